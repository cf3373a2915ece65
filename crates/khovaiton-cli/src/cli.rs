use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "khovaiton")]
#[command(about = "Resolve, upload and sync fabric images from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory for the local image mapping cache
    #[arg(long, global = true, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve one fabric code to an image URL
    Resolve {
        /// Fabric code
        code: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve many fabric codes in throttled batches
    Batch {
        /// Fabric codes
        codes: Vec<String>,
        /// Read additional codes from a file, one per line
        #[arg(short, long, value_name = "PATH")]
        file: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Upload an image file for a fabric code
    Upload {
        /// Fabric code
        code: String,
        /// Image file (JPEG, PNG or WebP)
        path: PathBuf,
        /// File name sent to the image host (defaults to the local file name)
        #[arg(long, value_name = "NAME")]
        name: Option<String>,
    },
    /// Point a fabric code at an arbitrary image URL
    #[command(name = "override")]
    Override {
        /// Fabric code
        code: String,
        /// Absolute http(s) image URL
        url: String,
    },
    /// Reconcile the local cache with the shared mapping store
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
    /// Count which fabric codes have images
    Report {
        /// Fabric codes
        codes: Vec<String>,
        /// Read additional codes from a file, one per line
        #[arg(short, long, value_name = "PATH")]
        file: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show sync health and runtime cache contents
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop the local image caches (the shared mapping store is kept)
    ClearCache,
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Keep syncing on an interval until interrupted
    Watch {
        /// Seconds between passes (defaults to KHOVAITON_SYNC_INTERVAL_SECS)
        #[arg(long, value_name = "SECS")]
        interval_secs: Option<u64>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    #[value(name = "powershell")]
    PowerShell,
}
