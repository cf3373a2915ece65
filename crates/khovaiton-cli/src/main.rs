//! Khovaiton CLI - fabric image lookups and mapping sync from the terminal.

mod cli;
mod commands;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands, SyncCommands};
use crate::commands::batch::run_batch;
use crate::commands::clear_cache::run_clear_cache;
use crate::commands::common::{load_config, open_service};
use crate::commands::completions::run_completions;
use crate::commands::override_cmd::run_override;
use crate::commands::report::run_report;
use crate::commands::resolve::run_resolve;
use crate::commands::status::run_status;
use crate::commands::sync::{run_sync, run_sync_watch};
use crate::commands::upload::run_upload;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "khovaiton=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let interval_override = match &cli.command {
        Commands::Sync {
            command: Some(SyncCommands::Watch { interval_secs }),
        } => *interval_secs,
        _ => None,
    };
    let config = load_config(interval_override)?;
    let service = open_service(&config, cli.data_dir.as_deref()).await?;

    match cli.command {
        Commands::Resolve { code, json } => run_resolve(&service, &code, json).await?,
        Commands::Batch { codes, file, json } => {
            run_batch(&service, &codes, file.as_deref(), json).await?;
        }
        Commands::Upload { code, path, name } => {
            run_upload(&service, &code, &path, name.as_deref()).await?;
        }
        Commands::Override { code, url } => run_override(&service, &code, &url).await?,
        Commands::Sync { command: None } => run_sync(&service).await?,
        Commands::Sync {
            command: Some(SyncCommands::Watch { .. }),
        } => run_sync_watch(&service).await?,
        Commands::Report { codes, file, json } => {
            run_report(&service, &codes, file.as_deref(), json).await?;
        }
        Commands::Status { json } => run_status(&service, json)?,
        Commands::ClearCache => run_clear_cache(&service),
        Commands::Completions { .. } => {}
    }

    Ok(())
}
