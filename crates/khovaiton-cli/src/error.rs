use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] khovaiton_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No fabric codes provided")]
    NoCodes,
    #[error("Unsupported image type for {0}; expected JPEG, PNG or WebP")]
    UnsupportedFile(String),
    #[error(
        "Mapping sync is not configured. Set KHOVAITON_MAPPING_URL (and KHOVAITON_MAPPING_WRITE_URL to push)."
    )]
    SyncNotConfigured,
}
