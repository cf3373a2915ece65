//! Error types for khovaiton-core

use thiserror::Error;

use crate::http::TransportError;

/// Result type alias using khovaiton-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in khovaiton-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Remote store rejected or failed an upload
    #[error("Upload failed: {0}")]
    Upload(String),

    /// Mapping store or persisted cache error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Operation needs credentials or endpoints that are not configured
    #[error("Not configured: {0}")]
    NotConfigured(String),
}
