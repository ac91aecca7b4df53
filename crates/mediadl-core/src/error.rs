//! Error types for mediadl core

use thiserror::Error;

/// Errors surfaced by the download manager and its collaborators.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Invalid remote path: {0}")]
    InvalidRemotePath(String),

    #[error("No download found for identifier: {0}")]
    NotFound(String),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<reqwest::Error> for DownloadError {
    fn from(error: reqwest::Error) -> Self {
        DownloadError::Transfer(error.to_string())
    }
}
