//! Feed error types

use std::path::PathBuf;

use modhost_core::RegistryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    /// The feed source directory does not exist
    #[error("Feed source not found: {path}")]
    SourceNotFound { path: PathBuf },

    /// A package version directory could not be read as a version
    #[error("Invalid version '{version}' for package {id}")]
    InvalidVersion { id: String, version: String },

    /// The monitor was started while already running
    #[error("Feed monitor already started")]
    AlreadyStarted,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Lock file error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FeedError> for RegistryError {
    fn from(e: FeedError) -> Self {
        RegistryError::new(e)
    }
}
