use std::path::PathBuf;

use thiserror::Error;

/// Errors that stop a run. Everything file-level or reference-level is
/// collected into the run summary instead.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Root directory not found: {0}")]
    RootNotFound(PathBuf),

    #[error("Index store is not writable at {path}: {source}")]
    StoreUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Another run holds the index lock: {0}")]
    Locked(PathBuf),

    #[error("Invalid configuration in {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("Run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, IndexError>;
