//! Crate-level error type.
//!
//! Almost nothing in the pipeline is allowed to fail a run: transport,
//! decode, extraction and sanitization problems are absorbed where they
//! happen and only show up as counters in [`crate::models::RunStats`].
//! The variants here cover the few terminal conditions: an unreadable
//! source list or configuration, an unwritable output location, and
//! failing to persist caches or the snapshot.

use std::path::PathBuf;

/// Result alias used by fallible, terminal operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
