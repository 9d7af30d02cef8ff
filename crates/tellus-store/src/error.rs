//! Error types for the persistence layer.
//!
//! Every filesystem and serialization failure carries the path it concerns,
//! so a retry log line is enough to find the offending file.

use std::path::PathBuf;

/// Errors that can occur in the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A filesystem operation failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A record could not be encoded or decoded.
    #[error("serialization error at {}: {source}", path.display())]
    Serialization {
        /// File involved.
        path: PathBuf,
        /// The underlying serde error.
        source: serde_json::Error,
    },

    /// A blocking write task failed to complete.
    #[error("persistence task failed: {0}")]
    Task(String),

    /// The persistence pipeline is no longer running.
    #[error("persistence pipeline closed")]
    Closed,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serialization(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.into(),
            source,
        }
    }
}
