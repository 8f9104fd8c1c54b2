//! Error types for ChatCorpus.
//!
//! Library crates use [`ChatCorpusError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all ChatCorpus operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatCorpusError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during a provider call.
    #[error("network error: {0}")]
    Network(String),

    /// Export parsing error (CSV rows, timestamps, message kinds).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Message database access error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Enrichment provider error (request, API, or response parsing).
    #[error("enrichment error: {0}")]
    Enrichment(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (corpus shape, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Resumed against a checkpoint written under a different enrichment
    /// configuration. Always fatal: partial results under the old
    /// configuration are not comparable to the new one.
    #[error("checkpoint config mismatch: {message}")]
    CheckpointMismatch { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ChatCorpusError>;

impl ChatCorpusError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a checkpoint-mismatch error from any displayable message.
    pub fn checkpoint_mismatch(msg: impl Into<String>) -> Self {
        Self::CheckpointMismatch {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
