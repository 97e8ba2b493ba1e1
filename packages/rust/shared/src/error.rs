//! Error types for Playbook.
//!
//! Library crates use [`PlaybookError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Only failures that must reach a caller live here. Parse anomalies are
//! reported as [`crate::ParseDiagnostic`]s on the document, and an empty match
//! is an empty result, not an error.

use std::path::PathBuf;

/// Top-level error type for all Playbook operations.
#[derive(Debug, thiserror::Error)]
pub enum PlaybookError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The durable state store could not be read or written.
    ///
    /// Fatal for the current operation: without durable state the enrichment
    /// pipeline cannot guarantee it will not enrich a task twice.
    #[error("storage unavailable: {0}")]
    Storage(String),

    /// Text generation failed or returned unusable output.
    #[error("generation error: {0}")]
    Generation(String),

    /// The task tracker rejected or failed a request.
    #[error("tracker error: {0}")]
    Tracker(String),

    /// The collaborator bridge process misbehaved (spawn, protocol, exit).
    #[error("bridge error: {0}")]
    Bridge(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid input (unknown phase, bad argument, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON (de)serialization error for persisted or bridged payloads.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PlaybookError>;

impl PlaybookError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
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

    /// Whether this error must abort a whole batch rather than a single task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Bridge(_) | Self::Config { .. })
    }
}

impl From<serde_json::Error> for PlaybookError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
