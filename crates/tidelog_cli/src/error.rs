//! CLI error type.

use std::io;
use thiserror::Error;
use tidelog_core::CoreError;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// Commit log error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON output failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bad command-line input.
    #[error("{0}")]
    Usage(String),

    /// The log did not pass verification.
    #[error("verification failed: {0}")]
    VerificationFailed(String),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;
