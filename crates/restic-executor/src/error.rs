//! Executor error types

use std::time::Duration;

use thiserror::Error;

use crate::lock::is_lock_error;

/// Errors returned by [`crate::Executor`] implementations
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The restic process could not be started
    #[error("failed to run restic {operation}: {source}")]
    Spawn {
        /// restic subcommand
        operation: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// restic exited non-zero
    #[error("{context}: {status}: {stderr}")]
    CommandFailed {
        /// restic subcommand
        operation: String,
        /// What the caller was trying to do
        context: String,
        /// Exit status as printed by the OS
        status: String,
        /// Captured stderr, trimmed
        stderr: String,
    },

    /// restic did not finish within the per-call deadline
    #[error("restic {operation} timed out after {secs}s", secs = .after.as_secs())]
    Timeout {
        /// restic subcommand
        operation: String,
        /// Deadline that elapsed
        after: Duration,
    },

    /// restic output could not be decoded
    #[error("failed to parse {operation} output: {message}")]
    Parse {
        /// restic subcommand
        operation: String,
        /// Decoder message
        message: String,
    },
}

impl ExecutorError {
    /// restic subcommand that failed
    pub fn operation(&self) -> &str {
        match self {
            Self::Spawn { operation, .. }
            | Self::CommandFailed { operation, .. }
            | Self::Timeout { operation, .. }
            | Self::Parse { operation, .. } => operation,
        }
    }

    /// Whether repeating the call may succeed
    ///
    /// A missing binary or garbled output will not fix itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CommandFailed { .. } | Self::Timeout { .. })
    }

    /// Whether the failure was caused by an existing repository lock
    pub fn is_lock_error(&self) -> bool {
        is_lock_error(&self.to_string())
    }
}

impl From<ExecutorError> for restic_common::Error {
    fn from(e: ExecutorError) -> Self {
        restic_common::Error::Executor {
            operation: e.operation().to_string(),
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }
}
