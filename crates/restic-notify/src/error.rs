//! Notification error types

use thiserror::Error;

/// Errors from notification backends
#[derive(Debug, Error)]
pub enum NotifyError {
    /// HTTP client could not be constructed
    #[error("failed to create HTTP client: {0}")]
    Client(String),

    /// Request could not be sent
    #[error("request failed: {0}")]
    Request(String),

    /// Backend answered with a non-2xx status
    #[error("{backend} returned status code {status}")]
    Status {
        /// Backend name
        backend: &'static str,
        /// HTTP status code
        status: u16,
    },

    /// Payload could not be encoded
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// One or more backends failed, each entry prefixed with the backend name
    #[error("notification errors: {}", .0.join("; "))]
    Aggregate(Vec<String>),
}

impl From<reqwest::Error> for NotifyError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request(e.to_string())
    }
}

impl From<NotifyError> for restic_common::Error {
    fn from(e: NotifyError) -> Self {
        restic_common::Error::notification(e.to_string())
    }
}
