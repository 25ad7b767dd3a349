//! Notifications about backup and restore outcomes
//!
//! [`NotificationManager`] fans an event out to every configured backend.
//! A failing backend never stops the others; failures come back together
//! as [`NotifyError::Aggregate`].

#![deny(missing_docs)]

pub mod error;
pub mod event;
pub mod manager;
pub mod ntfy;
pub mod pushgateway;

pub use error::NotifyError;
pub use event::{EventKind, NotificationEvent};
pub use manager::{NotificationManager, Notifier, NotifyTargets, NtfyTarget};
pub use ntfy::NtfyNotifier;
pub use pushgateway::PushgatewayNotifier;

/// Per-request HTTP timeout for all backends
pub const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Build the HTTP client shared by the default backends
pub fn http_client() -> Result<reqwest::Client, NotifyError> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| NotifyError::Client(e.to_string()))
}
