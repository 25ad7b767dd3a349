//! Notification events

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Outcome being reported
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Operation succeeded
    Success,
    /// Operation failed
    Failure,
    /// Operation finished with warnings
    Warning,
}

impl EventKind {
    /// Suffix used in message titles
    pub fn title(&self) -> &'static str {
        match self {
            Self::Success => "Succeeded",
            Self::Failure => "Failed",
            Self::Warning => "Warning",
        }
    }
}

/// One backup or restore outcome
#[derive(Clone, Debug, PartialEq)]
pub struct NotificationEvent {
    /// Outcome
    pub kind: EventKind,
    /// Name of the ResticBackup or ResticRestore
    pub resource: String,
    /// Namespace of the resource
    pub namespace: String,
    /// Human-readable summary
    pub message: String,
    /// When the operation started
    pub timestamp: DateTime<Utc>,
    /// How long it took
    pub duration: Duration,
    /// Snapshot involved, if known
    pub snapshot_id: Option<String>,
    /// Formatted size, if known
    pub size: Option<String>,
    /// Number of files, zero when unknown
    pub files: u64,
}

impl NotificationEvent {
    fn new(kind: EventKind, resource: &str, namespace: &str, message: String) -> Self {
        Self {
            kind,
            resource: resource.to_string(),
            namespace: namespace.to_string(),
            message,
            timestamp: Utc::now(),
            duration: Duration::ZERO,
            snapshot_id: None,
            size: None,
            files: 0,
        }
    }

    /// A backup run produced `snapshot_id`
    pub fn backup_success(
        resource: &str,
        namespace: &str,
        snapshot_id: &str,
        size: Option<String>,
        files: u64,
        duration: Duration,
    ) -> Self {
        Self {
            duration,
            snapshot_id: Some(snapshot_id.to_string()),
            size,
            files,
            ..Self::new(
                EventKind::Success,
                resource,
                namespace,
                format!("Backup completed successfully: {snapshot_id}"),
            )
        }
    }

    /// A backup run failed with `error`
    pub fn backup_failure(resource: &str, namespace: &str, error: &str, duration: Duration) -> Self {
        Self {
            duration,
            ..Self::new(
                EventKind::Failure,
                resource,
                namespace,
                format!("Backup failed: {error}"),
            )
        }
    }

    /// A restore from `snapshot_id` completed
    pub fn restore_success(
        resource: &str,
        namespace: &str,
        snapshot_id: &str,
        duration: Duration,
    ) -> Self {
        Self {
            duration,
            snapshot_id: Some(snapshot_id.to_string()),
            ..Self::new(
                EventKind::Success,
                resource,
                namespace,
                format!("Restore completed successfully from snapshot: {snapshot_id}"),
            )
        }
    }

    /// A restore failed with `error`
    pub fn restore_failure(
        resource: &str,
        namespace: &str,
        error: &str,
        duration: Duration,
    ) -> Self {
        Self {
            duration,
            ..Self::new(
                EventKind::Failure,
                resource,
                namespace,
                format!("Restore failed: {error}"),
            )
        }
    }

    /// Override the start timestamp
    pub fn started_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether this event reports a failure
    pub fn is_failure(&self) -> bool {
        self.kind == EventKind::Failure
    }
}
