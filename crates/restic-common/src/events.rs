//! Kubernetes Event recording for restic controllers.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so reconcilers can
//! be tested without an API server. Events show up in
//! `kubectl describe` and `kubectl get events`.
//!
//! Publishing is fire-and-forget: a failed event is logged and never fails
//! a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about a resource
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`
    ///
    /// * `type_` - Normal or Warning
    /// * `reason` - machine-readable reason, one of [`reasons`]
    /// * `action` - what the controller was doing, one of [`actions`]
    /// * `note` - optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production publisher backed by `Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops everything.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (REASON column of `kubectl get events`).
pub mod reasons {
    // Repository
    /// Credentials secret missing or incomplete
    pub const CREDENTIALS_NOT_FOUND: &str = "CredentialsNotFound";
    /// `restic init` created the repository
    pub const REPOSITORY_INITIALIZED: &str = "RepositoryInitialized";
    /// A stale lock was removed
    pub const REPOSITORY_UNLOCKED: &str = "RepositoryUnlocked";
    /// Repository could not be initialized
    pub const INITIALIZATION_FAILED: &str = "InitializationFailed";

    // Backup and retention
    /// Referenced repository does not exist
    pub const REPOSITORY_NOT_FOUND: &str = "RepositoryNotFound";
    /// Generated CronJob could not be written
    pub const CRONJOB_FAILED: &str = "CronJobFailed";
    /// A scheduled backup run succeeded
    pub const BACKUP_SUCCEEDED: &str = "BackupSucceeded";
    /// A scheduled backup run failed
    pub const BACKUP_FAILED: &str = "BackupFailed";

    // Restore
    /// Restore job created
    pub const RESTORE_STARTED: &str = "RestoreStarted";
    /// Restore job succeeded
    pub const RESTORE_COMPLETED: &str = "RestoreCompleted";
    /// Restore failed
    pub const RESTORE_FAILED: &str = "RestoreFailed";

    /// One or more notification backends failed
    pub const NOTIFICATION_FAILED: &str = "NotificationFailed";
}

/// Event actions (ACTION column of `kubectl get events`).
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Unlocking a repository
    pub const UNLOCK: &str = "Unlock";
    /// Initializing a repository
    pub const INITIALIZE: &str = "Initialize";
    /// Running a restore
    pub const RESTORE: &str = "Restore";
    /// Sending notifications
    pub const NOTIFY: &str = "Notify";
}
