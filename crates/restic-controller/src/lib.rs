//! Reconcilers for the restic operator
//!
//! - **repository**: checks repository health, recovers stale locks and
//!   initializes new repositories
//! - **backup**: turns a ResticBackup into a CronJob and tracks its runs
//! - **restore**: drives a ResticRestore through Pending, InProgress and a
//!   terminal phase
//! - **retention**: turns a GlobalRetentionPolicy into a forget/prune CronJob
//!
//! All reconcilers share [`Context`], which carries the Kubernetes client
//! seam, the restic executor and the notification manager.

#![deny(missing_docs)]

pub mod backup;
pub mod client;
pub mod context;
pub mod finalizer;
pub mod jobs;
pub mod repository;
pub mod resolve;
pub mod restore;
pub mod retention;

#[cfg(test)]
mod testing;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, error};

use restic_common::Error;

pub use client::{KubeClient, KubeClientImpl};
pub use context::{Context, ContextBuilder};

/// Requeue interval while a dependency or credential is missing
pub const REQUEUE_NOT_READY_SECS: u64 = 30;
/// Requeue interval for a healthy repository
pub const REQUEUE_HEALTHY_SECS: u64 = 3600;
/// Requeue interval for configured backups and retention policies
pub const REQUEUE_SCHEDULED_SECS: u64 = 300;
/// Poll interval while a restore job runs
pub const REQUEUE_RESTORE_POLL_SECS: u64 = 10;
/// Requeue after persisting the initial restore phase
pub const REQUEUE_IMMEDIATE_SECS: u64 = 1;
/// Backoff after a retryable reconcile error
pub const REQUEUE_ERROR_SECS: u64 = 5;
/// Backoff after an error that needs outside intervention
pub const REQUEUE_PERMANENT_ERROR_SECS: u64 = 300;

/// Run one reconcile under a deadline
///
/// A reconcile that overruns is abandoned (dropping it kills any restic
/// child) and reported as [`Error::Timeout`] so the controller requeues it.
pub async fn with_deadline<F>(operation: String, after: Duration, reconcile: F) -> Result<Action, Error>
where
    F: Future<Output = Result<Action, Error>>,
{
    match tokio::time::timeout(after, reconcile).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, after)),
    }
}

/// Error policy shared by all four controllers
pub fn error_policy<K>(obj: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action
where
    K: Resource,
    K::DynamicType: Default,
{
    if error.is_conflict() {
        debug!(
            name = %obj.name_any(),
            namespace = obj.namespace().as_deref().unwrap_or_default(),
            "status write raced a newer version, requeueing"
        );
        return Action::requeue(Duration::from_secs(REQUEUE_IMMEDIATE_SECS));
    }

    error!(
        ?error,
        kind = %K::kind(&K::DynamicType::default()),
        name = %obj.name_any(),
        namespace = obj.namespace().as_deref().unwrap_or_default(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
    } else {
        Action::requeue(Duration::from_secs(REQUEUE_PERMANENT_ERROR_SECS))
    }
}
