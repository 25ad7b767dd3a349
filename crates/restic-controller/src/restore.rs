//! ResticRestore reconciler
//!
//! A restore runs once. Its phase only moves forward:
//!
//! ```text
//! (unset) -> Pending -> InProgress -> Completed
//!                 \            \
//!                  `-> Failed   `-> Failed
//! ```
//!
//! Every phase write goes through [`transition`], which refuses to move a
//! restore backwards or out of a terminal phase.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use restic_common::conditions::set_condition;
use restic_common::crd::{
    Condition, ObjectReference, ResticBackup, ResticRestore, ResticRestoreStatus, RestorePhase,
};
use restic_common::events::{actions, reasons};
use restic_common::kube_utils::StatusUpdate;
use restic_common::{Error, ManagedKind};
use restic_notify::NotificationEvent;

use crate::context::Context;
use crate::finalizer::{ensure_finalizer, handle_deletion};
use crate::jobs::{
    is_job_complete, is_job_failed, job_failure_message, restore_job, restore_pvc, snapshot_token,
};
use crate::resolve::{find_backup, find_repository, notification_targets};
use crate::{REQUEUE_IMMEDIATE_SECS, REQUEUE_RESTORE_POLL_SECS};

/// Move `status` to `next`, refusing backward or post-terminal moves
pub fn transition(status: &mut ResticRestoreStatus, next: RestorePhase) -> Result<(), Error> {
    if let Some(from) = status.phase {
        if !from.can_transition_to(next) {
            return Err(Error::internal_with_context(
                "restore",
                format!("illegal phase transition {from} -> {next}"),
            ));
        }
    }
    status.phase = Some(next);
    Ok(())
}

/// Reconcile a ResticRestore
#[instrument(
    skip(restore, ctx),
    fields(restore = %restore.name_any(), namespace = %restore.namespace().unwrap_or_default())
)]
pub async fn reconcile(restore: Arc<ResticRestore>, ctx: Arc<Context>) -> Result<Action, Error> {
    let info = ctx.registry.get(ManagedKind::Restore);

    if restore.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&*restore, info, ctx.kube.as_ref()).await;
    }

    if ensure_finalizer(&*restore, info, ctx.kube.as_ref()).await? {
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_IMMEDIATE_SECS)));
    }

    let current = restore.status.clone().unwrap_or_default();
    match current.phase {
        None => {
            let mut status = current.clone();
            transition(&mut status, RestorePhase::Pending)?;
            set_condition(
                &mut status.conditions,
                Condition::unknown("RestorePending", "Restore is pending"),
            );
            status.observed_generation = restore.metadata.generation;
            write_status(&restore, &ctx, &status).await?;
            Ok(Action::requeue(Duration::from_secs(REQUEUE_IMMEDIATE_SECS)))
        }
        Some(RestorePhase::Pending) => start(&restore, &ctx, current).await,
        Some(RestorePhase::InProgress) => track(&restore, &ctx, current).await,
        Some(phase) => {
            debug!(%phase, "restore finished");
            Ok(Action::await_change())
        }
    }
}

/// Resolve references and launch the restore Job
async fn start(
    restore: &ResticRestore,
    ctx: &Context,
    mut status: ResticRestoreStatus,
) -> Result<Action, Error> {
    let info = ctx.registry.get(ManagedKind::Restore);
    let namespace = restore.namespace().unwrap_or_default();

    let backup_ref = &restore.spec.backup_ref;
    let Some(backup) = find_backup(ctx.kube.as_ref(), backup_ref, &namespace).await? else {
        let message = format!(
            "Backup {}/{} not found",
            backup_ref.namespace_or(&namespace),
            backup_ref.name
        );
        return finish(restore, ctx, status, Failure::new("BackupNotFound", message), None).await;
    };

    let backup_namespace = backup.namespace().unwrap_or_default();
    let repository_ref = &backup.spec.repository_ref;
    let Some(repository) =
        find_repository(ctx.kube.as_ref(), repository_ref, &backup_namespace).await?
    else {
        let message = format!(
            "Repository {}/{} not found",
            repository_ref.namespace_or(&backup_namespace),
            repository_ref.name
        );
        let failure = Failure::new("RepositoryNotFound", message);
        return finish(restore, ctx, status, failure, Some(&backup)).await;
    };

    if let Some(target) = restore.spec.target.new_pvc.as_ref() {
        let pvc = restore_pvc(restore, target, info);
        match ctx.kube.create_pvc(&namespace, &pvc).await {
            Ok(()) => info!(pvc = %target.name, "created restore target PVC"),
            Err(e) if e.is_already_exists() => {
                debug!(pvc = %target.name, "restore target PVC exists")
            }
            Err(e) => return Err(e),
        }
    }

    let job = match restore_job(restore, &backup, &repository, info) {
        Ok(job) => job,
        Err(e) => {
            let failure =
                Failure::new("JobCreationFailed", format!("Failed to build restore job: {e}"));
            return finish(restore, ctx, status, failure, Some(&backup)).await;
        }
    };
    let job_name = job.name_any();
    match ctx.kube.create_job(&namespace, &job).await {
        Ok(()) => info!(job = %job_name, "created restore job"),
        Err(e) if e.is_already_exists() => {
            match ctx.kube.get_job(&job_name, &namespace).await? {
                Some(existing) if controlled_by(&existing, restore) => {
                    debug!(job = %job_name, "adopting existing restore job")
                }
                Some(_) => {
                    warn!(job = %job_name, "restore job name is held by another owner");
                    let failure = Failure::new(
                        "JobConflict",
                        format!("Job {job_name} exists but is not owned by this restore"),
                    );
                    return finish(restore, ctx, status, failure, Some(&backup)).await;
                }
                None => {
                    debug!(job = %job_name, "conflicting restore job is being removed");
                    return Ok(Action::requeue(Duration::from_secs(REQUEUE_IMMEDIATE_SECS)));
                }
            }
        }
        Err(e) => {
            warn!(job = %job_name, error = %e, "failed to create restore job");
            let failure =
                Failure::new("JobCreationFailed", format!("Failed to create restore job: {e}"));
            return finish(restore, ctx, status, failure, Some(&backup)).await;
        }
    }

    transition(&mut status, RestorePhase::InProgress)?;
    status.start_time = Some(Utc::now());
    status.restored_snapshot = Some(snapshot_token(restore).to_string());
    status.job_ref = Some(ObjectReference {
        name: job_name.clone(),
        namespace: namespace.clone(),
    });
    status.observed_generation = restore.metadata.generation;
    set_condition(
        &mut status.conditions,
        Condition::unknown("RestoreInProgress", "Restore job is running"),
    );
    write_status(restore, ctx, &status).await?;
    ctx.publish(
        restore,
        EventType::Normal,
        reasons::RESTORE_STARTED,
        actions::RESTORE,
        Some(format!("Restore job {job_name} created")),
    )
    .await;

    Ok(poll())
}

/// Follow the restore Job until it finishes
async fn track(
    restore: &ResticRestore,
    ctx: &Context,
    status: ResticRestoreStatus,
) -> Result<Action, Error> {
    let namespace = restore.namespace().unwrap_or_default();
    let backup = find_backup(ctx.kube.as_ref(), &restore.spec.backup_ref, &namespace)
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "cannot resolve backup for notifications");
            None
        });

    let Some(job_ref) = status.job_ref.clone() else {
        let failure = Failure::new("JobNotFound", "No job reference in status");
        return finish(restore, ctx, status, failure, backup.as_ref()).await;
    };
    let Some(job) = ctx.kube.get_job(&job_ref.name, &job_ref.namespace).await? else {
        let failure = Failure::new("JobNotFound", "Restore job was not found");
        return finish(restore, ctx, status, failure, backup.as_ref()).await;
    };

    if is_job_complete(&job) {
        info!(job = %job_ref.name, "restore completed");
        return complete(restore, ctx, status, backup.as_ref()).await;
    }
    if is_job_failed(&job) {
        let detail = job_failure_message(&job);
        warn!(job = %job_ref.name, error = ?detail, "restore job failed");
        let mut failure = Failure::new("RestoreFailed", "Restore job failed");
        failure.detail = detail;
        return finish(restore, ctx, status, failure, backup.as_ref()).await;
    }

    debug!(job = %job_ref.name, "restore job still running");
    Ok(poll())
}

/// Why a restore ended in Failed
struct Failure {
    reason: &'static str,
    message: String,
    detail: Option<String>,
}

impl Failure {
    fn new(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            detail: None,
        }
    }
}

async fn complete(
    restore: &ResticRestore,
    ctx: &Context,
    mut status: ResticRestoreStatus,
    backup: Option<&ResticBackup>,
) -> Result<Action, Error> {
    transition(&mut status, RestorePhase::Completed)?;
    let now = Utc::now();
    status.completion_time = Some(now);
    set_condition(
        &mut status.conditions,
        Condition::ready("RestoreCompleted", "Restore completed successfully"),
    );
    write_status(restore, ctx, &status).await?;

    let snapshot = status.restored_snapshot.clone().unwrap_or_default();
    ctx.publish(
        restore,
        EventType::Normal,
        reasons::RESTORE_COMPLETED,
        actions::RESTORE,
        Some(format!("Restored snapshot {snapshot}")),
    )
    .await;

    if let Some(backup) = backup {
        let event = NotificationEvent::restore_success(
            &restore.name_any(),
            &restore.namespace().unwrap_or_default(),
            &snapshot,
            elapsed(&status),
        );
        send(restore, backup, ctx, event, &status).await;
    }
    Ok(Action::await_change())
}

/// Move to Failed; reached from Pending or InProgress
async fn finish(
    restore: &ResticRestore,
    ctx: &Context,
    mut status: ResticRestoreStatus,
    failure: Failure,
    backup: Option<&ResticBackup>,
) -> Result<Action, Error> {
    transition(&mut status, RestorePhase::Failed)?;
    status.completion_time = Some(Utc::now());
    status.observed_generation = restore.metadata.generation;
    set_condition(
        &mut status.conditions,
        Condition::not_ready(failure.reason, failure.message.clone()),
    );
    write_status(restore, ctx, &status).await?;

    let note = match &failure.detail {
        Some(detail) => format!("{}: {detail}", failure.message),
        None => failure.message.clone(),
    };
    ctx.publish(
        restore,
        EventType::Warning,
        reasons::RESTORE_FAILED,
        actions::RESTORE,
        Some(note.clone()),
    )
    .await;

    if let Some(backup) = backup {
        let event = NotificationEvent::restore_failure(
            &restore.name_any(),
            &restore.namespace().unwrap_or_default(),
            &note,
            elapsed(&status),
        );
        send(restore, backup, ctx, event, &status).await;
    }
    Ok(Action::await_change())
}

/// Restore notifications go to the backup's targets
async fn send(
    restore: &ResticRestore,
    backup: &ResticBackup,
    ctx: &Context,
    event: NotificationEvent,
    status: &ResticRestoreStatus,
) {
    let targets = notification_targets(
        ctx.kube.as_ref(),
        backup.spec.notifications.as_ref(),
        &backup.namespace().unwrap_or_default(),
    )
    .await;
    let event = match status.start_time {
        Some(start) => event.started_at(start),
        None => event,
    };
    ctx.notify(restore, &targets, &event).await;
}

fn elapsed(status: &ResticRestoreStatus) -> Duration {
    match (status.start_time, status.completion_time) {
        (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
        _ => Duration::ZERO,
    }
}

fn poll() -> Action {
    Action::requeue(Duration::from_secs(REQUEUE_RESTORE_POLL_SECS))
}

/// Whether `job` is controlled by this restore, by UID rather than name
fn controlled_by(job: &Job, restore: &ResticRestore) -> bool {
    let Some(uid) = restore.metadata.uid.as_deref() else {
        return false;
    };
    job.owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true) && owner.uid == uid)
}

/// Write `status` against the version of the snapshot it was derived from
///
/// A stale snapshot fails with a conflict before any event or notification
/// for the transition goes out.
async fn write_status(
    restore: &ResticRestore,
    ctx: &Context,
    status: &ResticRestoreStatus,
) -> Result<(), Error> {
    let current = restore.status.clone().unwrap_or_default();
    let update = StatusUpdate::new(restore, &current, status);
    ctx.kube
        .patch_restore_status(
            &restore.name_any(),
            &restore.namespace().unwrap_or_default(),
            &update,
        )
        .await?;
    Ok(())
}
