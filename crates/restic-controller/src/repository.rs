//! ResticRepository reconciler
//!
//! Checks that the repository is reachable, removes locks left behind by
//! crashed restic processes, initializes repositories that do not exist yet
//! and records size statistics.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use restic_common::conditions::set_condition;
use restic_common::crd::{
    Condition, IntegrityCheckSpec, RepositoryStatistics, ResticRepository, ResticRepositoryStatus,
};
use restic_common::cron;
use restic_common::duration::format_duration;
use restic_common::events::{actions, reasons};
use restic_common::kube_utils::StatusUpdate;
use restic_common::{Error, ManagedKind};
use restic_executor::{format_bytes, parse_lock_age, Credentials, StatsMode};

use crate::context::Context;
use crate::finalizer::{ensure_finalizer, handle_deletion};
use crate::resolve::{load_credentials, CredentialsError};
use crate::{REQUEUE_HEALTHY_SECS, REQUEUE_IMMEDIATE_SECS, REQUEUE_NOT_READY_SECS};

/// Value of `lastIntegrityCheckResult` after a passing check
pub const INTEGRITY_PASSED: &str = "Passed";

/// Outcome of checking the repository, after any lock recovery
#[derive(Debug)]
enum Probe {
    Accessible,
    /// Locked by an operation younger than the threshold (or we do not lead)
    Locked(Duration),
    UnlockFailed(String),
    Failed(String),
}

/// Reconcile a ResticRepository
#[instrument(
    skip(repo, ctx),
    fields(repository = %repo.name_any(), namespace = %repo.namespace().unwrap_or_default())
)]
pub async fn reconcile(repo: Arc<ResticRepository>, ctx: Arc<Context>) -> Result<Action, Error> {
    let info = ctx.registry.get(ManagedKind::Repository);

    if repo.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&*repo, info, ctx.kube.as_ref()).await;
    }

    if ensure_finalizer(&*repo, info, ctx.kube.as_ref()).await? {
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_IMMEDIATE_SECS)));
    }

    let current = repo.status.clone().unwrap_or_default();
    let mut status = current.clone();
    let mut version = repo.resource_version();

    let credentials = match load_credentials(ctx.kube.as_ref(), &repo).await {
        Ok(credentials) => credentials,
        Err(CredentialsError::Kube(e)) => return Err(e),
        Err(e) => {
            warn!(error = %e, "repository credentials unavailable");
            set_condition(
                &mut status.conditions,
                Condition::not_ready("CredentialsNotFound", e.to_string()),
            );
            write_status(&repo, &ctx, &mut version, &current, &status).await?;
            ctx.publish(
                &*repo,
                EventType::Warning,
                reasons::CREDENTIALS_NOT_FOUND,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
            return Ok(not_ready_requeue());
        }
    };

    match probe(&repo, &ctx, &credentials).await {
        Probe::Accessible => {}
        Probe::Locked(age) => {
            let message = format!(
                "Repository is locked by another operation (lock age: {}, threshold: {})",
                format_duration(age),
                format_duration(ctx.stale_lock_threshold)
            );
            info!(lock_age = %format_duration(age), "repository locked, leaving lock in place");
            set_condition(
                &mut status.conditions,
                Condition::not_ready("RepositoryLocked", message),
            );
            write_status(&repo, &ctx, &mut version, &current, &status).await?;
            return Ok(not_ready_requeue());
        }
        Probe::UnlockFailed(message) => {
            warn!(error = %message, "failed to remove stale lock");
            set_condition(
                &mut status.conditions,
                Condition::not_ready(
                    "UnlockFailed",
                    format!("Failed to unlock repository: {message}"),
                ),
            );
            write_status(&repo, &ctx, &mut version, &current, &status).await?;
            return Ok(not_ready_requeue());
        }
        Probe::Failed(message) => {
            info!(error = %message, "repository check failed, initializing");
            if let Err(e) = ctx.executor.init(&credentials).await {
                warn!(error = %e, "repository initialization failed");
                set_condition(
                    &mut status.conditions,
                    Condition::not_ready(
                        "InitializationFailed",
                        format!("Failed to initialize repository: {e}"),
                    ),
                );
                write_status(&repo, &ctx, &mut version, &current, &status).await?;
                ctx.publish(
                    &*repo,
                    EventType::Warning,
                    reasons::INITIALIZATION_FAILED,
                    actions::INITIALIZE,
                    Some(e.to_string()),
                )
                .await;
                return Ok(not_ready_requeue());
            }
            info!("repository initialized");
            ctx.publish(
                &*repo,
                EventType::Normal,
                reasons::REPOSITORY_INITIALIZED,
                actions::INITIALIZE,
                Some("Repository initialized".to_string()),
            )
            .await;
        }
    }

    let now = Utc::now();
    set_condition(
        &mut status.conditions,
        Condition::ready("RepositoryAccessible", "Repository is accessible"),
    );
    status.observed_generation = repo.metadata.generation;
    if let Some(check) = repo.spec.integrity_check.as_ref() {
        if integrity_check_due(check, status.last_integrity_check, now) {
            status.last_integrity_check = Some(now);
            status.last_integrity_check_result = Some(INTEGRITY_PASSED.to_string());
        }
    }
    write_status(&repo, &ctx, &mut version, &current, &status).await?;

    match ctx.executor.stats(&credentials, StatsMode::RestoreSize).await {
        Ok(stats) => {
            let written = status.clone();
            status.statistics = Some(RepositoryStatistics {
                total_size: format_bytes(stats.total_size),
                total_file_count: stats.total_file_count,
                snapshot_count: stats.snapshot_count,
            });
            write_status(&repo, &ctx, &mut version, &written, &status).await?;
        }
        Err(e) => warn!(error = %e, "failed to collect repository statistics"),
    }

    Ok(Action::requeue(Duration::from_secs(REQUEUE_HEALTHY_SECS)))
}

/// Run `restic check`, recovering from a stale lock at most once
async fn probe(repo: &ResticRepository, ctx: &Context, credentials: &Credentials) -> Probe {
    let error = match ctx.executor.check(credentials).await {
        Ok(result) if result.success => return Probe::Accessible,
        Ok(result) => return Probe::Failed(result.message),
        Err(e) => e,
    };

    if !error.is_lock_error() {
        return Probe::Failed(error.to_string());
    }

    let age = parse_lock_age(&error.to_string());
    if age < ctx.stale_lock_threshold {
        return Probe::Locked(age);
    }
    if !ctx.leadership.is_held() {
        debug!("stale lock found but this replica does not hold leadership");
        return Probe::Locked(age);
    }

    info!(lock_age = %format_duration(age), "removing stale repository lock");
    if let Err(e) = ctx.executor.unlock(credentials).await {
        return Probe::UnlockFailed(e.to_string());
    }
    ctx.publish(
        repo,
        EventType::Normal,
        reasons::REPOSITORY_UNLOCKED,
        actions::UNLOCK,
        Some(format!("Removed stale lock (age: {})", format_duration(age))),
    )
    .await;

    match ctx.executor.check(credentials).await {
        Ok(result) if result.success => Probe::Accessible,
        Ok(result) => Probe::Failed(result.message),
        Err(e) => Probe::Failed(e.to_string()),
    }
}

/// Whether a passing check should be recorded as a fresh integrity check
///
/// Without a (valid) schedule a check is recorded at most once per healthy
/// requeue interval.
pub fn integrity_check_due(
    check: &IntegrityCheckSpec,
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if !check.enabled {
        return false;
    }
    let Some(last) = last else {
        return true;
    };

    let scheduled = check
        .schedule
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .and_then(|s| cron::next_after(s, last));
    match scheduled {
        Some(next) => next <= now,
        None => now - last >= chrono::Duration::seconds(REQUEUE_HEALTHY_SECS as i64),
    }
}

/// Write `status`, moving `version` forward so a later write in the same
/// reconcile is not mistaken for a stale one
async fn write_status(
    repo: &ResticRepository,
    ctx: &Context,
    version: &mut Option<String>,
    current: &ResticRepositoryStatus,
    status: &ResticRepositoryStatus,
) -> Result<(), Error> {
    if current == status {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    let update = StatusUpdate {
        resource_version: version.clone(),
        current: current.clone(),
        desired: status.clone(),
    };
    let written = ctx
        .kube
        .patch_repository_status(&repo.name_any(), &repo.namespace().unwrap_or_default(), &update)
        .await?;
    if written.is_some() {
        *version = written;
    }
    Ok(())
}

fn not_ready_requeue() -> Action {
    Action::requeue(Duration::from_secs(REQUEUE_NOT_READY_SECS))
}
