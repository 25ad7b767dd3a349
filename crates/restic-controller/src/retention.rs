//! GlobalRetentionPolicy reconciler
//!
//! A policy becomes a CronJob `globalretention-<name>` that runs one
//! `restic forget` per rule, in declared order, then an optional prune.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, instrument, warn};

use restic_common::conditions::set_condition;
use restic_common::crd::{
    Condition, ConditionStatus, GlobalRetentionPolicy, GlobalRetentionPolicyStatus,
    ObjectReference,
};
use restic_common::cron;
use restic_common::duration::format_duration;
use restic_common::events::{actions, reasons};
use restic_common::kube_utils::StatusUpdate;
use restic_common::{Error, KindInfo, ManagedKind};

use crate::backup::apply_cron_job;
use crate::context::Context;
use crate::finalizer::{ensure_finalizer, handle_deletion};
use crate::jobs::{is_job_complete, is_job_failed, retention_cron_job};
use crate::resolve::{find_repository, repository_ready, set_repository_ready};
use crate::{REQUEUE_IMMEDIATE_SECS, REQUEUE_NOT_READY_SECS, REQUEUE_SCHEDULED_SECS};

const RESULT_SUCCEEDED: &str = "Succeeded";
const RESULT_FAILED: &str = "Failed";

/// Reconcile a GlobalRetentionPolicy
#[instrument(
    skip(policy, ctx),
    fields(policy = %policy.name_any(), namespace = %policy.namespace().unwrap_or_default())
)]
pub async fn reconcile(
    policy: Arc<GlobalRetentionPolicy>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let info = ctx.registry.get(ManagedKind::RetentionPolicy);

    if policy.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&*policy, info, ctx.kube.as_ref()).await;
    }

    if ensure_finalizer(&*policy, info, ctx.kube.as_ref()).await? {
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_IMMEDIATE_SECS)));
    }

    let namespace = policy.namespace().unwrap_or_default();
    let current = policy.status.clone().unwrap_or_default();
    let mut status = current.clone();

    let reference = &policy.spec.repository_ref;
    let Some(repository) = find_repository(ctx.kube.as_ref(), reference, &namespace).await? else {
        let message = format!(
            "Repository {}/{} not found",
            reference.namespace_or(&namespace),
            reference.name
        );
        warn!(repository = %reference.name, "referenced repository does not exist");
        set_repository_ready(
            &mut status.conditions,
            ConditionStatus::False,
            "RepositoryNotFound",
            &message,
        );
        set_condition(
            &mut status.conditions,
            Condition::not_ready("RepositoryNotFound", message.clone()),
        );
        write_status(&policy, &ctx, &current, &status).await?;
        ctx.publish(
            &*policy,
            EventType::Warning,
            reasons::REPOSITORY_NOT_FOUND,
            actions::RECONCILE,
            Some(message),
        )
        .await;
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_NOT_READY_SECS)));
    };

    if !repository_ready(&repository) {
        let message = format!("Repository {} is not ready", repository.name_any());
        debug!(repository = %repository.name_any(), "waiting for repository");
        set_repository_ready(
            &mut status.conditions,
            ConditionStatus::False,
            "RepositoryNotReady",
            &message,
        );
        set_condition(
            &mut status.conditions,
            Condition::not_ready("RepositoryNotReady", message),
        );
        write_status(&policy, &ctx, &current, &status).await?;
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_NOT_READY_SECS)));
    }
    set_repository_ready(
        &mut status.conditions,
        ConditionStatus::True,
        "RepositoryAccessible",
        "Repository is accessible",
    );

    let desired = retention_cron_job(&policy, &repository, info)?;
    let cron_job_name = desired.metadata.name.clone().unwrap_or_default();
    if let Err(e) = apply_cron_job(ctx.kube.as_ref(), &namespace, desired).await {
        warn!(cron_job = %cron_job_name, error = %e, "failed to apply CronJob");
        let message = format!("Failed to apply CronJob {cron_job_name}: {e}");
        set_condition(
            &mut status.conditions,
            Condition::not_ready("CronJobFailed", message.clone()),
        );
        write_status(&policy, &ctx, &current, &status).await?;
        ctx.publish(
            &*policy,
            EventType::Warning,
            reasons::CRONJOB_FAILED,
            actions::RECONCILE,
            Some(message),
        )
        .await;
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_NOT_READY_SECS)));
    }

    observe_last_run(&policy, &ctx, info, &mut status).await;

    set_condition(
        &mut status.conditions,
        Condition::ready(
            "RetentionPolicyConfigured",
            format!("Retention scheduled by CronJob {cron_job_name}"),
        ),
    );
    status.cron_job_ref = Some(ObjectReference {
        name: cron_job_name,
        namespace,
    });
    status.next_run = cron::next_after(&policy.spec.schedule, Utc::now());
    status.observed_generation = policy.metadata.generation;
    write_status(&policy, &ctx, &current, &status).await?;

    Ok(Action::requeue(Duration::from_secs(REQUEUE_SCHEDULED_SECS)))
}

/// Record the newest finished retention Job
async fn observe_last_run(
    policy: &GlobalRetentionPolicy,
    ctx: &Context,
    info: &KindInfo,
    status: &mut GlobalRetentionPolicyStatus,
) {
    let selector = format!("{}={}", info.owner_label, policy.name_any());
    let jobs = match ctx
        .kube
        .list_jobs(&policy.namespace().unwrap_or_default(), &selector)
        .await
    {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "failed to list retention jobs");
            return;
        }
    };

    let Some((job, started)) = jobs
        .iter()
        .filter(|job| is_job_complete(job) || is_job_failed(job))
        .filter_map(|job| start_time(job).map(|t| (job, t)))
        .max_by_key(|(_, started)| *started)
    else {
        return;
    };

    let (result, finished) = if is_job_complete(job) {
        let finished = job
            .status
            .as_ref()
            .and_then(|s| s.completion_time.as_ref())
            .map(|t| t.0);
        (RESULT_SUCCEEDED, finished)
    } else {
        (RESULT_FAILED, None)
    };

    status.last_run = Some(started);
    status.last_run_result = Some(result.to_string());
    status.last_run_duration = finished
        .and_then(|end| (end - started).to_std().ok())
        .map(format_duration);
}

fn start_time(job: &Job) -> Option<chrono::DateTime<Utc>> {
    job.status
        .as_ref()
        .and_then(|s| s.start_time.as_ref())
        .or(job.metadata.creation_timestamp.as_ref())
        .map(|t| t.0)
}

async fn write_status(
    policy: &GlobalRetentionPolicy,
    ctx: &Context,
    current: &GlobalRetentionPolicyStatus,
    status: &GlobalRetentionPolicyStatus,
) -> Result<(), Error> {
    if current == status {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    let update = StatusUpdate::new(policy, current, status);
    let namespace = policy.namespace().unwrap_or_default();
    ctx.kube
        .patch_retention_status(&policy.name_any(), &namespace, &update)
        .await?;
    Ok(())
}
