//! ResticBackup reconciler
//!
//! A backup is realized as a CronJob `resticbackup-<name>`. The reconciler
//! keeps that CronJob in line with the spec and folds the outcome of the Jobs
//! it spawns back into the backup's status.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use restic_common::conditions::set_condition;
use restic_common::crd::{
    BackupRunResult, BackupRunStatus, Condition, ConditionStatus, ObjectReference,
    ResticBackup, ResticBackupStatus, ResticRepository, SourceKind,
};
use restic_common::cron;
use restic_common::duration::format_duration;
use restic_common::events::{actions, reasons};
use restic_common::kube_utils::StatusUpdate;
use restic_common::{Error, KindInfo, ManagedKind};
use restic_notify::NotificationEvent;

use crate::client::KubeClient;
use crate::context::Context;
use crate::finalizer::{ensure_finalizer, handle_deletion};
use crate::jobs::{
    backup_cron_job, backup_hostname, is_job_complete, is_job_failed, job_failure_message,
    needs_update,
};
use crate::resolve::{
    find_repository, load_credentials, notification_targets, repository_ready,
    set_repository_ready,
};
use crate::{REQUEUE_IMMEDIATE_SECS, REQUEUE_NOT_READY_SECS, REQUEUE_SCHEDULED_SECS};

/// Reconcile a ResticBackup
#[instrument(
    skip(backup, ctx),
    fields(backup = %backup.name_any(), namespace = %backup.namespace().unwrap_or_default())
)]
pub async fn reconcile(backup: Arc<ResticBackup>, ctx: Arc<Context>) -> Result<Action, Error> {
    let info = ctx.registry.get(ManagedKind::Backup);

    if backup.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&*backup, info, ctx.kube.as_ref()).await;
    }

    if ensure_finalizer(&*backup, info, ctx.kube.as_ref()).await? {
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_IMMEDIATE_SECS)));
    }

    let namespace = backup.namespace().unwrap_or_default();
    let current = backup.status.clone().unwrap_or_default();
    let mut status = current.clone();

    let reference = &backup.spec.repository_ref;
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
        write_status(&backup, &ctx, &current, &status).await?;
        ctx.publish(
            &*backup,
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
        write_status(&backup, &ctx, &current, &status).await?;
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_NOT_READY_SECS)));
    }
    set_repository_ready(
        &mut status.conditions,
        ConditionStatus::True,
        "RepositoryAccessible",
        "Repository is accessible",
    );

    let source = match backup.spec.source.resolve() {
        Ok(SourceKind::PodVolume(_)) => {
            set_condition(
                &mut status.conditions,
                Condition::not_ready(
                    "UnsupportedSource",
                    "podVolumeBackup sources cannot run as a standalone job",
                ),
            );
            write_status(&backup, &ctx, &current, &status).await?;
            return Ok(Action::await_change());
        }
        Ok(source) => source,
        Err(message) => {
            set_condition(
                &mut status.conditions,
                Condition::not_ready("InvalidSource", message),
            );
            write_status(&backup, &ctx, &current, &status).await?;
            return Ok(Action::await_change());
        }
    };

    let desired = backup_cron_job(&backup, source, &repository, info)?;
    let cron_job_name = desired.metadata.name.clone().unwrap_or_default();
    if let Err(e) = apply_cron_job(ctx.kube.as_ref(), &namespace, desired).await {
        warn!(cron_job = %cron_job_name, error = %e, "failed to apply CronJob");
        let message = format!("Failed to apply CronJob {cron_job_name}: {e}");
        set_condition(
            &mut status.conditions,
            Condition::not_ready("CronJobFailed", message.clone()),
        );
        write_status(&backup, &ctx, &current, &status).await?;
        ctx.publish(
            &*backup,
            EventType::Warning,
            reasons::CRONJOB_FAILED,
            actions::RECONCILE,
            Some(message),
        )
        .await;
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_NOT_READY_SECS)));
    }

    let finished = observe_runs(&backup, &repository, &ctx, info, &mut status).await;

    set_condition(
        &mut status.conditions,
        Condition::ready(
            "BackupConfigured",
            format!("Backup scheduled by CronJob {cron_job_name}"),
        ),
    );
    status.cron_job_ref = Some(ObjectReference {
        name: cron_job_name,
        namespace: namespace.clone(),
    });
    status.next_backup = cron::next_after(&backup.spec.schedule, Utc::now());
    status.observed_generation = backup.metadata.generation;
    write_status(&backup, &ctx, &current, &status).await?;
    if let Some(run) = finished {
        announce(&backup, &ctx, run).await;
    }

    Ok(Action::requeue(Duration::from_secs(REQUEUE_SCHEDULED_SECS)))
}

/// Create `desired` or replace the existing CronJob when its spec drifted
///
/// An existing CronJob whose spec hash matches is left untouched.
pub async fn apply_cron_job(
    kube: &dyn KubeClient,
    namespace: &str,
    mut desired: CronJob,
) -> Result<(), Error> {
    let name = desired.metadata.name.clone().unwrap_or_default();
    match kube.get_cron_job(&name, namespace).await? {
        None => {
            info!(cron_job = %name, "creating CronJob");
            kube.create_cron_job(namespace, &desired).await
        }
        Some(existing) if needs_update(&existing, &desired) => {
            info!(cron_job = %name, "updating CronJob");
            desired.metadata.resource_version = existing.metadata.resource_version;
            kube.replace_cron_job(&name, namespace, &desired).await
        }
        Some(_) => {
            debug!(cron_job = %name, "CronJob up to date");
            Ok(())
        }
    }
}

/// A run that finished since the stored status was written
struct FinishedRun {
    event_type: EventType,
    reason: &'static str,
    note: String,
    notification: NotificationEvent,
}

/// Fold the newest backup Job into `status`
///
/// Counters move once per finished run; a run already recorded as finished
/// is not counted again. Listing failures only skip the update. A newly
/// finished run is returned so it can be announced after the status write.
async fn observe_runs(
    backup: &ResticBackup,
    repository: &ResticRepository,
    ctx: &Context,
    info: &KindInfo,
    status: &mut ResticBackupStatus,
) -> Option<FinishedRun> {
    let name = backup.name_any();
    let namespace = backup.namespace().unwrap_or_default();
    let selector = format!("{}={}", info.owner_label, name);

    let jobs = match ctx.kube.list_jobs(&namespace, &selector).await {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "failed to list backup jobs");
            return None;
        }
    };
    let (job, mut run) = jobs
        .iter()
        .filter_map(|job| run_status(job).map(|run| (job, run)))
        .max_by_key(|(_, run)| run.start_time)?;

    let previous = status
        .last_backup
        .as_ref()
        .filter(|p| p.start_time == run.start_time);
    let newly_finished = run.result != BackupRunResult::Running
        && previous.map_or(true, |p| p.result == BackupRunResult::Running);

    if let Some(previous) = previous {
        run.snapshot_id = previous.snapshot_id.clone();
    }

    let mut finished = None;
    if newly_finished {
        let job_name = job.name_any();
        let statistics = status.statistics.get_or_insert_with(Default::default);
        statistics.total_backups += 1;
        let elapsed = run
            .completion_time
            .and_then(|end| (end - run.start_time).to_std().ok())
            .unwrap_or_default();

        if run.result == BackupRunResult::Succeeded {
            statistics.successful_backups += 1;
            status.last_successful_backup = run.completion_time.or(Some(run.start_time));
            run.snapshot_id = latest_snapshot(backup, repository, ctx).await;
            info!(job = %job_name, snapshot = ?run.snapshot_id, "backup run succeeded");

            finished = Some(FinishedRun {
                event_type: EventType::Normal,
                reason: reasons::BACKUP_SUCCEEDED,
                note: format!("Backup job {job_name} succeeded"),
                notification: NotificationEvent::backup_success(
                    &name,
                    &namespace,
                    run.snapshot_id.as_deref().unwrap_or_default(),
                    None,
                    0,
                    elapsed,
                )
                .started_at(run.start_time),
            });
        } else {
            statistics.failed_backups += 1;
            let reason =
                job_failure_message(job).unwrap_or_else(|| format!("backup job {job_name} failed"));
            warn!(job = %job_name, error = %reason, "backup run failed");

            finished = Some(FinishedRun {
                event_type: EventType::Warning,
                reason: reasons::BACKUP_FAILED,
                notification: NotificationEvent::backup_failure(&name, &namespace, &reason, elapsed)
                    .started_at(run.start_time),
                note: reason,
            });
        }
    }

    status.last_backup = Some(run);
    finished
}

async fn announce(backup: &ResticBackup, ctx: &Context, run: FinishedRun) {
    ctx.publish(
        backup,
        run.event_type,
        run.reason,
        actions::RECONCILE,
        Some(run.note),
    )
    .await;
    let targets = notification_targets(
        ctx.kube.as_ref(),
        backup.spec.notifications.as_ref(),
        &backup.namespace().unwrap_or_default(),
    )
    .await;
    ctx.notify(backup, &targets, &run.notification).await;
}

/// Run record for a backup Job, None before the Job has a start time
fn run_status(job: &Job) -> Option<BackupRunStatus> {
    let job_status = job.status.as_ref();
    let start_time = job_status
        .and_then(|s| s.start_time.as_ref())
        .or(job.metadata.creation_timestamp.as_ref())
        .map(|t| t.0)?;

    let result = if is_job_complete(job) {
        BackupRunResult::Succeeded
    } else if is_job_failed(job) {
        BackupRunResult::Failed
    } else {
        BackupRunResult::Running
    };

    let completion_time = match result {
        BackupRunResult::Running => None,
        BackupRunResult::Succeeded => job_status
            .and_then(|s| s.completion_time.as_ref())
            .map(|t| t.0),
        BackupRunResult::Failed => failed_at(job),
    };

    Some(BackupRunStatus {
        start_time,
        completion_time,
        duration: completion_time
            .and_then(|end| (end - start_time).to_std().ok())
            .map(format_duration),
        snapshot_id: None,
        result,
    })
}

fn failed_at(job: &Job) -> Option<DateTime<Utc>> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Failed"))
        .and_then(|c| c.last_transition_time.as_ref())
        .map(|t| t.0)
}

/// Newest snapshot taken under this backup's hostname, best effort
async fn latest_snapshot(
    backup: &ResticBackup,
    repository: &ResticRepository,
    ctx: &Context,
) -> Option<String> {
    let credentials = match load_credentials(ctx.kube.as_ref(), repository).await {
        Ok(credentials) => credentials,
        Err(e) => {
            debug!(error = %e, "cannot read credentials to look up snapshot");
            return None;
        }
    };
    let snapshots = match ctx.executor.snapshots(&credentials).await {
        Ok(snapshots) => snapshots,
        Err(e) => {
            warn!(error = %e, "failed to list snapshots");
            return None;
        }
    };

    let hostname = backup_hostname(backup);
    snapshots
        .into_iter()
        .filter(|s| s.hostname == hostname)
        .max_by_key(|s| s.time)
        .map(|s| if s.short_id.is_empty() { s.id } else { s.short_id })
}

async fn write_status(
    backup: &ResticBackup,
    ctx: &Context,
    current: &ResticBackupStatus,
    status: &ResticBackupStatus,
) -> Result<(), Error> {
    if current == status {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    let update = StatusUpdate::new(backup, current, status);
    ctx.kube
        .patch_backup_status(&backup.name_any(), &backup.namespace().unwrap_or_default(), &update)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use restic_common::conditions::get_condition;
    use restic_common::crd::{
        BackupSource, PodVolumeSource, ResticBackupSpec, CONDITION_READY,
        CONDITION_REPOSITORY_READY,
    };
    use restic_common::ResourceRegistry;
    use restic_executor::Snapshot;

    use super::*;
    use crate::client::MockKubeClient;
    use crate::testing::{
        backup as backup_fixture, backup_spec, credentials_secret, event_capture, reasons_of,
        ready_repository, repository, MockResticExecutor, StatusCapture, NAMESPACE,
    };

    fn nightly(spec: ResticBackupSpec) -> ResticBackup {
        backup_fixture("nightly", spec)
    }

    fn desired_cron_job(backup: &ResticBackup, repo: &ResticRepository) -> CronJob {
        let registry = ResourceRegistry::new();
        let source = backup.spec.source.resolve().expect("valid source");
        backup_cron_job(backup, source, repo, registry.get(ManagedKind::Backup))
            .expect("descriptor builds")
    }

    /// Client that finds `repo`, no CronJob, no Jobs and records statuses
    fn base_kube(
        repo: Option<ResticRepository>,
        capture: &StatusCapture<ResticBackupStatus>,
    ) -> MockKubeClient {
        let mut kube = MockKubeClient::new();
        kube.expect_get_repository()
            .returning(move |_, _| Ok(repo.clone()));
        kube.expect_list_jobs().returning(|_, _| Ok(vec![]));
        kube.expect_get_secret()
            .returning(|_, _| Ok(Some(credentials_secret())));
        let sink = capture.clone();
        kube.expect_patch_backup_status()
            .returning(move |_, _, update| {
                sink.record(update.desired.clone());
                Ok(None)
            });
        kube
    }

    fn condition<'a>(status: &'a ResticBackupStatus, type_: &str) -> &'a Condition {
        get_condition(&status.conditions, type_).expect("condition set")
    }

    fn job(name: &str, start: DateTime<Utc>, outcome: Option<bool>) -> Job {
        let mut status = JobStatus {
            start_time: Some(Time(start)),
            ..Default::default()
        };
        match outcome {
            Some(true) => {
                status.succeeded = Some(1);
                status.completion_time = Some(Time(start + ChronoDuration::minutes(5)));
            }
            Some(false) => {
                status.failed = Some(1);
                status.conditions = Some(vec![JobCondition {
                    type_: "Failed".to_string(),
                    status: "True".to_string(),
                    message: Some("Job has reached the specified backoff limit".to_string()),
                    last_transition_time: Some(Time(start + ChronoDuration::minutes(3))),
                    ..Default::default()
                }]);
            }
            None => {}
        }
        Job {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                creation_timestamp: Some(Time(start)),
                ..Default::default()
            },
            status: Some(status),
            ..Default::default()
        }
    }

    fn run_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0)
            .single()
            .expect("valid time")
    }

    mod dependencies {
        use super::*;

        #[tokio::test]
        async fn missing_repository_warns_and_requeues() {
            let capture = StatusCapture::new();
            let mut kube = base_kube(None, &capture);
            kube.expect_get_cron_job().never();
            kube.expect_create_cron_job().never();

            let (recorder, events) = event_capture();
            let mut ctx = Context::for_testing(Arc::new(kube), Arc::new(MockResticExecutor::new()));
            ctx.events = Arc::new(recorder);

            let action = reconcile(Arc::new(nightly(backup_spec("main", None))), Arc::new(ctx))
                .await
                .expect("reconcile succeeds");

            assert_eq!(action, Action::requeue(Duration::from_secs(30)));
            let status = capture.last().expect("status written");
            let ready = condition(&status, CONDITION_READY);
            assert_eq!(ready.status, ConditionStatus::False);
            assert_eq!(ready.reason, "RepositoryNotFound");
            assert_eq!(ready.message, "Repository apps/main not found");
            assert_eq!(reasons_of(&events), vec![reasons::REPOSITORY_NOT_FOUND]);
        }

        #[tokio::test]
        async fn unready_repository_waits() {
            let capture = StatusCapture::new();
            let mut kube = base_kube(Some(repository("main", NAMESPACE)), &capture);
            kube.expect_create_cron_job().never();

            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockResticExecutor::new()),
            ));
            let action = reconcile(Arc::new(nightly(backup_spec("main", None))), ctx)
                .await
                .expect("reconcile succeeds");

            assert_eq!(action, Action::requeue(Duration::from_secs(30)));
            let status = capture.last().expect("status written");
            assert_eq!(condition(&status, CONDITION_READY).reason, "RepositoryNotReady");
            assert_eq!(
                condition(&status, CONDITION_REPOSITORY_READY).status,
                ConditionStatus::False
            );
        }

        #[tokio::test]
        async fn repository_resolved_in_referenced_namespace() {
            let capture = StatusCapture::new();
            let repo = ready_repository("shared", "backup-system");
            let mut kube = MockKubeClient::new();
            kube.expect_get_repository()
                .withf(|name, ns| name == "shared" && ns == "backup-system")
                .times(1)
                .returning(move |_, _| Ok(Some(repo.clone())));
            kube.expect_get_cron_job().returning(|_, _| Ok(None));
            kube.expect_create_cron_job()
                .withf(|ns, _| ns == NAMESPACE)
                .times(1)
                .returning(|_, _| Ok(()));
            kube.expect_list_jobs().returning(|_, _| Ok(vec![]));
            let sink = capture.clone();
            kube.expect_patch_backup_status()
                .returning(move |_, _, update| {
                    sink.record(update.desired.clone());
                    Ok(None)
                });

            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockResticExecutor::new()),
            ));
            reconcile(
                Arc::new(nightly(backup_spec("shared", Some("backup-system")))),
                ctx,
            )
            .await
            .expect("reconcile succeeds");

            let status = capture.last().expect("status written");
            assert_eq!(condition(&status, CONDITION_READY).status, ConditionStatus::True);
        }
    }

    mod sources {
        use super::*;

        #[tokio::test]
        async fn missing_source_waits_for_spec_change() {
            let capture = StatusCapture::new();
            let mut kube = base_kube(Some(ready_repository("main", NAMESPACE)), &capture);
            kube.expect_create_cron_job().never();

            let mut spec = backup_spec("main", None);
            spec.source = BackupSource::default();

            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockResticExecutor::new()),
            ));
            let action = reconcile(Arc::new(nightly(spec)), ctx)
                .await
                .expect("reconcile succeeds");

            assert_eq!(action, Action::await_change());
            let status = capture.last().expect("status written");
            assert_eq!(condition(&status, CONDITION_READY).reason, "InvalidSource");
        }

        #[tokio::test]
        async fn pod_volume_source_is_unsupported() {
            let capture = StatusCapture::new();
            let mut kube = base_kube(Some(ready_repository("main", NAMESPACE)), &capture);
            kube.expect_create_cron_job().never();

            let mut spec = backup_spec("main", None);
            spec.source = BackupSource {
                pod_volume_backup: Some(PodVolumeSource {
                    volume_name: "data".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            };

            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockResticExecutor::new()),
            ));
            let action = reconcile(Arc::new(nightly(spec)), ctx)
                .await
                .expect("reconcile succeeds");

            assert_eq!(action, Action::await_change());
            let status = capture.last().expect("status written");
            let ready = condition(&status, CONDITION_READY);
            assert_eq!(ready.status, ConditionStatus::False);
            assert_eq!(ready.reason, "UnsupportedSource");
        }
    }

    mod cron_jobs {
        use super::*;

        #[tokio::test]
        async fn creates_cron_job_and_reports_configured() {
            let capture = StatusCapture::new();
            let mut kube = base_kube(Some(ready_repository("main", NAMESPACE)), &capture);
            kube.expect_get_cron_job()
                .withf(|name, ns| name == "resticbackup-nightly" && ns == NAMESPACE)
                .returning(|_, _| Ok(None));
            kube.expect_create_cron_job()
                .withf(|_, cron_job| {
                    cron_job.metadata.name.as_deref() == Some("resticbackup-nightly")
                })
                .times(1)
                .returning(|_, _| Ok(()));

            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockResticExecutor::new()),
            ));
            let action = reconcile(Arc::new(nightly(backup_spec("main", None))), ctx)
                .await
                .expect("reconcile succeeds");

            assert_eq!(action, Action::requeue(Duration::from_secs(300)));
            let status = capture.last().expect("status written");
            let ready = condition(&status, CONDITION_READY);
            assert_eq!(ready.status, ConditionStatus::True);
            assert_eq!(ready.reason, "BackupConfigured");
            let repo_ready = condition(&status, CONDITION_REPOSITORY_READY);
            assert_eq!(repo_ready.status, ConditionStatus::True);
            assert_eq!(repo_ready.reason, "RepositoryAccessible");
            assert_eq!(
                status.cron_job_ref,
                Some(ObjectReference {
                    name: "resticbackup-nightly".to_string(),
                    namespace: NAMESPACE.to_string(),
                })
            );
            assert!(status.next_backup.is_some_and(|next| next > Utc::now()));
            assert_eq!(status.observed_generation, Some(1));
        }

        #[tokio::test]
        async fn matching_cron_job_is_not_rewritten() {
            let capture = StatusCapture::new();
            let repo = ready_repository("main", NAMESPACE);
            let backup = nightly(backup_spec("main", None));
            let existing = desired_cron_job(&backup, &repo);

            let mut kube = base_kube(Some(repo), &capture);
            kube.expect_get_cron_job()
                .returning(move |_, _| Ok(Some(existing.clone())));
            kube.expect_create_cron_job().never();
            kube.expect_replace_cron_job().never();

            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockResticExecutor::new()),
            ));
            reconcile(Arc::new(backup), ctx)
                .await
                .expect("reconcile succeeds");
        }

        #[tokio::test]
        async fn second_reconcile_writes_nothing() {
            let capture = StatusCapture::new();
            let repo = ready_repository("main", NAMESPACE);
            let mut backup = nightly(backup_spec("main", None));
            let existing = desired_cron_job(&backup, &repo);

            let mut kube = base_kube(Some(repo), &capture);
            kube.expect_get_cron_job()
                .returning(move |_, _| Ok(Some(existing.clone())));
            kube.expect_create_cron_job().never();
            kube.expect_replace_cron_job().never();
            let kube = Arc::new(kube);

            let ctx = Arc::new(Context::for_testing(
                kube.clone(),
                Arc::new(MockResticExecutor::new()),
            ));
            reconcile(Arc::new(backup.clone()), ctx.clone())
                .await
                .expect("first reconcile succeeds");
            assert_eq!(capture.count(), 1);

            backup.status = capture.last();
            reconcile(Arc::new(backup), ctx)
                .await
                .expect("second reconcile succeeds");
            assert_eq!(capture.count(), 1, "unchanged status must not be patched");
        }

        #[tokio::test]
        async fn drifted_cron_job_is_replaced_with_resource_version() {
            let capture = StatusCapture::new();
            let repo = ready_repository("main", NAMESPACE);
            let backup = nightly(backup_spec("main", None));

            let mut old_spec = backup_spec("main", None);
            old_spec.schedule = "0 4 * * *".to_string();
            let mut existing = desired_cron_job(&nightly(old_spec), &repo);
            existing.metadata.resource_version = Some("4711".to_string());

            let mut kube = base_kube(Some(repo), &capture);
            kube.expect_get_cron_job()
                .returning(move |_, _| Ok(Some(existing.clone())));
            kube.expect_replace_cron_job()
                .withf(|name, _, cron_job| {
                    name == "resticbackup-nightly"
                        && cron_job.metadata.resource_version.as_deref() == Some("4711")
                        && cron_job
                            .spec
                            .as_ref()
                            .is_some_and(|s| s.schedule == "0 2 * * *")
                })
                .times(1)
                .returning(|_, _, _| Ok(()));

            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockResticExecutor::new()),
            ));
            reconcile(Arc::new(backup), ctx)
                .await
                .expect("reconcile succeeds");
        }

        #[tokio::test]
        async fn apply_failure_is_reported() {
            let capture = StatusCapture::new();
            let mut kube = base_kube(Some(ready_repository("main", NAMESPACE)), &capture);
            kube.expect_get_cron_job().returning(|_, _| Ok(None));
            kube.expect_create_cron_job()
                .returning(|_, _| Err(Error::internal("admission webhook denied the request")));

            let (recorder, events) = event_capture();
            let mut ctx = Context::for_testing(Arc::new(kube), Arc::new(MockResticExecutor::new()));
            ctx.events = Arc::new(recorder);

            let action = reconcile(Arc::new(nightly(backup_spec("main", None))), Arc::new(ctx))
                .await
                .expect("reconcile succeeds");

            assert_eq!(action, Action::requeue(Duration::from_secs(30)));
            let status = capture.last().expect("status written");
            let ready = condition(&status, CONDITION_READY);
            assert_eq!(ready.reason, "CronJobFailed");
            assert!(ready.message.contains("admission webhook denied"));
            assert_eq!(reasons_of(&events), vec![reasons::CRONJOB_FAILED]);
        }

        #[tokio::test]
        async fn invalid_schedule_leaves_next_backup_unset() {
            let capture = StatusCapture::new();
            let mut kube = base_kube(Some(ready_repository("main", NAMESPACE)), &capture);
            kube.expect_get_cron_job().returning(|_, _| Ok(None));
            kube.expect_create_cron_job().returning(|_, _| Ok(()));

            let mut spec = backup_spec("main", None);
            spec.schedule = "invalid-schedule".to_string();

            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockResticExecutor::new()),
            ));
            reconcile(Arc::new(nightly(spec)), ctx)
                .await
                .expect("reconcile succeeds");

            let status = capture.last().expect("status written");
            assert!(status.next_backup.is_none());
            assert_eq!(condition(&status, CONDITION_READY).status, ConditionStatus::True);
        }

        #[tokio::test]
        async fn schedule_edited_to_invalid_clears_stored_next_backup() {
            let patches = Arc::new(std::sync::Mutex::new(Vec::new()));
            let sink = patches.clone();
            let repo = ready_repository("main", NAMESPACE);
            let mut kube = MockKubeClient::new();
            kube.expect_get_repository()
                .returning(move |_, _| Ok(Some(repo.clone())));
            kube.expect_list_jobs().returning(|_, _| Ok(vec![]));
            kube.expect_get_secret()
                .returning(|_, _| Ok(Some(credentials_secret())));
            kube.expect_get_cron_job().returning(|_, _| Ok(None));
            kube.expect_create_cron_job().returning(|_, _| Ok(()));
            kube.expect_patch_backup_status()
                .times(1)
                .returning(move |_, _, update| {
                    let patch = update.merge_patch().expect("status serializes");
                    sink.lock().expect("mutex should not be poisoned").push(patch);
                    Ok(Some("13".to_string()))
                });

            let mut spec = backup_spec("main", None);
            spec.schedule = "invalid-schedule".to_string();
            let mut backup = nightly(spec);
            backup.metadata.resource_version = Some("12".to_string());
            backup.status = Some(ResticBackupStatus {
                next_backup: Some(Utc::now() + chrono::Duration::hours(3)),
                ..Default::default()
            });

            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockResticExecutor::new()),
            ));
            reconcile(Arc::new(backup), ctx)
                .await
                .expect("reconcile succeeds");

            let patches = patches.lock().expect("mutex should not be poisoned");
            let patch = patches.last().expect("status patched");
            assert_eq!(patch["status"]["nextBackup"], serde_json::Value::Null);
            assert_eq!(patch["metadata"]["resourceVersion"], "12");
        }
    }

    mod runs {
        use super::*;

        fn kube_with_jobs(
            jobs: Vec<Job>,
            capture: &StatusCapture<ResticBackupStatus>,
        ) -> MockKubeClient {
            let repo = ready_repository("main", NAMESPACE);
            let mut kube = MockKubeClient::new();
            kube.expect_get_repository()
                .returning(move |_, _| Ok(Some(repo.clone())));
            kube.expect_get_cron_job().returning(|_, _| Ok(None));
            kube.expect_create_cron_job().returning(|_, _| Ok(()));
            kube.expect_list_jobs()
                .withf(|ns, selector| {
                    ns == NAMESPACE && selector == "backup.resticbackup.io/backup=nightly"
                })
                .returning(move |_, _| Ok(jobs.clone()));
            kube.expect_get_secret()
                .returning(|_, _| Ok(Some(credentials_secret())));
            let sink = capture.clone();
            kube.expect_patch_backup_status()
                .returning(move |_, _, update| {
                    sink.record(update.desired.clone());
                    Ok(None)
                });
            kube
        }

        fn snapshot(short_id: &str, hostname: &str, minutes: i64) -> Snapshot {
            Snapshot {
                id: format!("{short_id}0000"),
                short_id: short_id.to_string(),
                time: run_start() + ChronoDuration::minutes(minutes),
                hostname: hostname.to_string(),
                ..Default::default()
            }
        }

        #[tokio::test]
        async fn succeeded_run_is_recorded_once() {
            let capture = StatusCapture::new();
            let kube = kube_with_jobs(
                vec![
                    job("nightly-older", run_start() - ChronoDuration::days(1), Some(false)),
                    job("nightly-latest", run_start(), Some(true)),
                ],
                &capture,
            );
            let mut exec = MockResticExecutor::new();
            exec.expect_snapshots().times(1).returning(|_| {
                Ok(vec![
                    snapshot("aaaa1111", "nightly", 1),
                    snapshot("bbbb2222", "nightly", 4),
                    snapshot("cccc3333", "other-host", 6),
                ])
            });

            let (recorder, events) = event_capture();
            let mut ctx = Context::for_testing(Arc::new(kube), Arc::new(exec));
            ctx.events = Arc::new(recorder);
            let ctx = Arc::new(ctx);

            let mut backup = nightly(backup_spec("main", None));
            reconcile(Arc::new(backup.clone()), ctx.clone())
                .await
                .expect("reconcile succeeds");

            let status = capture.last().expect("status written");
            let run = status.last_backup.clone().expect("run recorded");
            assert_eq!(run.result, BackupRunResult::Succeeded);
            assert_eq!(run.start_time, run_start());
            assert_eq!(run.duration.as_deref(), Some("5m0s"));
            assert_eq!(run.snapshot_id.as_deref(), Some("bbbb2222"));
            assert_eq!(
                status.last_successful_backup,
                Some(run_start() + ChronoDuration::minutes(5))
            );
            let stats = status.statistics.clone().expect("statistics");
            assert_eq!(
                (stats.total_backups, stats.successful_backups, stats.failed_backups),
                (1, 1, 0)
            );
            assert_eq!(reasons_of(&events), vec![reasons::BACKUP_SUCCEEDED]);

            backup.status = Some(status);
            reconcile(Arc::new(backup), ctx)
                .await
                .expect("second reconcile succeeds");
            let stats = capture
                .last()
                .and_then(|s| s.statistics)
                .expect("statistics");
            assert_eq!(stats.total_backups, 1, "a recorded run is not counted twice");
            assert_eq!(reasons_of(&events).len(), 1);
        }

        #[tokio::test]
        async fn failed_run_warns() {
            let capture = StatusCapture::new();
            let kube = kube_with_jobs(vec![job("nightly-1", run_start(), Some(false))], &capture);
            let mut exec = MockResticExecutor::new();
            exec.expect_snapshots().never();

            let (recorder, events) = event_capture();
            let mut ctx = Context::for_testing(Arc::new(kube), Arc::new(exec));
            ctx.events = Arc::new(recorder);

            reconcile(Arc::new(nightly(backup_spec("main", None))), Arc::new(ctx))
                .await
                .expect("reconcile succeeds");

            let status = capture.last().expect("status written");
            let run = status.last_backup.expect("run recorded");
            assert_eq!(run.result, BackupRunResult::Failed);
            assert_eq!(run.duration.as_deref(), Some("3m0s"));
            assert!(status.last_successful_backup.is_none());
            let stats = status.statistics.expect("statistics");
            assert_eq!(stats.failed_backups, 1);

            let recorded = events.lock().expect("mutex should not be poisoned").clone();
            assert_eq!(recorded.len(), 1);
            assert_eq!(recorded[0].reason, reasons::BACKUP_FAILED);
            assert!(recorded[0].warning);
            assert_eq!(
                recorded[0].note.as_deref(),
                Some("Job has reached the specified backoff limit")
            );
        }

        #[tokio::test]
        async fn running_job_is_not_counted() {
            let capture = StatusCapture::new();
            let kube = kube_with_jobs(vec![job("nightly-1", run_start(), None)], &capture);

            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockResticExecutor::new()),
            ));
            reconcile(Arc::new(nightly(backup_spec("main", None))), ctx)
                .await
                .expect("reconcile succeeds");

            let status = capture.last().expect("status written");
            let run = status.last_backup.expect("run recorded");
            assert_eq!(run.result, BackupRunResult::Running);
            assert!(run.completion_time.is_none());
            assert!(status.statistics.is_none());
        }
    }

    #[tokio::test]
    async fn deletion_only_drops_finalizer() {
        let mut kube = MockKubeClient::new();
        kube.expect_set_finalizers()
            .withf(|kind, name, _, finalizers| {
                *kind == ManagedKind::Backup && name == "nightly" && finalizers.is_empty()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        kube.expect_get_repository().never();

        let mut backup = nightly(backup_spec("main", None));
        backup.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let ctx = Arc::new(Context::for_testing(
            Arc::new(kube),
            Arc::new(MockResticExecutor::new()),
        ));
        let action = reconcile(Arc::new(backup), ctx)
            .await
            .expect("deletion succeeds");
        assert_eq!(action, Action::await_change());
    }
}
