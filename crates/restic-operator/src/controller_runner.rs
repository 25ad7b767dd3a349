//! Controller runner - builds one controller future per managed kind
//!
//! Each future runs until a shutdown signal arrives. The caller decides how
//! to compose them (see `main`).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};

use restic_common::crd::{GlobalRetentionPolicy, ResticBackup, ResticRepository, ResticRestore};
use restic_common::{Error, ManagedKind};
use restic_controller::{
    backup, error_policy, repository, restore, retention, with_deadline, Context,
};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A running controller
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the four controllers sharing `ctx`
pub fn build_controllers(
    client: Client,
    ctx: Arc<Context>,
    concurrency: u16,
) -> Vec<ControllerFuture> {
    let config = ControllerConfig::default().concurrency(concurrency);
    let backup_label = ctx.registry.get(ManagedKind::Backup).owner_label.clone();
    let retention_label = ctx
        .registry
        .get(ManagedKind::RetentionPolicy)
        .owner_label
        .clone();

    let repositories: Api<ResticRepository> = Api::all(client.clone());
    let repository_ctrl = Controller::new(repositories, watcher())
        .with_config(config.clone())
        .shutdown_on_signal()
        .run(
            bounded("ResticRepository", repository::reconcile),
            error_policy::<ResticRepository>,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("Repository"));

    let backups: Api<ResticBackup> = Api::all(client.clone());
    let backup_ctrl = Controller::new(backups, watcher())
        .with_config(config.clone())
        .owns(Api::<CronJob>::all(client.clone()), watcher())
        .watches(
            Api::<Job>::all(client.clone()),
            watcher().labels(&backup_label),
            move |job| labelled_owner::<ResticBackup>(&backup_label, &job),
        )
        .shutdown_on_signal()
        .run(
            bounded("ResticBackup", backup::reconcile),
            error_policy::<ResticBackup>,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("Backup"));

    let restores: Api<ResticRestore> = Api::all(client.clone());
    let restore_ctrl = Controller::new(restores, watcher())
        .with_config(config.clone())
        .owns(Api::<Job>::all(client.clone()), watcher())
        .shutdown_on_signal()
        .run(
            bounded("ResticRestore", restore::reconcile),
            error_policy::<ResticRestore>,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("Restore"));

    let policies: Api<GlobalRetentionPolicy> = Api::all(client.clone());
    let retention_ctrl = Controller::new(policies, watcher())
        .with_config(config)
        .owns(Api::<CronJob>::all(client.clone()), watcher())
        .watches(
            Api::<Job>::all(client),
            watcher().labels(&retention_label),
            move |job| labelled_owner::<GlobalRetentionPolicy>(&retention_label, &job),
        )
        .shutdown_on_signal()
        .run(
            bounded("GlobalRetentionPolicy", retention::reconcile),
            error_policy::<GlobalRetentionPolicy>,
            ctx,
        )
        .for_each(log_reconcile_result("RetentionPolicy"));

    tracing::info!("- ResticRepository controller");
    tracing::info!("- ResticBackup controller");
    tracing::info!("- ResticRestore controller");
    tracing::info!("- GlobalRetentionPolicy controller");

    vec![
        Box::pin(repository_ctrl),
        Box::pin(backup_ctrl),
        Box::pin(restore_ctrl),
        Box::pin(retention_ctrl),
    ]
}

/// Wrap a reconciler so every run is cut off at the context's deadline
fn bounded<K, F, Fut>(
    kind: &'static str,
    reconcile: F,
) -> impl FnMut(Arc<K>, Arc<Context>) -> BoxFuture<'static, Result<Action, Error>>
where
    K: Resource + Send + Sync + 'static,
    F: Fn(Arc<K>, Arc<Context>) -> Fut,
    Fut: Future<Output = Result<Action, Error>> + Send + 'static,
{
    move |obj, ctx| {
        let operation = format!(
            "reconcile {kind} {}/{}",
            obj.namespace().unwrap_or_default(),
            obj.name_any()
        );
        let after = ctx.reconcile_timeout;
        Box::pin(with_deadline(operation, after, reconcile(obj, ctx)))
    }
}

/// Map a Job spawned by a CronJob back to the resource named in `label`
///
/// CronJob-spawned Jobs are owned by the CronJob, not by our resource, so
/// ownership cannot be followed directly.
fn labelled_owner<K>(label: &str, job: &Job) -> Option<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    let name = job.labels().get(label)?;
    let namespace = job.namespace()?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
