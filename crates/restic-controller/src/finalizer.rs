//! Finalizer bookkeeping shared by the four reconcilers
//!
//! Generated Jobs and CronJobs carry owner references, so deletion only has
//! to drop the finalizer and let garbage collection do the rest.

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use restic_common::kube_utils::{finalizers_with, finalizers_without, has_finalizer};
use restic_common::{Error, KindInfo};

use crate::client::KubeClient;

/// Add the kind's finalizer if it is missing
///
/// Returns true when a patch was sent.
pub async fn ensure_finalizer<K>(
    obj: &K,
    info: &KindInfo,
    kube: &dyn KubeClient,
) -> Result<bool, Error>
where
    K: Resource,
{
    let meta = obj.meta();
    if has_finalizer(meta, &info.finalizer) {
        return Ok(false);
    }

    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    debug!(kind = %info.kind, %name, %namespace, "adding finalizer");
    kube.set_finalizers(
        info.kind,
        &name,
        &namespace,
        finalizers_with(meta, &info.finalizer),
    )
    .await?;
    Ok(true)
}

/// Release a resource that is being deleted
pub async fn handle_deletion<K>(
    obj: &K,
    info: &KindInfo,
    kube: &dyn KubeClient,
) -> Result<Action, Error>
where
    K: Resource,
{
    let meta = obj.meta();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    if has_finalizer(meta, &info.finalizer) {
        info!(kind = %info.kind, %name, %namespace, "removing finalizer");
        kube.set_finalizers(
            info.kind,
            &name,
            &namespace,
            finalizers_without(meta, &info.finalizer),
        )
        .await?;
    }

    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use restic_common::{ManagedKind, ResourceRegistry};

    use super::*;
    use crate::client::MockKubeClient;
    use crate::testing::{repository, NAMESPACE};

    #[tokio::test]
    async fn existing_finalizer_is_left_alone() {
        let registry = ResourceRegistry::new();
        let kube = MockKubeClient::new();
        let repo = repository("main", NAMESPACE);

        let patched = ensure_finalizer(&repo, registry.get(ManagedKind::Repository), &kube)
            .await
            .expect("no API call needed");
        assert!(!patched);
    }

    #[tokio::test]
    async fn missing_finalizer_is_added() {
        let registry = ResourceRegistry::new();
        let mut kube = MockKubeClient::new();
        kube.expect_set_finalizers()
            .withf(|kind, name, ns, finalizers| {
                *kind == ManagedKind::Repository
                    && name == "main"
                    && ns == NAMESPACE
                    && *finalizers == ["backup.resticbackup.io/resticrepository-finalizer"]
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut repo = repository("main", NAMESPACE);
        repo.metadata.finalizers = None;

        let patched = ensure_finalizer(&repo, registry.get(ManagedKind::Repository), &kube)
            .await
            .expect("patch succeeds");
        assert!(patched);
    }

    #[tokio::test]
    async fn deletion_keeps_foreign_finalizers() {
        let registry = ResourceRegistry::new();
        let mut kube = MockKubeClient::new();
        kube.expect_set_finalizers()
            .withf(|_, _, _, finalizers| *finalizers == ["example.com/other"])
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut repo = repository("main", NAMESPACE);
        repo.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        repo.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push("example.com/other".to_string());

        let action = handle_deletion(&repo, registry.get(ManagedKind::Repository), &kube)
            .await
            .expect("deletion handled");
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn deletion_without_our_finalizer_is_a_no_op() {
        let registry = ResourceRegistry::new();
        let kube = MockKubeClient::new();
        let mut repo = repository("main", NAMESPACE);
        repo.metadata.finalizers = None;

        let action = handle_deletion(&repo, registry.get(ManagedKind::Repository), &kube)
            .await
            .expect("nothing to do");
        assert_eq!(action, Action::await_change());
    }
}
