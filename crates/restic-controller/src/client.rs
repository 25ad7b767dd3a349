//! Kubernetes API seam for the reconcilers
//!
//! Every API call a reconciler makes goes through [`KubeClient`] so that
//! reconcile logic can be unit-tested against `MockKubeClient`.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use restic_common::crd::{
    GlobalRetentionPolicy, GlobalRetentionPolicyStatus, ResticBackup, ResticBackupStatus,
    ResticRepository, ResticRepositoryStatus, ResticRestore, ResticRestoreStatus,
};
use restic_common::kube_utils::{patch_finalizers, patch_resource_status, StatusUpdate};
use restic_common::{Error, ManagedKind, FIELD_MANAGER};

/// Kubernetes operations used by the restic reconcilers
///
/// Lookups return `Ok(None)` when the object does not exist.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a ResticRepository
    async fn get_repository(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ResticRepository>, Error>;

    /// Get a ResticBackup
    async fn get_backup(&self, name: &str, namespace: &str)
        -> Result<Option<ResticBackup>, Error>;

    /// Get a Secret
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Merge-patch a ResticRepository status, returning the new resourceVersion
    async fn patch_repository_status(
        &self,
        name: &str,
        namespace: &str,
        update: &StatusUpdate<ResticRepositoryStatus>,
    ) -> Result<Option<String>, Error>;

    /// Merge-patch a ResticBackup status, returning the new resourceVersion
    async fn patch_backup_status(
        &self,
        name: &str,
        namespace: &str,
        update: &StatusUpdate<ResticBackupStatus>,
    ) -> Result<Option<String>, Error>;

    /// Merge-patch a ResticRestore status, returning the new resourceVersion
    async fn patch_restore_status(
        &self,
        name: &str,
        namespace: &str,
        update: &StatusUpdate<ResticRestoreStatus>,
    ) -> Result<Option<String>, Error>;

    /// Merge-patch a GlobalRetentionPolicy status, returning the new resourceVersion
    async fn patch_retention_status(
        &self,
        name: &str,
        namespace: &str,
        update: &StatusUpdate<GlobalRetentionPolicyStatus>,
    ) -> Result<Option<String>, Error>;

    /// Replace the finalizer list of a managed resource
    async fn set_finalizers(
        &self,
        kind: ManagedKind,
        name: &str,
        namespace: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error>;

    /// Get a CronJob
    async fn get_cron_job(&self, name: &str, namespace: &str) -> Result<Option<CronJob>, Error>;

    /// Create a CronJob
    async fn create_cron_job(&self, namespace: &str, cron_job: &CronJob) -> Result<(), Error>;

    /// Replace a CronJob (carries the existing resourceVersion)
    async fn replace_cron_job(
        &self,
        name: &str,
        namespace: &str,
        cron_job: &CronJob,
    ) -> Result<(), Error>;

    /// Get a Job
    async fn get_job(&self, name: &str, namespace: &str) -> Result<Option<Job>, Error>;

    /// Create a Job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error>;

    /// Create a PersistentVolumeClaim
    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim)
        -> Result<(), Error>;

    /// List Jobs matching a label selector
    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_repository(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ResticRepository>, Error> {
        Ok(self.api::<ResticRepository>(namespace).get_opt(name).await?)
    }

    async fn get_backup(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ResticBackup>, Error> {
        Ok(self.api::<ResticBackup>(namespace).get_opt(name).await?)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        Ok(self.api::<Secret>(namespace).get_opt(name).await?)
    }

    async fn patch_repository_status(
        &self,
        name: &str,
        namespace: &str,
        update: &StatusUpdate<ResticRepositoryStatus>,
    ) -> Result<Option<String>, Error> {
        let patched: ResticRepository =
            patch_resource_status(&self.client, name, namespace, update, FIELD_MANAGER).await?;
        Ok(patched.resource_version())
    }

    async fn patch_backup_status(
        &self,
        name: &str,
        namespace: &str,
        update: &StatusUpdate<ResticBackupStatus>,
    ) -> Result<Option<String>, Error> {
        let patched: ResticBackup =
            patch_resource_status(&self.client, name, namespace, update, FIELD_MANAGER).await?;
        Ok(patched.resource_version())
    }

    async fn patch_restore_status(
        &self,
        name: &str,
        namespace: &str,
        update: &StatusUpdate<ResticRestoreStatus>,
    ) -> Result<Option<String>, Error> {
        let patched: ResticRestore =
            patch_resource_status(&self.client, name, namespace, update, FIELD_MANAGER).await?;
        Ok(patched.resource_version())
    }

    async fn patch_retention_status(
        &self,
        name: &str,
        namespace: &str,
        update: &StatusUpdate<GlobalRetentionPolicyStatus>,
    ) -> Result<Option<String>, Error> {
        let patched: GlobalRetentionPolicy =
            patch_resource_status(&self.client, name, namespace, update, FIELD_MANAGER).await?;
        Ok(patched.resource_version())
    }

    async fn set_finalizers(
        &self,
        kind: ManagedKind,
        name: &str,
        namespace: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let client = &self.client;
        match kind {
            ManagedKind::Repository => {
                patch_finalizers::<ResticRepository>(client, name, namespace, finalizers, FIELD_MANAGER)
                    .await?
            }
            ManagedKind::Backup => {
                patch_finalizers::<ResticBackup>(client, name, namespace, finalizers, FIELD_MANAGER)
                    .await?
            }
            ManagedKind::Restore => {
                patch_finalizers::<ResticRestore>(client, name, namespace, finalizers, FIELD_MANAGER)
                    .await?
            }
            ManagedKind::RetentionPolicy => {
                patch_finalizers::<GlobalRetentionPolicy>(
                    client,
                    name,
                    namespace,
                    finalizers,
                    FIELD_MANAGER,
                )
                .await?
            }
        }
        Ok(())
    }

    async fn get_cron_job(&self, name: &str, namespace: &str) -> Result<Option<CronJob>, Error> {
        Ok(self.api::<CronJob>(namespace).get_opt(name).await?)
    }

    async fn create_cron_job(&self, namespace: &str, cron_job: &CronJob) -> Result<(), Error> {
        self.api::<CronJob>(namespace)
            .create(&PostParams::default(), cron_job)
            .await?;
        Ok(())
    }

    async fn replace_cron_job(
        &self,
        name: &str,
        namespace: &str,
        cron_job: &CronJob,
    ) -> Result<(), Error> {
        self.api::<CronJob>(namespace)
            .replace(name, &PostParams::default(), cron_job)
            .await?;
        Ok(())
    }

    async fn get_job(&self, name: &str, namespace: &str) -> Result<Option<Job>, Error> {
        Ok(self.api::<Job>(namespace).get_opt(name).await?)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error> {
        self.api::<Job>(namespace)
            .create(&PostParams::default(), job)
            .await?;
        Ok(())
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), Error> {
        self.api::<PersistentVolumeClaim>(namespace)
            .create(&PostParams::default(), pvc)
            .await?;
        Ok(())
    }

    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>, Error> {
        let jobs = self
            .api::<Job>(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(jobs.items)
    }
}
