//! Registry of the kinds this operator manages
//!
//! Built once at startup and shared by reference with every controller.
//! Each entry ties a kind to its CRD, finalizer token, generated-object
//! prefix and the labels stamped on generated Jobs and CronJobs.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

use crate::crd::{
    GlobalRetentionPolicy, ResticBackup, ResticRepository, ResticRestore, API_GROUP,
};
use crate::{Error, LABEL_COMPONENT, LABEL_MANAGED_BY, LABEL_NAME, OPERATOR_NAME};

/// Kinds reconciled by this operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagedKind {
    /// ResticRepository
    Repository,
    /// ResticBackup
    Backup,
    /// ResticRestore
    Restore,
    /// GlobalRetentionPolicy
    RetentionPolicy,
}

impl std::fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repository => write!(f, "ResticRepository"),
            Self::Backup => write!(f, "ResticBackup"),
            Self::Restore => write!(f, "ResticRestore"),
            Self::RetentionPolicy => write!(f, "GlobalRetentionPolicy"),
        }
    }
}

/// Registry entry for one kind
#[derive(Debug, Clone)]
pub struct KindInfo {
    /// Which kind
    pub kind: ManagedKind,
    /// Finalizer token, `backup.resticbackup.io/<kind>-finalizer`
    pub finalizer: String,
    /// Prefix of generated Jobs/CronJobs (`<prefix>-<name>`), if any
    pub job_prefix: Option<&'static str>,
    /// `app.kubernetes.io/component` value on generated objects
    pub component: &'static str,
    /// Label pointing generated objects back at their owner
    pub owner_label: String,
    /// Generated CRD
    pub crd: CustomResourceDefinition,
}

impl KindInfo {
    fn new(
        kind: ManagedKind,
        crd: CustomResourceDefinition,
        job_prefix: Option<&'static str>,
        component: &'static str,
        owner_label: &str,
    ) -> Self {
        let lower = kind.to_string().to_lowercase();
        Self {
            kind,
            finalizer: format!("{API_GROUP}/{lower}-finalizer"),
            job_prefix,
            component,
            owner_label: format!("{API_GROUP}/{owner_label}"),
            crd,
        }
    }

    /// CRD object name, e.g. `resticbackups.backup.resticbackup.io`
    pub fn crd_name(&self) -> String {
        self.crd.metadata.name.clone().unwrap_or_default()
    }

    /// Name of the generated Job/CronJob for `resource`
    pub fn job_name(&self, resource: &str) -> Option<String> {
        self.job_prefix.map(|prefix| format!("{prefix}-{resource}"))
    }

    /// Labels for generated objects owned by `resource`
    pub fn labels(&self, resource: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_NAME.to_string(), OPERATOR_NAME.to_string()),
            (LABEL_COMPONENT.to_string(), self.component.to_string()),
            (LABEL_MANAGED_BY.to_string(), OPERATOR_NAME.to_string()),
            (self.owner_label.clone(), resource.to_string()),
        ])
    }
}

/// Registry of managed kinds
#[derive(Debug, Clone)]
pub struct ResourceRegistry {
    kinds: Vec<KindInfo>,
}

impl ResourceRegistry {
    /// Build the registry for all four kinds
    pub fn new() -> Self {
        Self {
            kinds: vec![
                KindInfo::new(
                    ManagedKind::Repository,
                    ResticRepository::crd(),
                    None,
                    "repository",
                    "repository",
                ),
                KindInfo::new(
                    ManagedKind::Backup,
                    ResticBackup::crd(),
                    Some("resticbackup"),
                    "backup",
                    "backup",
                ),
                KindInfo::new(
                    ManagedKind::Restore,
                    ResticRestore::crd(),
                    Some("resticrestore"),
                    "restore",
                    "restore",
                ),
                KindInfo::new(
                    ManagedKind::RetentionPolicy,
                    GlobalRetentionPolicy::crd(),
                    Some("globalretention"),
                    "retention",
                    "retentionpolicy",
                ),
            ],
        }
    }

    /// Entry for a kind
    pub fn get(&self, kind: ManagedKind) -> &KindInfo {
        // entries are stored in ManagedKind declaration order
        &self.kinds[kind as usize]
    }

    /// All entries in install order
    pub fn iter(&self) -> impl Iterator<Item = &KindInfo> {
        self.kinds.iter()
    }

    /// All CRDs as a multi-document YAML stream
    pub fn crds_yaml(&self) -> Result<String, Error> {
        let docs = self
            .kinds
            .iter()
            .map(|k| serde_yaml::to_string(&k.crd).map_err(|e| Error::serialization(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(docs.join("---\n"))
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
