//! ResticRestore Custom Resource Definition
//!
//! A ResticRestore restores a snapshot of a ResticBackup's repository into a
//! volume through a one-shot Job. It moves through
//! Pending -> InProgress -> Completed | Failed and never moves backward.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, CrossNamespaceObjectReference, Hook, JobConfiguration, ObjectReference,
};

/// Phase of a ResticRestore
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RestorePhase {
    /// Restore is pending
    #[default]
    Pending,
    /// Restore job is running
    InProgress,
    /// Restore completed successfully
    Completed,
    /// Restore failed
    Failed,
}

impl RestorePhase {
    /// Completed and Failed never change
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` is allowed
    ///
    /// Staying in the same phase is allowed so status can be refreshed.
    pub fn can_transition_to(self, next: RestorePhase) -> bool {
        if self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Filter used when no explicit snapshot ID is given
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSelector {
    /// Use the latest matching snapshot
    #[serde(default)]
    pub latest: bool,
    /// Snapshot must carry these tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Snapshot hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Snapshot taken before this time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<DateTime<Utc>>,
}

/// Restore into an existing claim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcTarget {
    /// Claim name
    pub claim_name: String,
    /// Subdirectory inside the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Restore into a claim created for the restore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewPvcTarget {
    /// Claim name
    pub name: String,
    /// Storage class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    /// Access modes (default ReadWriteOnce)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    /// Requested size, e.g. "10Gi"
    pub size: String,
}

/// Restore destination; exactly one field must be set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreTarget {
    /// Existing claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PvcTarget>,
    /// New claim
    #[serde(rename = "newPVC", default, skip_serializing_if = "Option::is_none")]
    pub new_pvc: Option<NewPvcTarget>,
}

impl RestoreTarget {
    /// Name of the claim the job mounts
    pub fn claim_name(&self) -> Option<&str> {
        self.pvc
            .as_ref()
            .map(|p| p.claim_name.as_str())
            .or_else(|| self.new_pvc.as_ref().map(|p| p.name.as_str()))
    }
}

/// Restore behavior
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOptions {
    /// Overwrite existing files
    #[serde(default = "super::default_true")]
    pub overwrite: bool,
    /// Verify restored files
    #[serde(default)]
    pub verify: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            overwrite: true,
            verify: false,
        }
    }
}

/// Restore lifecycle hooks
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreHooks {
    /// Before the restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_restore: Option<Hook>,
    /// After a successful restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_restore: Option<Hook>,
}

/// Status of a ResticRestore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResticRestoreStatus {
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Current phase; absent until first reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RestorePhase>,

    /// When the restore job was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the restore finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Snapshot ID or token passed to `restic restore`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_snapshot: Option<String>,

    /// Files restored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_files: Option<u64>,

    /// Bytes restored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_size: Option<String>,

    /// Generated Job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_ref: Option<ObjectReference>,

    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Specification for a ResticRestore
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "backup.resticbackup.io",
    version = "v1alpha1",
    kind = "ResticRestore",
    plural = "resticrestores",
    shortname = "rres",
    namespaced,
    status = "ResticRestoreStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Snapshot","type":"string","jsonPath":".status.restoredSnapshot"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResticRestoreSpec {
    /// Backup whose repository is restored from
    pub backup_ref: CrossNamespaceObjectReference,

    /// Explicit snapshot ID; wins over the selector
    #[serde(rename = "snapshotID", default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,

    /// Snapshot filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_selector: Option<SnapshotSelector>,

    /// Destination
    pub target: RestoreTarget,

    /// Only restore these paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_paths: Vec<String>,

    /// Skip these paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_paths: Vec<String>,

    /// Restore options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<RestoreOptions>,

    /// Lifecycle hooks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<RestoreHooks>,

    /// Job execution settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_config: Option<JobConfiguration>,
}
