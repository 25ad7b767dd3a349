//! ResticBackup Custom Resource Definition
//!
//! A ResticBackup schedules `restic backup` runs against a repository. The
//! backup controller turns it into a CronJob named `resticbackup-<name>`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, CrossNamespaceObjectReference, Hook, JobConfiguration, NotificationConfig,
    ObjectReference, RetentionRules, DEFAULT_RESTIC_IMAGE,
};

/// Back up a PersistentVolumeClaim mounted read-only at `/backup`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcSource {
    /// Claim to back up
    pub claim_name: String,
    /// Paths inside the volume; the whole volume when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    /// Exclude patterns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
}

/// Back up a volume of a running pod
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodVolumeSource {
    /// Labels selecting the pod
    pub selector: BTreeMap<String, String>,
    /// Volume name in the pod
    pub volume_name: String,
    /// Container mounting the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

/// Back up a node path
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomSource {
    /// Path passed to `restic backup`
    pub backup_path: String,
    /// Host path mounted read-only at `backupPath`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
}

/// What to back up; exactly one field must be set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSource {
    /// PersistentVolumeClaim source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PvcSource>,
    /// Pod volume source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_volume_backup: Option<PodVolumeSource>,
    /// Node path source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_source: Option<CustomSource>,
}

/// Resolved backup source
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SourceKind<'a> {
    /// PersistentVolumeClaim
    Pvc(&'a PvcSource),
    /// Pod volume
    PodVolume(&'a PodVolumeSource),
    /// Node path
    Custom(&'a CustomSource),
}

impl BackupSource {
    /// The single configured source, or an error describing the problem
    pub fn resolve(&self) -> Result<SourceKind<'_>, String> {
        match (&self.pvc, &self.pod_volume_backup, &self.custom_source) {
            (Some(pvc), None, None) => Ok(SourceKind::Pvc(pvc)),
            (None, Some(pod), None) => Ok(SourceKind::PodVolume(pod)),
            (None, None, Some(custom)) => Ok(SourceKind::Custom(custom)),
            (None, None, None) => Err("no backup source configured".to_string()),
            _ => Err("exactly one backup source must be configured".to_string()),
        }
    }
}

/// restic invocation options
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResticOptions {
    /// Snapshot hostname (defaults to the backup name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Snapshot tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Extra arguments appended before the paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    /// restic image
    #[serde(default = "default_image")]
    pub image: String,
}

impl Default for ResticOptions {
    fn default() -> Self {
        Self {
            hostname: None,
            tags: Vec::new(),
            extra_args: Vec::new(),
            image: default_image(),
        }
    }
}

fn default_image() -> String {
    DEFAULT_RESTIC_IMAGE.to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Backup lifecycle hooks
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupHooks {
    /// Before the backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_backup: Option<Hook>,
    /// After a successful backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_backup: Option<Hook>,
    /// After a failed backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Hook>,
}

/// Retention applied right after each backup run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRetention {
    /// Run `restic forget` after the backup
    #[serde(default)]
    pub enabled: bool,
    /// Keep rules
    #[serde(default)]
    pub policy: RetentionRules,
    /// Pass `--prune` to forget
    #[serde(default)]
    pub prune: bool,
    /// `--group-by` fields, e.g. `host`, `tags`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
}

/// Outcome of a backup run
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupRunResult {
    /// Still running
    #[default]
    Running,
    /// Completed
    Succeeded,
    /// Failed
    Failed,
}

/// Record of one backup run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRunStatus {
    /// Start time
    pub start_time: DateTime<Utc>,
    /// Completion time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    /// Duration, e.g. "1m30s"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// Snapshot created by the run
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "snapshotID")]
    pub snapshot_id: Option<String>,
    /// Run outcome
    #[serde(default)]
    pub result: BackupRunResult,
}

/// Aggregate backup statistics
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatistics {
    /// Total runs
    #[serde(default)]
    pub total_backups: u64,
    /// Successful runs
    #[serde(default)]
    pub successful_backups: u64,
    /// Failed runs
    #[serde(default)]
    pub failed_backups: u64,
    /// Bytes added by the last run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_size: Option<String>,
    /// Files processed by the last run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_files: Option<u64>,
}

/// Status of a ResticBackup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResticBackupStatus {
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Last run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<BackupRunStatus>,
    /// Completion time of the last successful run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_backup: Option<DateTime<Utc>>,
    /// Next scheduled run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_backup: Option<DateTime<Utc>>,
    /// Aggregate statistics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<BackupStatistics>,
    /// Last retention run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retention_run: Option<DateTime<Utc>>,
    /// Snapshots remaining after retention
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshots_after_retention: Option<u64>,
    /// Generated CronJob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_job_ref: Option<ObjectReference>,
    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Specification for a ResticBackup
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "backup.resticbackup.io",
    version = "v1alpha1",
    kind = "ResticBackup",
    plural = "resticbackups",
    shortname = "rb",
    namespaced,
    status = "ResticBackupStatus",
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Last Backup","type":"date","jsonPath":".status.lastSuccessfulBackup"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResticBackupSpec {
    /// Repository to back up into
    pub repository_ref: CrossNamespaceObjectReference,

    /// Five-field cron schedule
    pub schedule: String,

    /// IANA timezone for the schedule
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Data source
    pub source: BackupSource,

    /// restic options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restic: Option<ResticOptions>,

    /// Lifecycle hooks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<BackupHooks>,

    /// Retention after each run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<BackupRetention>,

    /// Notification targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationConfig>,

    /// Job execution settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_config: Option<JobConfiguration>,

    /// Suspend scheduling
    #[serde(default)]
    pub suspend: bool,
}

impl ResticBackupSpec {
    /// Image used by jobs derived from this backup
    pub fn image(&self) -> &str {
        self.restic
            .as_ref()
            .map(|r| r.image.as_str())
            .filter(|i| !i.is_empty())
            .unwrap_or(DEFAULT_RESTIC_IMAGE)
    }
}
