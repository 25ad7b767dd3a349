//! ResticRepository Custom Resource Definition
//!
//! A ResticRepository describes where snapshots are stored and which secret
//! holds the repository passphrase. The repository controller keeps it
//! initialized, unlocked and reports statistics.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SecretKeySelector};

/// Periodic `restic check` settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityCheckSpec {
    /// Record integrity check results in status
    #[serde(default)]
    pub enabled: bool,

    /// Cron schedule for full checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

/// Local cache volume for restic
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheSpec {
    /// Use a persistent cache
    #[serde(default)]
    pub enabled: bool,

    /// Cache volume size
    #[serde(default = "default_cache_size")]
    pub size: String,

    /// Storage class for the cache volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

fn default_cache_size() -> String {
    "5Gi".to_string()
}

/// Repository statistics reported by `restic stats`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStatistics {
    /// Human-readable restore size, e.g. "1.5 GiB"
    pub total_size: String,
    /// Files across all snapshots
    pub total_file_count: u64,
    /// Number of snapshots
    pub snapshot_count: u64,
}

/// Status of a ResticRepository
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResticRepositoryStatus {
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When the repository was last checked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_integrity_check: Option<DateTime<Utc>>,

    /// Result of the last check ("Passed" or "Failed")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_integrity_check_result: Option<String>,

    /// Repository statistics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<RepositoryStatistics>,

    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Specification for a ResticRepository
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "backup.resticbackup.io",
    version = "v1alpha1",
    kind = "ResticRepository",
    plural = "resticrepositories",
    shortname = "rr",
    namespaced,
    status = "ResticRepositoryStatus",
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.repositoryURL"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Snapshots","type":"integer","jsonPath":".status.statistics.snapshotCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResticRepositorySpec {
    /// restic repository URL, e.g. `s3:s3.amazonaws.com/bucket/path`
    #[serde(rename = "repositoryURL")]
    pub repository_url: String,

    /// Secret with `RESTIC_PASSWORD` and optional AWS keys
    pub credentials_secret_ref: SecretKeySelector,

    /// Integrity check settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_check: Option<IntegrityCheckSpec>,

    /// Cache settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSpec>,
}
