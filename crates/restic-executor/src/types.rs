//! Inputs and outputs of restic operations

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use restic_common::crd::RetentionRules;
use serde::{Deserialize, Serialize};

/// Environment variable restic reads the repository location from
pub const ENV_REPOSITORY: &str = "RESTIC_REPOSITORY";
/// Environment variable restic reads the repository password from
pub const ENV_PASSWORD: &str = "RESTIC_PASSWORD";
/// S3 access key
pub const ENV_AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
/// S3 secret key
pub const ENV_AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
/// Local cache directory
pub const ENV_CACHE_DIR: &str = "RESTIC_CACHE_DIR";

/// Everything restic needs to open a repository
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Repository URL
    pub repository: String,
    /// Repository password
    pub password: String,
    /// S3 access key
    pub aws_access_key_id: Option<String>,
    /// S3 secret key
    pub aws_secret_access_key: Option<String>,
    /// Cache directory
    pub cache_dir: Option<String>,
}

impl Credentials {
    /// Credentials for `repository` protected by `password`
    pub fn new(repository: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// Process environment for a restic invocation
    ///
    /// Optional values are only exported when non-empty.
    pub fn env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            (ENV_REPOSITORY, self.repository.clone()),
            (ENV_PASSWORD, self.password.clone()),
        ];
        let optional = [
            (ENV_AWS_ACCESS_KEY_ID, &self.aws_access_key_id),
            (ENV_AWS_SECRET_ACCESS_KEY, &self.aws_secret_access_key),
            (ENV_CACHE_DIR, &self.cache_dir),
        ];
        for (key, value) in optional {
            if let Some(v) = value.as_ref().filter(|v| !v.is_empty()) {
                env.push((key, v.clone()));
            }
        }
        env
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("repository", &self.repository)
            .field("password", &"<redacted>")
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field(
                "aws_secret_access_key",
                &self.aws_secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

/// One entry of `restic snapshots --json`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Snapshot {
    /// Full snapshot ID
    pub id: String,
    /// Abbreviated ID
    #[serde(default)]
    pub short_id: String,
    /// When the snapshot was taken
    pub time: DateTime<Utc>,
    /// Host the snapshot was taken on
    #[serde(default)]
    pub hostname: String,
    /// User that ran the backup
    #[serde(default)]
    pub username: String,
    /// Root tree ID
    #[serde(default)]
    pub tree: String,
    /// Backed-up paths
    #[serde(default)]
    pub paths: Vec<String>,
    /// Snapshot tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Parent snapshot ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// `restic stats --mode` value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatsMode {
    /// Size a full restore would produce
    #[default]
    RestoreSize,
    /// Deduplicated size on the backend
    RawData,
    /// Files counted by content
    FilesByContents,
    /// Blobs referenced by each file
    BlobsPerFile,
}

impl StatsMode {
    /// Flag value as restic expects it
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RestoreSize => "restore-size",
            Self::RawData => "raw-data",
            Self::FilesByContents => "files-by-contents",
            Self::BlobsPerFile => "blobs-per-file",
        }
    }
}

/// Repository statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepoStats {
    /// Total size in bytes for the selected mode
    pub total_size: u64,
    /// Number of files
    pub total_file_count: u64,
    /// Number of snapshots
    pub snapshot_count: u64,
}

/// Outcome of `restic check`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckResult {
    /// Whether the check passed
    pub success: bool,
    /// restic's stderr
    pub message: String,
    /// Wall time
    pub duration: Duration,
}

/// Options for `restic backup`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupOptions {
    /// Paths to back up
    pub paths: Vec<String>,
    /// Exclude patterns
    pub excludes: Vec<String>,
    /// Snapshot hostname
    pub hostname: String,
    /// Snapshot tags
    pub tags: Vec<String>,
    /// Extra arguments passed verbatim
    pub extra_args: Vec<String>,
}

/// Summary of `restic backup`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupResult {
    /// ID of the new snapshot
    pub snapshot_id: String,
    /// New files
    pub files_new: u64,
    /// Changed files
    pub files_changed: u64,
    /// Unmodified files
    pub files_unmodified: u64,
    /// New directories
    pub dirs_new: u64,
    /// Changed directories
    pub dirs_changed: u64,
    /// Unmodified directories
    pub dirs_unmodified: u64,
    /// Bytes added to the repository
    pub data_added: u64,
    /// Files processed
    pub total_files: u64,
    /// Bytes processed
    pub total_bytes: u64,
    /// Wall time
    pub duration: Duration,
}

/// Options for `restic restore`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Snapshot ID or `latest`
    pub snapshot_id: String,
    /// Target directory
    pub target: String,
    /// Include patterns
    pub include: Vec<String>,
    /// Exclude patterns
    pub exclude: Vec<String>,
    /// Verify restored files
    pub verify: bool,
}

/// Outcome of `restic restore`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreResult {
    /// Restored files, when restic reported them
    pub restored_files: u64,
    /// Restored bytes, when restic reported them
    pub restored_bytes: u64,
    /// Wall time
    pub duration: Duration,
}

/// Options for `restic forget`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ForgetOptions {
    /// Keep rules
    pub retention: RetentionRules,
    /// Only consider snapshots with these tags
    pub tags: Vec<String>,
    /// Only consider snapshots from this host
    pub hostname: String,
    /// Grouping keys, e.g. `host`, `paths`
    pub group_by: Vec<String>,
    /// Prune after forgetting
    pub prune: bool,
    /// Report without removing
    pub dry_run: bool,
}

/// Outcome of `restic forget`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForgetResult {
    /// Snapshots removed across all groups
    pub snapshots_removed: u64,
    /// Snapshots kept across all groups
    pub snapshots_kept: u64,
}

/// Outcome of `restic prune`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PruneResult {
    /// Pack files deleted
    pub packs_deleted: u64,
    /// Bytes freed
    pub bytes_freed: u64,
    /// Wall time
    pub duration: Duration,
}
