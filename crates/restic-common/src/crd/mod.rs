//! Custom Resource Definitions for the restic operator
//!
//! All kinds live in the `backup.resticbackup.io/v1alpha1` API group.

mod backup;
mod repository;
mod restore;
mod retention;
mod types;

pub use backup::{
    BackupHooks, BackupRetention, BackupRunResult, BackupRunStatus, BackupSource,
    BackupStatistics, CustomSource, PodVolumeSource, PvcSource, ResticBackup, ResticBackupSpec,
    ResticBackupStatus, ResticOptions, SourceKind,
};
pub use repository::{
    CacheSpec, IntegrityCheckSpec, RepositoryStatistics, ResticRepository, ResticRepositorySpec,
    ResticRepositoryStatus,
};
pub use restore::{
    NewPvcTarget, PvcTarget, ResticRestore, ResticRestoreSpec, ResticRestoreStatus,
    RestoreHooks, RestoreOptions, RestorePhase, RestoreTarget, SnapshotSelector,
};
pub use retention::{
    GlobalRetentionPolicy, GlobalRetentionPolicySpec, GlobalRetentionPolicyStatus,
    RetentionPolicyRule, SnapshotFilter,
};
pub use types::{
    ConcurrencyPolicy, Condition, ConditionStatus, CrossNamespaceObjectReference, ExecHook, Hook,
    JobConfiguration, JobHook, NotificationConfig, NtfyConfig, ObjectReference,
    PodSecurityOverride, PushgatewayConfig, ResourceSpec, RetentionRules, SecretKeySelector,
    TolerationSpec, CONDITION_DEGRADED, CONDITION_PROGRESSING, CONDITION_READY,
    CONDITION_REPOSITORY_READY, DEFAULT_RESTIC_IMAGE,
};

/// API group for all kinds
pub const API_GROUP: &str = "backup.resticbackup.io";

/// API version for all kinds
pub const API_VERSION: &str = "v1alpha1";

pub(crate) fn default_true() -> bool {
    true
}
