//! GlobalRetentionPolicy Custom Resource Definition
//!
//! Applies `restic forget` rules across every snapshot in a repository on a
//! schedule, independent of the backups that created them.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, CrossNamespaceObjectReference, JobConfiguration, NotificationConfig,
    ObjectReference, RetentionRules,
};

/// Which snapshots a policy applies to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFilter {
    /// Snapshot tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Snapshot hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// One forget rule set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicyRule {
    /// Snapshot filter
    #[serde(default)]
    pub selector: SnapshotFilter,
    /// Keep rules
    #[serde(default)]
    pub retention: RetentionRules,
}

/// Status of a GlobalRetentionPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRetentionPolicyStatus {
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Last run start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,

    /// Last run outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_result: Option<String>,

    /// Last run duration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_duration: Option<String>,

    /// Repository size before the last run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_size_before: Option<String>,

    /// Repository size after the last run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_size_after: Option<String>,

    /// Snapshots removed by the last run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshots_removed: Option<u64>,

    /// Next scheduled run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,

    /// Generated CronJob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_job_ref: Option<ObjectReference>,

    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Specification for a GlobalRetentionPolicy
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "backup.resticbackup.io",
    version = "v1alpha1",
    kind = "GlobalRetentionPolicy",
    plural = "globalretentionpolicies",
    shortname = "grp",
    namespaced,
    status = "GlobalRetentionPolicyStatus",
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Last Run","type":"date","jsonPath":".status.lastRun"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRetentionPolicySpec {
    /// Repository the rules apply to
    pub repository_ref: CrossNamespaceObjectReference,

    /// Five-field cron schedule
    pub schedule: String,

    /// Rule sets, executed in order
    #[serde(default)]
    pub policies: Vec<RetentionPolicyRule>,

    /// Run `restic prune` after all rule sets
    #[serde(default)]
    pub prune: bool,

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_order_is_preserved() {
        let spec: GlobalRetentionPolicySpec = serde_yaml::from_str(
            r#"
repositoryRef:
  name: main
  namespace: backups
schedule: "0 3 * * 0"
policies:
  - selector:
      tags: [a]
    retention:
      keepLast: 5
  - selector:
      tags: [b]
      hostname: db-0
    retention:
      keepDaily: 7
prune: true
"#,
        )
        .expect("parse spec");

        assert_eq!(spec.policies.len(), 2);
        assert_eq!(spec.policies[0].selector.tags, vec!["a"]);
        assert_eq!(spec.policies[0].retention.keep_last, Some(5));
        assert_eq!(spec.policies[1].selector.hostname.as_deref(), Some("db-0"));
        assert_eq!(spec.policies[1].retention.keep_daily, Some(7));
        assert!(spec.prune);
        assert!(!spec.suspend);
        assert_eq!(spec.repository_ref.namespace_or("default"), "backups");
    }
}
