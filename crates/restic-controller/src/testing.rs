//! Shared fixtures and mocks for reconciler tests

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use k8s_openapi::ByteString;
use kube::runtime::events::EventType;
use mockall::mock;

use restic_common::crd::{
    BackupSource, Condition, CrossNamespaceObjectReference, GlobalRetentionPolicy,
    GlobalRetentionPolicySpec, PvcSource, PvcTarget, ResticBackup, ResticBackupSpec,
    ResticRepository, ResticRepositorySpec, ResticRepositoryStatus, ResticRestore,
    ResticRestoreSpec, RestoreTarget, SecretKeySelector,
};
use restic_common::events::EventPublisher;
use restic_common::ResourceRegistry;
use restic_executor::{
    BackupOptions, BackupResult, CheckResult, Credentials, Executor, ExecutorError,
    ForgetOptions, ForgetResult, PruneResult, RepoStats, RestoreOptions, RestoreResult, Snapshot,
    StatsMode,
};

mock! {
    pub ResticExecutor {}

    #[async_trait::async_trait]
    impl Executor for ResticExecutor {
        async fn init(&self, creds: &Credentials) -> Result<(), ExecutorError>;
        async fn unlock(&self, creds: &Credentials) -> Result<(), ExecutorError>;
        async fn check(&self, creds: &Credentials) -> Result<CheckResult, ExecutorError>;
        async fn stats(&self, creds: &Credentials, mode: StatsMode) -> Result<RepoStats, ExecutorError>;
        async fn snapshots(&self, creds: &Credentials) -> Result<Vec<Snapshot>, ExecutorError>;
        async fn backup(&self, creds: &Credentials, opts: &BackupOptions) -> Result<BackupResult, ExecutorError>;
        async fn restore(&self, creds: &Credentials, opts: &RestoreOptions) -> Result<RestoreResult, ExecutorError>;
        async fn forget(&self, creds: &Credentials, opts: &ForgetOptions) -> Result<ForgetResult, ExecutorError>;
        async fn prune(&self, creds: &Credentials) -> Result<PruneResult, ExecutorError>;
    }
}

mock! {
    pub EventRecorder {}

    #[async_trait::async_trait]
    impl EventPublisher for EventRecorder {
        async fn publish(
            &self,
            resource_ref: &ObjectReference,
            type_: EventType,
            reason: &str,
            action: &str,
            note: Option<String>,
        );
    }
}

pub const NAMESPACE: &str = "apps";
pub const SECRET_NAME: &str = "restic-creds";

/// Records every status a reconciler patches
#[derive(Clone)]
pub struct StatusCapture<S> {
    updates: Arc<Mutex<Vec<S>>>,
}

impl<S: Clone> StatusCapture<S> {
    pub fn new() -> Self {
        Self {
            updates: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, status: S) {
        self.updates
            .lock()
            .expect("mutex should not be poisoned")
            .push(status);
    }

    pub fn last(&self) -> Option<S> {
        self.updates
            .lock()
            .expect("mutex should not be poisoned")
            .last()
            .cloned()
    }

    pub fn all(&self) -> Vec<S> {
        self.updates
            .lock()
            .expect("mutex should not be poisoned")
            .clone()
    }

    pub fn count(&self) -> usize {
        self.updates
            .lock()
            .expect("mutex should not be poisoned")
            .len()
    }
}

/// One published Event
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

/// Event publisher that keeps everything it was given
pub fn event_capture() -> (MockEventRecorder, Arc<Mutex<Vec<RecordedEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let mut recorder = MockEventRecorder::new();
    recorder
        .expect_publish()
        .returning(move |_, type_, reason, _, note| {
            sink.lock()
                .expect("mutex should not be poisoned")
                .push(RecordedEvent {
                    warning: matches!(type_, EventType::Warning),
                    reason: reason.to_string(),
                    note,
                });
        });
    (recorder, events)
}

pub fn reasons_of(events: &Arc<Mutex<Vec<RecordedEvent>>>) -> Vec<String> {
    events
        .lock()
        .expect("mutex should not be poisoned")
        .iter()
        .map(|e| e.reason.clone())
        .collect()
}

pub fn finalizer_for(kind: restic_common::ManagedKind) -> String {
    ResourceRegistry::new().get(kind).finalizer.clone()
}

pub fn repository(name: &str, namespace: &str) -> ResticRepository {
    let mut repo = ResticRepository::new(
        name,
        ResticRepositorySpec {
            repository_url: "s3:s3.amazonaws.com/bucket/restic".to_string(),
            credentials_secret_ref: SecretKeySelector {
                name: SECRET_NAME.to_string(),
                key: None,
            },
            integrity_check: None,
            cache: None,
        },
    );
    repo.metadata.namespace = Some(namespace.to_string());
    repo.metadata.uid = Some(format!("uid-{name}"));
    repo.metadata.generation = Some(1);
    repo.metadata.finalizers = Some(vec![finalizer_for(
        restic_common::ManagedKind::Repository,
    )]);
    repo
}

pub fn ready_repository(name: &str, namespace: &str) -> ResticRepository {
    let mut repo = repository(name, namespace);
    repo.status = Some(ResticRepositoryStatus {
        conditions: vec![Condition::ready("RepositoryAccessible", "Repository is accessible")],
        ..Default::default()
    });
    repo
}

pub fn backup_spec(repository: &str, repository_namespace: Option<&str>) -> ResticBackupSpec {
    ResticBackupSpec {
        repository_ref: CrossNamespaceObjectReference {
            name: repository.to_string(),
            namespace: repository_namespace.map(str::to_string),
        },
        schedule: "0 2 * * *".to_string(),
        timezone: "UTC".to_string(),
        source: BackupSource {
            pvc: Some(PvcSource {
                claim_name: "data".to_string(),
                paths: vec![],
                excludes: vec![],
            }),
            ..Default::default()
        },
        restic: None,
        hooks: None,
        retention: None,
        notifications: None,
        job_config: None,
        suspend: false,
    }
}

pub fn backup(name: &str, spec: ResticBackupSpec) -> ResticBackup {
    let mut b = ResticBackup::new(name, spec);
    b.metadata.namespace = Some(NAMESPACE.to_string());
    b.metadata.uid = Some(format!("uid-{name}"));
    b.metadata.generation = Some(1);
    b.metadata.finalizers = Some(vec![finalizer_for(restic_common::ManagedKind::Backup)]);
    b
}

pub fn restore(name: &str, backup_name: &str) -> ResticRestore {
    let mut r = ResticRestore::new(
        name,
        ResticRestoreSpec {
            backup_ref: CrossNamespaceObjectReference {
                name: backup_name.to_string(),
                namespace: None,
            },
            snapshot_id: None,
            snapshot_selector: None,
            target: RestoreTarget {
                pvc: Some(PvcTarget {
                    claim_name: "restored".to_string(),
                    path: None,
                }),
                new_pvc: None,
            },
            include_paths: vec![],
            exclude_paths: vec![],
            options: None,
            hooks: None,
            job_config: None,
        },
    );
    r.metadata.namespace = Some(NAMESPACE.to_string());
    r.metadata.uid = Some(format!("uid-{name}"));
    r.metadata.generation = Some(1);
    r.metadata.finalizers = Some(vec![finalizer_for(restic_common::ManagedKind::Restore)]);
    r
}

pub fn retention_policy(name: &str, spec: GlobalRetentionPolicySpec) -> GlobalRetentionPolicy {
    let mut p = GlobalRetentionPolicy::new(name, spec);
    p.metadata.namespace = Some(NAMESPACE.to_string());
    p.metadata.uid = Some(format!("uid-{name}"));
    p.metadata.generation = Some(1);
    p.metadata.finalizers = Some(vec![finalizer_for(
        restic_common::ManagedKind::RetentionPolicy,
    )]);
    p
}

pub fn credentials_secret() -> Secret {
    Secret {
        data: Some(BTreeMap::from([(
            "RESTIC_PASSWORD".to_string(),
            ByteString(b"hunter2".to_vec()),
        )])),
        ..Default::default()
    }
}

/// `restic check` failure caused by a lock of the given age
pub fn lock_error(age: &str) -> ExecutorError {
    ExecutorError::CommandFailed {
        operation: "check".to_string(),
        context: "repository check failed".to_string(),
        status: "exit status: 1".to_string(),
        stderr: format!(
            "unable to create lock in backend: repository is already locked by PID 1234 \
             on backup-7f9c by nobody (UID 65532, GID 65532)\n\
             lock was created at 2024-05-01 10:00:00 ({age} ago)"
        ),
    }
}

pub fn command_failed(operation: &str, stderr: &str) -> ExecutorError {
    ExecutorError::CommandFailed {
        operation: operation.to_string(),
        context: format!("{operation} failed"),
        status: "exit status: 1".to_string(),
        stderr: stderr.to_string(),
    }
}

pub fn check_ok() -> CheckResult {
    CheckResult {
        success: true,
        message: "no errors were found".to_string(),
        duration: std::time::Duration::from_secs(2),
    }
}

/// A condition whose transition time is well in the past
pub fn aged(mut condition: Condition, minutes: i64) -> Condition {
    condition.last_transition_time = Utc::now() - ChronoDuration::minutes(minutes);
    condition
}
