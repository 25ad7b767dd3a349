//! Job and CronJob construction
//!
//! Generated objects are pure functions of the owning resource and its
//! repository, so a reconcile that changes nothing produces a byte-identical
//! spec. CronJobs carry a hash of their spec in an annotation; the
//! reconcilers compare hashes instead of server-defaulted specs.
//!
//! Every pod runs as uid/gid 65532 with `RuntimeDefault` seccomp, no
//! privilege escalation and all capabilities dropped. Credentials reach the
//! container through `secretKeyRef` env vars, never as literals.

use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, HostPathVolumeSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec,
    PodTemplateSpec, ResourceRequirements, SeccompProfile, SecretKeySelector, SecurityContext,
    Toleration, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use restic_common::crd::{
    GlobalRetentionPolicy, Hook, JobConfiguration, NewPvcTarget, ResourceSpec, ResticBackup,
    ResticRepository, ResticRestore, SourceKind, DEFAULT_RESTIC_IMAGE,
};
use restic_common::kube_utils::deterministic_hash;
use restic_common::{Error, KindInfo};
use restic_executor::types::{
    ENV_AWS_ACCESS_KEY_ID, ENV_AWS_SECRET_ACCESS_KEY, ENV_CACHE_DIR, ENV_PASSWORD, ENV_REPOSITORY,
};
use restic_executor::{CommandBuilder, DEFAULT_RESTIC_BINARY};

use crate::resolve::password_key;

/// Name of the restic container in every generated pod
pub const CONTAINER_NAME: &str = "restic";
/// Volume holding the data being backed up
pub const BACKUP_VOLUME: &str = "backup-source";
/// Mount path of [`BACKUP_VOLUME`]
pub const BACKUP_MOUNT_PATH: &str = "/backup";
/// Volume receiving restored data
pub const RESTORE_VOLUME: &str = "restore-target";
/// Mount path of [`RESTORE_VOLUME`]
pub const RESTORE_MOUNT_PATH: &str = "/restore";
/// Scratch cache mount of the retention container
pub const CACHE_MOUNT_PATH: &str = "/cache";
/// Annotation carrying the hash of a generated CronJob's spec
pub const SPEC_HASH_ANNOTATION: &str = "backup.resticbackup.io/spec-hash";
/// Snapshot token used when no snapshot ID is given
pub const LATEST_SNAPSHOT: &str = "latest";

/// Default `activeDeadlineSeconds` for backup and restore jobs
pub const DEFAULT_ACTIVE_DEADLINE_SECS: i64 = 3600;
/// Default `activeDeadlineSeconds` for retention jobs
pub const RETENTION_ACTIVE_DEADLINE_SECS: i64 = 7200;

const NON_ROOT_ID: i64 = 65532;
const DEFAULT_HISTORY_LIMIT: i32 = 3;
const DEFAULT_BACKOFF_LIMIT: i32 = 0;
const DEFAULT_ACCESS_MODE: &str = "ReadWriteOnce";

// =============================================================================
// Shell quoting
// =============================================================================

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_./:=@%+-".contains(c)
}

/// Quote `value` for `/bin/sh` unless it only holds safe characters
pub fn shell_quote(value: &str) -> Cow<'_, str> {
    if !value.is_empty() && value.chars().all(is_shell_safe) {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("'{}'", value.replace('\'', r"'\''")))
    }
}

/// Join an argv into one shell command line
pub fn shell_join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn echo(message: &str) -> String {
    format!("echo {}", shell_quote(message))
}

fn restic(builder: CommandBuilder) -> Vec<String> {
    let mut argv = vec![DEFAULT_RESTIC_BINARY.to_string()];
    argv.extend(builder.build());
    argv
}

// =============================================================================
// Commands
// =============================================================================

fn under_mount(mount: &str, path: &str) -> String {
    if path.is_empty() || path == "/" {
        mount.to_string()
    } else if path.starts_with('/') {
        format!("{mount}{path}")
    } else {
        format!("{mount}/{path}")
    }
}

/// Paths handed to `restic backup` for a source
pub fn backup_paths(source: SourceKind<'_>) -> Vec<String> {
    match source {
        SourceKind::Pvc(pvc) if pvc.paths.is_empty() => vec![BACKUP_MOUNT_PATH.to_string()],
        SourceKind::Pvc(pvc) => pvc
            .paths
            .iter()
            .map(|p| under_mount(BACKUP_MOUNT_PATH, p))
            .collect(),
        SourceKind::Custom(custom) => vec![custom.backup_path.clone()],
        SourceKind::PodVolume(_) => Vec::new(),
    }
}

/// Hostname recorded on snapshots: `restic.hostname` or the backup's name
pub fn backup_hostname(backup: &ResticBackup) -> String {
    backup
        .spec
        .restic
        .as_ref()
        .and_then(|r| r.hostname.clone())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| backup.name_any())
}

fn backup_tags(backup: &ResticBackup) -> &[String] {
    backup
        .spec
        .restic
        .as_ref()
        .map(|r| r.tags.as_slice())
        .unwrap_or_default()
}

/// `restic backup` argv for a scheduled run
pub fn backup_command(backup: &ResticBackup, source: SourceKind<'_>) -> Vec<String> {
    let excludes = match source {
        SourceKind::Pvc(pvc) => pvc.excludes.as_slice(),
        _ => &[],
    };
    let extra_args = backup
        .spec
        .restic
        .as_ref()
        .map(|r| r.extra_args.as_slice())
        .unwrap_or_default();

    restic(
        CommandBuilder::new("backup")
            .host(&backup_hostname(backup))
            .tags(backup_tags(backup))
            .excludes(excludes)
            .args(extra_args)
            .args(&backup_paths(source)),
    )
}

/// `restic forget` argv applying a backup's own retention, if enabled
pub fn backup_forget_command(backup: &ResticBackup) -> Option<Vec<String>> {
    let retention = backup.spec.retention.as_ref().filter(|r| r.enabled)?;
    Some(restic(
        CommandBuilder::new("forget")
            .host(&backup_hostname(backup))
            .tags(backup_tags(backup))
            .retention(&retention.policy)
            .group_by(&retention.group_by)
            .prune(retention.prune),
    ))
}

/// Shell script run by a retention CronJob
///
/// Policies run in declared order; prune runs once at the end when enabled.
pub fn retention_script(policy: &GlobalRetentionPolicy) -> String {
    let mut lines = vec![
        "set -e".to_string(),
        echo("Starting retention policy execution"),
    ];

    for (i, rule) in policy.spec.policies.iter().enumerate() {
        lines.push(echo(&format!("Executing policy {}", i + 1)));
        let forget = CommandBuilder::new("forget")
            .tags(&rule.selector.tags)
            .host(rule.selector.hostname.as_deref().unwrap_or_default())
            .retention(&rule.retention);
        lines.push(shell_join(&restic(forget)));
    }

    if policy.spec.prune {
        lines.push(echo("Running prune"));
        lines.push(shell_join(&restic(CommandBuilder::new("prune"))));
    }

    lines.push(echo("Retention policy execution completed"));
    lines.join("\n")
}

/// Snapshot a restore reads: the explicit ID or `latest`
pub fn snapshot_token(restore: &ResticRestore) -> &str {
    restore
        .spec
        .snapshot_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .unwrap_or(LATEST_SNAPSHOT)
}

/// Directory inside the restore container that receives the data
pub fn restore_target_path(restore: &ResticRestore) -> String {
    let sub_path = restore
        .spec
        .target
        .pvc
        .as_ref()
        .and_then(|p| p.path.as_deref())
        .unwrap_or_default();
    under_mount(RESTORE_MOUNT_PATH, sub_path)
}

/// `restic restore` argv for a restore Job
///
/// Selector tags and hostname narrow `latest` to the newest matching
/// snapshot; they are not passed with an explicit snapshot ID.
pub fn restore_command(restore: &ResticRestore) -> Vec<String> {
    let spec = &restore.spec;
    let token = snapshot_token(restore);
    let options = spec.options.clone().unwrap_or_default();

    let mut builder = CommandBuilder::new("restore")
        .arg(token)
        .target(&restore_target_path(restore));

    if token == LATEST_SNAPSHOT {
        if let Some(selector) = spec.snapshot_selector.as_ref() {
            builder = builder
                .tags(&selector.tags)
                .host(selector.hostname.as_deref().unwrap_or_default());
        }
    }

    builder = builder
        .includes(&spec.include_paths)
        .excludes(&spec.exclude_paths);
    if !options.overwrite {
        builder = builder.arg("--overwrite").arg("never");
    }
    restic(builder.verify(options.verify))
}

// =============================================================================
// Pod building blocks
// =============================================================================

fn generated_name(info: &KindInfo, resource: &str) -> Result<String, Error> {
    info.job_name(resource).ok_or_else(|| {
        Error::internal_with_context("jobs", format!("{} has no generated job", info.kind))
    })
}

fn owned_metadata<K>(owner: &K, name: String, info: &KindInfo) -> ObjectMeta
where
    K: Resource<DynamicType = ()>,
{
    ObjectMeta {
        name: Some(name),
        namespace: owner.meta().namespace.clone(),
        labels: Some(info.labels(&owner.name_any())),
        owner_references: owner.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

fn template_metadata(labels: BTreeMap<String, String>) -> Option<ObjectMeta> {
    Some(ObjectMeta {
        labels: Some(labels),
        ..Default::default()
    })
}

fn secret_env(name: &str, secret: &str, key: &str, optional: bool) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: optional.then_some(true),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Repository location and credentials for a restic container
pub fn credential_env(repository: &ResticRepository) -> Vec<EnvVar> {
    let secret = &repository.spec.credentials_secret_ref.name;
    vec![
        EnvVar {
            name: ENV_REPOSITORY.to_string(),
            value: Some(repository.spec.repository_url.clone()),
            ..Default::default()
        },
        secret_env(ENV_PASSWORD, secret, password_key(repository), false),
        secret_env(ENV_AWS_ACCESS_KEY_ID, secret, ENV_AWS_ACCESS_KEY_ID, true),
        secret_env(ENV_AWS_SECRET_ACCESS_KEY, secret, ENV_AWS_SECRET_ACCESS_KEY, true),
    ]
}

fn run_as_non_root(config: Option<&JobConfiguration>) -> bool {
    config
        .and_then(|c| c.security_context.as_ref())
        .and_then(|s| s.run_as_non_root)
        .unwrap_or(true)
}

/// Pod security context, with per-field overrides from the job config
pub fn pod_security_context(config: Option<&JobConfiguration>) -> PodSecurityContext {
    let overrides = config.and_then(|c| c.security_context.as_ref());
    PodSecurityContext {
        run_as_non_root: Some(run_as_non_root(config)),
        run_as_user: Some(overrides.and_then(|o| o.run_as_user).unwrap_or(NON_ROOT_ID)),
        run_as_group: Some(overrides.and_then(|o| o.run_as_group).unwrap_or(NON_ROOT_ID)),
        fs_group: Some(overrides.and_then(|o| o.fs_group).unwrap_or(NON_ROOT_ID)),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Container security context
///
/// The root filesystem stays writable because restic keeps its cache
/// under `$HOME`.
pub fn container_security_context(config: Option<&JobConfiguration>) -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(false),
        run_as_non_root: Some(run_as_non_root(config)),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(values: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    (!values.is_empty()).then(|| {
        values
            .iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect()
    })
}

fn resource_requirements(spec: &ResourceSpec) -> ResourceRequirements {
    ResourceRequirements {
        requests: quantities(&spec.requests),
        limits: quantities(&spec.limits),
        ..Default::default()
    }
}

fn hook_container(
    name: &str,
    hook: Option<&Hook>,
    config: Option<&JobConfiguration>,
) -> Option<Container> {
    let job = hook?.job.as_ref()?;
    Some(Container {
        name: name.to_string(),
        image: Some(job.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: (!job.command.is_empty()).then(|| job.command.clone()),
        args: (!job.args.is_empty()).then(|| job.args.clone()),
        security_context: Some(container_security_context(config)),
        ..Default::default()
    })
}

struct PodParts {
    container: Container,
    init_container: Option<Container>,
    volume: Volume,
}

fn pod_spec(parts: PodParts, config: Option<&JobConfiguration>) -> PodSpec {
    let mut container = parts.container;
    container.security_context = Some(container_security_context(config));
    container.resources = config
        .and_then(|c| c.resources.as_ref())
        .map(resource_requirements);

    PodSpec {
        containers: vec![container],
        init_containers: parts.init_container.map(|c| vec![c]),
        volumes: Some(vec![parts.volume]),
        restart_policy: Some("Never".to_string()),
        security_context: Some(pod_security_context(config)),
        service_account_name: config
            .and_then(|c| c.service_account_name.clone())
            .filter(|s| !s.is_empty()),
        node_selector: config
            .map(|c| c.node_selector.clone())
            .filter(|n| !n.is_empty()),
        tolerations: config.map(|c| &c.tolerations).filter(|t| !t.is_empty()).map(|t| {
            t.iter()
                .map(|t| Toleration {
                    key: t.key.clone(),
                    operator: t.operator.clone(),
                    value: t.value.clone(),
                    effect: t.effect.clone(),
                    toleration_seconds: t.toleration_seconds,
                })
                .collect()
        }),
        ..Default::default()
    }
}

fn job_spec(
    pod: PodSpec,
    labels: BTreeMap<String, String>,
    config: Option<&JobConfiguration>,
    default_deadline: i64,
) -> JobSpec {
    JobSpec {
        backoff_limit: Some(
            config
                .and_then(|c| c.backoff_limit)
                .unwrap_or(DEFAULT_BACKOFF_LIMIT),
        ),
        active_deadline_seconds: Some(
            config
                .and_then(|c| c.active_deadline_seconds)
                .unwrap_or(default_deadline),
        ),
        template: PodTemplateSpec {
            metadata: template_metadata(labels),
            spec: Some(pod),
        },
        ..Default::default()
    }
}

struct Schedule<'a> {
    cron: &'a str,
    timezone: Option<&'a str>,
    suspend: bool,
}

fn cron_job(
    metadata: ObjectMeta,
    schedule: Schedule<'_>,
    job: JobSpec,
    config: Option<&JobConfiguration>,
) -> CronJob {
    let labels = metadata.labels.clone().unwrap_or_default();
    CronJob {
        metadata,
        spec: Some(CronJobSpec {
            schedule: schedule.cron.to_string(),
            time_zone: schedule
                .timezone
                .filter(|tz| !tz.is_empty() && *tz != "UTC")
                .map(str::to_string),
            suspend: Some(schedule.suspend),
            concurrency_policy: Some(
                config
                    .map(|c| c.concurrency_policy)
                    .unwrap_or_default()
                    .to_string(),
            ),
            successful_jobs_history_limit: Some(
                config
                    .and_then(|c| c.successful_jobs_history_limit)
                    .unwrap_or(DEFAULT_HISTORY_LIMIT),
            ),
            failed_jobs_history_limit: Some(
                config
                    .and_then(|c| c.failed_jobs_history_limit)
                    .unwrap_or(DEFAULT_HISTORY_LIMIT),
            ),
            job_template: JobTemplateSpec {
                metadata: template_metadata(labels),
                spec: Some(job),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Generated objects
// =============================================================================

fn backup_volume(source: SourceKind<'_>) -> Result<(Volume, VolumeMount), Error> {
    let mount = VolumeMount {
        name: BACKUP_VOLUME.to_string(),
        mount_path: BACKUP_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    };
    match source {
        SourceKind::Pvc(pvc) => Ok((
            Volume {
                name: BACKUP_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc.claim_name.clone(),
                    read_only: Some(true),
                }),
                ..Default::default()
            },
            mount,
        )),
        SourceKind::Custom(custom) => {
            let host_path = custom
                .host_path
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| custom.backup_path.clone());
            Ok((
                Volume {
                    name: BACKUP_VOLUME.to_string(),
                    host_path: Some(HostPathVolumeSource {
                        path: host_path,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                VolumeMount {
                    mount_path: custom.backup_path.clone(),
                    ..mount
                },
            ))
        }
        SourceKind::PodVolume(_) => Err(Error::validation(
            "podVolumeBackup sources cannot run as a standalone job",
        )),
    }
}

/// CronJob `resticbackup-<name>` running a backup on its schedule
pub fn backup_cron_job(
    backup: &ResticBackup,
    source: SourceKind<'_>,
    repository: &ResticRepository,
    info: &KindInfo,
) -> Result<CronJob, Error> {
    let name = generated_name(info, &backup.name_any())?;
    let config = backup.spec.job_config.as_ref();
    let (volume, mount) = backup_volume(source)?;

    let backup_argv = backup_command(backup, source);
    let command = match backup_forget_command(backup) {
        Some(forget) => vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("set -e\n{}\n{}", shell_join(&backup_argv), shell_join(&forget)),
        ],
        None => backup_argv,
    };

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(backup.spec.image().to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(command),
        env: Some(credential_env(repository)),
        volume_mounts: Some(vec![mount]),
        ..Default::default()
    };
    let pre_backup = backup.spec.hooks.as_ref().and_then(|h| h.pre_backup.as_ref());

    let metadata = owned_metadata(backup, name, info);
    let labels = metadata.labels.clone().unwrap_or_default();
    let pod = pod_spec(
        PodParts {
            container,
            init_container: hook_container("pre-backup-hook", pre_backup, config),
            volume,
        },
        config,
    );

    with_spec_hash(cron_job(
        metadata,
        Schedule {
            cron: &backup.spec.schedule,
            timezone: Some(&backup.spec.timezone),
            suspend: backup.spec.suspend,
        },
        job_spec(pod, labels, config, DEFAULT_ACTIVE_DEADLINE_SECS),
        config,
    ))
}

/// CronJob `globalretention-<name>` running the policy script
///
/// restic keeps its cache on a scratch volume; the repository is remote.
pub fn retention_cron_job(
    policy: &GlobalRetentionPolicy,
    repository: &ResticRepository,
    info: &KindInfo,
) -> Result<CronJob, Error> {
    let name = generated_name(info, &policy.name_any())?;
    let config = policy.spec.job_config.as_ref();

    let mut env = credential_env(repository);
    env.push(EnvVar {
        name: ENV_CACHE_DIR.to_string(),
        value: Some(CACHE_MOUNT_PATH.to_string()),
        ..Default::default()
    });
    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(DEFAULT_RESTIC_IMAGE.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            retention_script(policy),
        ]),
        env: Some(env),
        volume_mounts: Some(vec![VolumeMount {
            name: "cache".to_string(),
            mount_path: CACHE_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };
    let volume = Volume {
        name: "cache".to_string(),
        empty_dir: Some(Default::default()),
        ..Default::default()
    };

    let metadata = owned_metadata(policy, name, info);
    let labels = metadata.labels.clone().unwrap_or_default();
    let pod = pod_spec(
        PodParts {
            container,
            init_container: None,
            volume,
        },
        config,
    );

    with_spec_hash(cron_job(
        metadata,
        Schedule {
            cron: &policy.spec.schedule,
            timezone: None,
            suspend: policy.spec.suspend,
        },
        job_spec(pod, labels, config, RETENTION_ACTIVE_DEADLINE_SECS),
        config,
    ))
}

/// One-shot Job `resticrestore-<name>`
pub fn restore_job(
    restore: &ResticRestore,
    backup: &ResticBackup,
    repository: &ResticRepository,
    info: &KindInfo,
) -> Result<Job, Error> {
    let restore_name = restore.name_any();
    let name = generated_name(info, &restore_name)?;
    let claim_name = restore.spec.target.claim_name().ok_or_else(|| {
        Error::validation_for(restore_name.clone(), "restore target has no PVC")
    })?;
    let config = restore.spec.job_config.as_ref();

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(backup.spec.image().to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(restore_command(restore)),
        env: Some(credential_env(repository)),
        volume_mounts: Some(vec![VolumeMount {
            name: RESTORE_VOLUME.to_string(),
            mount_path: RESTORE_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };
    let volume = Volume {
        name: RESTORE_VOLUME.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim_name.to_string(),
            read_only: Some(false),
        }),
        ..Default::default()
    };
    let pre_restore = restore.spec.hooks.as_ref().and_then(|h| h.pre_restore.as_ref());

    let metadata = owned_metadata(restore, name, info);
    let labels = metadata.labels.clone().unwrap_or_default();
    let pod = pod_spec(
        PodParts {
            container,
            init_container: hook_container("pre-restore-hook", pre_restore, config),
            volume,
        },
        config,
    );

    Ok(Job {
        metadata,
        spec: Some(job_spec(pod, labels, config, DEFAULT_ACTIVE_DEADLINE_SECS)),
        ..Default::default()
    })
}

/// PVC provisioned for a `newPVC` restore target
///
/// Not owned by the restore: restored data outlives the request.
pub fn restore_pvc(
    restore: &ResticRestore,
    target: &NewPvcTarget,
    info: &KindInfo,
) -> PersistentVolumeClaim {
    let access_modes = if target.access_modes.is_empty() {
        vec![DEFAULT_ACCESS_MODE.to_string()]
    } else {
        target.access_modes.clone()
    };

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(target.name.clone()),
            namespace: restore.namespace(),
            labels: Some(info.labels(&restore.name_any())),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(access_modes),
            storage_class_name: target.storage_class_name.clone().filter(|s| !s.is_empty()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(target.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Diffing and job state
// =============================================================================

/// Hash of a CronJob's spec as generated
pub fn spec_hash(cron_job: &CronJob) -> Result<String, Error> {
    Ok(deterministic_hash(&serde_json::to_string(&cron_job.spec)?))
}

fn with_spec_hash(mut cron_job: CronJob) -> Result<CronJob, Error> {
    let hash = spec_hash(&cron_job)?;
    cron_job
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SPEC_HASH_ANNOTATION.to_string(), hash);
    Ok(cron_job)
}

/// Whether `existing` was generated from a different spec than `desired`
pub fn needs_update(existing: &CronJob, desired: &CronJob) -> bool {
    let hash = |c: &CronJob| {
        c.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(SPEC_HASH_ANNOTATION))
            .cloned()
    };
    hash(existing).is_none() || hash(existing) != hash(desired)
}

fn has_job_condition(job: &Job, type_: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == type_ && c.status == "True")
        })
}

/// Check if a Job has completed successfully
pub fn is_job_complete(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .is_some_and(|n| n > 0)
        || has_job_condition(job, "Complete")
}

/// Check if a Job has failed
pub fn is_job_failed(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.failed)
        .is_some_and(|n| n > 0)
        || has_job_condition(job, "Failed")
}

/// Extract failure message from a failed Job
pub fn job_failure_message(job: &Job) -> Option<String> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
                .and_then(|c| c.message.clone())
        })
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use restic_common::crd::{
        BackupHooks, BackupRetention, BackupSource, CustomSource, GlobalRetentionPolicySpec,
        JobHook, PodSecurityOverride, PvcSource, PvcTarget, ResticBackupSpec, ResticOptions,
        ResticRepositorySpec, ResticRestoreSpec, RestoreOptions, RestoreTarget,
        RetentionPolicyRule, RetentionRules, SecretKeySelector, SnapshotFilter, SnapshotSelector,
        TolerationSpec,
    };
    use restic_common::{ManagedKind, ResourceRegistry};

    use super::*;

    fn repository() -> ResticRepository {
        let mut repo = ResticRepository::new(
            "main",
            ResticRepositorySpec {
                repository_url: "s3:s3.amazonaws.com/bucket/restic".to_string(),
                credentials_secret_ref: SecretKeySelector {
                    name: "restic-creds".to_string(),
                    key: None,
                },
                integrity_check: None,
                cache: None,
            },
        );
        repo.metadata.namespace = Some("apps".to_string());
        repo
    }

    fn backup_spec() -> ResticBackupSpec {
        ResticBackupSpec {
            repository_ref: Default::default(),
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

    fn backup(spec: ResticBackupSpec) -> ResticBackup {
        let mut b = ResticBackup::new("nightly", spec);
        b.metadata.namespace = Some("apps".to_string());
        b.metadata.uid = Some("uid-backup".to_string());
        b
    }

    fn build_backup(b: &ResticBackup) -> CronJob {
        let registry = ResourceRegistry::new();
        let source = b.spec.source.resolve().expect("valid source");
        backup_cron_job(b, source, &repository(), registry.get(ManagedKind::Backup))
            .expect("cron job builds")
    }

    fn pod(cron: &CronJob) -> &PodSpec {
        cron.spec
            .as_ref()
            .and_then(|s| s.job_template.spec.as_ref())
            .and_then(|j| j.template.spec.as_ref())
            .expect("pod spec")
    }

    fn restore(spec: ResticRestoreSpec) -> ResticRestore {
        let mut r = ResticRestore::new("recover", spec);
        r.metadata.namespace = Some("apps".to_string());
        r.metadata.uid = Some("uid-restore".to_string());
        r
    }

    fn restore_spec() -> ResticRestoreSpec {
        ResticRestoreSpec {
            backup_ref: Default::default(),
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
        }
    }

    fn policy(rules: Vec<RetentionPolicyRule>, prune: bool) -> GlobalRetentionPolicy {
        let mut p = GlobalRetentionPolicy::new(
            "weekly-cleanup",
            GlobalRetentionPolicySpec {
                repository_ref: Default::default(),
                schedule: "0 4 * * 0".to_string(),
                policies: rules,
                prune,
                notifications: None,
                job_config: None,
                suspend: false,
            },
        );
        p.metadata.namespace = Some("apps".to_string());
        p.metadata.uid = Some("uid-policy".to_string());
        p
    }

    fn rule(tag: &str, retention: RetentionRules) -> RetentionPolicyRule {
        RetentionPolicyRule {
            selector: SnapshotFilter {
                tags: vec![tag.to_string()],
                hostname: None,
            },
            retention,
        }
    }

    mod quoting {
        use super::*;

        #[test]
        fn safe_values_pass_through() {
            assert_eq!(shell_quote("--keep-last"), "--keep-last");
            assert_eq!(shell_quote("s3:host/bucket@v1%x+y=z"), "s3:host/bucket@v1%x+y=z");
        }

        #[test]
        fn unsafe_values_are_single_quoted() {
            assert_eq!(shell_quote("two words"), "'two words'");
            assert_eq!(shell_quote(""), "''");
            assert_eq!(shell_quote("it's"), r"'it'\''s'");
            assert_eq!(shell_quote("$HOME"), "'$HOME'");
        }
    }

    mod backup_cron {
        use super::*;

        #[test]
        fn named_labelled_and_owned() {
            let cron = build_backup(&backup(backup_spec()));
            assert_eq!(cron.metadata.name.as_deref(), Some("resticbackup-nightly"));
            assert_eq!(cron.metadata.namespace.as_deref(), Some("apps"));

            let labels = cron.metadata.labels.clone().expect("labels");
            assert_eq!(
                labels.get("backup.resticbackup.io/backup").map(String::as_str),
                Some("nightly")
            );
            assert_eq!(
                labels.get("app.kubernetes.io/managed-by").map(String::as_str),
                Some("restic-backup-operator")
            );

            let owners = cron.metadata.owner_references.clone().expect("owner refs");
            assert_eq!(owners.len(), 1);
            assert_eq!(owners[0].kind, "ResticBackup");
            assert_eq!(owners[0].uid, "uid-backup");
            assert_eq!(owners[0].controller, Some(true));
        }

        #[test]
        fn schedule_defaults_and_policy() {
            let cron = build_backup(&backup(backup_spec()));
            let spec = cron.spec.as_ref().expect("spec");
            assert_eq!(spec.schedule, "0 2 * * *");
            assert_eq!(spec.time_zone, None);
            assert_eq!(spec.suspend, Some(false));
            assert_eq!(spec.concurrency_policy.as_deref(), Some("Forbid"));
            assert_eq!(spec.successful_jobs_history_limit, Some(3));
            assert_eq!(spec.failed_jobs_history_limit, Some(3));

            let job = spec.job_template.spec.as_ref().expect("job spec");
            assert_eq!(job.backoff_limit, Some(0));
            assert_eq!(job.active_deadline_seconds, Some(3600));
        }

        #[test]
        fn non_utc_timezone_is_set() {
            let mut spec = backup_spec();
            spec.timezone = "Europe/Berlin".to_string();
            spec.suspend = true;
            let cron = build_backup(&backup(spec));
            let spec = cron.spec.as_ref().expect("spec");
            assert_eq!(spec.time_zone.as_deref(), Some("Europe/Berlin"));
            assert_eq!(spec.suspend, Some(true));
        }

        #[test]
        fn command_uses_hostname_tags_excludes_and_paths() {
            let mut spec = backup_spec();
            spec.source.pvc = Some(PvcSource {
                claim_name: "data".to_string(),
                paths: vec!["/db".to_string(), "uploads".to_string()],
                excludes: vec!["*.tmp".to_string()],
            });
            spec.restic = Some(ResticOptions {
                hostname: Some("db-host".to_string()),
                tags: vec!["daily".to_string()],
                extra_args: vec!["--one-file-system".to_string()],
                ..Default::default()
            });
            let cron = build_backup(&backup(spec));
            let container = &pod(&cron).containers[0];
            assert_eq!(
                container.command.clone().expect("command"),
                vec![
                    "restic", "backup", "--host", "db-host", "--tag", "daily", "--exclude",
                    "*.tmp", "--one-file-system", "/backup/db", "/backup/uploads"
                ]
            );
        }

        #[test]
        fn hostname_defaults_to_backup_name() {
            let cron = build_backup(&backup(backup_spec()));
            let command = pod(&cron).containers[0].command.clone().expect("command");
            assert_eq!(command, vec!["restic", "backup", "--host", "nightly", "/backup"]);
        }

        #[test]
        fn retention_runs_forget_after_backup() {
            let mut spec = backup_spec();
            spec.restic = Some(ResticOptions {
                tags: vec!["daily".to_string()],
                ..Default::default()
            });
            spec.retention = Some(BackupRetention {
                enabled: true,
                policy: RetentionRules {
                    keep_daily: Some(7),
                    keep_weekly: Some(4),
                    ..Default::default()
                },
                prune: true,
                group_by: vec!["host".to_string(), "tags".to_string()],
            });
            let cron = build_backup(&backup(spec));
            let command = pod(&cron).containers[0].command.clone().expect("command");
            assert_eq!(command[..2], ["/bin/sh".to_string(), "-c".to_string()]);
            assert_eq!(
                command[2],
                "set -e\n\
                 restic backup --host nightly --tag daily /backup\n\
                 restic forget --host nightly --tag daily --keep-daily 7 --keep-weekly 4 \
                 --group-by host,tags --prune"
            );
        }

        #[test]
        fn disabled_retention_is_ignored() {
            let mut spec = backup_spec();
            spec.retention = Some(BackupRetention {
                enabled: false,
                policy: RetentionRules {
                    keep_last: Some(3),
                    ..Default::default()
                },
                ..Default::default()
            });
            let cron = build_backup(&backup(spec));
            assert_eq!(
                pod(&cron).containers[0].command.clone().expect("command")[0],
                "restic"
            );
        }

        #[test]
        fn credentials_come_from_the_secret() {
            let cron = build_backup(&backup(backup_spec()));
            let env = pod(&cron).containers[0].env.clone().expect("env");
            let names: Vec<_> = env.iter().map(|e| e.name.as_str()).collect();
            assert_eq!(
                names,
                vec![
                    "RESTIC_REPOSITORY",
                    "RESTIC_PASSWORD",
                    "AWS_ACCESS_KEY_ID",
                    "AWS_SECRET_ACCESS_KEY"
                ]
            );
            assert_eq!(env[0].value.as_deref(), Some("s3:s3.amazonaws.com/bucket/restic"));

            let password = env[1]
                .value_from
                .as_ref()
                .and_then(|v| v.secret_key_ref.as_ref())
                .expect("secret ref");
            assert_eq!(password.name, "restic-creds");
            assert_eq!(password.key, "RESTIC_PASSWORD");
            assert_eq!(password.optional, None);
            assert!(env[1].value.is_none());

            let aws = env[2]
                .value_from
                .as_ref()
                .and_then(|v| v.secret_key_ref.as_ref())
                .expect("secret ref");
            assert_eq!(aws.optional, Some(true));
        }

        #[test]
        fn security_posture() {
            let cron = build_backup(&backup(backup_spec()));
            let pod = pod(&cron);
            let psc = pod.security_context.clone().expect("pod security context");
            assert_eq!(psc.run_as_non_root, Some(true));
            assert_eq!(psc.run_as_user, Some(65532));
            assert_eq!(psc.run_as_group, Some(65532));
            assert_eq!(psc.fs_group, Some(65532));
            assert_eq!(
                psc.seccomp_profile.map(|s| s.type_).as_deref(),
                Some("RuntimeDefault")
            );

            let csc = pod.containers[0]
                .security_context
                .clone()
                .expect("container security context");
            assert_eq!(csc.allow_privilege_escalation, Some(false));
            assert_eq!(
                csc.capabilities.and_then(|c| c.drop),
                Some(vec!["ALL".to_string()])
            );
            assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        }

        #[test]
        fn pvc_mounted_read_only() {
            let cron = build_backup(&backup(backup_spec()));
            let pod = pod(&cron);
            let volume = &pod.volumes.as_ref().expect("volumes")[0];
            assert_eq!(volume.name, "backup-source");
            let claim = volume.persistent_volume_claim.as_ref().expect("pvc");
            assert_eq!(claim.claim_name, "data");
            assert_eq!(claim.read_only, Some(true));

            let mount = &pod.containers[0].volume_mounts.as_ref().expect("mounts")[0];
            assert_eq!(mount.mount_path, "/backup");
            assert_eq!(mount.read_only, Some(true));
        }

        #[test]
        fn custom_source_mounts_host_path() {
            let mut spec = backup_spec();
            spec.source = BackupSource {
                custom_source: Some(CustomSource {
                    backup_path: "/var/lib/app".to_string(),
                    host_path: Some("/mnt/disks/app".to_string()),
                }),
                ..Default::default()
            };
            let cron = build_backup(&backup(spec));
            let pod = pod(&cron);
            let volume = &pod.volumes.as_ref().expect("volumes")[0];
            assert_eq!(
                volume.host_path.as_ref().map(|h| h.path.as_str()),
                Some("/mnt/disks/app")
            );
            let container = &pod.containers[0];
            assert_eq!(
                container.volume_mounts.as_ref().expect("mounts")[0].mount_path,
                "/var/lib/app"
            );
            assert_eq!(
                container.command.clone().expect("command").last().map(String::as_str),
                Some("/var/lib/app")
            );
        }

        #[test]
        fn pre_backup_job_hook_becomes_init_container() {
            let mut spec = backup_spec();
            spec.hooks = Some(BackupHooks {
                pre_backup: Some(Hook {
                    exec: None,
                    job: Some(JobHook {
                        image: "busybox:1.36".to_string(),
                        command: vec!["sh".to_string(), "-c".to_string()],
                        args: vec!["sync".to_string()],
                    }),
                }),
                ..Default::default()
            });
            let cron = build_backup(&backup(spec));
            let init = pod(&cron).init_containers.clone().expect("init containers");
            assert_eq!(init.len(), 1);
            assert_eq!(init[0].name, "pre-backup-hook");
            assert_eq!(init[0].image.as_deref(), Some("busybox:1.36"));
            assert_eq!(init[0].args, Some(vec!["sync".to_string()]));
        }

        #[test]
        fn job_configuration_applies() {
            let mut spec = backup_spec();
            spec.job_config = Some(JobConfiguration {
                concurrency_policy: restic_common::crd::ConcurrencyPolicy::Replace,
                successful_jobs_history_limit: Some(1),
                active_deadline_seconds: Some(600),
                backoff_limit: Some(2),
                security_context: Some(PodSecurityOverride {
                    run_as_user: Some(1000),
                    ..Default::default()
                }),
                resources: Some(ResourceSpec {
                    requests: BTreeMap::from([("memory".to_string(), "256Mi".to_string())]),
                    limits: BTreeMap::new(),
                }),
                node_selector: BTreeMap::from([("disk".to_string(), "ssd".to_string())]),
                tolerations: vec![TolerationSpec {
                    key: Some("backup".to_string()),
                    operator: Some("Exists".to_string()),
                    effect: Some("NoSchedule".to_string()),
                    ..Default::default()
                }],
                service_account_name: Some("restic".to_string()),
                ..Default::default()
            });
            let cron = build_backup(&backup(spec));
            let cron_spec = cron.spec.as_ref().expect("spec");
            assert_eq!(cron_spec.concurrency_policy.as_deref(), Some("Replace"));
            assert_eq!(cron_spec.successful_jobs_history_limit, Some(1));
            assert_eq!(cron_spec.failed_jobs_history_limit, Some(3));

            let job = cron_spec.job_template.spec.as_ref().expect("job");
            assert_eq!(job.active_deadline_seconds, Some(600));
            assert_eq!(job.backoff_limit, Some(2));

            let pod = pod(&cron);
            let psc = pod.security_context.clone().expect("psc");
            assert_eq!(psc.run_as_user, Some(1000));
            assert_eq!(psc.run_as_group, Some(65532));
            assert_eq!(pod.service_account_name.as_deref(), Some("restic"));
            assert_eq!(
                pod.node_selector.as_ref().and_then(|n| n.get("disk")).map(String::as_str),
                Some("ssd")
            );
            assert_eq!(pod.tolerations.as_ref().map(Vec::len), Some(1));
            let requests = pod.containers[0]
                .resources
                .as_ref()
                .and_then(|r| r.requests.clone())
                .expect("requests");
            assert_eq!(requests.get("memory"), Some(&Quantity("256Mi".to_string())));
        }

        #[test]
        fn pod_volume_source_is_rejected() {
            let mut spec = backup_spec();
            spec.source = BackupSource {
                pod_volume_backup: Some(Default::default()),
                ..Default::default()
            };
            let b = backup(spec);
            let registry = ResourceRegistry::new();
            let source = b.spec.source.resolve().expect("single source");
            let err = backup_cron_job(&b, source, &repository(), registry.get(ManagedKind::Backup))
                .unwrap_err();
            assert!(matches!(err, Error::Validation { .. }));
        }
    }

    mod hashing {
        use super::*;

        #[test]
        fn same_input_same_hash() {
            let a = build_backup(&backup(backup_spec()));
            let b = build_backup(&backup(backup_spec()));
            assert!(!needs_update(&a, &b));
            assert_eq!(
                a.metadata.annotations.as_ref().and_then(|m| m.get(SPEC_HASH_ANNOTATION)),
                b.metadata.annotations.as_ref().and_then(|m| m.get(SPEC_HASH_ANNOTATION))
            );
        }

        #[test]
        fn spec_change_changes_hash() {
            let a = build_backup(&backup(backup_spec()));
            let mut spec = backup_spec();
            spec.schedule = "0 3 * * *".to_string();
            let b = build_backup(&backup(spec));
            assert!(needs_update(&a, &b));
        }

        #[test]
        fn unannotated_existing_needs_update() {
            let desired = build_backup(&backup(backup_spec()));
            let mut existing = desired.clone();
            existing.metadata.annotations = None;
            assert!(needs_update(&existing, &desired));
        }
    }

    mod retention {
        use super::*;

        #[test]
        fn script_runs_policies_in_order_then_prunes() {
            let p = policy(
                vec![
                    rule(
                        "a",
                        RetentionRules {
                            keep_last: Some(5),
                            ..Default::default()
                        },
                    ),
                    rule(
                        "b",
                        RetentionRules {
                            keep_daily: Some(7),
                            ..Default::default()
                        },
                    ),
                ],
                true,
            );
            assert_eq!(
                retention_script(&p),
                "set -e\n\
                 echo 'Starting retention policy execution'\n\
                 echo 'Executing policy 1'\n\
                 restic forget --tag a --keep-last 5\n\
                 echo 'Executing policy 2'\n\
                 restic forget --tag b --keep-daily 7\n\
                 echo 'Running prune'\n\
                 restic prune\n\
                 echo 'Retention policy execution completed'"
            );
        }

        #[test]
        fn no_prune_lines_without_prune() {
            let p = policy(
                vec![rule(
                    "a",
                    RetentionRules {
                        keep_last: Some(1),
                        ..Default::default()
                    },
                )],
                false,
            );
            let script = retention_script(&p);
            assert!(!script.contains("prune"));
            assert!(script.ends_with("echo 'Retention policy execution completed'"));
        }

        #[test]
        fn values_with_spaces_are_quoted() {
            let p = policy(
                vec![RetentionPolicyRule {
                    selector: SnapshotFilter {
                        tags: vec!["nightly db".to_string()],
                        hostname: Some("host-1".to_string()),
                    },
                    retention: RetentionRules {
                        keep_weekly: Some(4),
                        ..Default::default()
                    },
                }],
                false,
            );
            assert!(retention_script(&p)
                .contains("restic forget --tag 'nightly db' --host host-1 --keep-weekly 4"));
        }

        #[test]
        fn cron_job_shape() {
            let registry = ResourceRegistry::new();
            let p = policy(vec![], false);
            let cron = retention_cron_job(
                &p,
                &repository(),
                registry.get(ManagedKind::RetentionPolicy),
            )
            .expect("builds");
            assert_eq!(cron.metadata.name.as_deref(), Some("globalretention-weekly-cleanup"));

            let spec = cron.spec.as_ref().expect("spec");
            assert_eq!(spec.schedule, "0 4 * * 0");
            assert_eq!(spec.concurrency_policy.as_deref(), Some("Forbid"));
            let job = spec.job_template.spec.as_ref().expect("job");
            assert_eq!(job.active_deadline_seconds, Some(7200));

            let container = &pod(&cron).containers[0];
            assert_eq!(container.image.as_deref(), Some(DEFAULT_RESTIC_IMAGE));
            let command = container.command.clone().expect("command");
            assert_eq!(command[0], "/bin/sh");
            assert_eq!(command[2], retention_script(&p));
        }

        #[test]
        fn restic_cache_lives_on_the_scratch_volume() {
            let registry = ResourceRegistry::new();
            let cron = retention_cron_job(
                &policy(vec![], false),
                &repository(),
                registry.get(ManagedKind::RetentionPolicy),
            )
            .expect("builds");

            let container = &pod(&cron).containers[0];
            let cache_dir = container
                .env
                .iter()
                .flatten()
                .find(|e| e.name == "RESTIC_CACHE_DIR")
                .and_then(|e| e.value.as_deref());
            assert_eq!(cache_dir, Some("/cache"));

            let mounts = container.volume_mounts.clone().expect("mounts");
            assert_eq!(mounts[0].mount_path, "/cache");
            let volumes = pod(&cron).volumes.clone().expect("volumes");
            assert!(volumes
                .iter()
                .any(|v| v.name == mounts[0].name && v.empty_dir.is_some()));
        }
    }

    mod restore {
        use super::*;

        fn build(r: &ResticRestore) -> Job {
            let registry = ResourceRegistry::new();
            restore_job(
                r,
                &backup(backup_spec()),
                &repository(),
                registry.get(ManagedKind::Restore),
            )
            .expect("job builds")
        }

        fn command(job: &Job) -> Vec<String> {
            job.spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .and_then(|p| p.containers[0].command.clone())
                .expect("command")
        }

        #[test]
        fn latest_by_default() {
            let job = build(&restore(restore_spec()));
            assert_eq!(job.metadata.name.as_deref(), Some("resticrestore-recover"));
            assert_eq!(
                command(&job),
                vec!["restic", "restore", "latest", "--target", "/restore"]
            );
        }

        #[test]
        fn explicit_snapshot_ignores_selector() {
            let mut spec = restore_spec();
            spec.snapshot_id = Some("4bba301e".to_string());
            spec.snapshot_selector = Some(SnapshotSelector {
                tags: vec!["daily".to_string()],
                ..Default::default()
            });
            assert_eq!(
                command(&build(&restore(spec))),
                vec!["restic", "restore", "4bba301e", "--target", "/restore"]
            );
        }

        #[test]
        fn selector_filters_latest() {
            let mut spec = restore_spec();
            spec.snapshot_selector = Some(SnapshotSelector {
                latest: true,
                tags: vec!["daily".to_string()],
                hostname: Some("db-host".to_string()),
                before: None,
            });
            spec.target.pvc = Some(PvcTarget {
                claim_name: "restored".to_string(),
                path: Some("/var/data".to_string()),
            });
            spec.include_paths = vec!["/backup/db".to_string()];
            spec.exclude_paths = vec!["*.log".to_string()];
            spec.options = Some(RestoreOptions {
                overwrite: false,
                verify: true,
            });
            assert_eq!(
                command(&build(&restore(spec))),
                vec![
                    "restic", "restore", "latest", "--target", "/restore/var/data", "--tag",
                    "daily", "--host", "db-host", "--include", "/backup/db", "--exclude",
                    "*.log", "--overwrite", "never", "--verify"
                ]
            );
        }

        #[test]
        fn mounts_target_claim_writable() {
            let job = build(&restore(restore_spec()));
            let pod = job
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .expect("pod");
            let volume = &pod.volumes.as_ref().expect("volumes")[0];
            assert_eq!(volume.name, "restore-target");
            let claim = volume.persistent_volume_claim.as_ref().expect("pvc");
            assert_eq!(claim.claim_name, "restored");
            assert_eq!(claim.read_only, Some(false));
            assert_eq!(
                job.metadata.owner_references.as_ref().map(|o| o[0].kind.as_str()),
                Some("ResticRestore")
            );
            assert_eq!(job.spec.as_ref().and_then(|s| s.backoff_limit), Some(0));
        }

        #[test]
        fn new_pvc_target() {
            let registry = ResourceRegistry::new();
            let target = NewPvcTarget {
                name: "restored-data".to_string(),
                storage_class_name: Some("fast".to_string()),
                access_modes: vec![],
                size: "10Gi".to_string(),
            };
            let mut spec = restore_spec();
            spec.target = RestoreTarget {
                pvc: None,
                new_pvc: Some(target.clone()),
            };
            let r = restore(spec);

            let pvc = restore_pvc(&r, &target, registry.get(ManagedKind::Restore));
            assert_eq!(pvc.metadata.name.as_deref(), Some("restored-data"));
            assert!(pvc.metadata.owner_references.is_none());
            let pvc_spec = pvc.spec.expect("spec");
            assert_eq!(pvc_spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
            assert_eq!(pvc_spec.storage_class_name.as_deref(), Some("fast"));

            let job = build(&r);
            let claim = job
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .and_then(|p| p.volumes.as_ref())
                .and_then(|v| v[0].persistent_volume_claim.as_ref())
                .map(|c| c.claim_name.clone());
            assert_eq!(claim.as_deref(), Some("restored-data"));
        }

        #[test]
        fn missing_target_is_invalid() {
            let mut spec = restore_spec();
            spec.target = RestoreTarget::default();
            let registry = ResourceRegistry::new();
            let err = restore_job(
                &restore(spec),
                &backup(backup_spec()),
                &repository(),
                registry.get(ManagedKind::Restore),
            )
            .unwrap_err();
            assert!(matches!(err, Error::Validation { .. }));
        }
    }

    mod job_state {
        use super::*;

        fn job(succeeded: Option<i32>, failed: Option<i32>, condition: Option<&str>) -> Job {
            Job {
                status: Some(JobStatus {
                    succeeded,
                    failed,
                    conditions: condition.map(|c| {
                        vec![JobCondition {
                            type_: c.to_string(),
                            status: "True".to_string(),
                            message: Some("BackoffLimitExceeded".to_string()),
                            ..Default::default()
                        }]
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }
        }

        #[test]
        fn counts_and_conditions() {
            assert!(is_job_complete(&job(Some(1), None, None)));
            assert!(is_job_complete(&job(None, None, Some("Complete"))));
            assert!(!is_job_complete(&job(Some(0), None, None)));

            assert!(is_job_failed(&job(None, Some(1), None)));
            assert!(is_job_failed(&job(None, None, Some("Failed"))));
            assert!(!is_job_failed(&job(None, None, None)));
            assert!(!is_job_failed(&Job::default()));
        }

        #[test]
        fn failure_message() {
            assert_eq!(
                job_failure_message(&job(None, Some(1), Some("Failed"))).as_deref(),
                Some("BackoffLimitExceeded")
            );
            assert_eq!(job_failure_message(&job(Some(1), None, None)), None);
        }
    }
}
