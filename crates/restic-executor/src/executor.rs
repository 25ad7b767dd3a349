//! Executor trait and the process-backed implementation

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::commands::CommandBuilder;
use crate::error::ExecutorError;
use crate::types::{
    BackupOptions, BackupResult, CheckResult, Credentials, ForgetOptions, ForgetResult,
    PruneResult, RepoStats, RestoreOptions, RestoreResult, Snapshot, StatsMode,
};

/// Binary name looked up on `PATH` when none is configured
pub const DEFAULT_RESTIC_BINARY: &str = "restic";

/// Upper bound for a single restic invocation
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// stderr fragments restic prints when `init` finds an existing repository
const ALREADY_INITIALIZED: [&str; 3] = [
    "already exists",
    "repository master key and config already initialized",
    "config file already exists",
];

/// Operations the operator performs against a restic repository
///
/// Every call carries its own credentials; implementations hold no
/// per-repository state.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Executor: Send + Sync {
    /// Create the repository; succeeds when it already exists
    async fn init(&self, creds: &Credentials) -> Result<(), ExecutorError>;

    /// Remove stale locks
    async fn unlock(&self, creds: &Credentials) -> Result<(), ExecutorError>;

    /// Verify repository integrity
    async fn check(&self, creds: &Credentials) -> Result<CheckResult, ExecutorError>;

    /// Repository statistics plus the snapshot count
    async fn stats(&self, creds: &Credentials, mode: StatsMode)
        -> Result<RepoStats, ExecutorError>;

    /// All snapshots in the repository
    async fn snapshots(&self, creds: &Credentials) -> Result<Vec<Snapshot>, ExecutorError>;

    /// Take a snapshot
    async fn backup(
        &self,
        creds: &Credentials,
        opts: &BackupOptions,
    ) -> Result<BackupResult, ExecutorError>;

    /// Restore a snapshot into a directory
    async fn restore(
        &self,
        creds: &Credentials,
        opts: &RestoreOptions,
    ) -> Result<RestoreResult, ExecutorError>;

    /// Apply keep rules
    async fn forget(
        &self,
        creds: &Credentials,
        opts: &ForgetOptions,
    ) -> Result<ForgetResult, ExecutorError>;

    /// Remove unreferenced data
    async fn prune(&self, creds: &Credentials) -> Result<PruneResult, ExecutorError>;
}

/// Captured result of one restic process
struct RunOutput {
    success: bool,
    status: String,
    stdout: Vec<u8>,
    stderr: String,
}

impl RunOutput {
    fn into_result(self, operation: &str, context: &str) -> Result<Vec<u8>, ExecutorError> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(ExecutorError::CommandFailed {
                operation: operation.to_string(),
                context: context.to_string(),
                status: self.status,
                stderr: self.stderr,
            })
        }
    }
}

/// [`Executor`] that runs the restic binary as a child process
///
/// The child only sees the repository credentials plus `PATH` and `HOME`.
/// It is killed when the calling future is dropped or the deadline passes.
#[derive(Clone, Debug)]
pub struct ProcessExecutor {
    binary: String,
    timeout: Duration,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_RESTIC_BINARY, DEFAULT_COMMAND_TIMEOUT)
    }
}

impl ProcessExecutor {
    /// Executor running `binary` with a per-call `timeout`
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        let binary = binary.into();
        Self {
            binary: if binary.is_empty() {
                DEFAULT_RESTIC_BINARY.to_string()
            } else {
                binary
            },
            timeout,
        }
    }

    async fn run(
        &self,
        creds: &Credentials,
        command: CommandBuilder,
    ) -> Result<RunOutput, ExecutorError> {
        let operation = command.command().to_string();
        let description = command.to_string();
        let args = command.build();

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .env_clear()
            .envs(passthrough_env())
            .envs(creds.env())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(command = %description, args = %args.join(" "), "Executing restic command");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                warn!(command = %description, timeout = ?self.timeout, "restic command timed out");
                ExecutorError::Timeout {
                    operation: operation.clone(),
                    after: self.timeout,
                }
            })?
            .map_err(|source| {
                warn!(command = %description, error = %source, "Failed to spawn restic");
                ExecutorError::Spawn {
                    operation: operation.clone(),
                    source,
                }
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            warn!(command = %description, status = %output.status, stderr = %stderr, "restic command failed");
        }

        Ok(RunOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: output.stdout,
            stderr,
        })
    }
}

fn passthrough_env() -> Vec<(&'static str, String)> {
    ["PATH", "HOME"]
        .into_iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key, v)))
        .collect()
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn init(&self, creds: &Credentials) -> Result<(), ExecutorError> {
        let out = self.run(creds, CommandBuilder::new("init")).await?;
        if !out.success && ALREADY_INITIALIZED.iter().any(|m| out.stderr.contains(m)) {
            debug!("Repository already initialized");
            return Ok(());
        }
        out.into_result("init", "failed to initialize repository")
            .map(|_| ())
    }

    async fn unlock(&self, creds: &Credentials) -> Result<(), ExecutorError> {
        self.run(creds, CommandBuilder::new("unlock"))
            .await?
            .into_result("unlock", "failed to unlock repository")
            .map(|_| ())
    }

    async fn check(&self, creds: &Credentials) -> Result<CheckResult, ExecutorError> {
        let start = Instant::now();
        let out = self.run(creds, CommandBuilder::new("check")).await?;
        let message = out.stderr.clone();
        out.into_result("check", "repository check failed")?;
        Ok(CheckResult {
            success: true,
            message,
            duration: start.elapsed(),
        })
    }

    async fn stats(
        &self,
        creds: &Credentials,
        mode: StatsMode,
    ) -> Result<RepoStats, ExecutorError> {
        let stdout = self
            .run(creds, CommandBuilder::new("stats").json().mode(mode.as_str()))
            .await?
            .into_result("stats", "failed to get repository stats")?;
        let mut stats = parse_stats(&stdout)?;
        stats.snapshot_count = self.snapshots(creds).await?.len() as u64;
        Ok(stats)
    }

    async fn snapshots(&self, creds: &Credentials) -> Result<Vec<Snapshot>, ExecutorError> {
        let out = self
            .run(creds, CommandBuilder::new("snapshots").json())
            .await?;
        if !out.success && out.stderr.contains("no snapshots") {
            return Ok(Vec::new());
        }
        let stdout = out.into_result("snapshots", "failed to list snapshots")?;
        parse_snapshots(&stdout)
    }

    async fn backup(
        &self,
        creds: &Credentials,
        opts: &BackupOptions,
    ) -> Result<BackupResult, ExecutorError> {
        let start = Instant::now();
        let command = CommandBuilder::new("backup")
            .json()
            .host(&opts.hostname)
            .tags(&opts.tags)
            .excludes(&opts.excludes)
            .args(&opts.extra_args)
            .args(&opts.paths);
        let stdout = self
            .run(creds, command)
            .await?
            .into_result("backup", "backup failed")?;
        let mut result = parse_backup_summary(&stdout)?;
        result.duration = start.elapsed();
        Ok(result)
    }

    async fn restore(
        &self,
        creds: &Credentials,
        opts: &RestoreOptions,
    ) -> Result<RestoreResult, ExecutorError> {
        let start = Instant::now();
        let command = CommandBuilder::new("restore")
            .target(&opts.target)
            .includes(&opts.include)
            .excludes(&opts.exclude)
            .arg(&opts.snapshot_id)
            .verify(opts.verify);
        self.run(creds, command)
            .await?
            .into_result("restore", "restore failed")?;
        Ok(RestoreResult {
            duration: start.elapsed(),
            ..Default::default()
        })
    }

    async fn forget(
        &self,
        creds: &Credentials,
        opts: &ForgetOptions,
    ) -> Result<ForgetResult, ExecutorError> {
        let command = CommandBuilder::new("forget")
            .json()
            .host(&opts.hostname)
            .tags(&opts.tags)
            .retention(&opts.retention)
            .group_by(&opts.group_by)
            .prune(opts.prune)
            .dry_run(opts.dry_run);
        let stdout = self
            .run(creds, command)
            .await?
            .into_result("forget", "forget failed")?;
        Ok(parse_forget(&stdout))
    }

    async fn prune(&self, creds: &Credentials) -> Result<PruneResult, ExecutorError> {
        let start = Instant::now();
        self.run(creds, CommandBuilder::new("prune"))
            .await?
            .into_result("prune", "prune failed")?;
        Ok(PruneResult {
            duration: start.elapsed(),
            ..Default::default()
        })
    }
}

#[derive(Deserialize)]
struct StatsOutput {
    #[serde(default)]
    total_size: u64,
    #[serde(default)]
    total_file_count: u64,
}

/// Parse `restic stats --json`; the snapshot count is filled in separately
fn parse_stats(stdout: &[u8]) -> Result<RepoStats, ExecutorError> {
    let parsed: StatsOutput =
        serde_json::from_slice(stdout).map_err(|e| ExecutorError::Parse {
            operation: "stats".to_string(),
            message: e.to_string(),
        })?;
    Ok(RepoStats {
        total_size: parsed.total_size,
        total_file_count: parsed.total_file_count,
        snapshot_count: 0,
    })
}

/// Parse `restic snapshots --json`; an empty repository prints nothing or `null`
fn parse_snapshots(stdout: &[u8]) -> Result<Vec<Snapshot>, ExecutorError> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() || text == "null" {
        return Ok(Vec::new());
    }
    serde_json::from_str(text).map_err(|e| ExecutorError::Parse {
        operation: "snapshots".to_string(),
        message: e.to_string(),
    })
}

#[derive(Default, Deserialize)]
struct BackupMessage {
    #[serde(default)]
    message_type: String,
    #[serde(default)]
    snapshot_id: String,
    #[serde(default)]
    files_new: u64,
    #[serde(default)]
    files_changed: u64,
    #[serde(default)]
    files_unmodified: u64,
    #[serde(default)]
    dirs_new: u64,
    #[serde(default)]
    dirs_changed: u64,
    #[serde(default)]
    dirs_unmodified: u64,
    #[serde(default)]
    data_added: u64,
    #[serde(default)]
    total_files_processed: u64,
    #[serde(default)]
    total_bytes_processed: u64,
}

/// Find the last `summary` message in `restic backup --json` output
fn parse_backup_summary(stdout: &[u8]) -> Result<BackupResult, ExecutorError> {
    let text = String::from_utf8_lossy(stdout);
    let summary = text
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<BackupMessage>(line.trim()).ok())
        .find(|msg| msg.message_type == "summary")
        .ok_or_else(|| ExecutorError::Parse {
            operation: "backup".to_string(),
            message: "no summary message in output".to_string(),
        })?;

    Ok(BackupResult {
        snapshot_id: summary.snapshot_id,
        files_new: summary.files_new,
        files_changed: summary.files_changed,
        files_unmodified: summary.files_unmodified,
        dirs_new: summary.dirs_new,
        dirs_changed: summary.dirs_changed,
        dirs_unmodified: summary.dirs_unmodified,
        data_added: summary.data_added,
        total_files: summary.total_files_processed,
        total_bytes: summary.total_bytes_processed,
        duration: Duration::ZERO,
    })
}

#[derive(Deserialize)]
struct ForgetGroup {
    #[serde(default)]
    remove: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    keep: Option<Vec<serde_json::Value>>,
}

/// Sum removed and kept snapshots over all groups
///
/// Output that does not parse yields zero counts; forget itself succeeded.
fn parse_forget(stdout: &[u8]) -> ForgetResult {
    let Ok(groups) = serde_json::from_slice::<Vec<ForgetGroup>>(stdout) else {
        return ForgetResult::default();
    };
    groups
        .iter()
        .fold(ForgetResult::default(), |mut acc, group| {
            acc.snapshots_removed += group.remove.as_ref().map_or(0, Vec::len) as u64;
            acc.snapshots_kept += group.keep.as_ref().map_or(0, Vec::len) as u64;
            acc
        })
}
