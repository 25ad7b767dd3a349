//! Command line and environment configuration

use std::time::Duration;

use clap::Parser;

use restic_common::duration::parse_duration;
use restic_common::telemetry::LogFormat;
use restic_executor::DEFAULT_RESTIC_BINARY;

/// Default number of concurrent reconciles per controller
pub const DEFAULT_CONCURRENCY: u16 = 4;

/// Namespace used for the leader Lease when none is configured
pub const DEFAULT_NAMESPACE: &str = "restic-system";

/// Restic backup operator - schedules restic backups, restores and retention as Kubernetes Jobs
#[derive(Parser, Debug, Clone)]
#[command(name = "restic-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print CRD manifests as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Lock age at which a repository lock is removed (e.g. 30m, 1h30m)
    #[arg(
        long,
        env = "STALE_LOCK_THRESHOLD",
        value_parser = duration_arg,
        default_value = "30m"
    )]
    pub stale_lock_threshold: Duration,

    /// Deadline for a single restic invocation
    #[arg(long, env = "EXECUTOR_TIMEOUT", value_parser = duration_arg, default_value = "30m")]
    pub executor_timeout: Duration,

    /// Deadline for one reconcile
    #[arg(long, env = "RECONCILE_TIMEOUT", value_parser = duration_arg, default_value = "10m")]
    pub reconcile_timeout: Duration,

    /// Concurrent reconciles per controller
    #[arg(long, env = "CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: u16,

    /// Path to the restic binary
    #[arg(long, env = "RESTIC_BINARY", default_value = DEFAULT_RESTIC_BINARY)]
    pub restic_binary: String,

    /// Only run controllers while holding the leader Lease
    #[arg(long, env = "LEADER_ELECTION", default_value_t = false)]
    pub leader_election: bool,

    /// Namespace the operator runs in (holds the leader Lease)
    #[arg(long, env = "POD_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Log output format: json or text
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

fn duration_arg(text: &str) -> Result<Duration, String> {
    parse_duration(text).map_err(|e| e.to_string())
}
