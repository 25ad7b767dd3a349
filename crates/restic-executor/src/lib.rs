//! restic CLI integration
//!
//! The [`Executor`] trait is the only way the operator talks to restic.
//! [`ProcessExecutor`] runs the real binary; controllers take an
//! `Arc<dyn Executor>` so tests can substitute a mock.

#![deny(missing_docs)]

pub mod commands;
pub mod error;
pub mod executor;
pub mod format;
pub mod lock;
pub mod types;

pub use commands::CommandBuilder;
pub use error::ExecutorError;
pub use executor::{Executor, ProcessExecutor, DEFAULT_COMMAND_TIMEOUT, DEFAULT_RESTIC_BINARY};
pub use format::format_bytes;
pub use lock::{is_lock_error, parse_lock_age};
pub use types::{
    BackupOptions, BackupResult, CheckResult, Credentials, ForgetOptions, ForgetResult,
    PruneResult, RepoStats, RestoreOptions, RestoreResult, Snapshot, StatsMode,
};
