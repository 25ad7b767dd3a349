//! restic argument builder
//!
//! Used both for local invocations and for the command lines baked into
//! generated Jobs, so both paths agree on flag spelling.

use std::fmt;

use restic_common::crd::RetentionRules;

/// Builds the argument list of one restic subcommand
///
/// Empty values are skipped so optional fields can be passed through
/// unconditionally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandBuilder {
    command: String,
    args: Vec<String>,
}

impl CommandBuilder {
    /// Start a `restic <command>` invocation
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: vec![command.to_string()],
        }
    }

    /// Subcommand name
    pub fn command(&self) -> &str {
        &self.command
    }

    fn flag(mut self, name: &str, value: &str) -> Self {
        if !value.is_empty() {
            self.args.push(name.to_string());
            self.args.push(value.to_string());
        }
        self
    }

    fn switch(mut self, name: &str, on: bool) -> Self {
        if on {
            self.args.push(name.to_string());
        }
        self
    }

    /// `--json`
    pub fn json(self) -> Self {
        self.switch("--json", true)
    }

    /// `--host <host>`
    pub fn host(self, host: &str) -> Self {
        self.flag("--host", host)
    }

    /// `--tag <tag>` per tag
    pub fn tags(self, tags: &[String]) -> Self {
        tags.iter().fold(self, |b, t| b.flag("--tag", t))
    }

    /// `--exclude <pattern>` per pattern
    pub fn excludes(self, patterns: &[String]) -> Self {
        patterns.iter().fold(self, |b, p| b.flag("--exclude", p))
    }

    /// `--include <pattern>` per pattern
    pub fn includes(self, patterns: &[String]) -> Self {
        patterns.iter().fold(self, |b, p| b.flag("--include", p))
    }

    /// `--target <dir>`
    pub fn target(self, target: &str) -> Self {
        self.flag("--target", target)
    }

    /// `--mode <mode>`
    pub fn mode(self, mode: &str) -> Self {
        self.flag("--mode", mode)
    }

    /// `--keep-last`, `--keep-daily`, ... for every positive rule
    pub fn retention(mut self, rules: &RetentionRules) -> Self {
        for (flag, n) in rules.keep_flags() {
            self.args.push(flag.to_string());
            self.args.push(n.to_string());
        }
        self
    }

    /// `--group-by a,b`
    pub fn group_by(self, keys: &[String]) -> Self {
        let joined = keys
            .iter()
            .filter(|k| !k.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(",");
        self.flag("--group-by", &joined)
    }

    /// `--prune` when `on`
    pub fn prune(self, on: bool) -> Self {
        self.switch("--prune", on)
    }

    /// `--dry-run` when `on`
    pub fn dry_run(self, on: bool) -> Self {
        self.switch("--dry-run", on)
    }

    /// `--verify` when `on`
    pub fn verify(self, on: bool) -> Self {
        self.switch("--verify", on)
    }

    /// One positional argument, skipped when empty
    pub fn arg(mut self, arg: &str) -> Self {
        if !arg.is_empty() {
            self.args.push(arg.to_string());
        }
        self
    }

    /// Positional arguments, empty ones skipped
    pub fn args(self, args: &[String]) -> Self {
        args.iter().fold(self, |b, a| b.arg(a))
    }

    /// Final argument vector, starting with the subcommand
    pub fn build(self) -> Vec<String> {
        self.args
    }
}

impl fmt::Display for CommandBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "restic {}", self.command)
    }
}
