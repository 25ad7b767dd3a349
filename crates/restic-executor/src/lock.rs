//! Repository lock detection
//!
//! restic reports a held lock as
//! `repository is already locked ... lock was created at <ts> (12h36m32.09s ago)`.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use restic_common::duration::parse_duration;

const LOCKED_MARKER: &str = "repository is already locked";

static LOCK_AGE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\(([0-9hms.]+) ago\)").ok());

/// Whether `message` reports an existing repository lock
pub fn is_lock_error(message: &str) -> bool {
    message.contains(LOCKED_MARKER)
}

/// Age of the lock mentioned in `message`
///
/// Returns [`Duration::ZERO`] when no age can be found, so an unreadable
/// lock is treated as fresh and never removed.
pub fn parse_lock_age(message: &str) -> Duration {
    LOCK_AGE
        .as_ref()
        .and_then(|re| re.captures(message))
        .and_then(|caps| caps.get(1))
        .and_then(|m| parse_duration(m.as_str()).ok())
        .unwrap_or(Duration::ZERO)
}
