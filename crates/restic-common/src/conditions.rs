//! Condition store operations
//!
//! Every status in this operator carries a `Vec<Condition>` with at most one
//! entry per type. `set_condition` only moves `lastTransitionTime` when the
//! status actually flips, so watchers can tell how long a state has held.

use crate::crd::{Condition, ConditionStatus};

/// Insert or update a condition by type
///
/// Returns true if anything changed.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) if existing.status == new.status => {
            let changed = existing.reason != new.reason || existing.message != new.message;
            existing.reason = new.reason;
            existing.message = new.message;
            changed
        }
        Some(existing) => {
            *existing = new;
            true
        }
        None => {
            conditions.push(new);
            true
        }
    }
}

/// Find a condition by type
pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition exists and is True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    has_status(conditions, type_, ConditionStatus::True)
}

/// Whether the condition exists and is False
pub fn is_condition_false(conditions: &[Condition], type_: &str) -> bool {
    has_status(conditions, type_, ConditionStatus::False)
}

/// Whether the condition is missing or Unknown
pub fn is_condition_unknown(conditions: &[Condition], type_: &str) -> bool {
    get_condition(conditions, type_).map_or(true, |c| c.status == ConditionStatus::Unknown)
}

/// Remove a condition by type, returning true if one was removed
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    conditions.len() != before
}

fn has_status(conditions: &[Condition], type_: &str, status: ConditionStatus) -> bool {
    get_condition(conditions, type_).is_some_and(|c| c.status == status)
}
