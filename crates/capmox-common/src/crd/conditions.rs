//! Condition bookkeeping on status condition lists
//!
//! Marking is idempotent: re-marking a condition with the same status,
//! severity, reason and message leaves the existing entry (and its
//! transition timestamp) untouched, so repeated reconciliations do not
//! produce status churn.

use super::types::{Condition, ConditionSeverity, ConditionStatus};

/// Condition reporting whether the backing VM has been provisioned
pub const VM_PROVISIONED_CONDITION: &str = "VMProvisioned";

/// The VM is being cloned from its template
pub const CLONING_REASON: &str = "Cloning";

/// Cloning the VM failed
pub const CLONING_FAILED_REASON: &str = "CloningFailed";

/// Provisioning the VM failed terminally
pub const VM_PROVISION_FAILED_REASON: &str = "VMProvisionFailed";

/// Look up a condition by type
pub fn get<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check whether a condition of the given type exists
pub fn has(conditions: &[Condition], type_: &str) -> bool {
    get(conditions, type_).is_some()
}

/// Check whether a condition of the given type is False
pub fn is_false(conditions: &[Condition], type_: &str) -> bool {
    get(conditions, type_).is_some_and(|c| c.status == ConditionStatus::False)
}

/// Set a condition, replacing any existing condition of the same type
///
/// Returns false when an identical condition was already present.
pub fn set(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing)
            if existing.status == condition.status
                && existing.severity == condition.severity
                && existing.reason == condition.reason
                && existing.message == condition.message =>
        {
            false
        }
        Some(existing) => {
            let keep_time = existing.status == condition.status;
            let last_transition_time = existing.last_transition_time;
            *existing = condition;
            if keep_time {
                existing.last_transition_time = last_transition_time;
            }
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Mark a condition True
pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    set(
        conditions,
        Condition::new(type_, ConditionStatus::True, "", ""),
    )
}

/// Mark a condition False with a reason, severity and message
pub fn mark_false(
    conditions: &mut Vec<Condition>,
    type_: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: impl Into<String>,
) -> bool {
    set(
        conditions,
        Condition::new(type_, ConditionStatus::False, reason, message).with_severity(severity),
    )
}
