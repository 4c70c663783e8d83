//! Condition reasons and status computation.

use chrono::{DateTime, Utc};
use crds::{Condition, ResourceStatus};

// Success reasons
pub const REASON_CREATED: &str = "Created";
pub const REASON_UPDATED: &str = "Updated";
pub const REASON_SYNCED: &str = "Synced";
pub const REASON_UPDATE_PREVENTED: &str = "UpdatePrevented";

// Failure reasons
pub const REASON_AUTHENTICATION_FAILED: &str = "AuthenticationFailed";
pub const REASON_UNSUPPORTED_CHANGE: &str = "UnsupportedChange";
pub const REASON_PARTIAL_APPLY: &str = "PartialApply";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_APPLY_FAILED: &str = "ApplyFailed";
pub const REASON_DELETE_FAILED: &str = "DeleteFailed";
pub const REASON_WAITING_FOR_PARENT: &str = "WaitingForParent";
pub const REASON_ACCOUNT_NOT_FOUND: &str = "AccountNotFound";
pub const REASON_NO_CONNECTION_CONFIG: &str = "NoConnectionConfig";
pub const REASON_CREDENTIALS_UNAVAILABLE: &str = "CredentialsUnavailable";
pub const REASON_DEPENDENT_RESOURCES_EXIST: &str = "DependentResourcesExist";

/// Status after recording `condition` for spec generation `generation`.
///
/// Returns `None` when the stored status would not change, so callers can
/// skip the write entirely.
pub fn next_status(
    current: Option<&ResourceStatus>,
    generation: Option<i64>,
    condition: Condition,
    now: DateTime<Utc>,
) -> Option<ResourceStatus> {
    let mut status = current.cloned().unwrap_or_default();
    let condition_changed = status.set_condition(condition, now);
    let generation_changed = generation.is_some() && status.observed_generation != generation;
    if generation_changed {
        status.observed_generation = generation;
    }
    (condition_changed || generation_changed).then_some(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{CONDITION_READY, ConditionStatus};

    #[test]
    fn test_first_status() {
        let now = Utc::now();
        let status = next_status(
            None,
            Some(1),
            Condition::ready(ConditionStatus::True, REASON_CREATED, "created"),
            now,
        )
        .unwrap();

        assert_eq!(status.observed_generation, Some(1));
        let ready = status.condition(CONDITION_READY).unwrap();
        assert_eq!(ready.reason, REASON_CREATED);
        assert_eq!(ready.last_transition_time, Some(now));
    }

    #[test]
    fn test_unchanged_status_is_skipped() {
        let now = Utc::now();
        let condition = Condition::ready(ConditionStatus::True, REASON_SYNCED, "in sync");
        let status = next_status(None, Some(3), condition.clone(), now).unwrap();

        assert!(next_status(Some(&status), Some(3), condition.clone(), now).is_none());
        assert!(next_status(Some(&status), Some(4), condition, now).is_some());
    }

    #[test]
    fn test_reason_change_keeps_transition_time() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(30);
        let status = next_status(
            None,
            Some(1),
            Condition::ready(ConditionStatus::True, REASON_CREATED, "created"),
            t0,
        )
        .unwrap();
        let status = next_status(
            Some(&status),
            Some(2),
            Condition::ready(ConditionStatus::True, REASON_UPDATED, "updated subjects"),
            t1,
        )
        .unwrap();

        let ready = status.condition(CONDITION_READY).unwrap();
        assert_eq!(ready.reason, REASON_UPDATED);
        assert_eq!(ready.last_transition_time, Some(t0));
    }
}
