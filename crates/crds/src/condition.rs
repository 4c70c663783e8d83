//! Status conditions shared by all JetStream kinds

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported for every JetStream object
pub const CONDITION_READY: &str = "Ready";

/// Tri-state status of a condition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// Not yet determined
    #[default]
    Unknown,
}

/// A single observation about an object
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. "Ready")
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False or Unknown
    pub status: ConditionStatus,

    /// Machine-readable reason in CamelCase
    #[serde(default)]
    pub reason: String,

    /// Human-readable detail
    #[serde(default)]
    pub message: String,

    /// Last time `status` changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Build a Ready condition without a transition time.
    ///
    /// The time is filled in by [`ResourceStatus::set_condition`].
    pub fn ready(status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: CONDITION_READY.to_string(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
        }
    }

    /// Equal apart from the transition time
    fn same_observation(&self, other: &Self) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Status block common to Account, Stream, Consumer and StreamTemplate
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Generation of the spec this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// At most one entry per condition type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ResourceStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// True when the Ready condition is present with status True
    pub fn is_ready(&self) -> bool {
        self.condition(CONDITION_READY)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Insert or overwrite a condition.
    ///
    /// `last_transition_time` is carried over when the status value does not
    /// change and set to `now` when it does. A True condition is never
    /// replaced by Unknown; only an explicit False may follow True.
    ///
    /// Returns `true` if the stored condition changed.
    pub fn set_condition(&mut self, mut condition: Condition, now: DateTime<Utc>) -> bool {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == ConditionStatus::True
                    && condition.status == ConditionStatus::Unknown
                {
                    return false;
                }
                if existing.same_observation(&condition) {
                    return false;
                }
                condition.last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time.or(Some(now))
                } else {
                    Some(now)
                };
                *existing = condition;
                true
            }
            None => {
                condition.last_transition_time = Some(now);
                self.conditions.push(condition);
                true
            }
        }
    }
}
