//! Standard metadata facet shared by every resource, plus the condition
//! and selector types the controllers work with.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition type for `PodScheduled`.
pub const CONDITION_POD_SCHEDULED: &str = "PodScheduled";

/// Condition type for pod initialization (wire name `Initialized`).
pub const CONDITION_INITIALIZED: &str = "Initialized";

/// Condition type for pod and node readiness (wire name `Ready`).
pub const CONDITION_READY: &str = "Ready";

/// Object metadata. The store owns `uid`, `resource_version` and
/// `creation_timestamp`; clients may supply them but they are overwritten
/// or preserved by the store, never trusted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn namespaced(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }
}

/// Reference to an owning object, by kind/name/uid rather than pointer.
/// Re-resolution always goes through the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    #[serde(default)]
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
}

/// Tri-state condition status, serialized `True` / `False` / `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A single status condition. Used for both pods and nodes; pods simply
/// never populate the heartbeat time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,

    pub status: ConditionStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<DateTime<Utc>>,

    pub last_transition_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    pub fn new(condition_type: impl Into<String>, status: ConditionStatus) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            last_heartbeat_time: None,
            last_transition_time: Utc::now(),
            reason: String::new(),
            message: String::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        self.reason = reason.into();
        self.message = message.into();
        self
    }
}

/// Find a condition by type in a slice.
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// Insert or update a condition, preserving `last_transition_time` unless
/// the status actually flipped. The heartbeat time is always refreshed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut next: Condition) {
    let now = Utc::now();
    next.last_heartbeat_time = Some(now);
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == next.condition_type)
    {
        Some(existing) => {
            if existing.status == next.status {
                next.last_transition_time = existing.last_transition_time;
            } else {
                next.last_transition_time = now;
            }
            *existing = next;
        }
        None => {
            next.last_transition_time = now;
            conditions.push(next);
        }
    }
}

/// Label selector with exact-match semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(rename = "matchLabels")]
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub match_labels: HashMap<String, String>,
}

impl LabelSelector {
    /// An empty selector matches nothing, so an unset selector can never
    /// accidentally claim every pod in a namespace.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        !self.match_labels.is_empty()
            && self
                .match_labels
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }
}
