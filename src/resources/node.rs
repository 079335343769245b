//! Node - a host participating in the cluster, one per runtime process.
//! Cluster-scoped: nodes have no namespace.

use serde::{Deserialize, Serialize};

use super::meta::{find_condition, Condition, ConditionStatus, ObjectMeta, CONDITION_READY};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(default)]
    pub api_version: String,

    #[serde(default)]
    pub kind: String,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: NodeSpec,

    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Node".to_string(),
            metadata: ObjectMeta::named(name),
            spec: NodeSpec::default(),
            status: NodeStatus::default(),
        }
    }

    /// A node is ready when its `Ready` condition is True.
    pub fn is_ready(&self) -> bool {
        find_condition(&self.status.conditions, CONDITION_READY)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    #[serde(default)]
    pub unschedulable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<NodeAddress>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub address_type: String,

    pub address: String,
}
