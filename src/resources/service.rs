//! Service resource. Stored and served; no virtual-IP machinery in this
//! core, discovery side-cars consume these objects over the watch API.

use serde::{Deserialize, Serialize};

use super::meta::ObjectMeta;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(default)]
    pub api_version: String,

    #[serde(default)]
    pub kind: String,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: ServiceSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub selector: std::collections::HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,

    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub service_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_ip: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}
