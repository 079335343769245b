//! Manifest codec: YAML-or-JSON decoding into typed resources, encoding
//! back out, and multi-document manifest splitting.
//!
//! Decoding is a two-step affair: the bytes are first parsed into a JSON
//! value (JSON fast path, YAML fallback), then dispatched on the `kind`
//! field into the closed set of supported types. Unknown kinds raise a
//! typed error rather than falling back to any dynamic representation.

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::resources::{
    ConfigMap, DaemonSet, Deployment, Gvk, Node, Pod, Resource, Secret, Service, StatefulSet,
};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unsupported kind: {0}")]
    UnknownKind(String),

    #[error("manifest is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("failed to decode manifest: {0}")]
    Decode(String),

    #[error("failed to encode object: {0}")]
    Encode(String),
}

/// Decode a single YAML or JSON document into a typed resource plus the
/// GVK declared in its body.
pub fn decode_yaml_or_json(data: &[u8]) -> Result<(Resource, Gvk), CodecError> {
    let value: serde_json::Value = match serde_json::from_slice(data) {
        Ok(value) => value,
        Err(_) => {
            let yaml: serde_yaml::Value =
                serde_yaml::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))?;
            serde_json::to_value(yaml).map_err(|e| CodecError::Decode(e.to_string()))?
        }
    };
    decode_value(value)
}

/// Decode an already-parsed JSON value. Used by the merge-patch path,
/// which manipulates values before re-typing them.
pub fn decode_value(value: serde_json::Value) -> Result<(Resource, Gvk), CodecError> {
    let kind = value
        .get("kind")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(CodecError::MissingField("kind"))?
        .to_string();
    let api_version = value
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(CodecError::MissingField("apiVersion"))?
        .to_string();

    let gvk = Gvk::from_api_version(&api_version, kind.clone());

    let resource = match (gvk.group.as_str(), kind.as_str()) {
        ("", "Pod") => Resource::Pod(typed::<Pod>(value)?),
        ("", "Service") => Resource::Service(typed::<Service>(value)?),
        ("", "ConfigMap") => Resource::ConfigMap(typed::<ConfigMap>(value)?),
        ("", "Secret") => Resource::Secret(typed::<Secret>(value)?),
        ("", "Node") => Resource::Node(typed::<Node>(value)?),
        ("apps", "Deployment") => Resource::Deployment(typed::<Deployment>(value)?),
        ("apps", "StatefulSet") => Resource::StatefulSet(typed::<StatefulSet>(value)?),
        ("apps", "DaemonSet") => Resource::DaemonSet(typed::<DaemonSet>(value)?),
        _ => return Err(CodecError::UnknownKind(format!("{}/{}", api_version, kind))),
    };

    Ok((resource, gvk))
}

fn typed<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, CodecError> {
    serde_json::from_value(value).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Encode a resource as YAML.
pub fn encode_yaml(resource: &Resource) -> Result<Vec<u8>, CodecError> {
    serde_yaml::to_string(resource)
        .map(String::into_bytes)
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Encode a resource as JSON.
pub fn encode_json(resource: &Resource) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(resource).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Encode a resource as a JSON value.
pub fn to_value(resource: &Resource) -> Result<serde_json::Value, CodecError> {
    serde_json::to_value(resource).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Split a multi-document manifest on `---` separators. Empty documents
/// and documents containing only comments are dropped.
pub fn split_multi_doc(data: &[u8]) -> Vec<Vec<u8>> {
    let text = String::from_utf8_lossy(data);
    let mut docs = Vec::new();

    for part in text.split("\n---") {
        let part = part.trim_start_matches("---").trim();
        if part.is_empty() {
            continue;
        }
        let has_content = part
            .lines()
            .any(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'));
        if has_content {
            docs.push(part.as_bytes().to_vec());
        }
    }

    docs
}
