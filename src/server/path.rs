//! Kubernetes URL conventions: parsing request paths into resource
//! references and building them back.
//!
//! ```text
//! Core group:  /api/<version>/[namespaces/<ns>/]<resource>[/<name>]
//! Named group: /apis/<group>/<version>/[namespaces/<ns>/]<resource>[/<name>]
//! Watch:       insert "watch/" right after the version segment
//! ```

use crate::resources::gvk::kind_for_resource;
use crate::resources::Gvk;

/// What a request path addresses: a Kind, an optional namespace, an
/// optional item name, and whether this is the watch variant.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRef {
    pub gvk: Gvk,
    pub namespace: String,
    pub name: String,
    pub watch: bool,
}

impl ResourceRef {
    pub fn is_collection(&self) -> bool {
        self.name.is_empty()
    }
}

/// Parse a request path. Returns a message suitable for a 400 response
/// on any shape the API does not serve.
pub fn parse_path(path: &str) -> Result<ResourceRef, String> {
    let parts: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

    let (group, version, rest) = match parts.first() {
        Some(&"api") => {
            if parts.len() < 2 {
                return Err("missing API version".to_string());
            }
            ("", parts[1], &parts[2..])
        }
        Some(&"apis") => {
            if parts.len() < 3 {
                return Err("missing API group or version".to_string());
            }
            (parts[1], parts[2], &parts[3..])
        }
        _ => return Err(format!("unknown API path prefix: {}", path)),
    };

    let mut rest = rest;
    let watch = rest.first() == Some(&"watch");
    if watch {
        rest = &rest[1..];
    }

    let mut namespace = "";
    if rest.first() == Some(&"namespaces") {
        if rest.len() < 2 {
            return Err("missing namespace name".to_string());
        }
        namespace = rest[1];
        rest = &rest[2..];
    }

    let resource = match rest.first() {
        Some(resource) => *resource,
        None => return Err("missing resource type".to_string()),
    };
    let gvk = kind_for_resource(resource)
        .ok_or_else(|| format!("unknown resource type: {}", resource))?;
    if gvk.group != group || gvk.version != version {
        return Err(format!(
            "resource {} is not served under {}/{}",
            resource,
            if group.is_empty() { "core" } else { group },
            version
        ));
    }

    let name = match rest.len() {
        1 => "",
        2 => rest[1],
        _ => return Err(format!("unexpected trailing path segments in {}", path)),
    };

    Ok(ResourceRef {
        gvk,
        namespace: namespace.to_string(),
        name: name.to_string(),
        watch,
    })
}

/// Build the canonical path for a reference; inverse of [`parse_path`]
/// for every supported resource.
pub fn build_path(reference: &ResourceRef) -> String {
    let mut path = if reference.gvk.group.is_empty() {
        format!("/api/{}", reference.gvk.version)
    } else {
        format!("/apis/{}/{}", reference.gvk.group, reference.gvk.version)
    };

    if reference.watch {
        path.push_str("/watch");
    }
    if !reference.namespace.is_empty() {
        path.push_str("/namespaces/");
        path.push_str(&reference.namespace);
    }
    path.push('/');
    // Supported kinds always have a plural form.
    path.push_str(reference.gvk.plural().unwrap_or_default());
    if !reference.name.is_empty() {
        path.push('/');
        path.push_str(&reference.name);
    }
    path
}
