//! Group/Version/Kind identity and the plural-resource mapping tables.

use std::fmt;

/// Identifies a resource type: API group (empty for the core group),
/// version, and Kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

/// (plural resource name, Kind, group) for every supported type.
const RESOURCE_TABLE: &[(&str, &str, &str)] = &[
    ("pods", "Pod", ""),
    ("services", "Service", ""),
    ("configmaps", "ConfigMap", ""),
    ("secrets", "Secret", ""),
    ("nodes", "Node", ""),
    ("deployments", "Deployment", "apps"),
    ("statefulsets", "StatefulSet", "apps"),
    ("daemonsets", "DaemonSet", "apps"),
];

impl Gvk {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Core-group v1 Kind.
    pub fn core(kind: impl Into<String>) -> Self {
        Self::new("", "v1", kind)
    }

    /// apps/v1 Kind.
    pub fn apps(kind: impl Into<String>) -> Self {
        Self::new("apps", "v1", kind)
    }

    pub fn pod() -> Self {
        Self::core("Pod")
    }

    pub fn service() -> Self {
        Self::core("Service")
    }

    pub fn configmap() -> Self {
        Self::core("ConfigMap")
    }

    pub fn secret() -> Self {
        Self::core("Secret")
    }

    pub fn node() -> Self {
        Self::core("Node")
    }

    pub fn deployment() -> Self {
        Self::apps("Deployment")
    }

    pub fn statefulset() -> Self {
        Self::apps("StatefulSet")
    }

    pub fn daemonset() -> Self {
        Self::apps("DaemonSet")
    }

    /// The `apiVersion` wire value: `v1` for the core group,
    /// `<group>/<version>` otherwise.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Split an `apiVersion` wire value back into (group, version).
    pub fn from_api_version(api_version: &str, kind: impl Into<String>) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Only Node is cluster-scoped in this release.
    pub fn is_cluster_scoped(&self) -> bool {
        self.group.is_empty() && self.kind == "Node"
    }

    /// Lowercase plural resource name for this Kind, if supported.
    pub fn plural(&self) -> Option<&'static str> {
        RESOURCE_TABLE
            .iter()
            .find(|(_, kind, group)| *kind == self.kind && *group == self.group)
            .map(|(plural, _, _)| *plural)
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Map a lowercase plural resource name ("pods") to its Kind ("Pod").
pub fn kind_for_resource(resource: &str) -> Option<Gvk> {
    RESOURCE_TABLE
        .iter()
        .find(|(plural, _, _)| *plural == resource)
        .map(|(_, kind, group)| Gvk::new(*group, "v1", *kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_version_core_and_grouped() {
        assert_eq!(Gvk::pod().api_version(), "v1");
        assert_eq!(Gvk::deployment().api_version(), "apps/v1");
    }

    #[test]
    fn test_from_api_version() {
        assert_eq!(Gvk::from_api_version("v1", "Pod"), Gvk::pod());
        assert_eq!(
            Gvk::from_api_version("apps/v1", "Deployment"),
            Gvk::deployment()
        );
    }

    #[test]
    fn test_kind_for_resource() {
        assert_eq!(kind_for_resource("pods"), Some(Gvk::pod()));
        assert_eq!(kind_for_resource("deployments"), Some(Gvk::deployment()));
        assert_eq!(kind_for_resource("gadgets"), None);
    }

    #[test]
    fn test_plural_round_trip() {
        for (plural, _, _) in RESOURCE_TABLE {
            let gvk = kind_for_resource(plural).unwrap();
            assert_eq!(gvk.plural(), Some(*plural));
        }
    }

    #[test]
    fn test_cluster_scope() {
        assert!(Gvk::node().is_cluster_scoped());
        assert!(!Gvk::pod().is_cluster_scoped());
        assert!(!Gvk::deployment().is_cluster_scoped());
    }
}
