//! The `Resource` sum type over every supported Kind.
//!
//! The supported set is closed per release; the codec dispatches on the
//! `kind` field when decoding, so the enum carries serialization only.

use serde::Serialize;

use super::config::{ConfigMap, Secret};
use super::gvk::Gvk;
use super::meta::ObjectMeta;
use super::node::Node;
use super::pod::Pod;
use super::service::Service;
use super::workload::{DaemonSet, Deployment, StatefulSet};

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Resource {
    Pod(Pod),
    Service(Service),
    ConfigMap(ConfigMap),
    Secret(Secret),
    Node(Node),
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
}

impl Resource {
    pub fn gvk(&self) -> Gvk {
        match self {
            Resource::Pod(_) => Gvk::pod(),
            Resource::Service(_) => Gvk::service(),
            Resource::ConfigMap(_) => Gvk::configmap(),
            Resource::Secret(_) => Gvk::secret(),
            Resource::Node(_) => Gvk::node(),
            Resource::Deployment(_) => Gvk::deployment(),
            Resource::StatefulSet(_) => Gvk::statefulset(),
            Resource::DaemonSet(_) => Gvk::daemonset(),
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Resource::Pod(r) => &r.metadata,
            Resource::Service(r) => &r.metadata,
            Resource::ConfigMap(r) => &r.metadata,
            Resource::Secret(r) => &r.metadata,
            Resource::Node(r) => &r.metadata,
            Resource::Deployment(r) => &r.metadata,
            Resource::StatefulSet(r) => &r.metadata,
            Resource::DaemonSet(r) => &r.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Resource::Pod(r) => &mut r.metadata,
            Resource::Service(r) => &mut r.metadata,
            Resource::ConfigMap(r) => &mut r.metadata,
            Resource::Secret(r) => &mut r.metadata,
            Resource::Node(r) => &mut r.metadata,
            Resource::Deployment(r) => &mut r.metadata,
            Resource::StatefulSet(r) => &mut r.metadata,
            Resource::DaemonSet(r) => &mut r.metadata,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata().namespace
    }

    pub fn as_pod(&self) -> Option<&Pod> {
        match self {
            Resource::Pod(pod) => Some(pod),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Resource::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_deployment(&self) -> Option<&Deployment> {
        match self {
            Resource::Deployment(deployment) => Some(deployment),
            _ => None,
        }
    }
}

impl From<Pod> for Resource {
    fn from(pod: Pod) -> Self {
        Resource::Pod(pod)
    }
}

impl From<Node> for Resource {
    fn from(node: Node) -> Self {
        Resource::Node(node)
    }
}

impl From<Deployment> for Resource {
    fn from(deployment: Deployment) -> Self {
        Resource::Deployment(deployment)
    }
}
