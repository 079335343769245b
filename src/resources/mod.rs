//! Typed Kubernetes resource model
//!
//! A deliberately small, hand-rolled subset of the Kubernetes API types:
//! dragging in the full generated API surface would be enormous, and the
//! supported Kind set is closed per release. Every resource follows the
//! wire shape `{apiVersion, kind, metadata, spec?, status?}` and carries
//! the standard metadata facet the store stamps on create.
//!
//! ## Supported Kinds
//!
//! | Group | Kind        | Scope        |
//! |-------|-------------|--------------|
//! | core  | Pod         | namespaced   |
//! | core  | Service     | namespaced   |
//! | core  | ConfigMap   | namespaced   |
//! | core  | Secret      | namespaced   |
//! | core  | Node        | cluster      |
//! | apps  | Deployment  | namespaced   |
//! | apps  | StatefulSet | namespaced   |
//! | apps  | DaemonSet   | namespaced   |

pub mod config;
pub mod gvk;
pub mod meta;
pub mod node;
pub mod pod;
pub mod resource;
pub mod service;
pub mod workload;

pub use config::{ConfigMap, Secret};
pub use gvk::Gvk;
pub use meta::{
    Condition, ConditionStatus, LabelSelector, ObjectMeta, OwnerReference, CONDITION_INITIALIZED,
    CONDITION_POD_SCHEDULED, CONDITION_READY,
};
pub use node::{Node, NodeAddress, NodeSpec, NodeStatus};
pub use pod::{
    Container, ContainerPort, ContainerState, ContainerStateRunning, ContainerStateTerminated,
    ContainerStateWaiting, ContainerStatus, EnvVar, Pod, PodPhase, PodSpec, PodStatus,
};
pub use resource::Resource;
pub use service::{Service, ServicePort, ServiceSpec};
pub use workload::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec, DeploymentStatus,
    PodTemplateSpec, StatefulSet, StatefulSetSpec};
