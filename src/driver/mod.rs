//! Container drivers: the boundary between the runtime controller and
//! the host's container engine.
//!
//! A driver maps a pod's first container spec onto one host container
//! named `k8s_<namespace>_<pod>_<container>`. Detection tries engines in
//! priority order Docker → Podman → Containerd → CRI-O and returns the
//! first one that answers; the runtime controller is simply not started
//! when none does.

pub mod cli;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::resources::Pod;

pub use cli::{CliDriver, ProbeDriver};

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("no container runtime available")]
    NoneAvailable,

    #[error("{driver} driver does not support {operation}")]
    Unsupported {
        driver: &'static str,
        operation: &'static str,
    },

    #[error("pod {0} has no container definitions")]
    NoContainers(String),

    #[error("pod {0} does not specify a container image")]
    MissingImage(String),

    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("failed to run `{command}`: {source}")]
    Io {
        command: String,
        source: std::io::Error,
    },
}

/// Observed state of a pod's container.
#[derive(Debug, Clone, Default)]
pub struct DriverStatus {
    pub running: bool,
    pub status: String,
    pub message: String,
}

/// One instance serves all reconciles concurrently; implementations that
/// need to serialize do so internally.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn is_available(&self) -> bool;

    /// Create and start the pod's container.
    async fn start_container(&self, pod: &Pod) -> Result<(), DriverError>;

    /// Stop and remove the pod's container.
    async fn stop_container(&self, pod: &Pod) -> Result<(), DriverError>;

    async fn container_status(&self, pod: &Pod) -> Result<DriverStatus, DriverError>;
}

pub type SharedDriver = Arc<dyn ContainerDriver>;

/// Host container name for a pod's first container.
pub fn container_name(pod: &Pod) -> Result<String, DriverError> {
    let container = pod
        .spec
        .containers
        .first()
        .ok_or_else(|| DriverError::NoContainers(pod.metadata.name.clone()))?;
    Ok(format!(
        "k8s_{}_{}_{}",
        pod.metadata.namespace, pod.metadata.name, container.name
    ))
}

/// Probe engines in priority order and return the first available one.
pub async fn detect_driver() -> Result<SharedDriver, DriverError> {
    let candidates: Vec<SharedDriver> = vec![
        Arc::new(CliDriver::docker()),
        Arc::new(CliDriver::podman()),
        Arc::new(ProbeDriver::containerd()),
        Arc::new(ProbeDriver::crio()),
    ];

    for driver in candidates {
        if driver.is_available().await {
            info!("detected container runtime: {}", driver.name());
            return Ok(driver);
        }
        debug!("container runtime {} not available", driver.name());
    }

    Err(DriverError::NoneAvailable)
}
