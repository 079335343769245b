//! Runtime controller: drives the container engine for pods assigned to
//! this node.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::driver::{DriverStatus, SharedDriver};
use crate::resources::{
    meta::set_condition, Condition, ConditionStatus, ContainerState, ContainerStatus, Gvk, Pod,
    PodPhase, Resource, CONDITION_READY,
};
use crate::store::{EventType, ResourceEvent, SharedStore, StoreError};

/// Budget for creating and starting a container.
const START_TIMEOUT: Duration = Duration::from_secs(120);

/// Budget for stopping and removing a container.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RuntimeController {
    store: SharedStore,
    driver: SharedDriver,
    node_name: String,
}

impl RuntimeController {
    pub fn new(store: SharedStore, driver: SharedDriver, node_name: String) -> Self {
        Self {
            store,
            driver,
            node_name,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "starting runtime controller on node {} with driver {}",
            self.node_name,
            self.driver.name()
        );

        let mut events = match self.store.watch(&Gvk::pod(), "", "").await {
            Ok(handle) => handle,
            Err(e) => {
                error!("runtime controller cannot watch pods: {}", e);
                return;
            }
        };

        self.sync_all().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("pod watch channel closed");
                        break;
                    };
                    self.handle_event(event).await;
                }
            }
        }

        info!("runtime controller stopped");
    }

    fn on_this_node(&self, pod: &Pod) -> bool {
        pod.spec.node_name == self.node_name
    }

    async fn sync_all(&self) {
        let pods = match self.store.list(&Gvk::pod(), "").await {
            Ok(items) => items,
            Err(e) => {
                error!("failed to list pods for runtime sync: {}", e);
                return;
            }
        };
        for resource in pods {
            if let Resource::Pod(pod) = resource {
                if self.on_this_node(&pod) && pod.status.phase != PodPhase::Running {
                    if let Err(e) = self.ensure_running(pod).await {
                        error!("failed to start pod container: {}", e);
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: ResourceEvent) {
        match event.event_type {
            EventType::Added | EventType::Modified => {
                let Some(Resource::Pod(pod)) = event.object else {
                    return;
                };
                if self.on_this_node(&pod) && pod.status.phase != PodPhase::Running {
                    if let Err(e) = self.ensure_running(pod).await {
                        error!("failed to start pod container: {}", e);
                    }
                }
            }
            EventType::Deleted => {
                let Some(Resource::Pod(pod)) = event.object else {
                    return;
                };
                if !self.on_this_node(&pod) {
                    return;
                }
                info!(
                    "pod {}/{} deleted, stopping its container",
                    pod.metadata.namespace, pod.metadata.name
                );
                match tokio::time::timeout(STOP_TIMEOUT, self.driver.stop_container(&pod)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("failed to stop container: {}", e),
                    Err(_) => error!(
                        "stopping container for {}/{} timed out after {:?}",
                        pod.metadata.namespace, pod.metadata.name, STOP_TIMEOUT
                    ),
                }
            }
            EventType::Bookmark => {}
        }
    }

    /// Start the pod's container when the engine does not report it
    /// running, then publish the Running status.
    async fn ensure_running(&self, mut pod: Pod) -> Result<(), StoreError> {
        let status = match self.driver.container_status(&pod).await {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    "could not read container status for {}/{}: {}",
                    pod.metadata.namespace, pod.metadata.name, e
                );
                DriverStatus::default()
            }
        };

        if status.running {
            debug!(
                "container for {}/{} already running",
                pod.metadata.namespace, pod.metadata.name
            );
            return Ok(());
        }

        info!(
            "starting container for pod {}/{}",
            pod.metadata.namespace, pod.metadata.name
        );
        match tokio::time::timeout(START_TIMEOUT, self.driver.start_container(&pod)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    "container start for {}/{} failed: {}",
                    pod.metadata.namespace, pod.metadata.name, e
                );
                return Ok(());
            }
            Err(_) => {
                error!(
                    "container start for {}/{} timed out after {:?}",
                    pod.metadata.namespace, pod.metadata.name, START_TIMEOUT
                );
                return Ok(());
            }
        }

        pod.status.phase = PodPhase::Running;
        pod.status.container_statuses = pod
            .spec
            .containers
            .iter()
            .map(|container| ContainerStatus {
                name: container.name.clone(),
                state: ContainerState::running(),
                ready: true,
            })
            .collect();
        set_condition(
            &mut pod.status.conditions,
            Condition::new(CONDITION_READY, ConditionStatus::True)
                .with_reason("ContainersReady", "All containers are ready"),
        );

        let namespace = pod.metadata.namespace.clone();
        let name = pod.metadata.name.clone();
        self.store.update(&Gvk::pod(), Resource::Pod(pod)).await?;
        info!("pod {}/{} is running", namespace, name);
        Ok(())
    }
}
