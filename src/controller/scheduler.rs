//! Scheduler: assigns pending, unassigned pods to the first ready node.
//!
//! Node choice is stable: ready nodes sorted by name, first one wins.
//! When no node is ready the pod is left alone; a later node event
//! re-triggers every pending pod.

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::resources::{
    meta::set_condition, Condition, ConditionStatus, Gvk, Node, Pod, PodPhase, Resource,
    CONDITION_POD_SCHEDULED,
};
use crate::store::{EventType, ResourceEvent, SharedStore, StoreError};

pub struct SchedulerController {
    store: SharedStore,
}

impl SchedulerController {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("starting scheduler");

        let mut pod_events = match self.store.watch(&Gvk::pod(), "", "").await {
            Ok(handle) => handle,
            Err(e) => {
                error!("scheduler cannot watch pods: {}", e);
                return;
            }
        };
        let mut node_events = match self.store.watch(&Gvk::node(), "", "").await {
            Ok(handle) => handle,
            Err(e) => {
                error!("scheduler cannot watch nodes: {}", e);
                return;
            }
        };

        self.sync_pending().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                event = pod_events.recv() => {
                    let Some(event) = event else {
                        warn!("pod watch channel closed");
                        break;
                    };
                    self.handle_pod_event(event).await;
                }
                event = node_events.recv() => {
                    let Some(event) = event else {
                        warn!("node watch channel closed");
                        break;
                    };
                    // A node turning ready may unblock parked pods.
                    let became_ready = matches!(
                        event.event_type,
                        EventType::Added | EventType::Modified
                    ) && event
                        .object
                        .as_ref()
                        .and_then(Resource::as_node)
                        .map(Node::is_ready)
                        .unwrap_or(false);
                    if became_ready {
                        self.sync_pending().await;
                    }
                }
            }
        }

        info!("scheduler stopped");
    }

    async fn handle_pod_event(&self, event: ResourceEvent) {
        if !matches!(event.event_type, EventType::Added | EventType::Modified) {
            return;
        }
        let Some(Resource::Pod(pod)) = event.object else {
            return;
        };
        if !needs_scheduling(&pod) {
            return;
        }
        if let Err(e) = self.schedule(pod).await {
            error!("scheduling failed: {}", e);
        }
    }

    /// Full pass over pods awaiting assignment.
    async fn sync_pending(&self) {
        let pods = match self.store.list(&Gvk::pod(), "").await {
            Ok(items) => items,
            Err(e) => {
                error!("failed to list pods for scheduling sync: {}", e);
                return;
            }
        };
        for resource in pods {
            if let Resource::Pod(pod) = resource {
                if needs_scheduling(&pod) {
                    if let Err(e) = self.schedule(pod).await {
                        error!("scheduling failed: {}", e);
                    }
                }
            }
        }
    }

    async fn schedule(&self, mut pod: Pod) -> Result<(), StoreError> {
        let nodes = self.store.list(&Gvk::node(), "").await?;
        let mut ready: Vec<Node> = nodes
            .into_iter()
            .filter_map(|resource| match resource {
                Resource::Node(node) => Some(node),
                _ => None,
            })
            .filter(Node::is_ready)
            .collect();

        if ready.is_empty() {
            debug!(
                "no ready node for pod {}/{}, leaving it pending",
                pod.metadata.namespace, pod.metadata.name
            );
            return Ok(());
        }
        ready.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        let node_name = ready[0].metadata.name.clone();

        info!(
            "assigning pod {}/{} to node {}",
            pod.metadata.namespace, pod.metadata.name, node_name
        );
        pod.spec.node_name = node_name.clone();
        let message = format!(
            "Successfully assigned {}/{} to {}",
            pod.metadata.namespace, pod.metadata.name, node_name
        );
        set_condition(
            &mut pod.status.conditions,
            Condition::new(CONDITION_POD_SCHEDULED, ConditionStatus::True)
                .with_reason("Scheduled", message),
        );

        self.store.update(&Gvk::pod(), Resource::Pod(pod)).await?;
        Ok(())
    }
}

fn needs_scheduling(pod: &Pod) -> bool {
    pod.spec.node_name.is_empty() && pod.status.phase == PodPhase::Pending
}
