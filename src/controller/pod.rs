//! Pod status controller: keeps the standard condition triad and the
//! derived phase in step with observed container state.
//!
//! Writes are suppressed when nothing would change; otherwise the
//! controller's own Modified events would re-trigger it forever.

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::resources::{
    meta::set_condition, Condition, ConditionStatus, ContainerState, ContainerStatus, Gvk, Pod,
    PodPhase, Resource, CONDITION_INITIALIZED, CONDITION_POD_SCHEDULED, CONDITION_READY,
};
use crate::store::{EventType, ResourceEvent, SharedStore, StoreError};

pub struct PodStatusController {
    store: SharedStore,
}

impl PodStatusController {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("starting pod status controller");

        let mut events = match self.store.watch(&Gvk::pod(), "", "").await {
            Ok(handle) => handle,
            Err(e) => {
                error!("pod status controller cannot watch: {}", e);
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

        info!("pod status controller stopped");
    }

    async fn sync_all(&self) {
        let pods = match self.store.list(&Gvk::pod(), "").await {
            Ok(items) => items,
            Err(e) => {
                error!("failed to list pods for status sync: {}", e);
                return;
            }
        };
        for resource in pods {
            if let Resource::Pod(pod) = resource {
                if let Err(e) = self.reconcile(pod).await {
                    error!("pod status sync failed: {}", e);
                }
            }
        }
    }

    async fn handle_event(&self, event: ResourceEvent) {
        match event.event_type {
            EventType::Added => {
                if let Some(Resource::Pod(pod)) = event.object {
                    if let Err(e) = self.initialize(pod).await {
                        error!("pod initialization failed: {}", e);
                    }
                }
            }
            EventType::Modified => {
                if let Some(Resource::Pod(pod)) = event.object {
                    if let Err(e) = self.reconcile(pod).await {
                        error!("pod status reconcile failed: {}", e);
                    }
                }
            }
            EventType::Deleted | EventType::Bookmark => {}
        }
    }

    /// Seed a freshly created pod: the full condition triad (all False)
    /// and a waiting status per declared container.
    async fn initialize(&self, mut pod: Pod) -> Result<(), StoreError> {
        let mut changed = false;

        if pod.status.conditions.is_empty() {
            set_condition(
                &mut pod.status.conditions,
                Condition::new(CONDITION_POD_SCHEDULED, ConditionStatus::False)
                    .with_reason("Unscheduled", "Pod is waiting to be scheduled"),
            );
            set_condition(
                &mut pod.status.conditions,
                Condition::new(CONDITION_INITIALIZED, ConditionStatus::False)
                    .with_reason("NotInitialized", "Pod is being initialized"),
            );
            set_condition(
                &mut pod.status.conditions,
                Condition::new(CONDITION_READY, ConditionStatus::False)
                    .with_reason("NotReady", "Pod is not ready"),
            );
            changed = true;
        }

        if pod.status.container_statuses.is_empty() && !pod.spec.containers.is_empty() {
            pod.status.container_statuses = pod
                .spec
                .containers
                .iter()
                .map(|container| ContainerStatus {
                    name: container.name.clone(),
                    state: ContainerState::waiting("ContainerCreating"),
                    ready: false,
                })
                .collect();
            changed = true;
        }

        if changed {
            debug!(
                "initialized pod {}/{}",
                pod.metadata.namespace, pod.metadata.name
            );
            self.store.update(&Gvk::pod(), Resource::Pod(pod)).await?;
        }
        Ok(())
    }

    /// Recompute conditions and phase; write back only when something
    /// observable changed.
    async fn reconcile(&self, mut pod: Pod) -> Result<(), StoreError> {
        let before = status_fingerprint(&pod);

        update_conditions(&mut pod);
        pod.status.phase = derive_phase(&pod);

        if status_fingerprint(&pod) == before {
            return Ok(());
        }

        debug!(
            "pod {}/{} status moved to {:?}",
            pod.metadata.namespace, pod.metadata.name, pod.status.phase
        );
        self.store.update(&Gvk::pod(), Resource::Pod(pod)).await?;
        Ok(())
    }
}

/// The parts of status whose change justifies a write: phase plus the
/// status of each condition. Heartbeat times alone never trigger one.
fn status_fingerprint(pod: &Pod) -> (PodPhase, Vec<(String, ConditionStatus)>) {
    let mut conditions: Vec<(String, ConditionStatus)> = pod
        .status
        .conditions
        .iter()
        .map(|c| (c.condition_type.clone(), c.status))
        .collect();
    conditions.sort_by(|a, b| a.0.cmp(&b.0));
    (pod.status.phase, conditions)
}

/// Maintain the triad. `LastTransitionTime` is preserved by
/// `set_condition` unless the status actually flips.
fn update_conditions(pod: &mut Pod) {
    let assigned = !pod.spec.node_name.is_empty();

    if assigned {
        let message = format!(
            "Successfully assigned {}/{} to {}",
            pod.metadata.namespace, pod.metadata.name, pod.spec.node_name
        );
        set_condition(
            &mut pod.status.conditions,
            Condition::new(CONDITION_POD_SCHEDULED, ConditionStatus::True)
                .with_reason("Scheduled", message),
        );
        // No init containers in this core: initialized rides on
        // assignment.
        set_condition(
            &mut pod.status.conditions,
            Condition::new(CONDITION_INITIALIZED, ConditionStatus::True)
                .with_reason("Initialized", "Pod has been initialized"),
        );
    }

    let all_ready = !pod.status.container_statuses.is_empty()
        && pod.status.container_statuses.iter().all(|s| s.ready);
    let ready = all_ready && pod.status.phase == PodPhase::Running;
    let condition = if ready {
        Condition::new(CONDITION_READY, ConditionStatus::True)
            .with_reason("ContainersReady", "All containers are ready")
    } else {
        Condition::new(CONDITION_READY, ConditionStatus::False)
            .with_reason("ContainersNotReady", "Not all containers are ready")
    };
    set_condition(&mut pod.status.conditions, condition);
}

/// Phase from aggregated container states.
fn derive_phase(pod: &Pod) -> PodPhase {
    let statuses = &pod.status.container_statuses;
    if statuses.is_empty() {
        return PodPhase::Pending;
    }

    let mut any_running = false;
    let mut any_waiting = false;
    let mut all_terminated = true;
    for status in statuses {
        if status.state.running.is_some() {
            any_running = true;
            all_terminated = false;
        } else if status.state.waiting.is_some() {
            any_waiting = true;
            all_terminated = false;
        } else if status.state.terminated.is_none() {
            all_terminated = false;
        }
    }

    if all_terminated {
        let all_zero = statuses.iter().all(|s| {
            s.state
                .terminated
                .as_ref()
                .map(|t| t.exit_code == 0)
                .unwrap_or(false)
        });
        if all_zero {
            PodPhase::Succeeded
        } else {
            PodPhase::Failed
        }
    } else if any_running {
        PodPhase::Running
    } else if any_waiting {
        PodPhase::Pending
    } else {
        PodPhase::Pending
    }
}
