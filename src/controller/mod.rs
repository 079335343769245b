//! Controller fabric: independent reconciliation loops driven by store
//! watch streams.
//!
//! Every controller follows the same contract: subscribe to its Kind
//! first, then list and reconcile everything as a full sync, then react
//! to events. Reconciliation errors are logged and the loop continues;
//! the next event for the same key is the retry. Controllers never share
//! mutable state; all coordination happens through the store.

pub mod deployment;
pub mod heartbeat;
pub mod pod;
pub mod runtime;
pub mod scheduler;

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::driver;
use crate::store::SharedStore;

pub use deployment::DeploymentController;
pub use heartbeat::{announce_node, NodeHeartbeat};
pub use pod::PodStatusController;
pub use runtime::RuntimeController;
pub use scheduler::SchedulerController;

/// Running controller set plus its shutdown signal.
pub struct ControllerManager {
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl ControllerManager {
    /// Announce the local node, then spawn every controller.
    ///
    /// The runtime controller needs a container engine; when detection
    /// fails it is skipped and the rest of the fabric runs without it.
    pub async fn start(store: SharedStore, node_name: String) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        // The node must exist before the scheduler looks for ready nodes.
        if let Err(e) = announce_node(store.as_ref(), &node_name).await {
            warn!("initial node announce failed: {}", e);
        }

        let controller = PodStatusController::new(store.clone());
        tasks.spawn(controller.run(shutdown_rx.clone()));

        let controller = DeploymentController::new(store.clone());
        tasks.spawn(controller.run(shutdown_rx.clone()));

        let controller = SchedulerController::new(store.clone());
        tasks.spawn(controller.run(shutdown_rx.clone()));

        match driver::detect_driver().await {
            Ok(driver) => {
                let controller = RuntimeController::new(store.clone(), driver, node_name.clone());
                tasks.spawn(controller.run(shutdown_rx.clone()));
            }
            Err(e) => {
                warn!("runtime controller disabled: {}", e);
            }
        }

        let heartbeat = NodeHeartbeat::new(store, node_name);
        tasks.spawn(heartbeat.run(shutdown_rx));

        info!("controller manager started");
        Self { shutdown_tx, tasks }
    }

    /// Signal every loop and wait up to `budget` for them to drain.
    pub async fn shutdown(mut self, budget: Duration) {
        let _ = self.shutdown_tx.send(true);
        let drain = async {
            while self.tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(budget, drain).await.is_err() {
            warn!("controllers did not stop within {:?}, aborting", budget);
            self.tasks.abort_all();
        }
        info!("controller manager stopped");
    }
}
