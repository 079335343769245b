//! Node heartbeat: upserts this process's Node resource on an interval
//! so the scheduler always sees a live, ready node.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::resources::{
    meta::set_condition, Condition, ConditionStatus, Gvk, Node, NodeAddress, Resource,
    CONDITION_READY,
};
use crate::store::{SharedStore, Store, StoreError};

/// Seconds between heartbeats.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

pub struct NodeHeartbeat {
    store: SharedStore,
    node_name: String,
    interval: Duration,
}

impl NodeHeartbeat {
    pub fn new(store: SharedStore, node_name: String) -> Self {
        Self {
            store,
            node_name,
            interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "starting node heartbeat for {} every {:?}",
            self.node_name, self.interval
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match announce_node(self.store.as_ref(), &self.node_name).await {
                        Ok(_) => debug!("node heartbeat sent for {}", self.node_name),
                        Err(e) => error!("node heartbeat failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("node heartbeat stopped");
    }
}

/// Create or refresh this process's Node. Existing conditions are carried
/// forward so `LastTransitionTime` only moves when readiness flips; the
/// heartbeat time always advances.
pub async fn announce_node(store: &dyn Store, node_name: &str) -> Result<(), StoreError> {
    let mut node = match store.get(&Gvk::node(), "", node_name).await {
        Ok(Resource::Node(existing)) => existing,
        Ok(_) | Err(StoreError::NotFound { .. }) => fresh_node(node_name),
        Err(e) => return Err(e),
    };

    set_condition(
        &mut node.status.conditions,
        Condition::new(CONDITION_READY, ConditionStatus::True)
            .with_reason("KubeletReady", "kubelet is posting ready status"),
    );

    // Node create is an upsert, so one call covers both paths.
    store.create(&Gvk::node(), Resource::Node(node)).await?;
    Ok(())
}

fn fresh_node(node_name: &str) -> Node {
    let mut node = Node::new(node_name);
    node.metadata.labels.insert(
        "kubernetes.io/hostname".to_string(),
        node_name.to_string(),
    );
    node.status.addresses = vec![NodeAddress {
        address_type: "Hostname".to_string(),
        address: node_name.to_string(),
    }];
    node
}
