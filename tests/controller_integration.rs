//! Controller fabric scenarios against the in-memory store, with a
//! scripted container driver standing in for the host engine.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tokio::sync::watch;
use tower::ServiceExt;

use kubelite::controller::{
    announce_node, DeploymentController, PodStatusController, RuntimeController,
    SchedulerController,
};
use kubelite::driver::{ContainerDriver, DriverError, DriverStatus, SharedDriver};
use kubelite::resources::meta::{find_condition, CONDITION_POD_SCHEDULED, CONDITION_READY};
use kubelite::resources::{ConditionStatus, Gvk, Pod, PodPhase, Resource};
use kubelite::server::{create_router, AppState};
use kubelite::store::{MemoryStore, SharedStore};

/// Driver that records starts/stops and reports containers it has
/// started as running.
struct ScriptedDriver {
    started: Mutex<HashSet<String>>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl ScriptedDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Mutex::new(HashSet::new()),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        })
    }

    fn key(pod: &Pod) -> String {
        format!("{}/{}", pod.metadata.namespace, pod.metadata.name)
    }
}

#[async_trait]
impl ContainerDriver for ScriptedDriver {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn start_container(&self, pod: &Pod) -> Result<(), DriverError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().insert(Self::key(pod));
        Ok(())
    }

    async fn stop_container(&self, pod: &Pod) -> Result<(), DriverError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().remove(&Self::key(pod));
        Ok(())
    }

    async fn container_status(&self, pod: &Pod) -> Result<DriverStatus, DriverError> {
        let running = self.started.lock().unwrap().contains(&Self::key(pod));
        Ok(DriverStatus {
            running,
            status: if running { "Up".to_string() } else { String::new() },
            message: String::new(),
        })
    }
}

/// Spawn the whole fabric on one node; returns the shutdown sender.
async fn start_fabric(
    store: SharedStore,
    driver: SharedDriver,
    node_name: &str,
) -> watch::Sender<bool> {
    announce_node(store.as_ref(), node_name).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(PodStatusController::new(store.clone()).run(shutdown_rx.clone()));
    tokio::spawn(DeploymentController::new(store.clone()).run(shutdown_rx.clone()));
    tokio::spawn(SchedulerController::new(store.clone()).run(shutdown_rx.clone()));
    tokio::spawn(
        RuntimeController::new(store.clone(), driver, node_name.to_string()).run(shutdown_rx),
    );

    // Let the loops subscribe and run their full syncs.
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx
}

/// Poll until `check` holds or five seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..50 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

async fn pods_with_label(store: &SharedStore, key: &str, value: &str) -> Vec<Pod> {
    store
        .list(&Gvk::pod(), "default")
        .await
        .unwrap()
        .into_iter()
        .filter_map(|resource| match resource {
            Resource::Pod(pod) => Some(pod),
            _ => None,
        })
        .filter(|pod| pod.metadata.labels.get(key).map(String::as_str) == Some(value))
        .collect()
}

#[tokio::test]
async fn test_deployment_expands_and_contracts() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let driver = ScriptedDriver::new();
    let shutdown = start_fabric(store.clone(), driver.clone(), "n1").await;
    let app = create_router(AppState::new(store.clone()), false);

    // POST a deployment with three replicas through the gateway.
    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "d"},
        "spec": {
            "replicas": 3,
            "selector": {"matchLabels": {"app": "x"}},
            "template": {
                "metadata": {"labels": {"app": "x"}},
                "spec": {"containers": [{"name": "c", "image": "nginx"}]}
            }
        }
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/apis/apps/v1/namespaces/default/deployments")
                .header("content-type", "application/json")
                .body(Body::from(deployment.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let reached_three = eventually(|| {
        let store = store.clone();
        async move { pods_with_label(&store, "app", "x").await.len() == 3 }
    })
    .await;
    assert!(reached_three, "deployment never reached 3 pods");

    // Generated pods carry the controller owner reference.
    for pod in pods_with_label(&store, "app", "x").await {
        let owner = &pod.metadata.owner_references[0];
        assert_eq!(owner.kind, "Deployment");
        assert_eq!(owner.name, "d");
        assert_eq!(owner.controller, Some(true));
        assert!(pod.metadata.name.starts_with("d-"));
    }

    // PATCH replicas down to one; two pods must go away.
    let response = app
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri("/apis/apps/v1/namespaces/default/deployments/d")
                .header("content-type", "application/json")
                .body(Body::from(json!({"spec": {"replicas": 1}}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let reached_one = eventually(|| {
        let store = store.clone();
        async move { pods_with_label(&store, "app", "x").await.len() == 1 }
    })
    .await;
    assert!(reached_one, "deployment never contracted to 1 pod");

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_pending_pod_gets_scheduled_and_started() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let driver = ScriptedDriver::new();
    let shutdown = start_fabric(store.clone(), driver.clone(), "n1").await;

    let mut pod = Pod::new("solo", "default");
    pod.spec.containers.push(kubelite::resources::Container {
        name: "c".to_string(),
        image: "nginx".to_string(),
        ..Default::default()
    });
    store.create(&Gvk::pod(), Resource::Pod(pod)).await.unwrap();

    // The fixed point: assigned, running, ready, with the condition
    // triad in place.
    let settled = eventually(|| {
        let store = store.clone();
        async move {
            let Ok(resource) = store.get(&Gvk::pod(), "default", "solo").await else {
                return false;
            };
            let pod = resource.as_pod().unwrap();
            let scheduled = find_condition(&pod.status.conditions, CONDITION_POD_SCHEDULED)
                .map(|c| c.status == ConditionStatus::True && c.reason == "Scheduled")
                .unwrap_or(false);
            let ready = find_condition(&pod.status.conditions, CONDITION_READY)
                .map(|c| c.status == ConditionStatus::True)
                .unwrap_or(false);
            pod.spec.node_name == "n1"
                && pod.status.phase == PodPhase::Running
                && scheduled
                && ready
                && !pod.status.container_statuses.is_empty()
                && pod.status.container_statuses.iter().all(|s| s.ready)
        }
    })
    .await;
    assert!(settled, "pod never settled at scheduled+running+ready");

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_runtime_starts_assigned_pod_exactly_once() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let driver = ScriptedDriver::new();
    let shutdown = start_fabric(store.clone(), driver.clone(), "n1").await;

    // Pre-assigned to this node: the scheduler has nothing to do.
    let mut pod = Pod::new("direct", "default");
    pod.spec.node_name = "n1".to_string();
    pod.spec.containers.push(kubelite::resources::Container {
        name: "c".to_string(),
        image: "nginx".to_string(),
        ..Default::default()
    });
    store.create(&Gvk::pod(), Resource::Pod(pod)).await.unwrap();

    let running = eventually(|| {
        let store = store.clone();
        async move {
            store
                .get(&Gvk::pod(), "default", "direct")
                .await
                .map(|r| r.as_pod().unwrap().status.phase == PodPhase::Running)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(running, "pod never reached Running");

    // Settle, then check the driver saw exactly one start.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(driver.start_calls.load(Ordering::SeqCst), 1);

    // Deleting the pod stops its container.
    store.delete(&Gvk::pod(), "default", "direct").await.unwrap();
    let stopped = eventually(|| {
        let driver = driver.clone();
        async move { driver.stop_calls.load(Ordering::SeqCst) == 1 }
    })
    .await;
    assert!(stopped, "container was never stopped");

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_pod_waits_when_no_node_is_ready() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // Scheduler only, and no node announced at all.
    tokio::spawn(SchedulerController::new(store.clone()).run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let pod = Pod::new("parked", "default");
    store.create(&Gvk::pod(), Resource::Pod(pod)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let resource = store.get(&Gvk::pod(), "default", "parked").await.unwrap();
    assert!(resource.as_pod().unwrap().spec.node_name.is_empty());

    // A node coming up unblocks it.
    announce_node(store.as_ref(), "n9").await.unwrap();
    let assigned = eventually(|| {
        let store = store.clone();
        async move {
            store
                .get(&Gvk::pod(), "default", "parked")
                .await
                .map(|r| r.as_pod().unwrap().spec.node_name == "n9")
                .unwrap_or(false)
        }
    })
    .await;
    assert!(assigned, "pod was never scheduled after the node came up");

    let _ = shutdown_tx.send(true);
}
