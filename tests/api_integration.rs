//! End-to-end tests for the REST gateway over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use kubelite::resources::Gvk;
use kubelite::server::{create_router, AppState};
use kubelite::store::{MemoryStore, SharedStore};

fn test_setup() -> (SharedStore, Router) {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let app = create_router(AppState::new(store.clone()), false);
    (store, app)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn sample_pod(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name},
        "spec": {"containers": [{"name": "c", "image": "nginx"}]}
    })
}

#[tokio::test]
async fn test_create_then_get_pod() {
    let (_, app) = test_setup();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/namespaces/default/pods",
            sample_pod("p"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert!(!created["metadata"]["uid"].as_str().unwrap().is_empty());

    let response = app
        .oneshot(get_request("/api/v1/namespaces/default/pods/p"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;

    assert_eq!(fetched["metadata"]["name"], "p");
    assert_eq!(fetched["metadata"]["namespace"], "default");
    assert_eq!(fetched["metadata"]["uid"], created["metadata"]["uid"]);
    assert!(fetched["metadata"]["creationTimestamp"].is_string());
    assert!(fetched["metadata"]["resourceVersion"].is_string());
    assert_eq!(fetched["status"]["phase"], "Pending");
    assert_eq!(fetched["spec"]["containers"][0]["image"], "nginx");
}

#[tokio::test]
async fn test_gvk_mismatch_leaves_store_unchanged() {
    let (_, app) = test_setup();

    let body = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": "p"}
    });
    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/v1/namespaces/default/pods", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = body_json(response).await;
    assert_eq!(error["code"], 400);
    assert!(error["message"].as_str().unwrap().contains("GVK mismatch"));

    // Nothing was stored, under either kind.
    let response = app
        .clone()
        .oneshot(get_request("/api/v1/namespaces/default/pods/p"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = app
        .oneshot(get_request("/api/v1/namespaces/default/services/p"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicate_create_conflicts() {
    let (_, app) = test_setup();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/namespaces/default/pods",
            sample_pod("p"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/v1/namespaces/default/pods",
            sample_pod("p"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let error = body_json(response).await;
    assert_eq!(error["code"], 409);
}

#[tokio::test]
async fn test_put_with_stale_version_still_succeeds() {
    let (store, app) = test_setup();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/namespaces/default/pods",
            sample_pod("p"),
        ))
        .await
        .unwrap();
    let created = body_json(response).await;
    let first_version: u64 = created["metadata"]["resourceVersion"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    // One watcher, subscribed before the update.
    let mut watch = store.watch(&Gvk::pod(), "", "").await.unwrap();
    let _bookmark = watch.recv().await.unwrap();

    // Replacement body carries a long-stale resourceVersion.
    let mut replacement = sample_pod("p");
    replacement["metadata"]["resourceVersion"] = json!("1");
    replacement["spec"]["containers"][0]["image"] = json!("nginx:1.25");

    let response = app
        .oneshot(json_request(
            "PUT",
            "/api/v1/namespaces/default/pods/p",
            replacement,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let updated = body_json(response).await;
    let new_version: u64 = updated["metadata"]["resourceVersion"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(new_version > first_version);
    assert_eq!(updated["spec"]["containers"][0]["image"], "nginx:1.25");

    // Exactly one Modified for the watcher.
    let event = watch.recv().await.unwrap();
    assert_eq!(event.event_type, kubelite::store::EventType::Modified);
    assert!(watch.try_recv().is_none());
}

#[tokio::test]
async fn test_merge_patch_semantics() {
    let (_, app) = test_setup();

    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "d", "labels": {"team": "core", "phase": "beta"}},
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
        .oneshot(json_request(
            "POST",
            "/apis/apps/v1/namespaces/default/deployments",
            deployment,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Scale down and delete a label in one merge patch.
    let patch = json!({
        "spec": {"replicas": 1},
        "metadata": {"labels": {"phase": null}}
    });
    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            "/apis/apps/v1/namespaces/default/deployments/d",
            patch,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let patched = body_json(response).await;
    assert_eq!(patched["spec"]["replicas"], 1);
    assert_eq!(patched["metadata"]["labels"]["team"], "core");
    assert!(patched["metadata"]["labels"].get("phase").is_none());
    // Untouched nested fields survive the merge.
    assert_eq!(patched["spec"]["selector"]["matchLabels"]["app"], "x");
}

#[tokio::test]
async fn test_delete_returns_object_then_not_found() {
    let (_, app) = test_setup();

    app.clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/namespaces/default/pods",
            sample_pod("p"),
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/namespaces/default/pods/p")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let deleted = body_json(response).await;
    assert_eq!(deleted["metadata"]["name"], "p");

    let response = app
        .oneshot(get_request("/api/v1/namespaces/default/pods/p"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cluster_scoped_namespace_ignored() {
    let (_, app) = test_setup();

    // Body smuggles a namespace in; it must be ignored, not rejected.
    let node = json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": {"name": "n1", "namespace": "ignored"}
    });
    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/v1/nodes", node))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app.oneshot(get_request("/api/v1/nodes/n1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert!(fetched["metadata"].get("namespace").is_none());
}

#[tokio::test]
async fn test_namespaced_create_without_namespace() {
    let (_, app) = test_setup();

    // Collection URL without a namespace segment: stored under "".
    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/v1/pods", sample_pod("bare")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .oneshot(get_request("/api/v1/pods/bare"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_list_envelope_and_yaml_body() {
    let (_, app) = test_setup();

    // YAML request body is accepted.
    let yaml = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: conf\n  namespace: default\ndata:\n  KEY: value\n";
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/namespaces/default/configmaps")
                .header("content-type", "application/yaml")
                .body(Body::from(yaml))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .oneshot(get_request("/api/v1/namespaces/default/configmaps"))
        .await
        .unwrap();
    let list = body_json(response).await;
    assert_eq!(list["kind"], "List");
    assert_eq!(list["apiVersion"], "v1");
    let items = list["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["data"]["KEY"], "value");
}

#[tokio::test]
async fn test_watch_stream_bookmark_added_deleted() {
    let (store, app) = test_setup();

    let request = get_request("/api/v1/watch/pods?timeoutSeconds=1");
    let response_task = tokio::spawn(async move { app.oneshot(request).await });

    // Give the stream time to subscribe before mutating.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (resource, _) = kubelite::codec::decode_yaml_or_json(
        sample_pod("q").to_string().as_bytes(),
    )
    .unwrap();
    let mut resource = resource;
    resource.metadata_mut().namespace = "default".to_string();
    store.create(&Gvk::pod(), resource).await.unwrap();
    store.delete(&Gvk::pod(), "default", "q").await.unwrap();

    let response = response_task.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));
    assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");
    assert_eq!(response.headers().get("cache-control").unwrap(), "no-cache");

    // Stream closes at the 1s timeout; collect and parse the frames.
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&body);
    let frames: Vec<Value> = text
        .split("\n\n")
        .filter_map(|chunk| chunk.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();

    assert_eq!(frames.len(), 3, "expected bookmark+added+deleted: {}", text);
    assert_eq!(frames[0]["type"], "BOOKMARK");
    assert!(frames[0]["object"]["metadata"]["resourceVersion"].is_string());
    assert_eq!(frames[1]["type"], "ADDED");
    assert_eq!(frames[1]["object"]["metadata"]["name"], "q");
    assert_eq!(frames[2]["type"], "DELETED");
    assert_eq!(
        frames[2]["object"]["metadata"]["resourceVersion"],
        frames[1]["object"]["metadata"]["resourceVersion"]
    );
}
