//! REST handlers: translate Kubernetes-convention HTTP requests into
//! store operations.
//!
//! All resource traffic funnels through [`dispatch`]: the path is parsed
//! into a (GVK, namespace, name) reference, then the verb picks the store
//! call. Bodies are YAML or JSON. Errors come back as
//! `{ "code": N, "message": "..." }`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode, Uri};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream;
use serde_json::json;
use tracing::debug;

use super::path::{parse_path, ResourceRef};
use super::state::AppState;
use crate::codec::{self, CodecError};
use crate::resources::Resource;
use crate::store::{EventType, ResourceEvent, StoreError};

/// Watch streams close after this long unless `?timeoutSeconds=N` says
/// otherwise.
const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Error envelope returned by every failing endpoint.
#[derive(Debug)]
pub struct ApiError {
    pub code: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "code": self.code.as_u16(),
            "message": self.message,
        });
        (self.code, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let code = match &e {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists { .. } => StatusCode::CONFLICT,
            StoreError::Codec(_) => StatusCode::BAD_REQUEST,
            StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            code,
            message: e.to_string(),
        }
    }
}

impl From<CodecError> for ApiError {
    fn from(e: CodecError) -> Self {
        Self::bad_request(e.to_string())
    }
}

/// `GET /api/health` and `/api/healthz`.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"code": 200}))
}

/// Single entry point for every resource route. Selector and
/// field-selector query parameters are accepted but do not filter.
pub async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let reference = match parse_path(uri.path()) {
        Ok(reference) => reference,
        Err(message) => return ApiError::bad_request(message).into_response(),
    };

    if reference.watch {
        if method != Method::GET {
            return ApiError::bad_request("watch endpoints only serve GET").into_response();
        }
        return watch_stream(state, reference, params).await;
    }

    let collection = reference.is_collection();
    let result = if method == Method::GET && collection {
        list(state, &reference).await
    } else if method == Method::GET {
        get(state, &reference).await
    } else if method == Method::POST && collection {
        create(state, &reference, &body).await
    } else if method == Method::PUT && !collection {
        update(state, &reference, &body).await
    } else if method == Method::PATCH && !collection {
        patch(state, &reference, &body).await
    } else if method == Method::DELETE && !collection {
        delete(state, &reference).await
    } else {
        Err(ApiError::bad_request(format!(
            "{} is not supported on {}",
            method,
            uri.path()
        )))
    };

    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn get(state: AppState, reference: &ResourceRef) -> Result<Response, ApiError> {
    let resource = state
        .store
        .get(&reference.gvk, &reference.namespace, &reference.name)
        .await?;
    Ok(Json(resource).into_response())
}

async fn list(state: AppState, reference: &ResourceRef) -> Result<Response, ApiError> {
    let items = state
        .store
        .list(&reference.gvk, &reference.namespace)
        .await?;
    Ok(Json(json!({
        "kind": "List",
        "apiVersion": "v1",
        "items": items,
    }))
    .into_response())
}

async fn create(
    state: AppState,
    reference: &ResourceRef,
    body: &[u8],
) -> Result<Response, ApiError> {
    let resource = decode_for(reference, body)?;
    let created = state.store.create(&reference.gvk, resource).await?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn update(
    state: AppState,
    reference: &ResourceRef,
    body: &[u8],
) -> Result<Response, ApiError> {
    let resource = decode_for(reference, body)?;
    let updated = state.store.update(&reference.gvk, resource).await?;
    Ok(Json(updated).into_response())
}

async fn patch(state: AppState, reference: &ResourceRef, body: &[u8]) -> Result<Response, ApiError> {
    let patch_value = parse_patch_body(body)?;
    if !patch_value.is_object() {
        return Err(ApiError::bad_request("merge patch body must be a JSON object"));
    }

    let existing = state
        .store
        .get(&reference.gvk, &reference.namespace, &reference.name)
        .await?;
    let mut target = codec::to_value(&existing)?;
    merge_patch(&mut target, &patch_value);

    let (patched, gvk) = codec::decode_value(target)?;
    if gvk != reference.gvk {
        return Err(ApiError::bad_request(
            "merge patch must not change apiVersion or kind",
        ));
    }

    let updated = state.store.update(&reference.gvk, patched).await?;
    Ok(Json(updated).into_response())
}

async fn delete(state: AppState, reference: &ResourceRef) -> Result<Response, ApiError> {
    let deleted = state
        .store
        .delete(&reference.gvk, &reference.namespace, &reference.name)
        .await?;
    Ok(Json(deleted).into_response())
}

/// Decode a request body and check it against the URL: the GVK in the
/// body must match the one the path implies, and a namespace present in
/// the URL is injected when the body omits one.
fn decode_for(reference: &ResourceRef, body: &[u8]) -> Result<Resource, ApiError> {
    let (mut resource, body_gvk) = codec::decode_yaml_or_json(body)?;

    if body_gvk != reference.gvk {
        return Err(ApiError::bad_request(format!(
            "GVK mismatch: body declares {} but the URL addresses {}",
            body_gvk, reference.gvk
        )));
    }

    let meta = resource.metadata_mut();
    if meta.namespace.is_empty() && !reference.namespace.is_empty() {
        meta.namespace = reference.namespace.clone();
    }
    if meta.name.is_empty() && !reference.name.is_empty() {
        meta.name = reference.name.clone();
    }
    if meta.name.is_empty() {
        return Err(ApiError::bad_request("resource name is required"));
    }

    Ok(resource)
}

fn parse_patch_body(body: &[u8]) -> Result<serde_json::Value, ApiError> {
    if let Ok(value) = serde_json::from_slice(body) {
        return Ok(value);
    }
    let yaml: serde_yaml::Value = serde_yaml::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("failed to parse patch body: {}", e)))?;
    serde_json::to_value(yaml)
        .map_err(|e| ApiError::bad_request(format!("failed to parse patch body: {}", e)))
}

/// RFC 7386 merge patch: object keys merge recursively, explicit nulls
/// delete, anything else replaces.
pub fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match patch {
        serde_json::Value::Object(patch_map) => {
            if !target.is_object() {
                *target = serde_json::Value::Object(Default::default());
            }
            if let serde_json::Value::Object(target_map) = target {
                for (key, patch_value) in patch_map {
                    if patch_value.is_null() {
                        target_map.remove(key);
                    } else {
                        merge_patch(
                            target_map
                                .entry(key.clone())
                                .or_insert(serde_json::Value::Null),
                            patch_value,
                        );
                    }
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

/// Stream store events as Server-Sent Events: one Bookmark first, then
/// every event for the watched Kind, until timeout, disconnect, or store
/// shutdown.
async fn watch_stream(
    state: AppState,
    reference: ResourceRef,
    params: HashMap<String, String>,
) -> Response {
    let timeout = params
        .get("timeoutSeconds")
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_WATCH_TIMEOUT);
    let since = params.get("resourceVersion").cloned().unwrap_or_default();

    let handle = match state
        .store
        .watch(&reference.gvk, &reference.namespace, &since)
        .await
    {
        Ok(handle) => handle,
        Err(e) => return ApiError::from(e).into_response(),
    };

    debug!(
        "watch opened: {} namespace={:?} timeout={:?}",
        reference.gvk, reference.namespace, timeout
    );

    let deadline = tokio::time::Instant::now() + timeout;
    let events = stream::unfold(handle, move |mut handle| async move {
        let event = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => None,
            event = handle.recv() => event,
        }?;
        let frame = watch_frame(&event).to_string();
        Some((
            Ok::<SseEvent, Infallible>(SseEvent::default().data(frame)),
            handle,
        ))
    });

    let mut response = Sse::new(events).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    // Tell intermediate proxies not to buffer the stream.
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// One `data:` frame: `{"type": ..., "object": ...}`. Bookmarks carry a
/// stub object holding only the current resourceVersion.
pub fn watch_frame(event: &ResourceEvent) -> serde_json::Value {
    let object = if event.event_type == EventType::Bookmark {
        json!({"metadata": {"resourceVersion": event.resource_version}})
    } else {
        event
            .object
            .as_ref()
            .and_then(|resource| codec::to_value(resource).ok())
            .unwrap_or(serde_json::Value::Null)
    };
    json!({"type": event.event_type, "object": object})
}
