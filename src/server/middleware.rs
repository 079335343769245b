//! Request middleware: per-request trace ids and panic recovery.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Stamp a trace id on every request, log method/path/status/latency.
pub async fn trace_requests(request: Request, next: Next) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        trace_id = %trace_id,
        "request completed"
    );
    response
}

/// Turn a handler panic into a 500 with a trace id; the process keeps
/// serving.
pub fn recover_panic(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    let trace_id = Uuid::new_v4().to_string();
    tracing::error!(trace_id = %trace_id, "handler panicked: {}", detail);

    let body = serde_json::json!({
        "code": 500,
        "message": "internal server error",
        "traceId": trace_id,
    });
    let mut response = (axum::http::StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}
