//! HTTP API gateway
//!
//! A stateless translation layer: Kubernetes REST conventions in, store
//! operations out. All resource routes funnel through one dispatcher so
//! the URL grammar lives in a single, testable place (`path`).

pub mod handlers;
pub mod middleware;
pub mod path;
pub mod state;

use axum::routing::{any, get};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;

pub use path::{build_path, parse_path, ResourceRef};
pub use state::AppState;

/// Build the gateway router.
pub fn create_router(state: AppState, cors: bool) -> Router {
    let mut router = Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/healthz", get(handlers::health))
        .route("/api/{*path}", any(handlers::dispatch))
        .route("/apis/{*path}", any(handlers::dispatch))
        .with_state(state)
        .layer(CatchPanicLayer::custom(middleware::recover_panic))
        .layer(axum::middleware::from_fn(middleware::trace_requests));

    if cors {
        router = router.layer(CorsLayer::permissive());
    }
    router
}
