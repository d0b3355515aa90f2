//! Applier side of the state bridge.
//!
//! ```text
//!  consumer ──ClientMessage──▶ run_connection ──▶ Bridge::handle_message
//!                                                    │
//!                     access check ◀─────────────────┤
//!                                                    ▼
//!                                             Scheduler (core)
//!                                                    │ admitted
//!                                                    ▼
//!                         Pipeline::before ─▶ StateStore::apply_action
//!                                                    │ change callback
//!                                                    ▼
//!                         Broadcaster ──StateUpdate──▶ subscribed consumers
//! ```
//!
//! [`Bridge`] can be driven in-process through [`Bridge::connect`] or over
//! HTTP through [`build_router`]: each consumer opens an SSE stream at
//! `/api/consumers/{id}/events` and posts its messages to
//! `/api/consumers/{id}/messages`.

pub mod bridge;
pub mod broadcast;
pub mod error;
pub mod middleware;
pub mod resources;
pub mod routes;
pub mod state;

pub use bridge::Bridge;
pub use middleware::{LoggingMiddleware, Middleware, MiddlewareContext, Pipeline};
pub use resources::{ResourceManager, TeardownHook};

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(bridge: Arc<Bridge>) -> Router {
    let app_state = state::AppState::new(bridge);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Consumer channels
        .route(
            "/api/consumers/{id}/events",
            get(routes::events::consumer_events),
        )
        .route(
            "/api/consumers/{id}/messages",
            post(routes::messages::post_message),
        )
        .route(
            "/api/consumers/{id}/subscriptions",
            get(routes::subscriptions::get_subscriptions),
        )
        // Introspection
        .route("/api/operations", get(routes::operations::get_operations))
        .route("/api/state", get(routes::state::get_state))
        .route("/api/scheduler", get(routes::scheduler::get_scheduler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Serve the bridge over HTTP on `0.0.0.0:{port}`.
pub async fn serve(bridge: Arc<Bridge>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(bridge, listener).await
}

/// Serve on a pre-bound listener, so the caller can read the actual port
/// first (useful with port 0).
pub async fn serve_on(
    bridge: Arc<Bridge>,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = build_router(bridge.clone());

    tracing::info!("statebridge listening on http://localhost:{actual_port}");

    let result = axum::serve(listener, app).await;
    bridge.destroy();
    result?;
    Ok(())
}
