//! Axum router construction for the observer API.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the observer router.
///
/// Every route is a `GET`; the observer never mutates the simulation.
/// CORS allows any origin so dashboards can be served from elsewhere.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::index))
        .route("/ws/ticks", get(ws::ws_ticks))
        .route("/api/world", get(handlers::get_world))
        .route(
            "/api/entities/{category}/{name}",
            get(handlers::get_entity),
        )
        .route("/api/events", get(handlers::list_events))
        .route("/api/status", get(handlers::status))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
