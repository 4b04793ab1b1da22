//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route(
            "/sessions",
            get(handlers::sessions::list_sessions).post(handlers::sessions::start_session),
        )
        .route(
            "/sessions/{id}",
            get(handlers::sessions::get_session).delete(handlers::sessions::cancel_session),
        )
        .route("/sessions/{id}/input", post(handlers::sessions::submit_input))
        .route(
            "/sessions/{id}/advance",
            post(handlers::sessions::advance_session),
        )
        .route("/sessions/{id}/history", get(handlers::sessions::get_history))
        .route("/health", get(health_check));

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /api/v1/health
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
