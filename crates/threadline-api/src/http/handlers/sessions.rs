//! Session HTTP handlers.
//!
//! Endpoints:
//! - GET    /api/v1/sessions               - List sessions, most recent first
//! - POST   /api/v1/sessions               - Start a session at the graph root
//! - GET    /api/v1/sessions/{id}          - Session snapshot
//! - DELETE /api/v1/sessions/{id}          - Cancel a session
//! - POST   /api/v1/sessions/{id}/input    - Resume a paused session with text
//! - POST   /api/v1/sessions/{id}/advance  - Process pending steps now
//! - GET    /api/v1/sessions/{id}/history  - Chat history

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use uuid::Uuid;

use threadline_core::workflow::EngineResponse;
use threadline_types::session::{ChatMessage, SessionSnapshot};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Body of `POST /sessions`.
#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Body of `POST /sessions/{id}/input`.
#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub text: String,
}

fn session_links(
    resp: ApiResponse<EngineResponse>,
    session_id: &str,
) -> ApiResponse<EngineResponse> {
    resp.with_link("self", &format!("/api/v1/sessions/{session_id}"))
        .with_link("history", &format!("/api/v1/sessions/{session_id}/history"))
}

/// GET /api/v1/sessions
pub async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<SessionSnapshot>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let sessions = state.engine.list_sessions().await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(sessions, request_id, elapsed).with_link("self", "/api/v1/sessions"),
    ))
}

/// POST /api/v1/sessions
pub async fn start_session(
    State(state): State<AppState>,
    body: Option<Json<StartSessionRequest>>,
) -> Result<Json<ApiResponse<EngineResponse>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let Json(body) = body.unwrap_or_default();
    if body.session_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
        return Err(AppError::Validation("session_id must not be empty".to_string()));
    }

    let response = state.engine.start(body.session_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let session_id = response.session_id.clone();
    Ok(Json(session_links(
        ApiResponse::success(response, request_id, elapsed),
        &session_id,
    )))
}

/// POST /api/v1/sessions/{id}/input
pub async fn submit_input(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<InputRequest>,
) -> Result<Json<ApiResponse<EngineResponse>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let response = state.engine.resume(&session_id, &body.text).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(session_links(
        ApiResponse::success(response, request_id, elapsed),
        &session_id,
    )))
}

/// POST /api/v1/sessions/{id}/advance
pub async fn advance_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<EngineResponse>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let response = state.engine.advance(&session_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(session_links(
        ApiResponse::success(response, request_id, elapsed),
        &session_id,
    )))
}

/// GET /api/v1/sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<SessionSnapshot>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let snapshot = state.engine.snapshot(&session_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(snapshot, request_id, elapsed)
            .with_link("self", &format!("/api/v1/sessions/{session_id}"))
            .with_link("history", &format!("/api/v1/sessions/{session_id}/history")),
    ))
}

/// GET /api/v1/sessions/{id}/history
pub async fn get_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<ChatMessage>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let history = state.engine.history(&session_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(history, request_id, elapsed)
            .with_link("session", &format!("/api/v1/sessions/{session_id}")),
    ))
}

/// DELETE /api/v1/sessions/{id}
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<EngineResponse>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let response = state.engine.cancel(&session_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(response, request_id, elapsed)
            .with_link("self", &format!("/api/v1/sessions/{session_id}")),
    ))
}
