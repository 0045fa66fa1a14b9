//! REST endpoints for querying server state: a liveness/metrics
//! endpoint and a per-session lookup used by the desktop app to confirm
//! its own registration survived a reconnect.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthReply {
    pub status: &'static str,
    pub desktops: usize,
    pub clients: usize,
    pub uptime: u64,
}

/// `GET /health` — used by load balancers and the desktop app's own
/// connectivity probe.
pub async fn health(State(state): State<AppState>) -> Json<HealthReply> {
    Json(HealthReply {
        status: "healthy",
        desktops: state.desktop_count(),
        clients: state.client_count(),
        uptime: state.uptime_seconds(),
    })
}

#[derive(Serialize)]
pub struct SessionInfoReply {
    pub active: bool,
    pub created: u64,
    pub url: String,
}

/// `GET /api/session/:id` — reports whether a session id currently has
/// a live registration, independent of whether this process happens to
/// hold its socket.
pub async fn session_info(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let canonical = relay_protocol::session_id::canonicalize(&session_id);
    match state.session_store.get(&canonical).await {
        Ok(registration) => Json(SessionInfoReply {
            active: true,
            created: registration.created_at_epoch_ms,
            url: registration.url,
        })
        .into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Session not found" })),
        )
            .into_response(),
    }
}
