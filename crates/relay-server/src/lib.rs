//! Relay fabric that lets a desktop app behind NAT be reached at a
//! public subdomain: HTTP requests tunnel over the desktop's outbound
//! control WebSocket, and a second bridge channel carries named events
//! (with ack-callback semantics) between the desktop and any attached
//! clients.
//!
//! ## Modules
//!
//! - [`config`]    — process configuration (clap + env)
//! - [`error`]      — the one error enum shared across components
//! - [`session`]    — session ids, tokens, and the session store
//! - [`state`]      — shared application state
//! - [`tunnel`]     — the HTTP tunnel
//! - [`bridge`]     — the event bridge and ack-callback sub-protocol
//! - [`subdomain`]  — `Host`-header session routing
//! - [`handlers`]   — the `/ws` upgrade endpoint and connection lifecycle
//! - [`health`]     — `/health` and `/api/session/:id`

pub mod bridge;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod session;
pub mod state;
pub mod subdomain;
pub mod tunnel;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::RelayError;
use crate::state::AppState;
use crate::subdomain::RelaySessionId;

/// Builds the application state from a parsed [`Config`], selecting and
/// connecting the configured [`session::SessionStore`] backend.
pub async fn build_state(config: Config) -> AppState {
    let config = Arc::new(config);
    let session_store = session::build_store(&config).await;
    AppState::new(config, session_store)
}

/// Builds the full axum [`Router`] for a given [`AppState`]: the
/// control-plane endpoints, the `/ws` upgrade, and the subdomain-routed
/// HTTP tunnel fallback, wrapped in the same CORS/trace layers the
/// process uses at startup. Exposed separately from [`build_state`] so
/// integration tests can drive the router in-process without binding a
/// socket.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/session/{session_id}", get(health::session_info))
        .route("/ws", get(handlers::ws_handler))
        .route("/", any(root_or_tunnel))
        .route("/{*path}", any(tunnel_dispatch))
        .layer(axum::middleware::from_fn(subdomain::resolve))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `/` on the bare base domain shows a banner; `/` on a session
/// subdomain is just another tunneled path.
async fn root_or_tunnel(state: State<AppState>, request: Request<Body>) -> Response {
    if request.extensions().get::<RelaySessionId>().is_some() {
        tunnel_dispatch(state, request).await
    } else {
        "relay server".into_response()
    }
}

/// Everything that isn't `/health`, `/api/session/:id`, or `/ws` is a
/// tunneled request and requires a valid session subdomain.
async fn tunnel_dispatch(State(state): State<AppState>, request: Request<Body>) -> Response {
    let Some(RelaySessionId(session_id)) = request.extensions().get::<RelaySessionId>().cloned()
    else {
        return subdomain::no_session_response();
    };

    let Some(desktop) = state
        .desktops
        .get(&session_id)
        .map(|entry| entry.value().clone())
    else {
        return match state.session_store.get(&session_id).await {
            Err(_) => RelayError::SessionNotFound.into_response(),
            Ok(_) => RelayError::DesktopOffline.into_response(),
        };
    };

    let is_asset = tunnel::is_asset_path(request.uri().path());

    desktop
        .tunnel
        .handle(
            &desktop.control_tx,
            request,
            state.config.http_timeout_page,
            state.config.asset_timeout(is_asset),
        )
        .await
}

/// Waits for either Ctrl+C or (on unix) SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining connections");
}
