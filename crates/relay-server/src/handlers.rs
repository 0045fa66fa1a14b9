//! WebSocket endpoint and connection lifecycle: the control channel a
//! desktop dials out on, and the attachment channel a client
//! (browser, CLI, etc.) uses to both ride the bridge and receive the
//! `registered` handshake reply when it *is* the desktop.
//!
//! One upgrade endpoint serves both roles, selected by a `role` query
//! parameter on the `/ws` URL — this is a plain WebSocket, so there is
//! no connect-time payload the way a socket.io handshake carries one.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use relay_protocol::ControlMessage;

use crate::error::RelayError;
use crate::session::{self, DesktopRegistration, SessionStore};
use crate::state::{AppState, DesktopHandle};
use crate::tunnel::HttpTunnel;

const MAX_ID_ATTEMPTS: usize = 5;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsHandshakeParams {
    role: Role,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Role {
    Desktop,
    Client,
}

/// `GET /ws?role=desktop&deviceId=...` or `/ws?role=client&sessionId=...&token=...`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsHandshakeParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        match params.role {
            Role::Desktop => {
                let device_id = params.device_id.filter(|id| !id.is_empty());
                let Some(device_id) = device_id else {
                    reject(socket, RelayError::InvalidHandshake).await;
                    return;
                };
                run_desktop(socket, state, device_id).await;
            }
            Role::Client => {
                let (Some(session_id), Some(token)) = (params.session_id, params.token) else {
                    reject(socket, RelayError::InvalidHandshake).await;
                    return;
                };
                run_client(socket, state, session_id, token).await;
            }
        }
    })
}

async fn reject(mut socket: WebSocket, error: RelayError) {
    let message = ControlMessage::Error {
        message: error.client_message().to_string(),
    };
    if let Ok(text) = serde_json::to_string(&message) {
        let _ = socket.send(Message::Text(text.into())).await;
    }
    let _ = socket.close().await;
}

/// Registers a new desktop session and drives its control channel until
/// it disconnects.
async fn run_desktop(socket: WebSocket, state: AppState, device_id: String) {
    let session_id = match allocate_session_id(&state.session_store).await {
        Ok(id) => id,
        Err(error) => {
            warn!(%device_id, "failed to allocate a session id: {error}");
            reject(socket, error).await;
            return;
        }
    };

    let url = state.config.session_url(&session_id);
    let registration = DesktopRegistration {
        session_id: session_id.clone(),
        device_id: device_id.clone(),
        url: url.clone(),
        created_at_epoch_ms: session::now_epoch_ms(),
    };

    if let Err(error) = state
        .session_store
        .put(&session_id, registration, state.config.session_ttl)
        .await
    {
        warn!(%session_id, "failed to persist new session: {error}");
        reject(socket, error).await;
        return;
    }

    let token = state
        .token_issuer
        .issue(&session_id, state.config.session_ttl);
    let connect_url = format!("{url}?token={token}");

    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlMessage>();
    let (alive_tx, _) = watch::channel(true);
    let tunnel = HttpTunnel::new(state.config.pending_per_desktop_max);

    let desktop = Arc::new(DesktopHandle {
        session_id: session_id.clone(),
        device_id: device_id.clone(),
        control_tx: control_tx.clone(),
        tunnel: tunnel.clone(),
        alive_tx,
        bridge_routes: DashMap::new(),
        attachments: DashMap::new(),
    });
    state.desktops.insert(session_id.clone(), desktop.clone());

    info!(%session_id, %device_id, "desktop registered");

    let registered = ControlMessage::Registered(relay_protocol::RegisteredReply {
        session_id: session_id.clone(),
        url,
        token,
        connect_url,
    });
    let _ = control_tx.send(registered);

    let (mut ws_sink, mut ws_stream) = socket.split();

    // One outbound-sender task per connection, mirroring the split
    // between inbound processing and a dedicated writer: a slow or
    // backed-up reader never blocks anything trying to send this
    // desktop a message.
    let outbound_task = tokio::spawn(async move {
        while let Some(message) = control_rx.recv().await {
            if send(&mut ws_sink, &message).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    keep_alive.tick().await; // first tick is immediate; the session is already fresh.

    loop {
        tokio::select! {
            incoming = ws_stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_desktop_message(&text, &desktop);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(%session_id, error = %e, "desktop websocket error");
                        break;
                    }
                }
            }

            _ = keep_alive.tick() => {
                if state
                    .session_store
                    .refresh(&session_id, state.config.session_ttl)
                    .await
                    .is_err()
                {
                    warn!(%session_id, "session vanished from the store mid-flight");
                    break;
                }
            }
        }
    }

    info!(%session_id, "desktop disconnected");
    state.desktops.remove(&session_id);
    state.session_store.delete(&session_id).await;
    desktop.tunnel.disconnect_all();
    let _ = desktop.alive_tx.send(false);
    outbound_task.abort();
}

fn dispatch_desktop_message(text: &str, desktop: &DesktopHandle) {
    let message: ControlMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "dropping malformed desktop message");
            return;
        }
    };

    match message {
        ControlMessage::HttpResponse(response) => desktop.tunnel.complete(response),
        ControlMessage::BridgeResponse(response) => {
            if let Some((_, route)) = desktop.bridge_routes.remove(&response.request_id) {
                let _ = route.send(response);
            }
        }
        ControlMessage::Event(event) => {
            if !relay_protocol::reserved::is_reserved(&event.name) {
                desktop.broadcast_event(event);
            }
        }
        other => {
            warn!(?other, "unexpected message type on desktop control channel");
        }
    }
}

/// Verifies the attaching client's token and hands the socket off to
/// the bridge for the session's lifetime.
async fn run_client(socket: WebSocket, state: AppState, session_id: String, token: String) {
    let canonical = relay_protocol::session_id::canonicalize(&session_id);

    if let Err(error) = state.token_issuer.verify(&token, &canonical) {
        reject(socket, error).await;
        return;
    }

    let Some(desktop) = state.desktops.get(&canonical).map(|entry| entry.value().clone()) else {
        reject(socket, RelayError::DesktopOffline).await;
        return;
    };

    if !desktop.is_alive() {
        reject(socket, RelayError::DesktopOffline).await;
        return;
    }

    crate::bridge::run(socket, desktop, state.config.bridge_timeout).await;
}

async fn allocate_session_id(store: &Arc<dyn SessionStore>) -> Result<String, RelayError> {
    for _ in 0..MAX_ID_ATTEMPTS {
        let candidate = session::id::generate();
        if matches!(store.get(&candidate).await, Err(RelayError::SessionNotFound)) {
            return Ok(candidate);
        }
    }
    Err(RelayError::IdExhausted)
}

async fn send(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &ControlMessage,
) -> Result<(), ()> {
    let text = serde_json::to_string(message).map_err(|_| ())?;
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}
