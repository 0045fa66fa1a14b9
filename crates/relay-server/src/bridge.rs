//! EventBridge: forwards named events between one client socket
//! and its desktop's socket in both directions, and implements the
//! `bridge:request`/`bridge:response` sub-protocol that preserves
//! ack-callback semantics across the hop.
//!
//! The original system's ack callback is a one-shot completion handle
//! supplied by an event-bus library. Here that handle is simply the
//! client's own `request_id`: each
//! attachment keeps a small table mapping the *server*-generated id it
//! sent to the desktop back to the *client*-supplied id, so the desktop
//! never needs to know anything about client-side call identifiers and
//! two clients can never collide on an id at the desktop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use relay_protocol::{
    reserved, BridgeRequestEnvelope, BridgeResponseEnvelope, ControlMessage, ForwardedEvent,
};

use crate::state::DesktopHandle;

struct PendingBridgeRequest {
    client_request_id: String,
    deadline: Instant,
}

/// Runs one client attachment until either side disconnects. Owns this
/// attachment's `PendingBridgeRequest` table exclusively: no other
/// component reads or writes it.
pub async fn run(socket: WebSocket, desktop: std::sync::Arc<DesktopHandle>, bridge_timeout: Duration) {
    let attachment_id = Uuid::new_v4();
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ForwardedEvent>();
    desktop.attachments.insert(attachment_id, event_tx);

    let (bridge_response_tx, mut bridge_response_rx) =
        mpsc::unbounded_channel::<BridgeResponseEnvelope>();

    let mut pending: HashMap<String, PendingBridgeRequest> = HashMap::new();
    let mut alive_rx = desktop.alive_rx();
    let mut sweep = tokio::time::interval(Duration::from_secs(1));

    debug!(%attachment_id, session_id = %desktop.session_id, "client attached");

    loop {
        tokio::select! {
            incoming = ws_stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(
                            &text,
                            &desktop,
                            &mut pending,
                            &bridge_response_tx,
                            attachment_id,
                            bridge_timeout,
                        );
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "client websocket error");
                        break;
                    }
                }
            }

            Some(event) = event_rx.recv() => {
                if send_to_client(&mut ws_sink, &ControlMessage::Event(event)).await.is_err() {
                    break;
                }
            }

            Some(response) = bridge_response_rx.recv() => {
                if let Some(entry) = pending.remove(&response.request_id) {
                    let outgoing = ControlMessage::BridgeResponse(BridgeResponseEnvelope {
                        request_id: entry.client_request_id,
                        response: response.response,
                    });
                    if send_to_client(&mut ws_sink, &outgoing).await.is_err() {
                        break;
                    }
                }
                // Duplicate bridge:response for an id already removed: dropped.
            }

            _ = sweep.tick() => {
                let now = Instant::now();
                let timed_out: Vec<String> = pending
                    .iter()
                    .filter(|(_, entry)| entry.deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for server_id in timed_out {
                    desktop.bridge_routes.remove(&server_id);
                    if let Some(entry) = pending.remove(&server_id) {
                        let ack = ControlMessage::BridgeResponse(BridgeResponseEnvelope {
                            request_id: entry.client_request_id,
                            response: serde_json::json!({"error": "Request timeout"}),
                        });
                        if send_to_client(&mut ws_sink, &ack).await.is_err() {
                            break;
                        }
                    }
                }
            }

            changed = alive_rx.changed() => {
                if changed.is_err() || !*alive_rx.borrow() {
                    debug!(%attachment_id, "desktop disconnected, detaching client");
                    break;
                }
            }
        }
    }

    // Teardown: every still-pending bridge request in this attachment
    // errors exactly once.
    desktop.attachments.remove(&attachment_id);
    for (server_id, entry) in pending.drain() {
        desktop.bridge_routes.remove(&server_id);
        let ack = ControlMessage::BridgeResponse(BridgeResponseEnvelope {
            request_id: entry.client_request_id,
            response: serde_json::json!({"error": "Connection closed"}),
        });
        let _ = send_to_client(&mut ws_sink, &ack).await;
    }
    let _ = ws_sink.close().await;
}

fn handle_client_message(
    text: &str,
    desktop: &DesktopHandle,
    pending: &mut HashMap<String, PendingBridgeRequest>,
    bridge_response_tx: &mpsc::UnboundedSender<BridgeResponseEnvelope>,
    attachment_id: Uuid,
    bridge_timeout: Duration,
) {
    let message: ControlMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "dropping malformed client message");
            return;
        }
    };

    match message {
        ControlMessage::Event(event) => {
            if reserved::is_reserved(&event.name) {
                return;
            }
            let _ = desktop.control_tx.send(ControlMessage::Event(event));
        }
        ControlMessage::BridgeRequest(request) => {
            if reserved::is_reserved(&request.event) {
                return;
            }
            let server_request_id = format!("{attachment_id}:{}", Uuid::new_v4());
            pending.insert(
                server_request_id.clone(),
                PendingBridgeRequest {
                    client_request_id: request.request_id,
                    deadline: Instant::now() + bridge_timeout,
                },
            );
            desktop
                .bridge_routes
                .insert(server_request_id.clone(), bridge_response_tx.clone());
            let _ = desktop
                .control_tx
                .send(ControlMessage::BridgeRequest(BridgeRequestEnvelope {
                    request_id: server_request_id,
                    event: request.event,
                    args: request.args,
                }));
        }
        other => {
            debug!(?other, "unexpected message type on client attachment");
        }
    }
}

async fn send_to_client(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &ControlMessage,
) -> Result<(), ()> {
    let text = match serde_json::to_string(message) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "failed to serialize outgoing client message");
            return Err(());
        }
    };
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}
