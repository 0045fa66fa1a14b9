//! HttpTunnel: bridges one client HTTP request to a desktop over
//! its control WebSocket and returns the eventual response, a 504 on
//! timeout, or a 503 if the desktop disconnects mid-flight.
//!
//! Exactly one of {response, 504, 503} is ever delivered per request:
//! the pending table entry is removed by whichever of the three
//! completion paths reaches it first, and a oneshot channel ensures the
//! awaiting handler sees exactly one outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use relay_protocol::{ControlMessage, HttpRequestEnvelope, HttpResponseEnvelope};

/// Body size limit for requests tunneled to a desktop; dev-server asset
/// payloads are small, and bodies are buffered fully in memory.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Headers stripped before forwarding — they describe the relay hop,
/// not the tunneled request/response.
const REQUEST_HOP_HEADERS: &[&str] = &["host", "connection"];
const RESPONSE_HOP_HEADERS: &[&str] = &["content-encoding", "transfer-encoding"];

pub(crate) fn is_asset_path(path: &str) -> bool {
    path.contains("/_nuxt/") || path.contains("/node_modules/")
}

enum Completion {
    Response(HttpResponseEnvelope),
    DesktopDisconnected,
}

struct PendingEntry {
    tx: oneshot::Sender<Completion>,
    deadline: Instant,
}

/// Owns the table of in-flight requests for one desktop's control
/// channel. One instance per connected desktop.
pub struct HttpTunnel {
    pending: Arc<DashMap<String, PendingEntry>>,
    pending_max: usize,
}

impl HttpTunnel {
    pub fn new(pending_max: usize) -> Arc<Self> {
        let tunnel = Arc::new(Self {
            pending: Arc::new(DashMap::new()),
            pending_max,
        });
        tunnel.clone().spawn_sweeper();
        tunnel
    }

    fn spawn_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3));
            loop {
                interval.tick().await;
                let now = Instant::now();
                let expired: Vec<String> = self
                    .pending
                    .iter()
                    .filter(|e| e.deadline <= now)
                    .map(|e| e.key().clone())
                    .collect();
                for id in expired {
                    if let Some((_, entry)) = self.pending.remove(&id) {
                        debug!(request_id = %id, "sweeper evicted a stale pending request");
                        // The rx side already timed out on its own deadline in the
                        // common case; this only catches a missed completion.
                        drop(entry.tx);
                    }
                }
            }
        });
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Tunnels `request` to the desktop over `control_tx` and returns the
    /// response once it arrives, times out, or the desktop disconnects.
    pub async fn handle(
        &self,
        control_tx: &mpsc::UnboundedSender<ControlMessage>,
        request: Request<Body>,
        timeout_page: Duration,
        timeout_asset: Duration,
    ) -> Response<Body> {
        if self.pending.len() >= self.pending_max {
            return text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "Too many in-flight requests for this desktop",
            );
        }

        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());
        let is_asset = is_asset_path(parts.uri.path());
        let deadline_duration = if is_asset { timeout_asset } else { timeout_page };

        let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to buffer tunneled request body");
                return text_response(StatusCode::BAD_REQUEST, "Invalid request body");
            }
        };

        let id = Uuid::new_v4().to_string();
        let mut headers = HashMap::new();
        for (name, value) in parts.headers.iter() {
            let name_lower = name.as_str().to_ascii_lowercase();
            if REQUEST_HOP_HEADERS.contains(&name_lower.as_str()) {
                continue;
            }
            if let Ok(value_str) = value.to_str() {
                headers.insert(name.as_str().to_string(), value_str.to_string());
            }
        }

        let envelope = HttpRequestEnvelope {
            id: id.clone(),
            method: parts.method.to_string(),
            url: path_and_query,
            headers,
            body: if body_bytes.is_empty() {
                None
            } else {
                Some(body_bytes.to_vec())
            },
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingEntry {
                tx,
                deadline: Instant::now() + deadline_duration,
            },
        );

        if control_tx
            .send(ControlMessage::HttpRequest(envelope))
            .is_err()
        {
            self.pending.remove(&id);
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "Desktop disconnected");
        }

        match tokio::time::timeout(deadline_duration, rx).await {
            Ok(Ok(Completion::Response(envelope))) => build_response(envelope),
            Ok(Ok(Completion::DesktopDisconnected)) => {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "Desktop disconnected")
            }
            Ok(Err(_)) => {
                // Sender dropped without completing — treat as disconnect.
                self.pending.remove(&id);
                text_response(StatusCode::SERVICE_UNAVAILABLE, "Desktop disconnected")
            }
            Err(_elapsed) => {
                self.pending.remove(&id);
                text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway timeout")
            }
        }
    }

    /// Matches a `http:response` envelope to its pending request. Logs
    /// and drops responses for unknown ids — expected during shutdown
    /// races.
    pub fn complete(&self, response: HttpResponseEnvelope) {
        match self.pending.remove(&response.id) {
            Some((_, entry)) => {
                let _ = entry.tx.send(Completion::Response(response));
            }
            None => {
                debug!(request_id = %response.id, "response for unknown or already-resolved request");
            }
        }
    }

    /// Completes every pending request with a 503 and clears the table.
    pub fn disconnect_all(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry.tx.send(Completion::DesktopDisconnected);
            }
        }
    }
}

fn build_response(envelope: HttpResponseEnvelope) -> Response<Body> {
    let status = StatusCode::from_u16(envelope.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in envelope.headers.iter() {
        let name_lower = name.to_ascii_lowercase();
        if RESPONSE_HOP_HEADERS.contains(&name_lower.as_str()) {
            continue;
        }
        if let (Ok(header_name), Ok(header_value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(header_name, header_value);
        }
    }
    let body = envelope.body.unwrap_or_default();
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| text_response(StatusCode::BAD_GATEWAY, "Malformed tunneled response"))
}

fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| {
            let mut response = Response::new(Body::from(message.to_string()));
            *response.status_mut() = status;
            response
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_heuristic_matches_dev_server_patterns() {
        assert!(is_asset_path("/_nuxt/app.js"));
        assert!(is_asset_path("/node_modules/foo/bar.js"));
        assert!(!is_asset_path("/"));
        assert!(!is_asset_path("/api/data"));
    }

    #[tokio::test]
    async fn handle_returns_504_when_desktop_never_responds() {
        let tunnel = HttpTunnel::new(1000);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();

        let handle = tokio::spawn({
            let tunnel = tunnel.clone();
            async move {
                tunnel
                    .handle(&tx, request, Duration::from_millis(50), Duration::from_secs(60))
                    .await
            }
        });

        // Drain the request so the channel doesn't look disconnected.
        let _ = rx.recv().await;

        let response = handle.await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(tunnel.in_flight(), 0);
    }

    #[tokio::test]
    async fn handle_returns_503_on_disconnect() {
        let tunnel = HttpTunnel::new(1000);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();

        let tunnel_for_task = tunnel.clone();
        let handle = tokio::spawn(async move {
            tunnel_for_task
                .handle(&tx, request, Duration::from_secs(30), Duration::from_secs(60))
                .await
        });

        let sent = rx.recv().await;
        assert!(sent.is_some());
        // Give the handle() task a moment to register its pending entry.
        tokio::time::sleep(Duration::from_millis(20)).await;
        tunnel.disconnect_all();

        let response = handle.await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn handle_matches_response_by_id() {
        let tunnel = HttpTunnel::new(1000);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = Request::builder().uri("/page").body(Body::empty()).unwrap();

        let tunnel_for_task = tunnel.clone();
        let handle = tokio::spawn(async move {
            tunnel_for_task
                .handle(&tx, request, Duration::from_secs(30), Duration::from_secs(60))
                .await
        });

        let sent = rx.recv().await.unwrap();
        let id = match sent {
            ControlMessage::HttpRequest(env) => env.id,
            _ => panic!("expected http:request"),
        };

        tunnel.complete(HttpResponseEnvelope {
            id,
            status: 200,
            headers: HashMap::from([("content-type".to_string(), "text/plain".to_string())]),
            body: Some(b"hello".to_vec()),
        });

        let response = handle.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(tunnel.in_flight(), 0);
    }

    #[tokio::test]
    async fn complete_for_unknown_id_is_dropped_silently() {
        let tunnel = HttpTunnel::new(1000);
        tunnel.complete(HttpResponseEnvelope {
            id: "unknown".to_string(),
            status: 200,
            headers: HashMap::new(),
            body: None,
        });
        assert_eq!(tunnel.in_flight(), 0);
    }
}
