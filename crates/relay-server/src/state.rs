//! Shared application state.
//!
//! The [`SessionStore`] is the only process-wide shared state and
//! serializes access per-key internally. Everything else here —
//! per-desktop pending HTTP tables, per-attachment bridge tables — is
//! owned by its component and never locked across components.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use relay_protocol::{BridgeResponseEnvelope, ControlMessage, ForwardedEvent};

use crate::session::{SessionStore, TokenIssuer};
use crate::tunnel::HttpTunnel;

/// The live, in-process view of one connected desktop. Distinct from
/// [`crate::session::DesktopRegistration`], which is the (possibly
/// cross-instance) record in the `SessionStore`: a registration can
/// exist in the shared store while the owning socket lives on a
/// different relay instance, in which case this process has no
/// `DesktopHandle` for it.
pub struct DesktopHandle {
    pub session_id: String,
    pub device_id: String,
    pub control_tx: mpsc::UnboundedSender<ControlMessage>,
    pub tunnel: Arc<HttpTunnel>,
    /// Flips to `false` exactly once, when the desktop socket closes.
    /// Attachments watch this to learn about disconnects without a
    /// lock shared with the tunnel or other attachments.
    pub alive_tx: watch::Sender<bool>,
    /// Routes an outstanding `bridge:request`'s id back to the
    /// attachment awaiting its `bridge:response`.
    pub bridge_routes: DashMap<String, mpsc::UnboundedSender<BridgeResponseEnvelope>>,
    /// Desktop-originated events not carrying a `bridge:response`,
    /// broadcast to every attachment on this session (see DESIGN.md for
    /// why broadcast was chosen over single-attachment delivery).
    pub attachments: DashMap<uuid::Uuid, mpsc::UnboundedSender<ForwardedEvent>>,
}

impl DesktopHandle {
    pub fn alive_rx(&self) -> watch::Receiver<bool> {
        self.alive_tx.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        *self.alive_tx.borrow()
    }

    /// Broadcasts a desktop-originated event to every attached client.
    pub fn broadcast_event(&self, event: ForwardedEvent) {
        for entry in self.attachments.iter() {
            let _ = entry.value().send(event.clone());
        }
    }
}

/// Process-wide shared state, cloned into every request/connection
/// handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<crate::config::Config>,
    pub session_store: Arc<dyn SessionStore>,
    pub token_issuer: Arc<TokenIssuer>,
    /// Desktops with a live control socket on this process.
    pub desktops: Arc<DashMap<String, Arc<DesktopHandle>>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Arc<crate::config::Config>, session_store: Arc<dyn SessionStore>) -> Self {
        let token_issuer = Arc::new(TokenIssuer::new(&config.jwt_secret));
        Self {
            config,
            session_store,
            token_issuer,
            desktops: Arc::new(DashMap::new()),
            started_at: Instant::now(),
        }
    }

    pub fn desktop_count(&self) -> usize {
        self.desktops.len()
    }

    pub fn client_count(&self) -> usize {
        self.desktops
            .iter()
            .map(|entry| entry.value().attachments.len())
            .sum()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
