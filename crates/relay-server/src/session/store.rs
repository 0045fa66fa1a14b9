//! SessionStore: the authoritative map from session id to desktop
//! registration, with expiration. Two interchangeable backends,
//! chosen once at startup: [`InMemorySessionStore`] for a single
//! instance, [`RemoteKvSessionStore`] (Redis) for multi-instance
//! deployments.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::RelayError;

/// One per connected desktop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesktopRegistration {
    pub session_id: String,
    pub device_id: String,
    pub url: String,
    pub created_at_epoch_ms: u64,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts or replaces a registration; (re)starts a TTL timer.
    async fn put(
        &self,
        session_id: &str,
        registration: DesktopRegistration,
        ttl: Duration,
    ) -> Result<(), RelayError>;

    /// Extends expiry. Fails with `SessionNotFound` if the entry has
    /// already expired or never existed.
    async fn refresh(&self, session_id: &str, ttl: Duration) -> Result<(), RelayError>;

    /// Reads without side effects.
    async fn get(&self, session_id: &str) -> Result<DesktopRegistration, RelayError>;

    /// Idempotent removal.
    async fn delete(&self, session_id: &str);
}

pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_millis() as u64
}

// ─── In-process backend ─────────────────────────────────────────────

struct Entry {
    registration: DesktopRegistration,
    expires_at: std::time::Instant,
}

/// Single-instance backend: a `DashMap` guarded by per-entry expiry,
/// swept at least once a minute so nothing lingers even if no reader
/// ever touches it again.
pub struct InMemorySessionStore {
    entries: Arc<DashMap<String, Entry>>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        let store = Arc::new(Self {
            entries: Arc::new(DashMap::new()),
        });
        store.clone().spawn_sweeper();
        store
    }

    fn spawn_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let now = std::time::Instant::now();
                self.entries.retain(|_, entry| entry.expires_at > now);
            }
        });
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn put(
        &self,
        session_id: &str,
        registration: DesktopRegistration,
        ttl: Duration,
    ) -> Result<(), RelayError> {
        self.entries.insert(
            session_id.to_string(),
            Entry {
                registration,
                expires_at: std::time::Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn refresh(&self, session_id: &str, ttl: Duration) -> Result<(), RelayError> {
        let mut entry = self
            .entries
            .get_mut(session_id)
            .ok_or(RelayError::SessionNotFound)?;
        if entry.expires_at <= std::time::Instant::now() {
            return Err(RelayError::SessionNotFound);
        }
        entry.expires_at = std::time::Instant::now() + ttl;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<DesktopRegistration, RelayError> {
        let entry = self
            .entries
            .get(session_id)
            .ok_or(RelayError::SessionNotFound)?;
        if entry.expires_at <= std::time::Instant::now() {
            drop(entry);
            self.entries.remove(session_id);
            return Err(RelayError::SessionNotFound);
        }
        Ok(entry.registration.clone())
    }

    async fn delete(&self, session_id: &str) {
        self.entries.remove(session_id);
    }
}

// ─── Remote (Redis) backend ──────────────────────────────────────────

/// Multi-instance backend backed by Redis `SET ... EX` / `GET`.
///
/// Reads may lag writes made on other instances by Redis's own
/// propagation; the relay only ever dispatches to a desktop socket that
/// is live in this process, so that lag never causes a request to be
/// misrouted.
pub struct RemoteKvSessionStore {
    conn: RwLock<ConnectionManager>,
}

impl RemoteKvSessionStore {
    /// Connects to `connection_string` and verifies the connection with
    /// a `PING` before returning. Callers fall back to the in-process
    /// backend if this fails.
    pub async fn connect(connection_string: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(connection_string).map_err(|e| {
            warn!(error = %e, "failed to parse remote-kv connection string");
            RelayError::BackendUnavailable
        })?;
        let mut conn = client.get_connection_manager().await.map_err(|e| {
            warn!(error = %e, "failed to connect to remote-kv backend");
            RelayError::BackendUnavailable
        })?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(error = %e, "remote-kv backend did not respond to PING");
                RelayError::BackendUnavailable
            })?;
        info!("connected to remote-kv session store");
        Ok(Self {
            conn: RwLock::new(conn),
        })
    }

    fn key(session_id: &str) -> String {
        format!("relay:session:{session_id}")
    }
}

#[async_trait]
impl SessionStore for RemoteKvSessionStore {
    async fn put(
        &self,
        session_id: &str,
        registration: DesktopRegistration,
        ttl: Duration,
    ) -> Result<(), RelayError> {
        let payload = serde_json::to_string(&registration)
            .expect("DesktopRegistration always serializes");
        let mut conn = self.conn.write().await;
        redis::cmd("SET")
            .arg(Self::key(session_id))
            .arg(payload)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| {
                warn!(error = %e, "remote-kv put failed");
                RelayError::BackendUnavailable
            })
    }

    async fn refresh(&self, session_id: &str, ttl: Duration) -> Result<(), RelayError> {
        let mut conn = self.conn.write().await;
        let updated: i64 = redis::cmd("EXPIRE")
            .arg(Self::key(session_id))
            .arg(ttl.as_secs().max(1))
            .query_async(&mut *conn)
            .await
            .map_err(|e| {
                warn!(error = %e, "remote-kv refresh failed");
                RelayError::BackendUnavailable
            })?;
        if updated == 0 {
            return Err(RelayError::SessionNotFound);
        }
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<DesktopRegistration, RelayError> {
        let mut conn = self.conn.write().await;
        let payload: Option<String> = redis::cmd("GET")
            .arg(Self::key(session_id))
            .query_async(&mut *conn)
            .await
            .map_err(|e| {
                warn!(error = %e, "remote-kv get failed");
                RelayError::BackendUnavailable
            })?;
        match payload {
            Some(json) => serde_json::from_str(&json).map_err(|_| RelayError::SessionNotFound),
            None => Err(RelayError::SessionNotFound),
        }
    }

    async fn delete(&self, session_id: &str) {
        let mut conn = self.conn.write().await;
        let _: Result<(), _> = redis::cmd("DEL")
            .arg(Self::key(session_id))
            .query_async::<()>(&mut *conn)
            .await;
    }
}

/// Builds the configured backend, falling back to in-process if a
/// remote-kv backend is configured but unreachable at startup.
pub async fn build_store(config: &crate::config::Config) -> Arc<dyn SessionStore> {
    match config.store_backend {
        crate::config::StoreBackend::InProcess => InMemorySessionStore::new(),
        crate::config::StoreBackend::RemoteKv => {
            let Some(connection_string) = &config.store_connection else {
                warn!("store-backend=remote-kv but store-connection is unset; falling back to in-process");
                return InMemorySessionStore::new();
            };
            match RemoteKvSessionStore::connect(connection_string).await {
                Ok(store) => Arc::new(store),
                Err(_) => {
                    warn!("remote-kv backend unreachable at startup; falling back to in-process (will not retry)");
                    InMemorySessionStore::new()
                }
            }
        }
    }
}

// A thin in-memory view used only for tests that don't want to spin up
// the sweeper task.
#[cfg(test)]
pub fn test_store() -> Arc<dyn SessionStore> {
    InMemorySessionStore::new()
}
