//! Process configuration. Parsed via `clap` with
//! `env =` fallbacks, the way the nearest sibling service in this
//! corpus configures itself: every option can be set on the command
//! line or via an environment variable, with sensible defaults.

use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Which [`crate::session::SessionStore`] backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum StoreBackend {
    RemoteKv,
    InProcess,
}

/// Relay server configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "relay-server", about = "Relay fabric for NAT-bound desktops")]
pub struct Config {
    /// TCP port for HTTP + WebSocket.
    #[clap(long, env = "LISTEN_PORT", default_value = "3790")]
    pub listen_port: u16,

    /// Suffix used to compute session URLs and parse subdomains.
    #[clap(long, env = "BASE_DOMAIN")]
    pub base_domain: String,

    /// HMAC key for signing/verifying session tokens. Required; startup
    /// fails with exit code 1 if unset.
    #[clap(long, env = "JWT_SECRET")]
    pub jwt_secret: String,

    /// Which SessionStore backend to use.
    #[clap(long, env = "STORE_BACKEND", value_enum, default_value = "in-process")]
    pub store_backend: StoreBackend,

    /// Connection descriptor for the remote-kv backend (ignored otherwise).
    #[clap(long, env = "STORE_CONNECTION")]
    pub store_connection: Option<String>,

    /// Session expiry, refreshed by the desktop's keep-alive heartbeat.
    #[clap(
        long,
        env = "SESSION_TTL_SECONDS",
        default_value = "3600",
        value_parser = parse_seconds,
    )]
    pub session_ttl: Duration,

    /// Tunnel timeout for ordinary (non-asset) HTTP requests.
    #[clap(
        long,
        env = "HTTP_TIMEOUT_PAGE",
        default_value = "30",
        value_parser = parse_seconds,
    )]
    pub http_timeout_page: Duration,

    /// Tunnel timeout for dev-server asset requests (`/_nuxt/`, `/node_modules/`).
    #[clap(
        long,
        env = "HTTP_TIMEOUT_ASSET",
        default_value = "60",
        value_parser = parse_seconds,
    )]
    pub http_timeout_asset: Duration,

    /// Ack deadline for bridged event requests.
    #[clap(
        long,
        env = "BRIDGE_TIMEOUT_SECONDS",
        default_value = "30",
        value_parser = parse_seconds,
    )]
    pub bridge_timeout: Duration,

    /// Soft cap on concurrent tunneled requests per desktop.
    #[clap(long, env = "PENDING_PER_DESKTOP_MAX", default_value = "1000")]
    pub pending_per_desktop_max: usize,
}

/// Accepts a bare integer (seconds) or a `humantime` duration like
/// `"90s"`/`"1h"`, matching how the rest of this corpus takes duration
/// flags.
fn parse_seconds(raw: &str) -> Result<Duration, humantime::DurationError> {
    if let Ok(seconds) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    humantime::parse_duration(raw)
}

impl Config {
    /// Builds the public URL for a session id (subdomain lowercased).
    pub fn session_url(&self, session_id: &str) -> String {
        format!(
            "https://{}.{}",
            relay_protocol::session_id::to_subdomain(session_id),
            self.base_domain
        )
    }

    pub fn asset_timeout(&self, is_asset: bool) -> Duration {
        if is_asset {
            self.http_timeout_asset
        } else {
            self.http_timeout_page
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_url_lowercases_the_subdomain() {
        let config = Config {
            listen_port: 3790,
            base_domain: "relay.example".into(),
            jwt_secret: "secret".into(),
            store_backend: StoreBackend::InProcess,
            store_connection: None,
            session_ttl: Duration::from_secs(3600),
            http_timeout_page: Duration::from_secs(30),
            http_timeout_asset: Duration::from_secs(60),
            bridge_timeout: Duration::from_secs(30),
            pending_per_desktop_max: 1000,
        };
        assert_eq!(config.session_url("ABC234"), "https://abc234.relay.example");
    }
}
