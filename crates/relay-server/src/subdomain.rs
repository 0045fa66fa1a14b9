//! Subdomain routing: the left-most label of the `Host` header
//! selects which desktop a request tunnels to. Requests to the bare
//! base domain (health checks, the session-lookup API, the root
//! banner) never carry a session id and fall through untouched.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use relay_protocol::session_id;

/// Request extension set by [`resolve`] once a valid session id is
/// found in the `Host` header. Absent on bare-domain requests.
#[derive(Debug, Clone)]
pub struct RelaySessionId(pub String);

fn leftmost_label(host: &str) -> Option<&str> {
    let host = host.split(':').next()?;
    host.split('.').next()
}

/// Extracts and canonicalizes a session id from `host`'s left-most
/// label, or `None` if the label isn't a well-formed session id token
/// (treated the same as no session at all).
pub fn extract_relay_subdomain(host: &str) -> Option<String> {
    let label = leftmost_label(host)?;
    if session_id::is_valid(label) {
        Some(session_id::canonicalize(label))
    } else {
        None
    }
}

/// Middleware that tags the request with [`RelaySessionId`] when the
/// `Host` header's left-most label is a valid session id. Routes that
/// don't care (`/health`, `/api/session/:id`, `/ws`) just ignore the
/// extension; [`crate::tunnel`] requires it and this middleware is what
/// turns a missing/invalid label into the 404 the tunnel path returns.
pub async fn resolve(mut request: Request, next: Next) -> Response {
    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(host) = host {
        if let Some(session_id) = extract_relay_subdomain(&host) {
            request.extensions_mut().insert(RelaySessionId(session_id));
        }
    }

    next.run(request).await
}

pub fn no_session_response() -> Response {
    (
        StatusCode::NOT_FOUND,
        "No relay session for this host".to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_canonicalizes_valid_subdomain() {
        assert_eq!(
            extract_relay_subdomain("abc234.relay.example"),
            Some("ABC234".to_string())
        );
    }

    #[test]
    fn rejects_base_domain_with_no_subdomain() {
        assert_eq!(extract_relay_subdomain("relay.example"), None);
    }

    #[test]
    fn ignores_port_suffix() {
        assert_eq!(
            extract_relay_subdomain("abc234.relay.example:8080"),
            Some("ABC234".to_string())
        );
    }

    #[test]
    fn rejects_malformed_label() {
        assert_eq!(extract_relay_subdomain("not-a-session.relay.example"), None);
    }
}
