//! Every local failure in the relay is mapped to one of these kinds
//! before it crosses a component boundary. Detailed diagnostics go to
//! `tracing`; the kinds carry only the short, stable text that is safe
//! to show a client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Session not found")]
    SessionNotFound,

    #[error("Desktop offline")]
    DesktopOffline,

    #[error("Gateway timeout")]
    GatewayTimeout,

    #[error("Request timeout")]
    RequestTimeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid connection parameters")]
    InvalidHandshake,

    #[error("Token invalid")]
    TokenInvalid,

    #[error("Token expired")]
    TokenExpired,

    #[error("Could not allocate a session id")]
    IdExhausted,

    #[error("Session store unavailable")]
    BackendUnavailable,
}

impl RelayError {
    /// The short, stable message shown to a client — never the `Display`
    /// of an underlying cause, which may leak internals.
    pub fn client_message(&self) -> &'static str {
        match self {
            RelayError::SessionNotFound => "Session not found",
            RelayError::DesktopOffline => "Desktop offline",
            RelayError::GatewayTimeout => "Gateway timeout",
            RelayError::RequestTimeout => "Request timeout",
            RelayError::ConnectionClosed => "Connection closed",
            RelayError::InvalidHandshake => "Invalid connection parameters",
            RelayError::TokenInvalid => "Token invalid",
            RelayError::TokenExpired => "Token expired",
            RelayError::IdExhausted => "Could not allocate a session id",
            RelayError::BackendUnavailable => "Session store unavailable",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            RelayError::SessionNotFound => StatusCode::NOT_FOUND,
            RelayError::DesktopOffline => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            RelayError::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::ConnectionClosed => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::RequestTimeout
            | RelayError::InvalidHandshake
            | RelayError::TokenInvalid
            | RelayError::TokenExpired
            | RelayError::IdExhausted => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, axum::Json(json!({ "error": self.client_message() }))).into_response()
    }
}
