//! Wire envelopes exchanged between the relay and a desktop over its
//! control WebSocket: the HTTP tunnel's request/response pair, the
//! bridge's request/response pair, forwarded bridge events, and the
//! registration handshake reply.
//!
//! Bodies are binary; since the control channel carries JSON text
//! frames, bodies are base64-encoded on the wire and decoded back to
//! raw bytes at each end.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod b64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(body: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match body {
            Some(bytes) => ser.serialize_some(&STANDARD.encode(bytes)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(de)?;
        match encoded {
            Some(s) => STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// An inbound HTTP request tunneled to a desktop.
///
/// `url` is the full original path + query, forwarded verbatim. `Host`
/// and `Connection` headers are never included — they belong to the
/// relay hop, not the tunneled request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestEnvelope {
    pub id: String,
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    #[serde(default, with = "b64_body", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

/// A desktop's response to a tunneled HTTP request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponseEnvelope {
    pub id: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    #[serde(default, with = "b64_body", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

/// A client's acknowledging event call, forwarded to the desktop with a
/// server-generated request id so the eventual `bridge:response` can be
/// matched back to the client's original ack callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequestEnvelope {
    pub request_id: String,
    pub event: String,
    pub args: Vec<Value>,
}

/// The desktop's reply to a `bridge:request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeResponseEnvelope {
    pub request_id: String,
    pub response: Value,
}

/// A plain forwarded event (no ack expected), carried verbatim in both
/// directions across the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedEvent {
    pub name: String,
    pub args: Vec<Value>,
}

/// The server's reply to a successful desktop registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredReply {
    pub session_id: String,
    pub url: String,
    pub token: String,
    pub connect_url: String,
}

/// Every message type that can cross a desktop's control WebSocket, in
/// either direction. Serialized as a JSON object tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "http:request")]
    HttpRequest(HttpRequestEnvelope),
    #[serde(rename = "http:response")]
    HttpResponse(HttpResponseEnvelope),
    #[serde(rename = "bridge:request")]
    BridgeRequest(BridgeRequestEnvelope),
    #[serde(rename = "bridge:response")]
    BridgeResponse(BridgeResponseEnvelope),
    #[serde(rename = "event")]
    Event(ForwardedEvent),
    #[serde(rename = "registered")]
    Registered(RegisteredReply),
    #[serde(rename = "error")]
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_request_round_trips_body_as_base64() {
        let env = HttpRequestEnvelope {
            id: "req-1".into(),
            method: "GET".into(),
            url: "/_nuxt/app.js".into(),
            headers: HashMap::new(),
            body: Some(b"console.log(1)".to_vec()),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"body\":\"Y29uc29sZS5sb2coMSk=\""));
        let back: HttpRequestEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body, env.body);
    }

    #[test]
    fn http_request_omits_body_field_when_absent() {
        let env = HttpRequestEnvelope {
            id: "req-2".into(),
            method: "GET".into(),
            url: "/".into(),
            headers: HashMap::new(),
            body: None,
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("\"body\""));
    }

    #[test]
    fn control_message_tags_http_request() {
        let msg = ControlMessage::HttpRequest(HttpRequestEnvelope {
            id: "req-3".into(),
            method: "GET".into(),
            url: "/".into(),
            headers: HashMap::new(),
            body: None,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "http:request");
    }

    #[test]
    fn control_message_tags_bridge_response() {
        let msg = ControlMessage::BridgeResponse(BridgeResponseEnvelope {
            request_id: "b-1".into(),
            response: serde_json::json!({"terminalId": "t1"}),
        });
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ControlMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ControlMessage::BridgeResponse(e) => assert_eq!(e.request_id, "b-1"),
            _ => panic!("wrong variant"),
        }
    }
}
