//! Shared wire types for the relay's desktop control channel.
//!
//! This crate has no knowledge of sockets, timers, or process state — it
//! only defines the envelopes and grammar that `relay-server` sends and
//! receives, so that a future alternate transport (or a test harness
//! standing in for a desktop) can depend on it without pulling in axum
//! or tokio.

pub mod envelope;
pub mod reserved;
pub mod session_id;

pub use envelope::{
    BridgeRequestEnvelope, BridgeResponseEnvelope, ControlMessage, ForwardedEvent,
    HttpRequestEnvelope, HttpResponseEnvelope, RegisteredReply,
};
