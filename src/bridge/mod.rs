//! HTTP-over-filesystem bridge.
//!
//! Makes the RPC fabric look like an HTTP transport. The server half is
//! an event-server handler that forwards envelopes to an upstream HTTP
//! client; the client half serializes `http` requests, posts them over
//! the RPC client, and waits for the response envelope.

pub mod client;
pub mod serde;
pub mod server;

pub use client::FileTransport;
pub use serde::{
    deserialize_request, deserialize_response, serialize_request, serialize_response,
    SerializedHttpRequest, SerializedHttpResponse,
};
pub use server::{HttpBridge, BRIDGE_ENDPOINT_PATTERN, BRIDGE_SEND_ENDPOINT};

use crate::rpc::RpcError;
use thiserror::Error;

/// Error type for the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("envelope error: {0}")]
    Envelope(String),

    #[error("host not allowed: {0}")]
    NotAllowed(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("transport failure: {0}")]
    Transport(String),
}
