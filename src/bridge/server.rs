//! Bridge server half: the `/http/**` handler.
//!
//! Decodes an HTTP-request envelope out of the rpc request body, checks
//! the destination host against the allow-list, forwards upstream, and
//! replies with an HTTP-response envelope. Upstream trouble becomes a
//! synthetic 502/504 envelope rather than a protocol-level failure; the
//! bridge never connects to hosts outside its allow-list.

use super::serde::{SerializedHttpRequest, SerializedHttpResponse};
use crate::protocol::RpcRequest;
use crate::server::{BoxHandler, EventServer, HandlerError, HandlerResponse, ServerError};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Route pattern the bridge installs itself under.
pub const BRIDGE_ENDPOINT_PATTERN: &str = "/http/**";

/// Endpoint bridge clients post their envelopes to.
pub const BRIDGE_SEND_ENDPOINT: &str = "http/forward";

const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// The bridge server half.
pub struct HttpBridge {
    allowed_hosts: HashSet<String>,
    upstream: reqwest::Client,
    timeout: Duration,
}

impl HttpBridge {
    /// A bridge forwarding only to the given hosts.
    pub fn new<I, S>(allowed_hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.into().to_ascii_lowercase())
                .collect(),
            upstream: reqwest::Client::new(),
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }

    pub fn with_upstream(mut self, upstream: reqwest::Client) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.contains(&host.to_ascii_lowercase())
    }

    /// Register the bridge on an event server under `/http/**`.
    pub fn install(self: Arc<Self>, server: &mut EventServer) -> Result<(), ServerError> {
        let bridge = self.clone();
        let handler: BoxHandler = Arc::new(move |request| {
            let bridge = bridge.clone();
            Box::pin(async move { bridge.handle(request).await })
        });
        server.on_request_boxed(BRIDGE_ENDPOINT_PATTERN, handler)
    }

    /// Handle one rpc request carrying an HTTP-request envelope.
    pub async fn handle(&self, request: RpcRequest) -> Result<HandlerResponse, HandlerError> {
        let envelope = SerializedHttpRequest::decode(&request.body)
            .map_err(|e| HandlerError::new(format!("invalid http envelope: {e}")))?;

        let Some(host) = envelope.host() else {
            return reply_envelope(SerializedHttpResponse::synthetic(
                403,
                "Forbidden",
                "request URL has no host",
            ));
        };
        if !self.is_allowed(&host) {
            warn!("Bridge refused host {:?}", host);
            return reply_envelope(SerializedHttpResponse::synthetic(
                403,
                "Forbidden",
                format!("host {host} is not allowed"),
            ));
        }

        debug!("Bridge forwarding {} {}", envelope.method, envelope.url);
        let response_envelope = self.forward(&envelope).await;
        reply_envelope(response_envelope)
    }

    /// Forward an envelope upstream; failures come back as synthetic
    /// 502/504 envelopes.
    async fn forward(&self, envelope: &SerializedHttpRequest) -> SerializedHttpResponse {
        let method = match reqwest::Method::from_str(&envelope.method) {
            Ok(method) => method,
            Err(_) => {
                return SerializedHttpResponse::synthetic(
                    502,
                    "Bad Gateway",
                    format!("invalid method {:?}", envelope.method),
                )
            }
        };

        let mut upstream_request = self
            .upstream
            .request(method, &envelope.url)
            .timeout(self.timeout)
            .body(envelope.body.to_vec());
        for (name, value) in &envelope.headers {
            // The upstream client computes its own Host header.
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            upstream_request = upstream_request.header(name, value);
        }

        let response = match upstream_request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!("Bridge upstream timeout for {}: {}", envelope.url, e);
                return SerializedHttpResponse::synthetic(
                    504,
                    "Gateway Timeout",
                    e.to_string(),
                );
            }
            Err(e) => {
                warn!("Bridge upstream error for {}: {}", envelope.url, e);
                return SerializedHttpResponse::synthetic(502, "Bad Gateway", e.to_string());
            }
        };

        let status_code = response.status().as_u16();
        let reason = response.status().canonical_reason().map(String::from);
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                warn!("Bridge failed reading upstream body: {}", e);
                return SerializedHttpResponse::synthetic(502, "Bad Gateway", e.to_string());
            }
        };

        SerializedHttpResponse {
            status_code,
            reason,
            headers,
            body: serde_bytes::ByteBuf::from(body),
        }
    }
}

fn reply_envelope(envelope: SerializedHttpResponse) -> Result<HandlerResponse, HandlerError> {
    let body = envelope
        .encode()
        .map_err(|e| HandlerError::new(e.to_string()))?;
    Ok(HandlerResponse {
        body,
        ..HandlerResponse::default()
    })
}
