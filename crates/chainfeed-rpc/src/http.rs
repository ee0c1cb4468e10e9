//! HTTP JSON-RPC transport backed by `reqwest`.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::transport::RpcTransport;

/// Default `User-Agent` header sent with every POST.
pub const DEFAULT_USER_AGENT: &str = concat!("chainfeed/", env!("CARGO_PKG_VERSION"));

/// HTTP transport: one POST per batch, JSON in, JSON out.
///
/// Timeouts are enforced by the client driver per batch, so the underlying
/// `reqwest::Client` is built without its own request timeout.
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport that identifies itself with `user_agent`.
    pub fn new(user_agent: &str) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self { http })
    }

    /// Build a transport with the default user agent.
    pub fn with_defaults() -> Result<Self, TransportError> {
        Self::new(DEFAULT_USER_AGENT)
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn post(&self, endpoint: &str, body: Value) -> Result<Value, TransportError> {
        let resp = self
            .http
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {status}: {text}")));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        serde_json::from_str(&text).map_err(|e| {
            tracing::debug!(error = %e, endpoint, "non-JSON response body");
            TransportError::MalformedResponse("Non-JSON response from server".into())
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}
