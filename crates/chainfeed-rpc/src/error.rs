//! Transport-level error types.

use thiserror::Error;

use crate::request::RpcError;

/// Errors that can occur while moving a batch to an endpoint and back.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, TLS, non-2xx status, ...).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The batch did not complete within the per-call timeout.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The endpoint answered, but not with a usable JSON-RPC reply.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// JSON-RPC error object returned by the node for a single call.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),

    /// Client configuration rejected at startup.
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),

    /// The client driver has stopped; no more calls can be issued.
    #[error("RPC client is closed")]
    ClientClosed,

    /// A result could not be deserialized into the requested type.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Returns `true` if the failure is recovered by requeueing the batch
    /// and rotating to another endpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Timeout { .. } | Self::MalformedResponse(_)
        )
    }

    /// Returns `true` if this is a node-side application error (never retried).
    pub fn is_rpc_error(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Http("refused".into()).is_retryable());
        assert!(TransportError::Timeout { ms: 15_000 }.is_retryable());
        assert!(TransportError::MalformedResponse("not json".into()).is_retryable());
        assert!(!TransportError::ClientClosed.is_retryable());
        assert!(!TransportError::InvalidConfig("no endpoints".into()).is_retryable());

        let rpc = TransportError::Rpc(RpcError {
            code: -32000,
            message: "unknown key".into(),
            data: None,
        });
        assert!(!rpc.is_retryable());
        assert!(rpc.is_rpc_error());
    }
}
