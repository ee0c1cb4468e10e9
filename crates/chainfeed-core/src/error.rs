//! Error types for the chainfeed pipeline.

use chainfeed_rpc::TransportError;
use thiserror::Error;

/// Errors that can occur while locating, tracking or dispatching.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("RPC error: {0}")]
    Rpc(#[from] TransportError),

    #[error("Handler error in '{consumer}' for '{event}': {reason}")]
    Handler {
        consumer: String,
        event: String,
        reason: String,
    },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

