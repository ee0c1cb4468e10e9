//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::http::DEFAULT_USER_AGENT;

/// Configuration for [`RpcClient`](crate::RpcClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Candidate endpoints, tried in order; rotation wraps around.
    pub endpoints: Vec<String>,
    /// Calls per outbound request. `1` sends bare request objects for
    /// endpoints that do not implement JSON-RPC batching.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Maximum number of requests in flight at any time.
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    /// Timeout for a single request, in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Stop the client driver once the queue is empty and nothing is in flight.
    #[serde(default)]
    pub stop_when_empty: bool,
    /// `User-Agent` header for the HTTP transport.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_max_batch_size() -> usize {
    1
}

fn default_parallel() -> usize {
    16
}

fn default_rpc_timeout_ms() -> u64 {
    15_000
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["https://api.steemit.com".into()],
            max_batch_size: default_max_batch_size(),
            parallel: default_parallel(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            stop_when_empty: false,
            user_agent: default_user_agent(),
        }
    }
}

impl ClientConfig {
    /// A config for the given endpoints with default limits.
    pub fn for_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Per-request timeout as a `Duration`.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Reject configurations the client cannot run with.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.endpoints.is_empty() {
            return Err(TransportError::InvalidConfig("endpoint list is empty".into()));
        }
        if self.max_batch_size == 0 {
            return Err(TransportError::InvalidConfig("max_batch_size must be at least 1".into()));
        }
        if self.parallel == 0 {
            return Err(TransportError::InvalidConfig("parallel must be at least 1".into()));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(TransportError::InvalidConfig("rpc_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}
