//! Tracker configuration and the fluent [`FeedBuilder`].
//!
//! # Example
//!
//! ```rust,no_run
//! use chainfeed_core::FeedBuilder;
//!
//! let config = FeedBuilder::new()
//!     .endpoints(["https://api.steemit.com"])
//!     .max_batch_size(8)
//!     .parallel(16)
//!     .rewind_days(2)
//!     .build_config()
//!     .unwrap();
//! ```

use std::path::Path;

use chainfeed_rpc::ClientConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::DEFAULT_TARGET_PARALLELISM;
use crate::error::FeedError;

/// Largest accepted `rewind_secs`: one hundred years.
pub const MAX_REWIND_SECS: u64 = 100 * 365 * 86_400;

/// The time `rewind_secs` before `now`, or `None` when there is no rewind.
pub fn rewind_target(
    rewind_secs: Option<u64>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, FeedError> {
    let Some(secs) = rewind_secs else {
        return Ok(None);
    };
    let out_of_range = || FeedError::Config(format!("rewind of {secs}s is out of range"));
    if secs > MAX_REWIND_SECS {
        return Err(out_of_range());
    }
    let delta = i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(out_of_range)?;
    now.checked_sub_signed(delta).map(Some).ok_or_else(out_of_range)
}

/// Remote method names the tracker and locator rely on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainMethods {
    /// Fetch one block by number; `null` when it does not exist yet.
    pub get_block: String,
    /// Fetch the chain's dynamic global properties.
    pub global_properties: String,
    /// Field of the global properties holding the last irreversible block.
    pub irreversible_field: String,
}

impl Default for ChainMethods {
    fn default() -> Self {
        Self {
            get_block: "get_block".into(),
            global_properties: "get_dynamic_global_properties".into(),
            irreversible_field: "last_irreversible_block_num".into(),
        }
    }
}

/// Configuration for [`ChainTracker`](crate::ChainTracker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub client: ClientConfig,
    /// `get_block` calls issued at startup, and the cap the tracker scales
    /// back up to while behind.
    #[serde(default = "default_initial_batch_size")]
    pub initial_batch_size: usize,
    /// Start this many seconds in the past. `None` starts at the last
    /// irreversible block.
    #[serde(default)]
    pub rewind_secs: Option<u64>,
    #[serde(default)]
    pub methods: ChainMethods,
}

fn default_initial_batch_size() -> usize {
    DEFAULT_TARGET_PARALLELISM
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            initial_batch_size: default_initial_batch_size(),
            rewind_secs: None,
            methods: ChainMethods::default(),
        }
    }
}

impl TrackerConfig {
    /// Load a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FeedError::Config(format!("reading {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| FeedError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        self.client.validate()?;
        if self.initial_batch_size == 0 {
            return Err(FeedError::Config("initial_batch_size must be at least 1".into()));
        }
        if self.rewind_secs.is_some_and(|secs| secs > MAX_REWIND_SECS) {
            return Err(FeedError::Config(format!(
                "rewind_secs must be at most {MAX_REWIND_SECS}"
            )));
        }
        let m = &self.methods;
        if m.get_block.is_empty()
            || m.global_properties.is_empty()
            || m.irreversible_field.is_empty()
        {
            return Err(FeedError::Config("method names must not be empty".into()));
        }
        Ok(())
    }

    /// The configured rewind applied to `now`.
    pub fn rewind_target(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, FeedError> {
        rewind_target(self.rewind_secs, now)
    }
}

/// Fluent builder for [`TrackerConfig`].
#[derive(Default)]
pub struct FeedBuilder {
    config: TrackerConfig,
}

impl FeedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the endpoint list.
    pub fn endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.client.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    /// Calls per outbound request. Only raise above 1 for nodes that
    /// support JSON-RPC batching.
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.config.client.max_batch_size = size;
        self
    }

    pub fn parallel(mut self, n: usize) -> Self {
        self.config.client.parallel = n;
        self
    }

    pub fn rpc_timeout_ms(mut self, ms: u64) -> Self {
        self.config.client.rpc_timeout_ms = ms;
        self
    }

    pub fn stop_when_empty(mut self, stop: bool) -> Self {
        self.config.client.stop_when_empty = stop;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.client.user_agent = agent.into();
        self
    }

    pub fn initial_batch_size(mut self, n: usize) -> Self {
        self.config.initial_batch_size = n;
        self
    }

    pub fn rewind_secs(mut self, secs: u64) -> Self {
        self.config.rewind_secs = Some(secs);
        self
    }

    /// Saturates on overflow; `build_config` then rejects the value.
    pub fn rewind_days(self, days: u64) -> Self {
        self.rewind_secs(days.saturating_mul(86_400))
    }

    pub fn methods(mut self, methods: ChainMethods) -> Self {
        self.config.methods = methods;
        self
    }

    /// Validate and return the config.
    pub fn build_config(self) -> Result<TrackerConfig, FeedError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = FeedBuilder::new().build_config().unwrap();
        assert_eq!(cfg.initial_batch_size, 128);
        assert_eq!(cfg.client.parallel, 16);
        assert_eq!(cfg.client.rpc_timeout_ms, 15_000);
        assert_eq!(cfg.methods.get_block, "get_block");
        assert!(cfg.rewind_secs.is_none());
    }

    #[test]
    fn builder_custom() {
        let cfg = FeedBuilder::new()
            .endpoints(["https://a.example", "https://b.example"])
            .max_batch_size(8)
            .parallel(4)
            .rewind_days(2)
            .initial_batch_size(32)
            .build_config()
            .unwrap();
        assert_eq!(cfg.client.endpoints.len(), 2);
        assert_eq!(cfg.client.max_batch_size, 8);
        assert_eq!(cfg.rewind_secs, Some(172_800));
        assert_eq!(cfg.initial_batch_size, 32);
    }

    #[test]
    fn builder_rejects_bad_values() {
        assert!(FeedBuilder::new().endpoints(Vec::<String>::new()).build_config().is_err());
        assert!(matches!(
            FeedBuilder::new().initial_batch_size(0).build_config(),
            Err(FeedError::Config(_))
        ));
    }

    #[test]
    fn builder_rejects_huge_rewind() {
        assert!(matches!(
            FeedBuilder::new().rewind_secs(u64::MAX).build_config(),
            Err(FeedError::Config(_))
        ));
        assert!(matches!(
            FeedBuilder::new().rewind_days(u64::MAX / 1_000).build_config(),
            Err(FeedError::Config(_))
        ));
        assert!(FeedBuilder::new().rewind_secs(MAX_REWIND_SECS).build_config().is_ok());
    }

    #[test]
    fn rewind_target_subtracts_from_now() {
        let now = Utc::now();
        assert_eq!(rewind_target(None, now).unwrap(), None);
        assert_eq!(
            rewind_target(Some(7_200), now).unwrap(),
            Some(now - chrono::Duration::hours(2))
        );
        assert!(matches!(rewind_target(Some(u64::MAX), now), Err(FeedError::Config(_))));

        // Config read from JSON skips the builder; the lookup still refuses.
        let cfg = TrackerConfig {
            rewind_secs: Some(i64::MAX as u64),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        assert!(cfg.rewind_target(now).is_err());
    }

    #[test]
    fn json_fills_defaults() {
        let cfg: TrackerConfig = serde_json::from_str(
            r#"{"client": {"endpoints": ["https://a.example"]}, "rewind_secs": 3600,
                "methods": {"get_block": "condenser_api.get_block"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.client.parallel, 16);
        assert_eq!(cfg.initial_batch_size, 128);
        assert_eq!(cfg.rewind_secs, Some(3600));
        assert_eq!(cfg.methods.get_block, "condenser_api.get_block");
        assert_eq!(cfg.methods.irreversible_field, "last_irreversible_block_num");
    }

    #[test]
    fn from_json_file_reports_missing_file() {
        let err = TrackerConfig::from_json_file("/nonexistent/chainfeed.json").unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
    }
}
