//! Ordered endpoint set with a damped round-robin rotation.

use std::time::{Duration, Instant};

/// Extra slack added to the per-call timeout before another rotation is allowed.
pub const ROTATION_GRACE: Duration = Duration::from_secs(2);

/// Ordered list of candidate endpoints plus the rotation cursor.
///
/// Failures tend to arrive in bursts: every batch in flight against a dead
/// endpoint fails at roughly the same time. Rotation is therefore only
/// allowed once per `timeout + 2s`, or when the failures seen since the last
/// rotation exceed `parallel + 1`. Endpoints are never removed.
#[derive(Debug)]
pub struct EndpointSet {
    endpoints: Vec<String>,
    cursor: usize,
    error_count: usize,
    last_rotation: Option<Instant>,
    hold_off: Duration,
    burst_limit: usize,
}

impl EndpointSet {
    /// Build a set from a non-empty endpoint list.
    ///
    /// Returns `None` if `endpoints` is empty.
    pub fn new(endpoints: Vec<String>, rpc_timeout: Duration, parallel: usize) -> Option<Self> {
        if endpoints.is_empty() {
            return None;
        }
        Some(Self {
            endpoints,
            cursor: 0,
            error_count: 0,
            last_rotation: None,
            hold_off: rpc_timeout + ROTATION_GRACE,
            burst_limit: parallel + 1,
        })
    }

    /// The endpoint batches are currently sent to.
    pub fn current(&self) -> &str {
        &self.endpoints[self.cursor]
    }

    /// Index of the current endpoint.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Failures counted since the last rotation.
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// Record a failure against the current endpoint and rotate if allowed.
    ///
    /// Returns `true` when the cursor moved.
    pub fn report_failure(&mut self, reason: &str, now: Instant) -> bool {
        self.error_count += 1;
        let quiet_long_enough = match self.last_rotation {
            None => true,
            Some(at) => now.saturating_duration_since(at) > self.hold_off,
        };
        if !quiet_long_enough && self.error_count <= self.burst_limit {
            return false;
        }

        let old = self.cursor;
        self.cursor = (self.cursor + 1) % self.endpoints.len();
        self.error_count = 0;
        self.last_rotation = Some(now);
        tracing::error!(
            from = %self.endpoints[old],
            to = %self.endpoints[self.cursor],
            reason,
            "switching endpoint"
        );
        true
    }
}
