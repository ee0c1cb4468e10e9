//! Chain cursor: which blocks to fetch next, and whether we have caught up.
//!
//! The cursor is a pure state machine. Each transition returns the block
//! numbers the caller must now fetch; the caller issues them through the RPC
//! client and feeds the completions back in.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::lag_secs;

/// Default number of `get_block` calls kept outstanding while catching up.
pub const DEFAULT_TARGET_PARALLELISM: usize = 128;

/// Below this lag the tracker considers itself synced.
pub const SYNC_LAG_SECS: u64 = 120;

/// Lag threshold per outstanding fetch while fewer than
/// [`RAMP_LIMIT`] fetches are outstanding.
const RAMP_SECS_PER_FETCH: u64 = 20;
const RAMP_LIMIT: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCursor {
    /// Highest block number ever requested. Never decreases.
    pub last_requested: u64,
    /// Lowest block number found missing since the last found block at or
    /// past it; the head of the chain is probed there.
    pub sync_probe: Option<u64>,
    /// Blocks past `sync_probe` whose fetch came back empty and was not
    /// retried. Refetched lowest first before `last_requested` advances.
    #[serde(default)]
    pub lapsed: BTreeSet<u64>,
    /// `get_block` calls issued and not yet completed.
    pub in_flight: usize,
    /// Cap on outstanding fetches when scaling back up.
    pub target_parallelism: usize,
    /// `true` once the block clock first came within [`SYNC_LAG_SECS`] of
    /// wall time. Never reverts.
    pub synced: bool,
}

impl Default for ChainCursor {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_PARALLELISM)
    }
}

impl ChainCursor {
    pub fn new(target_parallelism: usize) -> Self {
        Self {
            last_requested: 0,
            sync_probe: None,
            lapsed: BTreeSet::new(),
            in_flight: 0,
            target_parallelism: target_parallelism.max(1),
            synced: false,
        }
    }

    /// Record that `block` is being fetched.
    fn request(&mut self, block: u64, out: &mut Vec<u64>) {
        self.last_requested = self.last_requested.max(block);
        self.in_flight += 1;
        out.push(block);
    }

    /// The lowest lapsed block, else the block after `last_requested`.
    fn next_block(&mut self) -> u64 {
        self.lapsed
            .pop_first()
            .unwrap_or(self.last_requested + 1)
    }

    /// Initial burst: `target_parallelism` consecutive blocks from `from`.
    pub fn start(&mut self, from: u64) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.target_parallelism);
        for n in 0..self.target_parallelism as u64 {
            self.request(from + n, &mut out);
        }
        out
    }

    /// A fetch of `block` came back empty: the block does not exist yet.
    pub fn on_missing(&mut self, block: u64) -> Vec<u64> {
        self.in_flight = self.in_flight.saturating_sub(1);
        let mut out = Vec::new();

        match self.sync_probe {
            Some(probe) if block > probe => {
                self.lapsed.insert(block);
                if self.in_flight == 0 {
                    self.request(probe, &mut out);
                } else {
                    tracing::info!(
                        in_flight = self.in_flight,
                        "at chain head, reducing parallel get_block queries"
                    );
                }
            }
            _ => {
                self.sync_probe = Some(block);
                self.request(block, &mut out);
            }
        }
        out
    }

    /// A fetch of `block` returned a block stamped `block_time`.
    ///
    /// The caller decodes and dispatches the block; the cursor only decides
    /// on the follow-up fetches.
    pub fn on_found(
        &mut self,
        block: u64,
        block_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Vec<u64> {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.sync_probe.is_some_and(|probe| block >= probe) {
            self.sync_probe = None;
        }

        let mut out = Vec::new();
        let next = self.next_block();
        self.request(next, &mut out);

        let Some(block_time) = block_time else {
            return out;
        };
        let lag = lag_secs(now, block_time);

        if !self.synced && lag < SYNC_LAG_SECS {
            self.synced = true;
            tracing::info!(block, lag_secs = lag, "caught up with chain head");
        }

        if self.in_flight < self.target_parallelism && lag >= self.lag_threshold() {
            let next = self.next_block();
            self.request(next, &mut out);
            tracing::info!(
                in_flight = self.in_flight,
                lag_secs = lag,
                "falling behind, adding a parallel get_block query"
            );
        }
        out
    }

    /// Lag (seconds) above which one more fetch is added.
    pub fn lag_threshold(&self) -> u64 {
        if self.in_flight < RAMP_LIMIT {
            self.in_flight as u64 * RAMP_SECS_PER_FETCH
        } else {
            SYNC_LAG_SECS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        crate::types::parse_block_time("2018-03-12T00:00:00").unwrap()
    }

    #[test]
    fn start_issues_consecutive_burst() {
        let mut c = ChainCursor::new(4);
        assert_eq!(c.start(100), vec![100, 101, 102, 103]);
        assert_eq!(c.last_requested, 103);
        assert_eq!(c.in_flight, 4);
    }

    #[test]
    fn found_block_fetches_next_and_stays_level_when_synced() {
        let mut c = ChainCursor::new(4);
        c.start(100);
        let now = t0();
        // Already at target parallelism: exactly one follow-up fetch.
        let next = c.on_found(100, Some(now - Duration::seconds(3)), now);
        assert_eq!(next, vec![104]);
        assert_eq!(c.in_flight, 4);
        assert!(c.synced);
    }

    #[test]
    fn lagging_block_adds_parallel_fetch() {
        // Two fetches outstanding after earlier slots lapsed at the head.
        let mut c = ChainCursor {
            last_requested: 103,
            in_flight: 2,
            ..ChainCursor::new(4)
        };
        let now = t0();
        let next = c.on_found(102, Some(now - Duration::hours(5)), now);
        assert_eq!(next, vec![104, 105]);
        assert_eq!(c.in_flight, 3);
        assert!(!c.synced);
    }

    #[test]
    fn no_ramp_past_target_parallelism() {
        let mut c = ChainCursor::new(2);
        c.start(1);
        let now = t0();
        // in_flight back to 2 after the follow-up: at target, no extra.
        assert_eq!(c.on_found(1, Some(now - Duration::days(30)), now), vec![3]);
    }

    #[test]
    fn lag_threshold_ramps_then_caps() {
        let mut c = ChainCursor::new(128);
        c.in_flight = 0;
        assert_eq!(c.lag_threshold(), 0);
        c.in_flight = 3;
        assert_eq!(c.lag_threshold(), 60);
        c.in_flight = 6;
        assert_eq!(c.lag_threshold(), 120);
        c.in_flight = 50;
        assert_eq!(c.lag_threshold(), SYNC_LAG_SECS);
    }

    #[test]
    fn synced_latches() {
        let mut c = ChainCursor::new(1);
        c.start(1);
        let now = t0();
        c.on_found(1, Some(now), now);
        assert!(c.synced);
        c.on_found(2, Some(now - Duration::days(1)), now);
        assert!(c.synced);
    }

    #[test]
    fn missing_blocks_probe_the_head() {
        let mut c = ChainCursor::new(3);
        c.start(10); // 10, 11, 12
        // Lowest missing so far: becomes the probe and is re-fetched.
        assert_eq!(c.on_missing(11), vec![11]);
        assert_eq!(c.sync_probe, Some(11));
        // Beyond the probe with others outstanding: the slot lapses.
        assert_eq!(c.on_missing(12), Vec::<u64>::new());
        assert_eq!(c.in_flight, 2);
        assert!(c.lapsed.contains(&12));
        // Lower than the probe: it becomes the new probe.
        assert_eq!(c.on_missing(10), vec![10]);
        assert_eq!(c.sync_probe, Some(10));
    }

    #[test]
    fn last_outstanding_miss_retries_probe() {
        // Only the fetch of 12 is outstanding and the head probe sits at 10.
        let mut c = ChainCursor {
            last_requested: 12,
            sync_probe: Some(10),
            in_flight: 1,
            ..ChainCursor::new(2)
        };
        assert_eq!(c.on_missing(12), vec![10]);
        assert_eq!(c.in_flight, 1);
        assert_eq!(c.last_requested, 12);
    }

    #[test]
    fn lapsed_blocks_are_refetched_in_order() {
        // Head at 10; the burst overshoots it.
        let mut c = ChainCursor::new(3);
        assert_eq!(c.start(11), vec![11, 12, 13]);
        assert_eq!(c.on_missing(11), vec![11]);
        assert_eq!(c.on_missing(12), Vec::<u64>::new());
        assert_eq!(c.on_missing(13), Vec::<u64>::new());

        // The chain grows; each found block pulls the next lapsed one.
        let now = t0();
        assert_eq!(c.on_found(11, Some(now), now), vec![12]);
        assert_eq!(c.on_found(12, Some(now), now), vec![13]);
        assert!(c.lapsed.is_empty());
        assert_eq!(c.on_found(13, Some(now), now), vec![14]);
        assert_eq!(c.last_requested, 14);
    }

    #[test]
    fn lagging_ramp_drains_lapsed_first() {
        let mut c = ChainCursor {
            last_requested: 20,
            lapsed: BTreeSet::from([17, 19]),
            in_flight: 2,
            ..ChainCursor::new(4)
        };
        let now = t0();
        assert_eq!(c.on_found(16, Some(now - Duration::hours(1)), now), vec![17, 19]);
        assert_eq!(c.last_requested, 20);
        assert_eq!(c.on_found(17, Some(now - Duration::hours(1)), now), vec![21, 22]);
    }

    #[test]
    fn found_at_or_past_probe_clears_it() {
        let mut c = ChainCursor::new(2);
        c.start(10);
        c.on_missing(11);
        let now = t0();
        c.on_found(11, Some(now), now);
        assert_eq!(c.sync_probe, None);
    }

    #[test]
    fn last_requested_never_decreases() {
        let mut c = ChainCursor::new(3);
        c.start(10);
        let before = c.last_requested;
        c.on_missing(10);
        c.on_missing(9);
        assert_eq!(c.last_requested, before);
    }

    #[test]
    fn unparseable_time_still_advances() {
        let mut c = ChainCursor::new(2);
        c.start(1);
        assert_eq!(c.on_found(1, None, t0()), vec![3]);
        assert!(!c.synced);
    }
}
