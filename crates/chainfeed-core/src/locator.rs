//! Locate the block produced at a given time.
//!
//! Blocks are only addressable by number, so the locator bisects: three
//! concurrent probes narrow a [`SearchWindow`] until it brackets the target
//! to within one block. The only questions asked of the chain are "does
//! block *n* exist" and "what is its timestamp".

use chainfeed_rpc::RpcClient;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{json, Value};

use crate::config::ChainMethods;
use crate::error::FeedError;
use crate::types::block_time;

/// Initial probes, one per lane.
pub const SEED_PROBES: [u64; 3] = [10_000_000, 20_000_000, 30_000_000];

/// What a probe revealed about one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The block does not exist yet.
    Missing,
    /// The block was produced before the target time.
    Before,
    /// The block was produced at or after the target time.
    AtOrAfter,
}

impl Probe {
    /// Classify a `get_block` result against `target`. A block without a
    /// readable timestamp counts as missing.
    pub fn classify(block: &Value, target: DateTime<Utc>) -> Self {
        match block_time(block) {
            None => Self::Missing,
            Some(t) if t < target => Self::Before,
            Some(_) => Self::AtOrAfter,
        }
    }
}

/// What the locator should do after a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Found(u64),
    Probe(u64),
}

/// The bracket `[lower, upper)` known to contain the target block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SearchWindow {
    lower: u64,
    upper: Option<u64>,
}

impl SearchWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lower(&self) -> u64 {
        self.lower
    }

    pub fn upper(&self) -> Option<u64> {
        self.upper
    }

    /// `true` once the window is narrower than two blocks.
    pub fn is_closed(&self) -> bool {
        self.upper.is_some_and(|u| u - self.lower < 2)
    }

    /// Fold one probe result in and pick the next probe for `lane`.
    ///
    /// Results that would not tighten the window (stale lanes) leave it
    /// unchanged.
    pub fn observe(&mut self, lane: usize, block: u64, probe: Probe) -> Step {
        let before = *self;
        match probe {
            Probe::Before => {
                if block > self.lower && self.upper.map_or(true, |u| block < u) {
                    self.lower = block;
                }
            }
            Probe::Missing | Probe::AtOrAfter => {
                if block > self.lower && self.upper.map_or(true, |u| block < u) {
                    self.upper = Some(block);
                }
            }
        }
        if *self != before {
            tracing::debug!(lower = self.lower, upper = ?self.upper, "search window narrowed");
        }

        if self.is_closed() {
            Step::Found(self.lower)
        } else {
            Step::Probe(self.next_probe(lane))
        }
    }

    /// Lanes split an open window into quarters; an unbounded window grows
    /// geometrically from `lower`.
    fn next_probe(&self, lane: usize) -> u64 {
        let lane = lane as u64;
        match self.upper {
            Some(upper) => {
                let span = upper - self.lower;
                let guess = self.lower + span * (lane + 1) / 4;
                guess.clamp(self.lower + 1, upper - 1)
            }
            None => {
                let factor = 0.75 * lane as f64 + 1.75;
                ((self.lower as f64 * factor) as u64).max(self.lower + 1)
            }
        }
    }
}

type ProbeFuture = BoxFuture<'static, (usize, u64, Result<Value, FeedError>)>;

/// Resolves start blocks over an [`RpcClient`].
#[derive(Clone)]
pub struct BlockLocator {
    client: RpcClient,
    methods: ChainMethods,
}

impl BlockLocator {
    pub fn new(client: RpcClient, methods: ChainMethods) -> Self {
        Self { client, methods }
    }

    /// The block at or just before `target`, or the last irreversible block
    /// when `target` is `None`.
    ///
    /// A target before the first block resolves to 0.
    pub async fn locate(&self, target: Option<DateTime<Utc>>) -> Result<u64, FeedError> {
        // Between a reply and the next lookup the queue is empty.
        let _hold = self.client.hold();
        match target {
            None => self.irreversible_head().await,
            Some(t) => self.bisect(t).await,
        }
    }

    /// Last irreversible block number from the global properties.
    pub async fn irreversible_head(&self) -> Result<u64, FeedError> {
        let props = self
            .client
            .request(self.methods.global_properties.as_str(), vec![])
            .await?;
        props
            .get(&self.methods.irreversible_field)
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                FeedError::Decode(format!(
                    "global properties lack '{}'",
                    self.methods.irreversible_field
                ))
            })
    }

    async fn bisect(&self, target: DateTime<Utc>) -> Result<u64, FeedError> {
        tracing::info!(target = %target, "locating block");
        let mut window = SearchWindow::new();
        let mut probes: FuturesUnordered<ProbeFuture> = FuturesUnordered::new();
        for (lane, block) in SEED_PROBES.into_iter().enumerate() {
            probes.push(self.probe(lane, block));
        }

        while let Some((lane, block, result)) = probes.next().await {
            let probe = Probe::classify(&result?, target);
            match window.observe(lane, block, probe) {
                Step::Found(found) => {
                    tracing::info!(block = found, target = %target, "located block");
                    return Ok(found);
                }
                Step::Probe(next) => probes.push(self.probe(lane, next)),
            }
        }
        Err(FeedError::Other("block search ran out of probes".into()))
    }

    fn probe(&self, lane: usize, block: u64) -> ProbeFuture {
        let client = self.client.clone();
        let method = self.methods.get_block.clone();
        async move {
            let result = client
                .request(method, vec![json!(block)])
                .await
                .map_err(FeedError::from);
            (lane, block, result)
        }
        .boxed()
    }
}
