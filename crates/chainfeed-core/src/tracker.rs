//! Chain tracker: follows the chain from a located start block and feeds
//! every fetched block through the decoder to the registered consumers.
//!
//! # Flow
//! ```text
//! start() ── BlockLocator ──► ChainCursor::start ──► get_block × N
//!                                                          │
//!     ┌──────────── on_result (inside the client driver) ◄─┘
//!     ▼
//! null  → ChainCursor::on_missing ──► re-probe the head / park the block as lapsed
//! block → BlockDecoder::decode ──► HandlerRegistry::dispatch
//!       → ChainCursor::on_found ──► next fetch (+1 while behind)
//! ```
//!
//! Blocks are dispatched in the order their replies arrive, which is not
//! necessarily block-number order.

use std::sync::{Arc, Mutex, MutexGuard};

use chainfeed_rpc::{RpcClient, RpcTransport};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::config::{rewind_target, TrackerConfig};
use crate::cursor::ChainCursor;
use crate::decoder::BlockDecoder;
use crate::error::FeedError;
use crate::handler::{Consumer, HandlerFn, HandlerRegistry};
use crate::locator::BlockLocator;
use crate::types::block_time;

struct TrackerState {
    cursor: ChainCursor,
    decoder: BlockDecoder,
    registry: HandlerRegistry,
    blocks_dispatched: u64,
}

/// Shared between the tracker handle and every `get_block` callback.
#[derive(Clone)]
struct Fetcher {
    state: Arc<Mutex<TrackerState>>,
    get_block: Arc<str>,
}

impl Fetcher {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fetch_all(&self, client: &RpcClient, blocks: Vec<u64>) {
        for block in blocks {
            self.fetch(client, block);
        }
    }

    fn fetch(&self, client: &RpcClient, block: u64) {
        let on_result = self.clone();
        let on_error = self.clone();
        client
            .call(&*self.get_block, vec![json!(block)])
            .on_result(move |value, client| on_result.on_block(block, value, client))
            .on_error(move |err, client| {
                tracing::warn!(block, error = %err, "get_block failed, treating block as missing");
                on_error.on_block(block, Value::Null, client);
            })
            .send();
    }

    fn on_block(&self, block: u64, value: Value, client: &RpcClient) {
        let next = {
            let mut state = self.lock();
            if value.is_object() {
                let TrackerState {
                    cursor,
                    decoder,
                    registry,
                    blocks_dispatched,
                } = &mut *state;
                let stats = decoder.decode(&value, registry, client);
                *blocks_dispatched += 1;
                tracing::trace!(
                    block,
                    transactions = stats.transactions,
                    operations = stats.operations_dispatched,
                    "block dispatched"
                );
                cursor.on_found(block, block_time(&value), Utc::now())
            } else {
                state.cursor.on_missing(block)
            }
        };
        self.fetch_all(client, next);
    }
}

/// A handle on a running chain follower. Cheap to clone.
///
/// Handlers run with the tracker state locked: they may issue calls on the
/// client they are given but must not call back into the tracker.
#[derive(Clone)]
pub struct ChainTracker {
    client: RpcClient,
    fetcher: Fetcher,
    locator: BlockLocator,
    rewind_secs: Option<u64>,
}

impl ChainTracker {
    /// Build a tracker on top of an existing client.
    pub fn new(client: RpcClient, config: &TrackerConfig) -> Self {
        let state = TrackerState {
            cursor: ChainCursor::new(config.initial_batch_size),
            decoder: BlockDecoder::new(),
            registry: HandlerRegistry::new(),
            blocks_dispatched: 0,
        };
        Self {
            locator: BlockLocator::new(client.clone(), config.methods.clone()),
            client,
            fetcher: Fetcher {
                state: Arc::new(Mutex::new(state)),
                get_block: Arc::from(config.methods.get_block.as_str()),
            },
            rewind_secs: config.rewind_secs,
        }
    }

    /// Spawn a client for `config.client` and build a tracker on it.
    pub fn spawn(
        config: TrackerConfig,
        transport: Arc<dyn RpcTransport>,
    ) -> Result<(Self, JoinHandle<()>), FeedError> {
        config.validate()?;
        let (client, join) = RpcClient::spawn(config.client.clone(), transport)?;
        Ok((Self::new(client, &config), join))
    }

    /// Locate the start block and issue the initial burst of fetches.
    /// Returns the start block. Consumers registered before this call see
    /// every block from the start.
    pub async fn start(&self) -> Result<u64, FeedError> {
        let _hold = self.client.hold();
        let target = rewind_target(self.rewind_secs, Utc::now())?;
        let from = self.locator.locate(target).await?;
        tracing::info!(block = from, rewind_secs = ?self.rewind_secs, "starting chain tracker");

        let burst = self.fetcher.lock().cursor.start(from);
        self.fetcher.fetch_all(&self.client, burst);
        Ok(from)
    }

    /// Register every subscription of `consumer` under `consumer_id`.
    pub fn register_consumer<C: Consumer>(&self, consumer_id: &str, consumer: Arc<C>) {
        self.fetcher.lock().registry.register_consumer(consumer_id, consumer);
    }

    /// Register a single handler for `event` under `consumer_id`.
    pub fn register(&self, event: &str, consumer_id: &str, handler: HandlerFn) {
        self.fetcher.lock().registry.register(event, consumer_id, handler);
    }

    /// Copy of the cursor.
    pub fn snapshot(&self) -> ChainCursor {
        self.fetcher.lock().cursor.clone()
    }

    /// Blocks decoded and dispatched so far.
    pub fn blocks_dispatched(&self) -> u64 {
        self.fetcher.lock().blocks_dispatched
    }

    pub fn is_synced(&self) -> bool {
        self.fetcher.lock().cursor.synced
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Stop the underlying client.
    pub fn shutdown(&self) {
        self.client.shutdown();
    }
}
