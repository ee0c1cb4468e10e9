//! chainfeed-core: follow a Steem-style chain and fan its contents out to
//! consumers.
//!
//! # Architecture
//!
//! ```text
//! FeedBuilder → TrackerConfig → ChainTracker
//!                                   ├── BlockLocator   (time → block number bisection)
//!                                   ├── ChainCursor    (fetch scheduling, sync detection)
//!                                   ├── BlockDecoder   (block, transaction, op, calendar events)
//!                                   ├── HandlerRegistry (per-event consumer handlers)
//!                                   └── RpcClient      (chainfeed-rpc: batching, rotation)
//! ```

pub mod config;
pub mod cursor;
pub mod decoder;
pub mod error;
pub mod handler;
pub mod locator;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{rewind_target, ChainMethods, FeedBuilder, TrackerConfig, MAX_REWIND_SECS};
pub use cursor::ChainCursor;
pub use decoder::{BlockDecoder, DecodeStats};
pub use error::FeedError;
pub use handler::{handler_fn, Consumer, HandlerFn, HandlerRegistry};
pub use locator::{BlockLocator, Probe, SearchWindow, Step};
pub use tracker::ChainTracker;
pub use types::{BlockMeta, CalendarEvent, TransactionMeta};
