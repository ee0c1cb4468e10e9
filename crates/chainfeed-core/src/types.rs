//! Shared types for the ingestion pipeline.

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Event types ──────────────────────────────────────────────────────────────

/// Fired once per fetched block with its [`BlockMeta`].
pub const EVENT_BLOCK: &str = "block";
/// Fired once per transaction with its [`TransactionMeta`].
pub const EVENT_TRANSACTION: &str = "transaction";
/// Fired when the block clock enters a new hour.
pub const EVENT_HOUR: &str = "hour";
/// Fired alongside `hour` when the new hour is midnight.
pub const EVENT_DAY: &str = "day";
/// Fired alongside `day` when midnight falls on a Monday.
pub const EVENT_WEEK: &str = "week";

// ─── BlockMeta ────────────────────────────────────────────────────────────────

/// Block-level metadata copied from the raw block. Absent fields stay absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witness_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_merkle_root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witness: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
}

impl BlockMeta {
    /// Extract the metadata fields from a raw block object.
    pub fn from_block(block: &Value) -> Self {
        let field = |k: &str| block.get(k).and_then(Value::as_str).map(str::to_string);
        Self {
            witness_signature: field("witness_signature"),
            block_id: field("block_id"),
            signing_key: field("signing_key"),
            transaction_merkle_root: field("transaction_merkle_root"),
            witness: field("witness"),
            previous: field("previous"),
        }
    }
}

// ─── TransactionMeta ──────────────────────────────────────────────────────────

/// Transaction-level metadata: the enclosing block's metadata plus the
/// transaction id and reference fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMeta {
    pub block_meta: BlockMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_block_prefix: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_block_num: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
}

impl TransactionMeta {
    /// Build from a raw transaction object and its id (if the block lists one).
    pub fn from_transaction(block_meta: &BlockMeta, tx: &Value, id: Option<&str>) -> Self {
        Self {
            block_meta: block_meta.clone(),
            id: id.map(str::to_string),
            ref_block_prefix: tx.get("ref_block_prefix").and_then(Value::as_u64),
            ref_block_num: tx.get("ref_block_num").and_then(Value::as_u64),
            expiration: tx
                .get("expiration")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

// ─── CalendarEvent ────────────────────────────────────────────────────────────

/// Payload of the `hour`, `day` and `week` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    /// Monday = 0 … Sunday = 6.
    pub weekday: u32,
    pub hour: u32,
}

impl CalendarEvent {
    pub fn from_time(t: &DateTime<Utc>) -> Self {
        Self {
            year: t.year(),
            month: t.month(),
            day: t.day(),
            weekday: t.weekday().num_days_from_monday(),
            hour: t.hour(),
        }
    }

    pub fn is_midnight(&self) -> bool {
        self.hour == 0
    }

    /// Midnight on the first day of the week.
    pub fn is_week_start(&self) -> bool {
        self.is_midnight() && self.weekday == 0
    }
}

// ─── Timestamps ───────────────────────────────────────────────────────────────

/// Parse a block timestamp.
///
/// Nodes send UTC times without an offset (`2018-03-14T12:34:56`); RFC 3339
/// strings with an explicit offset are accepted too.
pub fn parse_block_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Timestamp of a raw block, if present and parseable.
pub fn block_time(block: &Value) -> Option<DateTime<Utc>> {
    block
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_block_time)
}

/// Whole seconds `now` is ahead of `then`, clamped at zero.
pub fn lag_secs(now: DateTime<Utc>, then: DateTime<Utc>) -> u64 {
    (now - then).num_seconds().max(0) as u64
}

// ─── Tests ────────────────────────────────────────────────────────────────────
