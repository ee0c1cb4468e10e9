//! Turns raw blocks into block, transaction, operation and calendar events.

use std::collections::HashSet;

use chainfeed_rpc::RpcClient;
use chrono::{DateTime, Timelike, Utc};
use serde_json::{Map, Value};

use crate::handler::HandlerRegistry;
use crate::types::{
    parse_block_time, BlockMeta, CalendarEvent, TransactionMeta, EVENT_BLOCK, EVENT_DAY,
    EVENT_HOUR, EVENT_TRANSACTION, EVENT_WEEK,
};

/// What decoding one block produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Calendar events fired, in order.
    pub calendar: Vec<&'static str>,
    pub transactions: usize,
    /// Operations that had at least one handler.
    pub operations_dispatched: usize,
    /// Operation types seen for the first time with no handler.
    pub first_unhandled: Vec<String>,
}

/// Decoder state carried across blocks.
#[derive(Debug, Default)]
pub struct BlockDecoder {
    /// Block time of the last calendar step.
    clock: Option<DateTime<Utc>>,
    seen_ops: HashSet<String>,
}

impl BlockDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `block` and dispatch every event it yields through `registry`.
    pub fn decode(
        &mut self,
        block: &Value,
        registry: &HandlerRegistry,
        client: &RpcClient,
    ) -> DecodeStats {
        let mut stats = DecodeStats::default();
        let timestamp = block.get("timestamp").and_then(Value::as_str).unwrap_or_default();

        match parse_block_time(timestamp) {
            Some(t) => {
                for event in self.tick(t) {
                    let payload =
                        serde_json::to_value(CalendarEvent::from_time(&t)).unwrap_or_default();
                    registry.dispatch(event, timestamp, &payload, client);
                    stats.calendar.push(event);
                }
            }
            None => {
                tracing::warn!(timestamp, "unparseable block timestamp, skipping calendar events")
            }
        }

        let block_meta = BlockMeta::from_block(block);
        if registry.has_handlers(EVENT_BLOCK) {
            let payload = serde_json::to_value(&block_meta).unwrap_or_default();
            registry.dispatch(EVENT_BLOCK, timestamp, &payload, client);
        }

        let Some(transactions) = block.get("transactions").and_then(Value::as_array) else {
            return stats;
        };
        let ids = block.get("transaction_ids").and_then(Value::as_array);

        for (index, tx) in transactions.iter().enumerate() {
            stats.transactions += 1;
            let id = ids.and_then(|ids| ids.get(index)).and_then(Value::as_str);
            let tx_meta = TransactionMeta::from_transaction(&block_meta, tx, id);
            let tx_meta_value = serde_json::to_value(&tx_meta).unwrap_or_default();

            if registry.has_handlers(EVENT_TRANSACTION) {
                registry.dispatch(EVENT_TRANSACTION, timestamp, &tx_meta_value, client);
            }

            let Some(operations) = tx.get("operations").and_then(Value::as_array) else {
                continue;
            };
            for (operation_no, op) in operations.iter().enumerate() {
                let Some((name, body)) = split_operation(op) else {
                    tracing::debug!(operation_no, "skipping malformed operation");
                    continue;
                };

                if !registry.has_handlers(&name) {
                    if self.seen_ops.insert(name.clone()) {
                        tracing::info!(op = %name, "operation type not handled by any consumer");
                        stats.first_unhandled.push(name);
                    }
                    continue;
                }
                self.seen_ops.insert(name.clone());

                let mut payload = body.clone();
                payload.insert("operation_no".into(), Value::from(operation_no));
                payload.insert("transaction_meta".into(), tx_meta_value.clone());
                registry.dispatch(&name, timestamp, &Value::Object(payload), client);
                stats.operations_dispatched += 1;
            }
        }
        stats
    }

    /// Advance the block clock to `t`; returns the calendar events due.
    ///
    /// The first block only sets the clock. Afterwards an hour boundary
    /// fires when `t` is later than the clock and its hour differs.
    fn tick(&mut self, t: DateTime<Utc>) -> Vec<&'static str> {
        let Some(last) = self.clock else {
            self.clock = Some(t);
            return vec![];
        };
        if t <= last || t.hour() == last.hour() {
            return vec![];
        }
        self.clock = Some(t);

        let cal = CalendarEvent::from_time(&t);
        let mut events = vec![EVENT_HOUR];
        if cal.is_midnight() {
            events.push(EVENT_DAY);
        }
        if cal.is_week_start() {
            events.push(EVENT_WEEK);
        }
        events
    }
}

/// Split an operation into its type name and object payload.
///
/// Accepts the legacy `[name, {..}]` pair and the appbase
/// `{"type": "vote_operation", "value": {..}}` form.
fn split_operation(op: &Value) -> Option<(String, &Map<String, Value>)> {
    match op {
        Value::Array(pair) if pair.len() == 2 => {
            let name = pair[0].as_str()?;
            Some((name.to_string(), pair[1].as_object()?))
        }
        Value::Object(obj) => {
            let kind = obj.get("type")?.as_str()?;
            let name = kind.strip_suffix("_operation").unwrap_or(kind);
            Some((name.to_string(), obj.get("value")?.as_object()?))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use crate::handler::handler_fn;
    use crate::testing::offline_client;

    type Log = Arc<Mutex<Vec<(String, String, Value)>>>;

    fn recorder(registry: &mut HandlerRegistry, events: &[&str]) -> Log {
        let log: Log = Arc::default();
        for event in events {
            let log = log.clone();
            let name = event.to_string();
            registry.register(
                *event,
                "recorder",
                handler_fn(move |ts, payload, _| {
                    log.lock().unwrap().push((name.clone(), ts.to_string(), payload.clone()));
                    Ok(())
                }),
            );
        }
        log
    }

    fn block(ts: &str) -> Value {
        json!({
            "timestamp": ts,
            "witness": "alice",
            "block_id": "00000001aa",
            "previous": "0000000000",
            "transaction_ids": ["tx-a"],
            "transactions": [{
                "ref_block_num": 7,
                "ref_block_prefix": 1234,
                "expiration": "2018-03-12T11:00:30",
                "operations": [
                    ["vote", {"voter": "bob", "weight": 10000}],
                    ["comment", {"author": "carol"}],
                ],
            }],
        })
    }

    #[tokio::test]
    async fn hour_fires_once_on_boundary() {
        let client = offline_client();
        let mut registry = HandlerRegistry::new();
        let log = recorder(&mut registry, &[EVENT_HOUR, EVENT_DAY, EVENT_WEEK]);
        let mut decoder = BlockDecoder::new();

        let a = decoder.decode(&block("2018-03-13T10:59:50"), &registry, &client);
        let b = decoder.decode(&block("2018-03-13T11:00:05"), &registry, &client);
        let c = decoder.decode(&block("2018-03-13T11:00:20"), &registry, &client);

        assert!(a.calendar.is_empty());
        assert_eq!(b.calendar, vec![EVENT_HOUR]);
        assert!(c.calendar.is_empty());

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].1, "2018-03-13T11:00:05");
        assert_eq!(
            log[0].2,
            json!({"year": 2018, "month": 3, "day": 13, "weekday": 1, "hour": 11})
        );
    }

    #[tokio::test]
    async fn monday_midnight_fires_day_and_week() {
        let client = offline_client();
        let registry = HandlerRegistry::new();
        let mut decoder = BlockDecoder::new();

        decoder.decode(&block("2018-03-11T23:59:57"), &registry, &client);
        let stats = decoder.decode(&block("2018-03-12T00:00:00"), &registry, &client);
        assert_eq!(stats.calendar, vec![EVENT_HOUR, EVENT_DAY, EVENT_WEEK]);

        decoder.decode(&block("2018-03-12T23:59:57"), &registry, &client);
        let stats = decoder.decode(&block("2018-03-13T00:00:00"), &registry, &client);
        assert_eq!(stats.calendar, vec![EVENT_HOUR, EVENT_DAY]);
    }

    #[tokio::test]
    async fn older_block_does_not_move_clock() {
        let client = offline_client();
        let registry = HandlerRegistry::new();
        let mut decoder = BlockDecoder::new();

        decoder.decode(&block("2018-03-13T11:00:05"), &registry, &client);
        let stale = decoder.decode(&block("2018-03-13T10:59:59"), &registry, &client);
        assert!(stale.calendar.is_empty());
        let same_hour = decoder.decode(&block("2018-03-13T11:30:00"), &registry, &client);
        assert!(same_hour.calendar.is_empty());
    }

    #[tokio::test]
    async fn unhandled_operation_logged_once_and_not_dispatched() {
        let client = offline_client();
        let mut registry = HandlerRegistry::new();
        let log = recorder(&mut registry, &["comment"]);
        let mut decoder = BlockDecoder::new();

        let first = decoder.decode(&block("2018-03-13T10:00:00"), &registry, &client);
        let second = decoder.decode(&block("2018-03-13T10:00:03"), &registry, &client);

        assert_eq!(first.first_unhandled, vec!["vote".to_string()]);
        assert!(second.first_unhandled.is_empty());
        assert_eq!(first.operations_dispatched, 1);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|(event, _, _)| event == "comment"));
    }

    #[tokio::test]
    async fn operation_payload_is_annotated() {
        let client = offline_client();
        let mut registry = HandlerRegistry::new();
        let log = recorder(&mut registry, &["vote", EVENT_TRANSACTION, EVENT_BLOCK]);
        let mut decoder = BlockDecoder::new();

        decoder.decode(&block("2018-03-13T10:00:00"), &registry, &client);

        let log = log.lock().unwrap();
        let events: Vec<&str> = log.iter().map(|(e, _, _)| e.as_str()).collect();
        assert_eq!(events, vec![EVENT_BLOCK, EVENT_TRANSACTION, "vote"]);

        let block_meta = json!({
            "witness": "alice",
            "block_id": "00000001aa",
            "previous": "0000000000",
        });
        assert_eq!(log[0].2, block_meta);
        let tx_meta = json!({
            "block_meta": block_meta,
            "id": "tx-a",
            "ref_block_prefix": 1234,
            "ref_block_num": 7,
            "expiration": "2018-03-12T11:00:30",
        });
        assert_eq!(log[1].2, tx_meta);
        assert_eq!(
            log[2].2,
            json!({"voter": "bob", "weight": 10000, "operation_no": 0, "transaction_meta": tx_meta})
        );
    }

    #[tokio::test]
    async fn appbase_operations_are_accepted() {
        let client = offline_client();
        let mut registry = HandlerRegistry::new();
        let log = recorder(&mut registry, &["transfer"]);
        let mut decoder = BlockDecoder::new();

        let blk = json!({
            "timestamp": "2018-03-13T10:00:00",
            "transactions": [{"operations": [
                {"type": "transfer_operation", "value": {"from": "a", "to": "b"}},
                {"type": "transfer_operation", "value": "not an object"},
                ["transfer"],
            ]}],
        });
        let stats = decoder.decode(&blk, &registry, &client);

        assert_eq!(stats.operations_dispatched, 1);
        let log = log.lock().unwrap();
        assert_eq!(log[0].2["from"], "a");
        assert_eq!(log[0].2["operation_no"], 0);
        assert_eq!(log[0].2["transaction_meta"]["block_meta"], json!({}));
    }

    #[tokio::test]
    async fn bad_timestamp_skips_only_calendar() {
        let client = offline_client();
        let mut registry = HandlerRegistry::new();
        let log = recorder(&mut registry, &["vote"]);
        let mut decoder = BlockDecoder::new();

        let stats = decoder.decode(&block("not a time"), &registry, &client);
        assert!(stats.calendar.is_empty());
        assert_eq!(stats.operations_dispatched, 1);
        assert_eq!(log.lock().unwrap()[0].1, "not a time");
    }
}
