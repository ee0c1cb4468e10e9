//! Consumer trait, handler registry and isolated dispatch.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chainfeed_rpc::RpcClient;
use serde_json::Value;

use crate::error::FeedError;

/// A registered handler: `(timestamp, payload, client)`.
pub type HandlerFn =
    Arc<dyn Fn(&str, &Value, &RpcClient) -> Result<(), FeedError> + Send + Sync + 'static>;

/// Wrap a closure as a [`HandlerFn`].
pub fn handler_fn<F>(f: F) -> HandlerFn
where
    F: Fn(&str, &Value, &RpcClient) -> Result<(), FeedError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A consumer of chain events.
///
/// The consumer declares up front which event types it handles: any of
/// `block`, `transaction`, `hour`, `day`, `week`, or an operation type name
/// as it appears on chain (e.g. `vote`, `comment`, `transfer`).
pub trait Consumer: Send + Sync + 'static {
    /// Event types this consumer wants delivered.
    fn subscriptions(&self) -> Vec<String>;

    /// Called for every event of a subscribed type.
    fn handle(
        &self,
        event: &str,
        timestamp: &str,
        payload: &Value,
        client: &RpcClient,
    ) -> Result<(), FeedError>;
}

/// Event type → consumer id → handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BTreeMap<String, HandlerFn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event` under `consumer_id`, replacing any
    /// handler that consumer already had for that event.
    pub fn register(
        &mut self,
        event: impl Into<String>,
        consumer_id: impl Into<String>,
        handler: HandlerFn,
    ) {
        self.handlers
            .entry(event.into())
            .or_default()
            .insert(consumer_id.into(), handler);
    }

    /// Register every subscription of `consumer` under `consumer_id`.
    pub fn register_consumer<C: Consumer>(&mut self, consumer_id: &str, consumer: Arc<C>) {
        for event in consumer.subscriptions() {
            let c = consumer.clone();
            let name = event.clone();
            let handler =
                handler_fn(move |ts, payload, client| c.handle(&name, ts, payload, client));
            tracing::debug!(consumer = consumer_id, event = %event, "registering handler");
            self.register(event, consumer_id, handler);
        }
    }

    /// `true` if at least one consumer handles `event`.
    pub fn has_handlers(&self, event: &str) -> bool {
        self.handlers.get(event).is_some_and(|m| !m.is_empty())
    }

    /// Number of consumers registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.get(event).map_or(0, BTreeMap::len)
    }

    /// Invoke every handler for `event`.
    ///
    /// Each invocation is isolated: an `Err` or a panic is logged with the
    /// consumer id and event type and the remaining handlers still run.
    /// Returns the number of handlers that completed successfully.
    pub fn dispatch(
        &self,
        event: &str,
        timestamp: &str,
        payload: &Value,
        client: &RpcClient,
    ) -> usize {
        let Some(handlers) = self.handlers.get(event) else {
            return 0;
        };

        let mut ok = 0;
        for (consumer, handler) in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(timestamp, payload, client)));
            let failure = match outcome {
                Ok(Ok(())) => {
                    ok += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "handler panicked".to_string(),
            };
            let err = FeedError::Handler {
                consumer: consumer.clone(),
                event: event.to_string(),
                reason: failure,
            };
            tracing::error!(consumer = %consumer, event, error = %err, "handler failed");
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::testing::offline_client as client;

    fn counting(count: &Arc<AtomicU32>) -> HandlerFn {
        let count = count.clone();
        handler_fn(move |_, _, _| {
            count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    struct Voter(Arc<AtomicU32>);

    impl Consumer for Voter {
        fn subscriptions(&self) -> Vec<String> {
            vec!["vote".into(), "block".into()]
        }
        fn handle(
            &self,
            event: &str,
            _ts: &str,
            _p: &Value,
            _c: &RpcClient,
        ) -> Result<(), FeedError> {
            if event == "vote" {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_siblings() {
        let client = client();
        let count = Arc::new(AtomicU32::new(0));

        let mut registry = HandlerRegistry::new();
        let broken = handler_fn(|_, _, _| Err(FeedError::Other("boom".into())));
        registry.register("block", "a-broken", broken);
        registry.register("block", "b-panics", handler_fn(|_, _, _| panic!("bot bug")));
        registry.register("block", "c-counter", counting(&count));

        let ok = registry.dispatch("block", "2018-03-12T00:00:03", &Value::Null, &client);
        assert_eq!(ok, 1);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn reregistering_replaces_handler() {
        let client = client();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let mut registry = HandlerRegistry::new();
        registry.register("hour", "bot", counting(&first));
        registry.register("hour", "bot", counting(&second));
        assert_eq!(registry.handler_count("hour"), 1);

        registry.dispatch("hour", "", &Value::Null, &client);
        assert_eq!(first.load(Ordering::Relaxed), 0);
        assert_eq!(second.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn consumer_registers_declared_events() {
        let client = client();
        let votes = Arc::new(AtomicU32::new(0));

        let mut registry = HandlerRegistry::new();
        registry.register_consumer("voter", Arc::new(Voter(votes.clone())));

        assert!(registry.has_handlers("vote"));
        assert!(registry.has_handlers("block"));
        assert!(!registry.has_handlers("comment"));

        registry.dispatch("vote", "", &Value::Null, &client);
        registry.dispatch("comment", "", &Value::Null, &client);
        assert_eq!(votes.load(Ordering::Relaxed), 1);
    }
}
