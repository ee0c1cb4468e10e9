//! Pending calls, the call queue and batch formation.
//!
//! Everything in this module is synchronous; the client driver owns one
//! [`CallQueue`] and is the only thing that mutates it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;

use crate::client::RpcClient;
use crate::request::{parse_reply, JsonRpcRequest, RpcError};

/// Callback invoked with a call's `result` value.
pub type ResultCallback = Box<dyn FnOnce(Value, &RpcClient) + Send + 'static>;

/// Callback invoked with a call's JSON-RPC error object.
pub type ErrorCallback = Box<dyn FnOnce(RpcError, &RpcClient) + Send + 'static>;

/// A queued remote call and its callbacks.
pub struct PendingCall {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
    pub(crate) on_result: Option<ResultCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl PendingCall {
    /// A call with no callbacks attached.
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            on_result: None,
            on_error: None,
        }
    }

    fn request(&self) -> JsonRpcRequest {
        JsonRpcRequest::new(self.id, self.method.clone(), self.params.clone())
    }

    /// Hand the outcome to the matching callback.
    ///
    /// A panicking callback is caught and logged; it never takes the driver down.
    pub(crate) fn resolve(self, outcome: Result<Value, RpcError>, client: &RpcClient) {
        let Self {
            id,
            method,
            on_result,
            on_error,
            ..
        } = self;

        let panicked = match outcome {
            Ok(value) => match on_result {
                Some(cb) => catch_unwind(AssertUnwindSafe(|| cb(value, client))).is_err(),
                None => {
                    tracing::error!(id, method = %method, "no result callback for call");
                    false
                }
            },
            Err(err) => match on_error {
                Some(cb) => catch_unwind(AssertUnwindSafe(|| cb(err, client))).is_err(),
                None => {
                    tracing::warn!(
                        id,
                        method = %method,
                        code = err.code,
                        message = %err.message,
                        "no error callback for call, dropping error"
                    );
                    false
                }
            },
        };

        if panicked {
            tracing::error!(id, method = %method, "callback panicked");
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// A group of call ids sent together as one request.
#[derive(Debug, Clone)]
pub struct Batch {
    pub ids: Vec<u64>,
    pub body: Value,
}

/// Ordered queue of call ids plus the id → call map.
///
/// Invariants: every queued id has an entry; an id is either queued or part
/// of exactly one in-flight batch, never both.
pub struct CallQueue {
    entries: HashMap<u64, PendingCall>,
    queue: VecDeque<u64>,
    in_flight: usize,
    max_batch_size: usize,
    parallel: usize,
}

impl CallQueue {
    pub fn new(max_batch_size: usize, parallel: usize) -> Self {
        Self {
            entries: HashMap::new(),
            queue: VecDeque::new(),
            in_flight: 0,
            max_batch_size: max_batch_size.max(1),
            parallel: parallel.max(1),
        }
    }

    /// Append a call to the back of the queue.
    pub fn push(&mut self, call: PendingCall) {
        let id = call.id;
        if self.entries.insert(id, call).is_some() {
            tracing::error!(id, "duplicate call id replaced");
            return;
        }
        self.queue.push_back(id);
    }

    /// Take the next batch from the front of the queue, if the parallelism
    /// cap allows another request in flight.
    pub fn next_batch(&mut self) -> Option<Batch> {
        if self.in_flight >= self.parallel || self.queue.is_empty() {
            return None;
        }
        let take = self.max_batch_size.min(self.queue.len());
        let ids: Vec<u64> = self.queue.drain(..take).collect();

        let mut requests: Vec<Value> = ids
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter_map(|call| serde_json::to_value(call.request()).ok())
            .collect();

        let body = if self.max_batch_size == 1 {
            requests.pop().unwrap_or(Value::Null)
        } else {
            Value::Array(requests)
        };

        self.in_flight += 1;
        Some(Batch { ids, body })
    }

    /// Return a failed batch's ids to the front of the queue, in their
    /// original order, ahead of already-queued work.
    pub fn requeue(&mut self, batch: Batch) {
        for id in batch.ids.into_iter().rev() {
            debug_assert!(self.entries.contains_key(&id));
            self.queue.push_front(id);
        }
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Match a reply against `batch`.
    ///
    /// The reply must cover every id of the batch exactly once and nothing
    /// else; otherwise nothing is resolved and the reason is returned so the
    /// caller can requeue the whole batch. On success the calls are removed
    /// from the map and returned with their outcomes.
    pub fn complete(
        &mut self,
        batch: &Batch,
        reply: &Value,
    ) -> Result<Vec<(PendingCall, Result<Value, RpcError>)>, String> {
        let entries = parse_reply(reply)?;

        let expected: HashSet<u64> = batch.ids.iter().copied().collect();
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !expected.contains(&entry.id) {
                return Err(format!("Invalid JSON-RPC id in entry {}", entry.id));
            }
            if !seen.insert(entry.id) {
                return Err(format!("duplicate JSON-RPC id {} in reply", entry.id));
            }
        }
        if seen.len() != expected.len() {
            return Err(format!(
                "reply covers {} of {} batched calls",
                seen.len(),
                expected.len()
            ));
        }

        self.in_flight = self.in_flight.saturating_sub(1);
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                self.entries
                    .remove(&entry.id)
                    .map(|call| (call, entry.outcome))
            })
            .collect())
    }

    /// Number of batches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Number of ids waiting to be batched.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Number of unresolved calls (queued or in flight).
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is queued and nothing is in flight.
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.in_flight == 0
    }
}
