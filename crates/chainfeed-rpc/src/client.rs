//! The batching RPC client: a cloneable handle plus one driver task.
//!
//! # Model
//! ```text
//! RpcClient::call() ──► mpsc ──► ClientDriver ──► CallQueue ──► Batch ──► RpcTransport
//!        ▲                              │
//!        └──── callbacks (on_result / on_error) run inside the driver ◄── reply
//! ```
//!
//! The driver task owns the queue, the endpoint set and every in-flight
//! batch future, so all bookkeeping and all callbacks run on one control
//! flow, one at a time. Callbacks get a `&RpcClient` and may issue new
//! calls; those are picked up on the next pump.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::endpoint::EndpointSet;
use crate::error::TransportError;
use crate::queue::{Batch, CallQueue, PendingCall};
use crate::request::RpcError;
use crate::transport::RpcTransport;

enum Command {
    Enqueue(PendingCall),
    /// A [`ClientHold`] was released; re-check the drained condition.
    Wake,
    Shutdown,
}

/// Handle for issuing JSON-RPC calls. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    holds: Arc<AtomicUsize>,
}

impl RpcClient {
    /// Start a driver task for `config` on the current Tokio runtime.
    ///
    /// The returned `JoinHandle` completes when the driver stops: after
    /// [`shutdown`](Self::shutdown), once every handle has been dropped, or
    /// once drained when `stop_when_empty` is set.
    pub fn spawn(
        config: ClientConfig,
        transport: Arc<dyn RpcTransport>,
    ) -> Result<(Self, JoinHandle<()>), TransportError> {
        config.validate()?;
        let endpoints = EndpointSet::new(
            config.endpoints.clone(),
            config.rpc_timeout(),
            config.parallel,
        )
        .ok_or_else(|| TransportError::InvalidConfig("endpoint list is empty".into()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            holds: Arc::new(AtomicUsize::new(0)),
        };

        let driver = ClientDriver {
            rx,
            weak_tx: client.tx.downgrade(),
            next_id: client.next_id.clone(),
            holds: client.holds.clone(),
            queue: CallQueue::new(config.max_batch_size, config.parallel),
            endpoints,
            transport,
            config,
            in_flight: FuturesUnordered::new(),
            seen_work: false,
            drained_reported: false,
        };
        let join = tokio::spawn(driver.run());
        Ok((client, join))
    }

    /// Start building a call to `method` with positional `params`.
    pub fn call(&self, method: impl Into<String>, params: Vec<Value>) -> CallBuilder<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        CallBuilder {
            client: self,
            call: PendingCall::new(id, method, params),
        }
    }

    /// Issue a call and wait for its outcome.
    pub async fn request(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<Value, TransportError> {
        let (tx, rx) = oneshot::channel::<Result<Value, RpcError>>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let err_slot = slot.clone();

        self.call(method, params)
            .on_result(move |value, _| deliver(&slot, Ok(value)))
            .on_error(move |err, _| deliver(&err_slot, Err(err)))
            .send();

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(TransportError::Rpc(err)),
            Err(_) => Err(TransportError::ClientClosed),
        }
    }

    /// Issue a call and deserialize its result.
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<T, TransportError> {
        let value = self.request(method, params).await?;
        serde_json::from_value(value).map_err(TransportError::Deserialization)
    }

    /// Keep the driver from treating an empty queue as drained until the
    /// returned guard is dropped. Use this across an `await` that is about
    /// to issue more calls.
    pub fn hold(&self) -> ClientHold {
        self.holds.fetch_add(1, Ordering::SeqCst);
        ClientHold {
            client: self.clone(),
        }
    }

    /// Ask the driver to stop. Unresolved calls are dropped.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    /// `true` once the driver has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Guard returned by [`RpcClient::hold`].
#[must_use = "the hold is released as soon as the guard is dropped"]
pub struct ClientHold {
    client: RpcClient,
}

impl Drop for ClientHold {
    fn drop(&mut self) {
        self.client.holds.fetch_sub(1, Ordering::SeqCst);
        let _ = self.client.tx.send(Command::Wake);
    }
}

fn deliver(
    slot: &Mutex<Option<oneshot::Sender<Result<Value, RpcError>>>>,
    outcome: Result<Value, RpcError>,
) {
    let sender = slot.lock().ok().and_then(|mut guard| guard.take());
    if let Some(tx) = sender {
        let _ = tx.send(outcome);
    }
}

/// A call being assembled; nothing is queued until [`send`](Self::send).
#[must_use = "a call is only queued once `send` is called"]
pub struct CallBuilder<'a> {
    client: &'a RpcClient,
    call: PendingCall,
}

impl CallBuilder<'_> {
    /// Set the callback for a successful result (including `null`).
    pub fn on_result<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Value, &RpcClient) + Send + 'static,
    {
        self.call.on_result = Some(Box::new(f));
        self
    }

    /// Set the callback for a JSON-RPC error object.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(RpcError, &RpcClient) + Send + 'static,
    {
        self.call.on_error = Some(Box::new(f));
        self
    }

    /// Queue the call and return its id.
    pub fn send(self) -> u64 {
        let id = self.call.id;
        if self.client.tx.send(Command::Enqueue(self.call)).is_err() {
            tracing::warn!(id, "call issued after the client stopped");
        }
        id
    }
}

type InFlight = BoxFuture<'static, (Batch, Result<Value, TransportError>)>;

enum DriverEvent {
    Command(Option<Command>),
    Completed(Batch, Result<Value, TransportError>),
}

struct ClientDriver {
    rx: mpsc::UnboundedReceiver<Command>,
    /// Weak so that dropping the last `RpcClient` closes the channel.
    weak_tx: mpsc::WeakUnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    holds: Arc<AtomicUsize>,
    queue: CallQueue,
    endpoints: EndpointSet,
    transport: Arc<dyn RpcTransport>,
    config: ClientConfig,
    in_flight: FuturesUnordered<InFlight>,
    seen_work: bool,
    drained_reported: bool,
}

impl ClientDriver {
    async fn run(mut self) {
        tracing::info!(
            endpoint = %self.endpoints.current(),
            transport = self.transport.name(),
            max_batch_size = self.config.max_batch_size,
            parallel = self.config.parallel,
            "starting RPC client"
        );

        loop {
            // Pick up everything issued since the last turn, including calls
            // made from inside callbacks.
            loop {
                match self.rx.try_recv() {
                    Ok(Command::Enqueue(call)) => self.enqueue(call),
                    Ok(Command::Wake) => {}
                    Ok(Command::Shutdown) => return self.stop("shutdown requested"),
                    Err(TryRecvError::Disconnected) => return self.stop("all handles dropped"),
                    Err(TryRecvError::Empty) => break,
                }
            }

            self.pump();

            let held = self.holds.load(Ordering::SeqCst) > 0;
            if self.queue.is_drained() && self.seen_work && !held && !self.drained_reported {
                self.drained_reported = true;
                tracing::info!("queue is empty and no requests remain in flight");
                if self.config.stop_when_empty {
                    return self.stop("drained");
                }
            }

            let event = tokio::select! {
                cmd = self.rx.recv() => DriverEvent::Command(cmd),
                Some((batch, outcome)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    DriverEvent::Completed(batch, outcome)
                }
            };

            match event {
                DriverEvent::Command(Some(Command::Enqueue(call))) => self.enqueue(call),
                DriverEvent::Command(Some(Command::Wake)) => {}
                DriverEvent::Command(Some(Command::Shutdown)) => {
                    return self.stop("shutdown requested");
                }
                DriverEvent::Command(None) => return self.stop("all handles dropped"),
                DriverEvent::Completed(batch, outcome) => self.finish(batch, outcome),
            }
        }
    }

    fn enqueue(&mut self, call: PendingCall) {
        self.seen_work = true;
        self.drained_reported = false;
        self.queue.push(call);
    }

    /// Send as many batches as the parallelism cap allows.
    fn pump(&mut self) {
        while let Some(batch) = self.queue.next_batch() {
            self.dispatch(batch);
        }
    }

    fn dispatch(&mut self, batch: Batch) {
        let endpoint = self.endpoints.current().to_string();
        let transport = self.transport.clone();
        let timeout = self.config.rpc_timeout();
        let body = batch.body.clone();

        tracing::trace!(endpoint = %endpoint, calls = batch.ids.len(), "dispatching batch");

        let fut = async move {
            let outcome = match tokio::time::timeout(timeout, transport.post(&endpoint, body)).await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    ms: timeout.as_millis() as u64,
                }),
            };
            (batch, outcome)
        };
        self.in_flight.push(fut.boxed());
    }

    /// A client for callbacks, or `None` once every user handle is gone.
    fn callback_client(&self) -> Option<RpcClient> {
        Some(RpcClient {
            tx: self.weak_tx.upgrade()?,
            next_id: self.next_id.clone(),
            holds: self.holds.clone(),
        })
    }

    fn finish(&mut self, batch: Batch, outcome: Result<Value, TransportError>) {
        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) if e.is_retryable() => return self.fail(batch, &e.to_string()),
            Err(e) => {
                // Not the endpoint's fault: retry the batch where it is.
                tracing::error!(
                    endpoint = %self.endpoints.current(),
                    calls = batch.ids.len(),
                    error = %e,
                    "transport error, requeueing without rotating"
                );
                self.queue.requeue(batch);
                return;
            }
        };

        match self.queue.complete(&batch, &reply) {
            Ok(resolved) => {
                let Some(client) = self.callback_client() else {
                    tracing::warn!(
                        calls = resolved.len(),
                        "all client handles dropped, discarding results"
                    );
                    return;
                };
                for (call, result) in resolved {
                    call.resolve(result, &client);
                }
            }
            Err(reason) => self.fail(batch, &reason),
        }
    }

    /// Failure path shared by network errors, timeouts and malformed
    /// replies: maybe rotate, then put the whole batch back at the front.
    fn fail(&mut self, batch: Batch, reason: &str) {
        tracing::warn!(
            endpoint = %self.endpoints.current(),
            calls = batch.ids.len(),
            reason,
            "batch failed, requeueing"
        );
        self.endpoints.report_failure(reason, Instant::now());
        self.queue.requeue(batch);
    }

    fn stop(&mut self, why: &str) {
        tracing::info!(
            reason = why,
            unresolved = self.queue.pending(),
            "stopping RPC client"
        );
        self.rx.close();
    }
}
