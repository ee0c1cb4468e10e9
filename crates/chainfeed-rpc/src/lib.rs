//! chainfeed-rpc: batching JSON-RPC client with endpoint rotation.
//!
//! # Overview
//!
//! - [`RpcClient`]: cloneable handle; `call(method, params)` queues a call
//!   with optional result/error callbacks, `request` awaits one
//! - [`CallQueue`]: pending calls, batch formation, reply matching
//! - [`EndpointSet`]: ordered endpoints with damped rotation on failure
//! - [`RpcTransport`]: the network seam; [`HttpTransport`] is the `reqwest` one
//! - [`TransportError`]: structured error type
//!
//! Method names and payloads are opaque: the client never interprets them.

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod queue;
pub mod request;
pub mod transport;

pub use client::{CallBuilder, ClientHold, RpcClient};
pub use config::ClientConfig;
pub use endpoint::EndpointSet;
pub use error::TransportError;
pub use http::HttpTransport;
pub use queue::{Batch, CallQueue, PendingCall};
pub use request::{JsonRpcRequest, ReplyEntry, RpcError, RpcParam};
pub use transport::RpcTransport;
