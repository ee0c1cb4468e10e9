//! The `RpcTransport` trait: the seam between the client engine and the network.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;

/// Moves one encoded request body to an endpoint and returns the decoded reply body.
///
/// The client engine knows nothing about HTTP; it hands a JSON body (a single
/// request object or an array of them) and the current endpoint to the
/// transport and interprets whatever JSON comes back.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` so they can be shared as
/// `Arc<dyn RpcTransport>` by the client driver.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// POST `body` to `endpoint` and return the parsed JSON reply.
    ///
    /// A reply that is not JSON at all must be reported as
    /// [`TransportError::MalformedResponse`].
    async fn post(&self, endpoint: &str, body: Value) -> Result<Value, TransportError>;

    /// Short identifier for logs.
    fn name(&self) -> &str;
}
