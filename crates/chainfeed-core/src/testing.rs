//! Test helpers shared by the unit test modules.

use std::sync::Arc;

use async_trait::async_trait;
use chainfeed_rpc::{ClientConfig, RpcClient, RpcTransport, TransportError};
use serde_json::Value;

/// A transport that never reaches anything.
pub(crate) struct NullTransport;

#[async_trait]
impl RpcTransport for NullTransport {
    async fn post(&self, _endpoint: &str, _body: Value) -> Result<Value, TransportError> {
        Err(TransportError::Http("offline".into()))
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// A client whose calls never resolve; enough to hand to handlers.
/// Must be called from within a Tokio runtime.
pub(crate) fn offline_client() -> RpcClient {
    let (client, _join) = RpcClient::spawn(ClientConfig::default(), Arc::new(NullTransport))
        .expect("default config is valid");
    client
}
