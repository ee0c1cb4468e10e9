//! JSON-RPC 2.0 wire types and reply parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single JSON-RPC parameter value.
pub type RpcParam = Value;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub id: u64,
    pub params: Vec<RpcParam>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(id: u64, method: impl Into<String>, params: Vec<RpcParam>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            id,
            params,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// One entry of a reply, already matched to a request id.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyEntry {
    pub id: u64,
    pub outcome: Result<Value, RpcError>,
}

/// Parse a reply body into its entries.
///
/// A single object is accepted as a one-entry reply (legacy, non-batching
/// endpoints); an array yields one entry per element. `"result": null` is a
/// valid result. Anything else is reported as `Err` with a short reason.
pub fn parse_reply(body: &Value) -> Result<Vec<ReplyEntry>, String> {
    match body {
        Value::Object(_) => Ok(vec![parse_entry(body)?]),
        Value::Array(items) => items.iter().map(parse_entry).collect(),
        _ => Err("JSON response neither list nor object".into()),
    }
}

fn parse_entry(entry: &Value) -> Result<ReplyEntry, String> {
    let obj = entry
        .as_object()
        .ok_or_else(|| "reply entry is not an object".to_string())?;
    let id = obj
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| "reply entry without numeric id".to_string())?;

    if let Some(result) = obj.get("result") {
        return Ok(ReplyEntry {
            id,
            outcome: Ok(result.clone()),
        });
    }

    let error = obj.get("error");
    match error.and_then(|e| e.get("code")).and_then(Value::as_i64) {
        Some(code) => {
            let message = error
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("No message included with error")
                .to_string();
            let data = error.and_then(|e| e.get("data")).cloned();
            Ok(ReplyEntry {
                id,
                outcome: Err(RpcError { code, message, data }),
            })
        }
        None => Err(format!("reply entry {id} has neither result nor error code")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new(7, "get_block", vec![json!(1234)]);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"get_block\""));
        assert!(json.contains("\"id\":7"));
        assert!(json.contains("\"params\":[1234]"));
    }

    #[test]
    fn null_result_is_a_result() {
        let entries = parse_reply(&json!({"jsonrpc": "2.0", "id": 3, "result": null})).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, 3);
        assert_eq!(entries[0].outcome, Ok(Value::Null));
    }

    #[test]
    fn error_entry_without_message() {
        let entries = parse_reply(&json!([{"id": 1, "error": {"code": -32601}}])).unwrap();
        let err = entries[0].outcome.clone().unwrap_err();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "No message included with error");
    }

    #[test]
    fn rejects_structurally_invalid_replies() {
        assert!(parse_reply(&json!("oops")).is_err());
        assert!(parse_reply(&json!([{"result": 1}])).is_err());
        assert!(parse_reply(&json!([{"id": 1, "error": {"message": "no code"}}])).is_err());
        assert!(parse_reply(&json!([{"id": 1}, 5])).is_err());
    }
}
