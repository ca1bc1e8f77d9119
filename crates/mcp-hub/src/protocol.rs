//! JSON-RPC 2.0 codec and MCP message builders.
//!
//! One envelope shape is shared by all three transports; only the framing
//! differs (newline-terminated lines on stdio, request bodies on HTTP, `data:`
//! frames on SSE). Request ids come from a process-wide counter: stdio
//! connections allow a single in-flight request, so ids only need to be
//! distinguishing, not sequenced per connection.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::HubError;

pub const JSONRPC_VERSION: &str = "2.0";
/// MCP protocol revision advertised during `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

static NEXT_ID: AtomicI64 = AtomicI64::new(1);

/// Allocate a request id. Monotonic across the whole process.
pub fn next_request_id() -> i64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// JSON-RPC 2.0 request. A `None` id makes this a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(next_request_id()),
            method: method.into(),
            params: None,
        }
    }

    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// One newline-terminated document, the stdio framing on both directions.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}

/// JSON-RPC 2.0 error object as returned by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A decoded backend reply: either a `result` payload or an `error` payload.
#[derive(Debug, Clone)]
pub enum RpcReply {
    Result(Value),
    Error(RpcError),
}

impl RpcReply {
    /// Candidate decode: `Some` only when the document carries a `result` or
    /// `error` field. SSE keep-alives and server-side notifications yield
    /// `None` and are skipped by the caller.
    pub fn from_value(value: &Value) -> Option<RpcReply> {
        let obj = value.as_object()?;
        if let Some(result) = obj.get("result") {
            return Some(RpcReply::Result(result.clone()));
        }
        if let Some(error) = obj.get("error") {
            let err: RpcError = serde_json::from_value(error.clone()).unwrap_or(RpcError {
                code: -32603,
                message: error.to_string(),
                data: None,
            });
            return Some(RpcReply::Error(err));
        }
        None
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self {
            RpcReply::Result(v) => Ok(v),
            RpcReply::Error(e) => Err(e),
        }
    }
}

/// Strict decode used by the stdio and HTTP channels: a parse failure or a
/// document with neither `result` nor `error` is a protocol error, reported
/// to the caller rather than crashing anything.
pub fn parse_reply(raw: &str) -> Result<RpcReply, HubError> {
    let value: Value = serde_json::from_str(raw.trim()).map_err(|e| {
        tracing::warn!("malformed JSON-RPC reply: {} (raw: {})", e, raw.trim());
        HubError::Protocol(format!("malformed JSON in reply: {e}"))
    })?;
    RpcReply::from_value(&value).ok_or_else(|| {
        tracing::warn!("reply missing result/error: {}", raw.trim());
        HubError::Protocol("reply contains neither result nor error".to_string())
    })
}

/// `initialize` request advertising the hub's protocol version and identity.
pub fn initialize_request() -> JsonRpcRequest {
    JsonRpcRequest::new("initialize").with_params(json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {
            "roots": { "listChanged": true },
            "sampling": {}
        },
        "clientInfo": {
            "name": "mcp-hub",
            "version": env!("CARGO_PKG_VERSION"),
        }
    }))
}

/// `notifications/initialized`: no id, no reply expected.
pub fn initialized_notification() -> JsonRpcRequest {
    JsonRpcRequest::notification("notifications/initialized")
}

pub fn list_tools_request() -> JsonRpcRequest {
    JsonRpcRequest::new("tools/list")
}

pub fn call_tool_request(tool: &str, arguments: Value) -> JsonRpcRequest {
    JsonRpcRequest::new("tools/call").with_params(json!({
        "name": tool,
        "arguments": arguments,
    }))
}
