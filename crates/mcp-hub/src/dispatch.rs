//! Call dispatch: route one tool invocation to whatever transport backs it.
//!
//! The registry lookup happens first and the lock is gone before any I/O; a
//! single timeout bounds the whole dispatch, candidate probing included, so a
//! caller waits at most one budget regardless of how many endpoints get
//! tried.

use std::time::Duration;

use serde_json::{Value, json};

use crate::error::HubError;
use crate::protocol::{RpcReply, call_tool_request};
use crate::registry::{DispatchHandle, ToolRegistry};
use crate::transport::{http, sse};

/// Invoke `tool` with `arguments`. The returned value is the backend's
/// `result` payload. A backend-reported JSON-RPC error surfaces as
/// [`HubError::Protocol`] carrying the backend's message.
pub async fn dispatch(
    registry: &ToolRegistry,
    tool: &str,
    arguments: Value,
    timeout: Duration,
) -> Result<Value, HubError> {
    let Some((meta, handle)) = registry.lookup(tool).await else {
        return Err(HubError::NotFound(format!("tool {tool}")));
    };
    tracing::debug!(
        "dispatching {} to {} over {}",
        tool,
        meta.server,
        meta.transport
    );

    tokio::time::timeout(timeout, route(&handle, tool, arguments, timeout))
        .await
        .map_err(|_| HubError::Timeout(timeout))?
}

async fn route(
    handle: &DispatchHandle,
    tool: &str,
    arguments: Value,
    timeout: Duration,
) -> Result<Value, HubError> {
    match handle {
        DispatchHandle::Stdio(conn) => {
            let reply = conn.request(&call_tool_request(tool, arguments), timeout).await?;
            unwrap_reply(reply)
        }
        DispatchHandle::Http { base_url } => {
            call_over_http(base_url, tool, arguments, timeout).await
        }
        DispatchHandle::Sse { base_url } => {
            let url = format!("{base_url}/mcp");
            let reply =
                sse::request_over_stream(&url, &call_tool_request(tool, arguments), timeout)
                    .await?;
            unwrap_reply(reply)
        }
    }
}

fn unwrap_reply(reply: RpcReply) -> Result<Value, HubError> {
    reply.into_result().map_err(|e| {
        HubError::Protocol(format!("backend error {}: {}", e.code, e.message))
    })
}

/// Ordered candidate URLs for invoking `tool` on a plain-HTTP backend. At
/// each one the JSON-RPC envelope is POSTed first, then the bare arguments
/// object, so a backend accepting only one shape is reachable at any path.
pub fn call_candidates(base_url: &str, tool: &str) -> Vec<String> {
    let base = base_url.trim_end_matches('/');
    vec![
        format!("{base}/mcp"),
        format!("{base}/tools/call"),
        format!("{base}/api/tools/{tool}"),
        format!("{base}/tools/{tool}"),
    ]
}

async fn call_over_http(
    base_url: &str,
    tool: &str,
    arguments: Value,
    timeout: Duration,
) -> Result<Value, HubError> {
    let envelope = call_tool_request(tool, arguments.clone());
    for url in call_candidates(base_url, tool) {
        // Envelope attempt. A 200 whose body is not a reply falls through to
        // the raw-arguments attempt on the same endpoint.
        match http::post_rpc(&url, &envelope, timeout).await {
            Ok(resp) if resp.is_success() => {
                if let Ok(value) = serde_json::from_str::<Value>(&resp.body)
                    && let Some(reply) = RpcReply::from_value(&value)
                {
                    return unwrap_reply(reply);
                }
                tracing::debug!("{} answered the envelope without a reply body", url);
            }
            Ok(_) => {}
            Err(HubError::Timeout(t)) => return Err(HubError::Timeout(t)),
            Err(e) => {
                tracing::debug!("call candidate {} failed: {}", url, e);
                continue;
            }
        }

        match http::post_json(&url, &arguments, timeout).await {
            Ok(resp) if resp.is_success() => {
                // Raw endpoints answer with arbitrary JSON (or text);
                // normalize to the shape an envelope reply would produce.
                let payload = serde_json::from_str::<Value>(&resp.body)
                    .unwrap_or_else(|_| Value::String(resp.body.clone()));
                return match RpcReply::from_value(&payload) {
                    Some(reply) => unwrap_reply(reply),
                    None => Ok(json!({ "result": payload })),
                };
            }
            Ok(_) => {}
            Err(HubError::Timeout(t)) => return Err(HubError::Timeout(t)),
            Err(e) => tracing::debug!("call candidate {} failed: {}", url, e),
        }
    }
    Err(HubError::TransportUnavailable(format!(
        "{base_url}: no call endpoint accepted tool {tool}"
    )))
}
