//! Streamed-response transport (server-sent events over a POST).
//!
//! The request side is a single POST like the plain HTTP channel; the reply
//! arrives as a stream of `data:`-prefixed frames. Keep-alive frames and
//! server-side notifications precede the real reply, so frames are candidate-
//! decoded in arrival order and the first one carrying a `result` or `error`
//! wins. Servers that answer with a plain JSON body instead of an event
//! stream are accepted too.

use std::time::Duration;

use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde_json::Value;

use crate::error::HubError;
use crate::protocol::{JsonRpcRequest, RpcReply};
use crate::transport::http::client;

const ACCEPT_STREAMING: &str = "application/json, text/event-stream";

/// One request/response round-trip over the streamed channel. The timeout
/// bounds the whole exchange, reading included.
pub async fn request_over_stream(
    url: &str,
    req: &JsonRpcRequest,
    timeout: Duration,
) -> Result<RpcReply, HubError> {
    tokio::time::timeout(timeout, drive(url, req))
        .await
        .map_err(|_| HubError::Timeout(timeout))?
}

/// Fire a notification at the streamed endpoint. Any success status counts;
/// the body, if one streams back, is not read.
pub async fn notify_over_stream(
    url: &str,
    req: &JsonRpcRequest,
    timeout: Duration,
) -> Result<(), HubError> {
    let send = async {
        client()
            .post(url)
            .header(ACCEPT, ACCEPT_STREAMING)
            .json(req)
            .send()
            .await
    };
    let resp = tokio::time::timeout(timeout, send)
        .await
        .map_err(|_| HubError::Timeout(timeout))?
        .map_err(|e| connect_error(url, e))?;
    if !resp.status().is_success() {
        return Err(HubError::Protocol(format!(
            "{url}: HTTP {} on notification",
            resp.status().as_u16()
        )));
    }
    Ok(())
}

fn connect_error(url: &str, e: reqwest::Error) -> HubError {
    if e.is_connect() {
        HubError::TransportUnavailable(format!("{url}: {e}"))
    } else {
        HubError::Protocol(format!("{url}: {e}"))
    }
}

async fn drive(url: &str, req: &JsonRpcRequest) -> Result<RpcReply, HubError> {
    let resp = client()
        .post(url)
        .header(ACCEPT, ACCEPT_STREAMING)
        .json(req)
        .send()
        .await
        .map_err(|e| connect_error(url, e))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(HubError::TransportUnavailable(format!(
            "{url}: HTTP {}",
            status.as_u16()
        )));
    }

    let mut stream = resp.bytes_stream();
    let mut buf = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| HubError::Protocol(format!("{url}: stream read failed: {e}")))?;
        buf.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(pos) = buf.find('\n') {
            let line = buf[..pos].trim().to_string();
            buf.drain(..=pos);
            if let Some(reply) = decode_frame(&line) {
                return Ok(reply);
            }
        }
    }
    // A plain JSON body may arrive without a trailing newline.
    if let Some(reply) = decode_frame(buf.trim()) {
        return Ok(reply);
    }
    Err(HubError::Protocol(format!(
        "{url}: stream ended without a result or error frame"
    )))
}

/// Decode one frame. Strips the `data:` prefix when present, then candidate-
/// decodes; anything that is not a reply (keep-alives, progress
/// notifications, blank separators) yields `None` and is skipped.
fn decode_frame(line: &str) -> Option<RpcReply> {
    let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    let value: Value = serde_json::from_str(payload).ok()?;
    RpcReply::from_value(&value)
}
