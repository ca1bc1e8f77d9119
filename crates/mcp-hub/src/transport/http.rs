//! Plain HTTP transport: one POST per JSON-RPC request.
//!
//! Backends expose tool endpoints at paths that vary by framework, so the
//! callers of this module iterate over candidate URLs; this module only knows
//! how to send one request to one URL and classify what came back.

use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::Value;

use crate::error::HubError;
use crate::protocol::JsonRpcRequest;

/// Shared client so connection pools survive across calls. Per-request
/// timeouts are set at the call sites; the client itself has none.
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .build()
        .unwrap_or_else(|_| Client::new())
});

/// The SSE channel reuses the same pool rather than building a second one.
pub(crate) fn client() -> &'static Client {
    &HTTP_CLIENT
}

/// Status and body of a completed exchange. A non-2xx status is data here,
/// not an error: endpoint probing treats 404 as "try the next candidate".
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn classify(url: &str, timeout: Duration, e: reqwest::Error) -> HubError {
    if e.is_timeout() {
        HubError::Timeout(timeout)
    } else if e.is_connect() {
        HubError::TransportUnavailable(format!("{url}: {e}"))
    } else {
        HubError::Protocol(format!("{url}: {e}"))
    }
}

async fn exchange(
    url: &str,
    timeout: Duration,
    builder: reqwest::RequestBuilder,
) -> Result<HttpResponse, HubError> {
    let resp = builder
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify(url, timeout, e))?;
    let status = resp.status().as_u16();
    let body = resp.text().await.map_err(|e| classify(url, timeout, e))?;
    Ok(HttpResponse { status, body })
}

/// POST a JSON-RPC envelope and return whatever the server said.
pub async fn post_rpc(
    url: &str,
    req: &JsonRpcRequest,
    timeout: Duration,
) -> Result<HttpResponse, HubError> {
    exchange(url, timeout, HTTP_CLIENT.post(url).json(req)).await
}

/// POST an arbitrary JSON body. Used for the raw-arguments fallback shape
/// spoken by non-MCP tool servers.
pub async fn post_json(
    url: &str,
    body: &Value,
    timeout: Duration,
) -> Result<HttpResponse, HubError> {
    exchange(url, timeout, HTTP_CLIENT.post(url).json(body)).await
}

/// Plain GET, for health probes and the legacy `GET /tools` listing.
pub async fn get(url: &str, timeout: Duration) -> Result<HttpResponse, HubError> {
    exchange(url, timeout, HTTP_CLIENT.get(url)).await
}
