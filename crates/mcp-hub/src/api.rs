//! HTTP surface of the hub.
//!
//! Tool invocation failures are carried in the response body with
//! `success: false`, never as HTTP errors; status codes are reserved for
//! problems with the request itself (unknown names, bad definitions).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::config::{ServerEntry, missing_env_keys, resolve_entry};
use crate::hub::{McpHub, ToolCallResponse};

pub struct ApiState {
    pub hub: Arc<McpHub>,
    pub started_at: Instant,
    /// Raw (unresolved) entries, kept so availability can be re-checked
    /// against the current environment at any time.
    pub entries: RwLock<HashMap<String, ServerEntry>>,
}

impl ApiState {
    pub fn new(hub: Arc<McpHub>, entries: HashMap<String, ServerEntry>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            started_at: Instant::now(),
            entries: RwLock::new(entries),
        })
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/servers", get(list_servers).post(add_server))
        .route("/servers/start-all", post(start_all))
        .route("/servers/stop-all", post(stop_all))
        .route("/servers/check-availability", get(check_availability))
        .route("/servers/{name}", delete(remove_server))
        .route("/servers/{name}/start", post(start_server))
        .route("/servers/{name}/stop", post(stop_server))
        .route("/tools", get(list_tools))
        .route("/tools/call", post(call_tool))
        .route("/tools/info/{name}", get(tool_info))
        .route("/tools/{server}", get(list_server_tools))
        .with_state(state)
}

async fn root(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let servers = state.hub.list_servers().await;
    let tools = state.hub.list_tools().await;
    Json(json!({
        "name": "mcp-hub",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "servers": servers.len(),
        "tools": tools.len(),
    }))
}

async fn list_servers(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let servers = state.hub.list_servers().await;
    Json(json!({ "count": servers.len(), "servers": servers }))
}

#[derive(Deserialize)]
struct AddServerRequest {
    name: String,
    #[serde(flatten)]
    entry: ServerEntry,
}

async fn add_server(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<AddServerRequest>,
) -> (StatusCode, Json<Value>) {
    let env = |k: &str| std::env::var(k).ok();
    match resolve_entry(&req.name, &req.entry, &env) {
        Ok(definition) => {
            state.hub.add_server(definition).await;
            state
                .entries
                .write()
                .await
                .insert(req.name.clone(), req.entry);
            (StatusCode::CREATED, Json(json!({ "added": req.name })))
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn remove_server(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Value>) {
    if state.hub.remove_server(&name).await {
        state.entries.write().await.remove(&name);
        (StatusCode::OK, Json(json!({ "removed": name })))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no server named {name}") })),
        )
    }
}

async fn start_server(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Value>) {
    if state.hub.start_server(&name).await {
        (StatusCode::OK, Json(json!({ "server": name, "running": true })))
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("failed to start {name}") })),
        )
    }
}

async fn stop_server(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Json<Value> {
    let stopped = state.hub.stop_server(&name).await;
    Json(json!({ "server": name, "stopped": stopped }))
}

async fn start_all(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let results = state.hub.start_all().await;
    Json(json!({ "results": results }))
}

async fn stop_all(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let stopped = state.hub.stop_all().await;
    Json(json!({ "stopped": stopped }))
}

async fn check_availability(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let env = |k: &str| std::env::var(k).ok();
    let entries = state.entries.read().await;
    let mut report = serde_json::Map::new();
    for (name, entry) in entries.iter() {
        let missing = missing_env_keys(entry, &env);
        report.insert(
            name.clone(),
            json!({ "available": missing.is_empty(), "missing": missing }),
        );
    }
    Json(Value::Object(report))
}

async fn list_tools(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let tools = state.hub.list_tools().await;
    let grouped = state.hub.registry().grouped_by_server().await;
    Json(json!({ "count": tools.len(), "tools": tools, "by_server": grouped }))
}

async fn list_server_tools(
    State(state): State<Arc<ApiState>>,
    Path(server): Path<String>,
) -> (StatusCode, Json<Value>) {
    let known = state
        .hub
        .list_servers()
        .await
        .iter()
        .any(|s| s.name == server);
    if !known {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no server named {server}") })),
        );
    }
    let tools = state.hub.list_tools_for_server(&server).await;
    (
        StatusCode::OK,
        Json(json!({ "server": server, "count": tools.len(), "tools": tools })),
    )
}

async fn tool_info(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.hub.tool_info(&name).await {
        Some(meta) => (StatusCode::OK, Json(json!(meta))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no tool named {name}") })),
        ),
    }
}

#[derive(Deserialize)]
struct CallRequest {
    name: String,
    #[serde(default)]
    arguments: Value,
    /// Optional per-call budget in seconds.
    timeout: Option<u64>,
}

async fn call_tool(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CallRequest>,
) -> Json<ToolCallResponse> {
    let arguments = match req.arguments {
        Value::Null => json!({}),
        other => other,
    };
    Json(state.hub.call_tool(&req.name, arguments, req.timeout).await)
}
