//! Server lifecycle: definitions, states, and the start/stop orchestration
//! that keeps the tool registry consistent with what is actually running.
//!
//! `start` and `stop` never return errors. Failures are logged with the
//! reason and reported as `false`; callers (the HTTP surface, startup) only
//! branch on whether the server ended up running. Every stop path purges the
//! server's registry entries before anything else, so a stopped server can
//! never receive a dispatch.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};

use crate::error::HubError;
use crate::protocol::{
    RpcReply, initialize_request, initialized_notification, list_tools_request, parse_reply,
};
use crate::registry::{DispatchHandle, ToolRegistry};
use crate::transport::TransportKind;
use crate::transport::stdio::StdioConnection;
use crate::transport::{http, sse};

/// A command the hub runs to bring a backend up.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Set when `command` runs a container, so stop can also tear the
    /// container down by image name.
    pub container_image: Option<String>,
}

/// How a backend comes to exist. Stdio backends are always spawned; network
/// backends may be spawned by the hub or already listening somewhere.
#[derive(Debug, Clone)]
pub enum LaunchSpec {
    Process(SpawnSpec),
    Endpoint {
        base_url: String,
        health_path: Option<String>,
        /// Per-server override of the readiness-poll window.
        health_timeout: Option<Duration>,
        spawn: Option<SpawnSpec>,
    },
}

#[derive(Debug, Clone)]
pub struct ServerDefinition {
    pub name: String,
    pub transport: TransportKind,
    pub launch: LaunchSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Configured,
    Starting,
    Ready,
    Stopping,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Configured => "configured",
            ServerState::Starting => "starting",
            ServerState::Ready => "ready",
            ServerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// One row of the server listing.
#[derive(Debug, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub transport: TransportKind,
    pub state: ServerState,
    pub ready: bool,
    pub tool_count: usize,
}

struct ActiveServer {
    handle: DispatchHandle,
    container_image: Option<String>,
    /// Process the hub spawned for a network backend. Stdio children live
    /// inside their connection instead.
    child: Option<Child>,
}

/// Bounds for the start/stop machinery. Defaults match interactive use;
/// tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Pause after spawn before the first liveness check, so commands that
    /// die instantly (bad binary, bad args) are caught before the handshake.
    pub startup_grace: Duration,
    /// Bound for each handshake round-trip (initialize, tools/list).
    pub handshake: Duration,
    /// Per-probe bound while waiting for a network backend to answer.
    pub health_probe: Duration,
    /// Total readiness-poll window, unless the definition overrides it.
    pub health_window: Duration,
    /// How long a stopping process gets between stdin close and the kill.
    pub stop_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_millis(500),
            handshake: Duration::from_secs(10),
            health_probe: Duration::from_secs(1),
            health_window: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
        }
    }
}

pub struct LifecycleManager {
    definitions: RwLock<HashMap<String, ServerDefinition>>,
    states: RwLock<HashMap<String, ServerState>>,
    active: RwLock<HashMap<String, ActiveServer>>,
    /// Per-name serialization of start/stop so concurrent requests for the
    /// same server cannot interleave. Map access itself is brief.
    name_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    registry: Arc<ToolRegistry>,
    timeouts: Timeouts,
}

impl LifecycleManager {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self::with_timeouts(registry, Timeouts::default())
    }

    pub fn with_timeouts(registry: Arc<ToolRegistry>, timeouts: Timeouts) -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            name_locks: Mutex::new(HashMap::new()),
            registry,
            timeouts,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    async fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.name_locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn set_state(&self, name: &str, state: ServerState) {
        self.states.write().await.insert(name.to_string(), state);
    }

    pub async fn state(&self, name: &str) -> Option<ServerState> {
        self.states.read().await.get(name).copied()
    }

    /// Add or replace a definition. A running server being replaced is
    /// stopped first so its old process and tools do not linger.
    pub async fn add_server(&self, definition: ServerDefinition) {
        let name = definition.name.clone();
        let lock = self.name_lock(&name).await;
        let _guard = lock.lock().await;

        if self.stop_locked(&name).await {
            tracing::info!("replaced running server {}; old instance stopped", name);
        }
        self.definitions
            .write()
            .await
            .insert(name.clone(), definition);
        self.set_state(&name, ServerState::Configured).await;
        tracing::info!("added server definition {}", name);
    }

    /// Remove a definition entirely, stopping it first when running.
    /// `false` when no such server is configured.
    pub async fn remove_server(&self, name: &str) -> bool {
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;

        if !self.definitions.read().await.contains_key(name) {
            return false;
        }
        self.stop_locked(name).await;
        self.definitions.write().await.remove(name);
        self.states.write().await.remove(name);
        self.name_locks.lock().await.remove(name);
        tracing::info!("removed server {}", name);
        true
    }

    pub async fn list_servers(&self) -> Vec<ServerStatus> {
        let definitions = self.definitions.read().await;
        let states = self.states.read().await;
        let mut out = Vec::with_capacity(definitions.len());
        for (name, def) in definitions.iter() {
            let state = states.get(name).copied().unwrap_or(ServerState::Configured);
            out.push(ServerStatus {
                name: name.clone(),
                transport: def.transport,
                state,
                ready: state == ServerState::Ready,
                tool_count: self.registry.list_for_server(name).await.len(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start one server. `true` when the server ends up Ready, including the
    /// case where it already was. Unknown names and every failure mode
    /// return `false` after logging.
    pub async fn start(&self, name: &str) -> bool {
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;

        // Looked up under the guard, so a remove that won the lock first
        // cannot hand back a stale definition.
        let Some(definition) = self.definitions.read().await.get(name).cloned() else {
            tracing::warn!("start requested for unknown server {}", name);
            return false;
        };

        if self.active.read().await.contains_key(name) {
            tracing::debug!("{} already running", name);
            return true;
        }

        self.set_state(name, ServerState::Starting).await;
        let outcome = match definition.transport {
            TransportKind::Stdio => self.start_stdio(&definition).await,
            TransportKind::Http => self.start_http(&definition).await,
            TransportKind::Sse => self.start_sse(&definition).await,
        };
        match outcome {
            Ok(active) => {
                self.active.write().await.insert(name.to_string(), active);
                self.set_state(name, ServerState::Ready).await;
                tracing::info!("server {} is ready", name);
                true
            }
            Err(e) => {
                tracing::error!("failed to start {}: {} ({})", name, e, e.kind());
                self.registry.remove_by_server(name).await;
                self.set_state(name, ServerState::Configured).await;
                false
            }
        }
    }

    async fn start_stdio(&self, def: &ServerDefinition) -> Result<ActiveServer, HubError> {
        let LaunchSpec::Process(spec) = &def.launch else {
            return Err(HubError::Configuration(format!(
                "{}: stdio transport requires a command",
                def.name
            )));
        };

        let conn = Arc::new(StdioConnection::spawn(
            &def.name,
            &spec.command,
            &spec.args,
            &spec.env,
        )?);
        tokio::time::sleep(self.timeouts.startup_grace).await;
        if let Some(status) = conn.exit_status().await {
            let stderr = conn.read_stderr_tail().await;
            return Err(HubError::ProcessTerminated(format!(
                "{} exited during startup with {status}: {}",
                def.name,
                stderr.trim()
            )));
        }

        // A failed handshake kills the fresh process before reporting, so a
        // Configured server never has a live child behind it.
        match self.handshake_stdio(&conn).await {
            Ok(descriptors) => {
                let handle = DispatchHandle::Stdio(conn);
                self.registry
                    .register_many(&def.name, TransportKind::Stdio, &handle, &descriptors)
                    .await;
                Ok(ActiveServer {
                    handle,
                    container_image: spec.container_image.clone(),
                    child: None,
                })
            }
            Err(e) => {
                let stderr = conn.read_stderr_tail().await;
                if !stderr.trim().is_empty() {
                    tracing::warn!("{} stderr during handshake: {}", def.name, stderr.trim());
                }
                conn.shutdown(self.timeouts.stop_grace).await;
                Err(e)
            }
        }
    }

    async fn handshake_stdio(&self, conn: &StdioConnection) -> Result<Vec<Value>, HubError> {
        let t = self.timeouts.handshake;
        conn.request(&initialize_request(), t)
            .await?
            .into_result()
            .map_err(|e| HubError::Protocol(format!("initialize rejected: {}", e.message)))?;
        conn.notify(&initialized_notification()).await?;
        let listing = conn
            .request(&list_tools_request(), t)
            .await?
            .into_result()
            .map_err(|e| HubError::Protocol(format!("tools/list rejected: {}", e.message)))?;
        extract_tools(&listing)
    }

    /// Common front half for network backends: spawn the launch command when
    /// there is one, then poll until the endpoint answers. A spawned child
    /// that never becomes healthy is killed before the failure is reported.
    async fn bring_up_endpoint(
        &self,
        def: &ServerDefinition,
    ) -> Result<(String, Option<Child>, Option<String>), HubError> {
        let LaunchSpec::Endpoint {
            base_url,
            health_path,
            health_timeout,
            spawn,
        } = &def.launch
        else {
            return Err(HubError::Configuration(format!(
                "{}: {} transport requires a url",
                def.name, def.transport
            )));
        };
        let base_url = base_url.trim_end_matches('/').to_string();

        let mut child = None;
        let mut container_image = None;
        if let Some(spec) = spawn {
            child = Some(spawn_detached(spec)?);
            container_image = spec.container_image.clone();
            tracing::debug!("{}: launched {}", def.name, spec.command);
            tokio::time::sleep(self.timeouts.startup_grace).await;
        }

        let path = health_path.as_deref().unwrap_or("/");
        let window = health_timeout.unwrap_or(self.timeouts.health_window);
        let ok_statuses: &[u16] = match def.transport {
            TransportKind::Sse => &[200],
            _ => &[200, 404],
        };
        if let Err(e) = self
            .wait_healthy(&def.name, &base_url, path, window, ok_statuses)
            .await
        {
            if let Some(mut c) = child {
                if let Err(kill_err) = c.kill().await {
                    tracing::warn!("{}: kill after failed poll: {}", def.name, kill_err);
                }
            }
            if let Some(image) = &container_image {
                stop_containers_by_image(&def.name, image, self.timeouts.stop_grace).await;
            }
            return Err(e);
        }
        Ok((base_url, child, container_image))
    }

    async fn start_http(&self, def: &ServerDefinition) -> Result<ActiveServer, HubError> {
        let (base_url, child, container_image) = self.bring_up_endpoint(def).await?;

        // Zero discovered tools is not a failure; the server may only be
        // partially up or expose nothing yet.
        let descriptors = self.discover_http_tools(&def.name, &base_url).await;
        if descriptors.is_empty() {
            tracing::warn!("{}: ready with zero tools", def.name);
        }
        let handle = DispatchHandle::Http {
            base_url: base_url.clone(),
        };
        self.registry
            .register_many(&def.name, TransportKind::Http, &handle, &descriptors)
            .await;
        Ok(ActiveServer {
            handle,
            container_image,
            child,
        })
    }

    async fn start_sse(&self, def: &ServerDefinition) -> Result<ActiveServer, HubError> {
        let (base_url, child, container_image) = self.bring_up_endpoint(def).await?;

        let outcome = self.handshake_sse(&base_url).await;
        let descriptors = match outcome {
            Ok(descriptors) => descriptors,
            Err(e) => {
                if let Some(mut c) = child {
                    if let Err(kill_err) = c.kill().await {
                        tracing::warn!("{}: kill after failed handshake: {}", def.name, kill_err);
                    }
                }
                if let Some(image) = &container_image {
                    stop_containers_by_image(&def.name, image, self.timeouts.stop_grace).await;
                }
                return Err(e);
            }
        };

        let handle = DispatchHandle::Sse {
            base_url: base_url.clone(),
        };
        self.registry
            .register_many(&def.name, TransportKind::Sse, &handle, &descriptors)
            .await;
        Ok(ActiveServer {
            handle,
            container_image,
            child,
        })
    }

    async fn handshake_sse(&self, base_url: &str) -> Result<Vec<Value>, HubError> {
        let url = format!("{base_url}/mcp");
        let t = self.timeouts.handshake;
        sse::request_over_stream(&url, &initialize_request(), t)
            .await?
            .into_result()
            .map_err(|e| HubError::Protocol(format!("initialize rejected: {}", e.message)))?;
        sse::notify_over_stream(&url, &initialized_notification(), t).await?;
        let listing = sse::request_over_stream(&url, &list_tools_request(), t)
            .await?
            .into_result()
            .map_err(|e| HubError::Protocol(format!("tools/list rejected: {}", e.message)))?;
        extract_tools(&listing)
    }

    /// Poll until the backend answers with an accepted status. Plain HTTP
    /// counts 404 as responding (frameworks differ on whether a health route
    /// exists); the streamed transport requires a 200. Anything else keeps
    /// polling until the window runs out.
    async fn wait_healthy(
        &self,
        name: &str,
        base_url: &str,
        health_path: &str,
        window: Duration,
        ok_statuses: &[u16],
    ) -> Result<(), HubError> {
        let url = format!("{base_url}{health_path}");
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let outcome = http::get(&url, self.timeouts.health_probe).await;
            match &outcome {
                Ok(resp) if ok_statuses.contains(&resp.status) => {
                    tracing::debug!("{} answered health probe with {}", name, resp.status);
                    return Ok(());
                }
                Ok(resp) => {
                    tracing::debug!("{} health probe got HTTP {}", name, resp.status);
                }
                Err(e) => tracing::debug!("{} health probe failed: {}", name, e),
            }
            if tokio::time::Instant::now() >= deadline {
                let reason = match outcome {
                    Ok(resp) => format!("HTTP {}", resp.status),
                    Err(e) => e.to_string(),
                };
                return Err(HubError::TransportUnavailable(format!(
                    "{name}: no healthy answer at {url} within {window:?}: {reason}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Tool discovery against a plain-HTTP backend: POST `tools/list` to each
    /// candidate path in order, then fall back to a legacy `GET /tools`
    /// returning a bare array. Exhaustion yields an empty list, not an error.
    async fn discover_http_tools(&self, name: &str, base_url: &str) -> Vec<Value> {
        let req = list_tools_request();
        for url in discovery_candidates(base_url) {
            let resp = match http::post_rpc(&url, &req, self.timeouts.handshake).await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::debug!("{}: discovery candidate {} failed: {}", name, url, e);
                    continue;
                }
            };
            if !resp.is_success() {
                continue;
            }
            if let Ok(RpcReply::Result(listing)) = parse_reply(&resp.body)
                && let Ok(tools) = extract_tools(&listing)
            {
                tracing::debug!("{}: discovered tools via {}", name, url);
                return tools;
            }
        }

        // Legacy listing: a plain JSON array of descriptors.
        let url = format!("{base_url}/tools");
        if let Ok(resp) = http::get(&url, self.timeouts.handshake).await
            && resp.is_success()
            && let Ok(Value::Array(tools)) = serde_json::from_str::<Value>(&resp.body)
        {
            tracing::debug!("{}: discovered tools via GET {}", name, url);
            return tools;
        }
        tracing::warn!("{}: no discovery endpoint answered at {}", name, base_url);
        Vec::new()
    }

    /// Stop one server. Idempotent; `true` when a running instance was
    /// actually torn down. Registry purge happens first and unconditionally.
    pub async fn stop(&self, name: &str) -> bool {
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;
        self.stop_locked(name).await
    }

    /// Teardown body; the caller holds the server's name lock.
    async fn stop_locked(&self, name: &str) -> bool {
        self.registry.remove_by_server(name).await;
        let Some(mut active) = self.active.write().await.remove(name) else {
            return false;
        };
        self.set_state(name, ServerState::Stopping).await;

        if let DispatchHandle::Stdio(conn) = &active.handle {
            conn.shutdown(self.timeouts.stop_grace).await;
        }
        if let Some(image) = &active.container_image {
            stop_containers_by_image(name, image, self.timeouts.stop_grace).await;
        }
        if let Some(child) = active.child.as_mut() {
            if let Err(e) = child.kill().await {
                tracing::warn!("{}: kill failed: {}", name, e);
            }
        }

        self.set_state(name, ServerState::Configured).await;
        tracing::info!("server {} stopped", name);
        true
    }

    /// Start every configured server; one failure never aborts the rest.
    /// Returns the outcome per server name.
    pub async fn start_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for name in self.server_names().await {
            let ok = self.start(&name).await;
            results.insert(name, ok);
        }
        results
    }

    /// Stop everything, bounding each server so one wedged backend cannot
    /// stall shutdown indefinitely.
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for name in self.server_names().await {
            match tokio::time::timeout(Duration::from_secs(10), self.stop(&name)).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(_) => tracing::error!("stop of {} did not finish within 10s", name),
            }
        }
        stopped
    }
}

fn spawn_detached(spec: &SpawnSpec) -> Result<Child, HubError> {
    let child = Command::new(&spec.command)
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}

/// Ordered candidate paths for POSTing `tools/list` at an HTTP backend.
pub fn discovery_candidates(base_url: &str) -> Vec<String> {
    let base = base_url.trim_end_matches('/');
    vec![
        format!("{base}/tools/list"),
        format!("{base}/mcp/tools"),
        format!("{base}/api/tools"),
        format!("{base}/tools"),
    ]
}

/// Pull the descriptor array out of a `tools/list` result.
fn extract_tools(listing: &Value) -> Result<Vec<Value>, HubError> {
    listing
        .get("tools")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| {
            HubError::Protocol("tools/list result is missing a tools array".to_string())
        })
}

/// Tear down containers spawned for a server, matched by image name.
/// Escalates from `docker stop` to `docker kill` per container.
async fn stop_containers_by_image(server: &str, image: &str, grace: Duration) {
    let ps = Command::new("docker")
        .args(["ps", "--format", "{{.ID}}", "--filter"])
        .arg(format!("ancestor={image}"))
        .output()
        .await;
    let ids = match ps {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
        Ok(out) => {
            tracing::warn!(
                "{}: docker ps failed: {}",
                server,
                String::from_utf8_lossy(&out.stderr).trim()
            );
            return;
        }
        Err(e) => {
            tracing::warn!("{}: docker not available: {}", server, e);
            return;
        }
    };

    for id in ids.lines().filter(|l| !l.is_empty()) {
        let stop = Command::new("docker")
            .args(["stop", "-t", &grace.as_secs().to_string(), id])
            .output()
            .await;
        let stopped = matches!(stop, Ok(out) if out.status.success());
        if !stopped {
            tracing::warn!("{}: docker stop {} failed; killing", server, id);
            let _ = Command::new("docker").args(["kill", id]).output().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{StatusCode, header};
    use axum::routing::{get, post};
    use serde_json::json;

    fn test_timeouts() -> Timeouts {
        Timeouts {
            startup_grace: Duration::from_millis(100),
            handshake: Duration::from_secs(5),
            health_probe: Duration::from_millis(500),
            health_window: Duration::from_secs(2),
            stop_grace: Duration::from_secs(2),
        }
    }

    fn manager() -> LifecycleManager {
        LifecycleManager::with_timeouts(Arc::new(ToolRegistry::new()), test_timeouts())
    }

    /// Shell script speaking just enough of the handshake: answers
    /// initialize, swallows the initialized notification, answers tools/list,
    /// then echoes a canned call result forever.
    const FAKE_BACKEND: &str = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0.0.0"}}}'
read line
read line
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo_text","description":"echo","inputSchema":{"type":"object"}}]}}'
while read line; do
  echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"pong"}]}}'
done
"#;

    fn stdio_definition(name: &str, script: &str) -> ServerDefinition {
        ServerDefinition {
            name: name.to_string(),
            transport: TransportKind::Stdio,
            launch: LaunchSpec::Process(SpawnSpec {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                env: HashMap::new(),
                container_image: None,
            }),
        }
    }

    fn endpoint_definition(name: &str, transport: TransportKind, base_url: &str) -> ServerDefinition {
        ServerDefinition {
            name: name.to_string(),
            transport,
            launch: LaunchSpec::Endpoint {
                base_url: base_url.to_string(),
                health_path: None,
                health_timeout: None,
                spawn: None,
            },
        }
    }

    #[tokio::test]
    async fn stdio_start_registers_tools_and_stop_purges_them() {
        let mgr = manager();
        mgr.add_server(stdio_definition("fake", FAKE_BACKEND)).await;

        assert!(mgr.start("fake").await);
        assert_eq!(mgr.state("fake").await, Some(ServerState::Ready));
        assert!(mgr.registry().lookup("echo_text").await.is_some());

        assert!(mgr.stop("fake").await);
        assert_eq!(mgr.state("fake").await, Some(ServerState::Configured));
        assert!(mgr.registry().is_empty().await);
        // Second stop is a no-op.
        assert!(!mgr.stop("fake").await);
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let mgr = manager();
        mgr.add_server(stdio_definition("fake", FAKE_BACKEND)).await;
        assert!(mgr.start("fake").await);
        assert!(mgr.start("fake").await);
        assert_eq!(mgr.registry().len().await, 1);
        mgr.stop("fake").await;
    }

    #[tokio::test]
    async fn command_that_dies_at_startup_reports_false() {
        let mgr = manager();
        mgr.add_server(stdio_definition("dies", "echo broken >&2; exit 1"))
            .await;
        assert!(!mgr.start("dies").await);
        assert_eq!(mgr.state("dies").await, Some(ServerState::Configured));
        assert!(mgr.registry().is_empty().await);
    }

    #[tokio::test]
    async fn handshake_refusal_leaves_no_running_child() {
        // Answers initialize with a JSON-RPC error, then idles.
        let script = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"go away"}}'
sleep 30
"#;
        let mgr = manager();
        mgr.add_server(stdio_definition("refuses", script)).await;
        assert!(!mgr.start("refuses").await);
        assert_eq!(mgr.state("refuses").await, Some(ServerState::Configured));
        // The child was torn down with the failed start.
        assert!(mgr.active.read().await.is_empty());
    }

    #[tokio::test]
    async fn start_of_unknown_server_is_false_not_a_panic() {
        let mgr = manager();
        assert!(!mgr.start("nobody").await);
        assert!(mgr.state("nobody").await.is_none());
    }

    #[tokio::test]
    async fn http_start_discovers_tools_via_candidate_paths() {
        // Only the second candidate path exists; the prober must skip the
        // 404 from the first and move on.
        let router = Router::new().route(
            "/mcp/tools",
            post(|axum::Json(req): axum::Json<Value>| async move {
                axum::Json(json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "result": {"tools": [
                        {"name": "lookup", "description": "", "inputSchema": {}}
                    ]}
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let mgr = manager();
        mgr.add_server(endpoint_definition(
            "web",
            TransportKind::Http,
            &format!("http://{addr}"),
        ))
        .await;

        assert!(mgr.start("web").await);
        let meta = mgr.registry().tool_info("lookup").await.unwrap();
        assert_eq!(meta.server, "web");
        assert_eq!(meta.transport, TransportKind::Http);
        assert!(mgr.stop("web").await);
    }

    #[tokio::test]
    async fn http_backend_with_no_discovery_is_ready_with_zero_tools() {
        // Listener answers (404) so health passes, but nothing speaks
        // tools/list anywhere.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new()).await.unwrap();
        });

        let mgr = manager();
        mgr.add_server(endpoint_definition(
            "bare",
            TransportKind::Http,
            &format!("http://{addr}"),
        ))
        .await;
        assert!(mgr.start("bare").await);
        assert_eq!(mgr.state("bare").await, Some(ServerState::Ready));
        assert!(mgr.registry().is_empty().await);
        mgr.stop("bare").await;
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_the_readiness_poll() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mgr = LifecycleManager::with_timeouts(
            Arc::new(ToolRegistry::new()),
            Timeouts {
                health_window: Duration::from_millis(600),
                health_probe: Duration::from_millis(200),
                ..test_timeouts()
            },
        );
        mgr.add_server(endpoint_definition(
            "gone",
            TransportKind::Http,
            &format!("http://{addr}"),
        ))
        .await;
        assert!(!mgr.start("gone").await);
        assert_eq!(mgr.state("gone").await, Some(ServerState::Configured));
        assert!(mgr.registry().is_empty().await);
    }

    #[tokio::test]
    async fn endpoint_answering_500_never_becomes_healthy() {
        let router = Router::new().fallback(|| async { StatusCode::INTERNAL_SERVER_ERROR });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let mgr = LifecycleManager::with_timeouts(
            Arc::new(ToolRegistry::new()),
            Timeouts {
                health_window: Duration::from_millis(600),
                health_probe: Duration::from_millis(200),
                ..test_timeouts()
            },
        );
        mgr.add_server(endpoint_definition(
            "sick",
            TransportKind::Http,
            &format!("http://{addr}"),
        ))
        .await;
        assert!(!mgr.start("sick").await);
        assert_eq!(mgr.state("sick").await, Some(ServerState::Configured));
        assert!(mgr.registry().is_empty().await);
    }

    #[tokio::test]
    async fn streamed_transport_health_probe_requires_a_200() {
        // A bare listener answers 404. That is enough for plain HTTP but not
        // for the streamed transport.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new()).await.unwrap();
        });

        let mgr = LifecycleManager::with_timeouts(
            Arc::new(ToolRegistry::new()),
            Timeouts {
                health_window: Duration::from_millis(600),
                health_probe: Duration::from_millis(200),
                ..test_timeouts()
            },
        );
        mgr.add_server(endpoint_definition(
            "events",
            TransportKind::Sse,
            &format!("http://{addr}"),
        ))
        .await;
        assert!(!mgr.start("events").await);
        assert_eq!(mgr.state("events").await, Some(ServerState::Configured));
    }

    #[tokio::test]
    async fn sse_start_handshakes_over_the_stream_and_registers_tools() {
        let frame = |v: Value| {
            axum::response::Response::builder()
                .header(header::CONTENT_TYPE, "text/event-stream")
                .body(axum::body::Body::from(format!("data: {v}\n\n")))
                .unwrap()
        };
        let router = Router::new()
            .route("/", get(|| async { "ok" }))
            .route(
                "/mcp",
                post(move |axum::Json(req): axum::Json<Value>| async move {
                    match req["method"].as_str() {
                        Some("initialize") => frame(json!({
                            "jsonrpc": "2.0", "id": req["id"],
                            "result": {
                                "protocolVersion": "2024-11-05",
                                "capabilities": {},
                                "serverInfo": {"name": "fake", "version": "0.0.0"}
                            }
                        })),
                        Some("tools/list") => frame(json!({
                            "jsonrpc": "2.0", "id": req["id"],
                            "result": {"tools": [
                                {"name": "stream_search", "description": "", "inputSchema": {}}
                            ]}
                        })),
                        // The initialized notification gets an empty ack.
                        _ => axum::response::Response::builder()
                            .status(StatusCode::ACCEPTED)
                            .body(axum::body::Body::empty())
                            .unwrap(),
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let mgr = manager();
        mgr.add_server(endpoint_definition(
            "events",
            TransportKind::Sse,
            &format!("http://{addr}"),
        ))
        .await;

        assert!(mgr.start("events").await);
        assert_eq!(mgr.state("events").await, Some(ServerState::Ready));
        let meta = mgr.registry().tool_info("stream_search").await.unwrap();
        assert_eq!(meta.server, "events");
        assert_eq!(meta.transport, TransportKind::Sse);

        assert!(mgr.stop("events").await);
        assert!(mgr.registry().is_empty().await);
    }

    #[tokio::test]
    async fn start_queued_behind_the_name_lock_sees_a_removed_definition() {
        let mgr = Arc::new(manager());
        mgr.add_server(stdio_definition("fake", FAKE_BACKEND)).await;

        let lock = mgr.name_lock("fake").await;
        let held = lock.lock().await;
        let racing = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.start("fake").await })
        };
        // Let the start call queue up on the lock, then pull the definition
        // out from under it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        mgr.definitions.write().await.remove("fake");
        mgr.states.write().await.remove("fake");
        drop(held);

        assert!(!racing.await.unwrap());
        assert!(mgr.active.read().await.is_empty());
        assert!(mgr.registry().is_empty().await);
    }

    #[tokio::test]
    async fn start_all_reports_an_outcome_per_server() {
        let mgr = manager();
        mgr.add_server(stdio_definition("fake", FAKE_BACKEND)).await;
        mgr.add_server(stdio_definition("dies", "exit 1")).await;

        let results = mgr.start_all().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results.get("fake"), Some(&true));
        assert_eq!(results.get("dies"), Some(&false));
        mgr.stop("fake").await;
    }

    #[tokio::test]
    async fn remove_server_stops_and_forgets() {
        let mgr = manager();
        mgr.add_server(stdio_definition("fake", FAKE_BACKEND)).await;
        assert!(mgr.start("fake").await);
        assert!(mgr.remove_server("fake").await);
        assert!(mgr.registry().is_empty().await);
        assert!(mgr.state("fake").await.is_none());
        assert!(!mgr.remove_server("fake").await);
    }

    #[test]
    fn discovery_candidate_order_is_stable() {
        let candidates = discovery_candidates("http://127.0.0.1:8901/");
        assert_eq!(
            candidates,
            vec![
                "http://127.0.0.1:8901/tools/list",
                "http://127.0.0.1:8901/mcp/tools",
                "http://127.0.0.1:8901/api/tools",
                "http://127.0.0.1:8901/tools",
            ]
        );
    }

    #[test]
    fn extract_tools_requires_an_array() {
        assert!(extract_tools(&json!({"tools": []})).unwrap().is_empty());
        assert!(extract_tools(&json!({"tools": {"not": "an array"}})).is_err());
        assert!(extract_tools(&json!({})).is_err());
    }
}
