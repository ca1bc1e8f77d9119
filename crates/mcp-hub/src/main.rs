mod api;
mod config;
mod dispatch;
mod error;
mod hub;
mod lifecycle;
mod protocol;
mod registry;
mod transport;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use env_flags::env_flags;
use once_cell::sync::OnceCell;

use crate::api::ApiState;
use crate::hub::McpHub;

/// Hub home directory: MCP_HUB_HOME, else $HOME/.mcp-hub, else ./.mcp-hub.
fn hub_home() -> PathBuf {
    if let Ok(dir) = std::env::var("MCP_HUB_HOME")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".mcp-hub");
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".mcp-hub")
}

fn init_tracing(hub_home: &std::path::Path) {
    env_flags! {
        /// Tracing filter, e.g. "info", "debug", or targets format.
        RUST_LOG: &str = "info";
        /// JSON formatting for logs
        TRACING_JSON: bool = false;
        /// Compact single-line formatting for logs (ignored if TRACING_JSON=true)
        TRACING_COMPACT: bool = true;
        /// If true, also log to file under <MCP_HUB_HOME>/logs or LOG_DIR
        LOG_TO_FILE: bool = true;
        /// Optional explicit log directory (absolute). Defaults to <MCP_HUB_HOME>/logs
        LOG_DIR: &str = "";
    }

    use tracing_subscriber::{
        EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
    };

    // User config fills in whatever the environment left unset.
    let user_cfg = config::load_user_config(hub_home).ok().flatten();
    let logging = user_cfg.as_ref().and_then(|c| c.logging.as_ref());
    let env_set = |k: &str| std::env::var_os(k).is_some();

    let mut rust_log = (*RUST_LOG).to_string();
    let mut json = *TRACING_JSON;
    let mut compact = *TRACING_COMPACT;
    let mut to_file = *LOG_TO_FILE;
    let mut log_dir: Option<PathBuf> = if (*LOG_DIR).is_empty() {
        None
    } else {
        Some(PathBuf::from((*LOG_DIR).to_string()))
    };
    if let Some(cfg) = logging {
        if !env_set("RUST_LOG")
            && let Some(level) = cfg.level.as_ref()
        {
            rust_log = level.clone();
        }
        if !env_set("TRACING_JSON")
            && let Some(v) = cfg.json
        {
            json = v;
        }
        if !env_set("TRACING_COMPACT")
            && let Some(v) = cfg.compact
        {
            compact = v;
        }
        if !env_set("LOG_TO_FILE")
            && let Some(v) = cfg.to_file
        {
            to_file = v;
        }
        if !env_set("LOG_DIR")
            && let Some(dir) = cfg.dir.as_ref()
        {
            log_dir = Some(PathBuf::from(dir));
        }
    }

    let filter = EnvFilter::try_new(rust_log).unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    // Logs always go to stderr; stdout stays clean for anything piping us.
    let stderr_base = tracing_subscriber::fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .with_target(true)
        .with_ansi(true)
        .with_writer(std::io::stderr);
    layers.push(if json {
        stderr_base.json().boxed()
    } else if compact {
        stderr_base.compact().boxed()
    } else {
        stderr_base.boxed()
    });

    static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
    if to_file {
        let dir = log_dir.unwrap_or_else(|| hub_home.join("logs"));
        match std::fs::create_dir_all(&dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, "mcp-hub.log");
                let (nb, guard) = tracing_appender::non_blocking(appender);
                let _ = FILE_GUARD.set(guard);
                let file_base = tracing_subscriber::fmt::layer()
                    .with_file(false)
                    .with_line_number(false)
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(nb);
                layers.push(if json {
                    file_base.json().boxed()
                } else {
                    file_base.compact().boxed()
                });
            }
            Err(e) => {
                eprintln!("failed to create log dir {}: {}", dir.display(), e);
            }
        }
    }

    if let Err(e) = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
    {
        tracing::debug!("tracing already set: {:?}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let home = hub_home();
    init_tracing(&home);

    env_flags! {
        /// Bind host for the hub API
        HOST: &str = "127.0.0.1";
        /// Bind port for the hub API
        PORT: u16 = 8000;
        /// Servers JSON file. If empty, defaults to <MCP_HUB_HOME>/servers.json
        CONFIG_FILE: &str = "";
        /// Start every configured server at boot
        START_ALL: bool = false;
        /// Per-call dispatch timeout in seconds
        CALL_TIMEOUT_SECS: u64 = 30;
    }

    let user_cfg = config::load_user_config(&home).ok().flatten();
    let hub_cfg = user_cfg.as_ref().and_then(|c| c.hub.as_ref());
    let env_set = |k: &str| std::env::var_os(k).is_some();

    let call_timeout_secs = if env_set("CALL_TIMEOUT_SECS") {
        *CALL_TIMEOUT_SECS
    } else {
        hub_cfg
            .and_then(|h| h.call_timeout_secs)
            .unwrap_or(*CALL_TIMEOUT_SECS)
    };
    let start_all = if env_set("START_ALL") {
        *START_ALL
    } else {
        hub_cfg.and_then(|h| h.start_all).unwrap_or(*START_ALL)
    };
    let servers_path = if !(*CONFIG_FILE).is_empty() {
        config::expand_home(*CONFIG_FILE)
    } else if let Some(path) = hub_cfg.and_then(|h| h.servers_file.as_ref()) {
        config::expand_home(path)
    } else {
        home.join("servers.json")
    };

    tracing::info!(
        "starting mcp-hub (home={}, servers_file={}, call_timeout={}s)",
        home.display(),
        servers_path.display(),
        call_timeout_secs
    );

    let hub = Arc::new(McpHub::new(Duration::from_secs(call_timeout_secs)));

    let mut raw_entries = HashMap::new();
    if servers_path.exists() {
        match config::load_servers_file(&servers_path) {
            Ok(file) => {
                let env = |k: &str| std::env::var(k).ok();
                for (name, entry) in file.servers {
                    let missing = config::missing_env_keys(&entry, &env);
                    if missing.is_empty() {
                        match config::resolve_entry(&name, &entry, &env) {
                            Ok(definition) => hub.add_server(definition).await,
                            Err(e) => tracing::warn!("skipping server {}: {}", name, e),
                        }
                    } else {
                        tracing::warn!(
                            "server {} unavailable (missing env: {})",
                            name,
                            missing.join(", ")
                        );
                    }
                    raw_entries.insert(name, entry);
                }
            }
            Err(e) => {
                tracing::warn!(
                    "failed to load {}: {} (continuing with no servers)",
                    servers_path.display(),
                    e
                );
            }
        }
    } else {
        tracing::info!("no servers file at {}", servers_path.display());
    }

    if start_all {
        let results = hub.start_all().await;
        let started = results.values().filter(|ok| **ok).count();
        tracing::info!("startup: {}/{} servers started", started, results.len());
        for (name, ok) in &results {
            if !ok {
                tracing::warn!("startup: {} failed to start", name);
            }
        }
    }

    let state = ApiState::new(hub.clone(), raw_entries);
    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(((*HOST).to_string(), *PORT)).await?;
    tracing::info!("listening on {}:{}", *HOST, *PORT);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let stopped = hub.stop_all().await;
    tracing::info!("shut down; {} servers stopped", stopped);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {}", e);
        return;
    }
    tracing::info!("shutdown signal received");
}
