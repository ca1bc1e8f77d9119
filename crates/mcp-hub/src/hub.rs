//! Hub facade: one object owning the registry and lifecycle manager, exposing
//! the operations the HTTP surface (and startup) call into.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::dispatch;
use crate::lifecycle::{LifecycleManager, ServerDefinition, ServerStatus};
use crate::registry::{ToolMetadata, ToolRegistry};

/// Structured outcome of one tool invocation. Failures are data, not HTTP
/// errors: callers always get a 200 with `success: false` and the reason.
#[derive(Debug, Serialize)]
pub struct ToolCallResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock seconds the dispatch took.
    pub execution_time: f64,
    pub timestamp: DateTime<Utc>,
}

pub struct McpHub {
    lifecycle: LifecycleManager,
    call_timeout: Duration,
}

impl McpHub {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            lifecycle: LifecycleManager::new(Arc::new(ToolRegistry::new())),
            call_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.lifecycle.registry()
    }

    pub async fn add_server(&self, definition: ServerDefinition) {
        self.lifecycle.add_server(definition).await;
    }

    pub async fn remove_server(&self, name: &str) -> bool {
        self.lifecycle.remove_server(name).await
    }

    pub async fn start_server(&self, name: &str) -> bool {
        self.lifecycle.start(name).await
    }

    pub async fn stop_server(&self, name: &str) -> bool {
        self.lifecycle.stop(name).await
    }

    pub async fn start_all(&self) -> HashMap<String, bool> {
        self.lifecycle.start_all().await
    }

    pub async fn stop_all(&self) -> usize {
        self.lifecycle.stop_all().await
    }

    pub async fn list_servers(&self) -> Vec<ServerStatus> {
        self.lifecycle.list_servers().await
    }

    pub async fn list_tools(&self) -> Vec<ToolMetadata> {
        self.registry().list().await
    }

    pub async fn list_tools_for_server(&self, server: &str) -> Vec<ToolMetadata> {
        self.registry().list_for_server(server).await
    }

    pub async fn tool_info(&self, tool: &str) -> Option<ToolMetadata> {
        self.registry().tool_info(tool).await
    }

    /// Invoke a tool and wrap the outcome. Never returns an error; the
    /// response carries either the result payload or the failure text.
    /// `timeout_secs` overrides the hub-wide call budget for this call only.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout_secs: Option<u64>,
    ) -> ToolCallResponse {
        let timeout = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.call_timeout);
        let started = Instant::now();
        let outcome = dispatch::dispatch(self.registry(), tool, arguments, timeout).await;
        let execution_time = started.elapsed().as_secs_f64();
        let timestamp = Utc::now();
        match outcome {
            Ok(result) => {
                tracing::info!("tool {} ok in {:.3}s", tool, execution_time);
                ToolCallResponse {
                    success: true,
                    result: Some(result),
                    error: None,
                    execution_time,
                    timestamp,
                }
            }
            Err(e) => {
                tracing::warn!(
                    "tool {} failed in {:.3}s: {} ({})",
                    tool,
                    execution_time,
                    e,
                    e.kind()
                );
                ToolCallResponse {
                    success: false,
                    result: None,
                    error: Some(e.to_string()),
                    execution_time,
                    timestamp,
                }
            }
        }
    }
}
