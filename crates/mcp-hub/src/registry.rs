//! Global tool registry: flat tool-name -> (metadata, dispatch handle) map.
//!
//! Tool names are globally unique keys. Registration is last-writer-wins so a
//! restarted server's fresh listing replaces its stale entries; a collision
//! across different servers is logged because it usually means two backends
//! export the same tool name.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::transport::TransportKind;
use crate::transport::stdio::StdioConnection;

/// Where a tool call gets routed. Cloning is cheap: the stdio variant shares
/// the live connection, the network variants carry only a base URL.
#[derive(Debug, Clone)]
pub enum DispatchHandle {
    Stdio(Arc<StdioConnection>),
    Http { base_url: String },
    Sse { base_url: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    pub server: String,
    pub transport: TransportKind,
}

struct RegisteredTool {
    meta: ToolMetadata,
    handle: DispatchHandle,
}

/// Shared across the lifecycle manager (writes) and the dispatcher (reads).
/// The lock is only held for map access, never across transport awaits.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every named descriptor from a `tools/list` reply. Descriptors
    /// without a string `name` are skipped with a warning rather than failing
    /// the whole listing. Returns how many tools were registered.
    pub async fn register_many(
        &self,
        server: &str,
        transport: TransportKind,
        handle: &DispatchHandle,
        descriptors: &[Value],
    ) -> usize {
        let mut tools = self.tools.write().await;
        let mut registered = 0;
        for descriptor in descriptors {
            let Some(name) = descriptor.get("name").and_then(Value::as_str) else {
                tracing::warn!("{}: skipping tool descriptor without a name", server);
                continue;
            };
            let meta = ToolMetadata {
                name: name.to_string(),
                description: descriptor
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input_schema: descriptor
                    .get("inputSchema")
                    .or_else(|| descriptor.get("input_schema"))
                    .cloned()
                    .unwrap_or_else(|| json!({})),
                server: server.to_string(),
                transport,
            };
            if let Some(previous) = tools.get(name)
                && previous.meta.server != server
            {
                tracing::warn!(
                    "tool {} from {} shadows the one from {}",
                    name,
                    server,
                    previous.meta.server
                );
            }
            tools.insert(
                name.to_string(),
                RegisteredTool {
                    meta,
                    handle: handle.clone(),
                },
            );
            registered += 1;
        }
        tracing::info!("registered {} tools from {}", registered, server);
        registered
    }

    /// Both pieces the dispatcher needs, cloned out so the lock drops before
    /// any transport work starts.
    pub async fn lookup(&self, tool: &str) -> Option<(ToolMetadata, DispatchHandle)> {
        let tools = self.tools.read().await;
        tools
            .get(tool)
            .map(|t| (t.meta.clone(), t.handle.clone()))
    }

    pub async fn tool_info(&self, tool: &str) -> Option<ToolMetadata> {
        self.tools.read().await.get(tool).map(|t| t.meta.clone())
    }

    /// All tools, sorted by name for stable listings.
    pub async fn list(&self) -> Vec<ToolMetadata> {
        let tools = self.tools.read().await;
        let mut out: Vec<ToolMetadata> = tools.values().map(|t| t.meta.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn list_for_server(&self, server: &str) -> Vec<ToolMetadata> {
        let tools = self.tools.read().await;
        let mut out: Vec<ToolMetadata> = tools
            .values()
            .filter(|t| t.meta.server == server)
            .map(|t| t.meta.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Server -> sorted tool names, for the aggregated listing endpoint.
    pub async fn grouped_by_server(&self) -> BTreeMap<String, Vec<String>> {
        let tools = self.tools.read().await;
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for tool in tools.values() {
            grouped
                .entry(tool.meta.server.clone())
                .or_default()
                .push(tool.meta.name.clone());
        }
        for names in grouped.values_mut() {
            names.sort();
        }
        grouped
    }

    /// Purge everything a server contributed. Called on every stop path so a
    /// stopped server can never receive a dispatch.
    pub async fn remove_by_server(&self, server: &str) -> usize {
        let mut tools = self.tools.write().await;
        let before = tools.len();
        tools.retain(|_, t| t.meta.server != server);
        let removed = before - tools.len();
        if removed > 0 {
            tracing::debug!("unregistered {} tools from {}", removed, server);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn http_handle() -> DispatchHandle {
        DispatchHandle::Http {
            base_url: "http://127.0.0.1:9".to_string(),
        }
    }

    fn descriptor(name: &str, description: &str) -> Value {
        json!({
            "name": name,
            "description": description,
            "inputSchema": {"type": "object", "properties": {}}
        })
    }

    #[tokio::test]
    async fn nameless_descriptors_are_skipped_not_fatal() {
        let registry = ToolRegistry::new();
        let n = registry
            .register_many(
                "alpha",
                TransportKind::Http,
                &http_handle(),
                &[
                    descriptor("search", "find things"),
                    json!({"description": "no name here"}),
                    descriptor("fetch", "get one thing"),
                ],
            )
            .await;
        assert_eq!(n, 2);
        assert_eq!(registry.len().await, 2);
        assert!(registry.lookup("search").await.is_some());
    }

    #[tokio::test]
    async fn reregistration_overwrites_in_place() {
        let registry = ToolRegistry::new();
        registry
            .register_many(
                "alpha",
                TransportKind::Http,
                &http_handle(),
                &[descriptor("search", "old description")],
            )
            .await;
        registry
            .register_many(
                "alpha",
                TransportKind::Http,
                &http_handle(),
                &[descriptor("search", "new description")],
            )
            .await;
        assert_eq!(registry.len().await, 1);
        let meta = registry.tool_info("search").await.unwrap();
        assert_eq!(meta.description, "new description");
    }

    #[tokio::test]
    async fn remove_by_server_only_touches_that_server() {
        let registry = ToolRegistry::new();
        registry
            .register_many(
                "alpha",
                TransportKind::Http,
                &http_handle(),
                &[descriptor("a1", ""), descriptor("a2", "")],
            )
            .await;
        registry
            .register_many(
                "beta",
                TransportKind::Sse,
                &DispatchHandle::Sse {
                    base_url: "http://127.0.0.1:9".to_string(),
                },
                &[descriptor("b1", "")],
            )
            .await;

        assert_eq!(registry.remove_by_server("alpha").await, 2);
        assert_eq!(registry.len().await, 1);
        assert!(registry.lookup("a1").await.is_none());
        assert!(registry.lookup("b1").await.is_some());
        assert_eq!(registry.remove_by_server("alpha").await, 0);
    }

    #[tokio::test]
    async fn grouped_listing_sorts_names_within_each_server() {
        let registry = ToolRegistry::new();
        registry
            .register_many(
                "alpha",
                TransportKind::Http,
                &http_handle(),
                &[descriptor("zeta", ""), descriptor("alpha_tool", "")],
            )
            .await;
        let grouped = registry.grouped_by_server().await;
        assert_eq!(grouped["alpha"], vec!["alpha_tool", "zeta"]);
    }

    proptest! {
        #[test]
        fn double_registration_never_grows_the_registry(
            names in proptest::collection::vec("[a-z]{1,12}", 1..20)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            rt.block_on(async {
                let registry = ToolRegistry::new();
                let descriptors: Vec<Value> =
                    names.iter().map(|n| descriptor(n, "")).collect();
                registry
                    .register_many("alpha", TransportKind::Http, &http_handle(), &descriptors)
                    .await;
                let first = registry.len().await;
                registry
                    .register_many("alpha", TransportKind::Http, &http_handle(), &descriptors)
                    .await;
                prop_assert_eq!(registry.len().await, first);
                Ok(())
            })?;
        }
    }
}
