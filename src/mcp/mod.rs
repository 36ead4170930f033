//! Tools served by external MCP servers, exposed to the model under
//! `mcp__<server>__<tool>` aliases.

pub mod client;

use anyhow::{Result, anyhow, bail};
use rmcp::model::CallToolRequestParam;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::McpServerConfig;
use crate::llm::types::ToolDef;
use crate::tools::{PLUGIN_PREFIX, PluginManager, ToolResult};
use client::McpClient;

#[derive(Clone)]
struct RemoteTool {
    remote_name: String,
    def: ToolDef,
    client: Arc<McpClient>,
}

#[derive(Default)]
struct RemoteRegistry {
    order: Vec<String>,
    lookup: HashMap<String, RemoteTool>,
}

/// Connects lazily to every enabled server on first use and routes prefixed
/// tool calls to the owning server.
pub struct McpManager {
    servers: Vec<McpServerConfig>,
    registry: RwLock<Option<RemoteRegistry>>,
}

impl McpManager {
    pub fn new(servers: Vec<McpServerConfig>) -> Self {
        Self {
            servers,
            registry: RwLock::new(None),
        }
    }

    pub fn has_enabled_servers(&self) -> bool {
        self.servers.iter().any(|s| s.enabled)
    }

    async fn ensure_loaded(&self) {
        if self.registry.read().await.is_some() {
            return;
        }
        let mut guard = self.registry.write().await;
        if guard.is_none() {
            *guard = Some(self.build_registry().await);
        }
    }

    async fn build_registry(&self) -> RemoteRegistry {
        let mut registry = RemoteRegistry::default();
        let mut alias_counts: HashMap<String, usize> = HashMap::new();

        for server_cfg in self.servers.iter().filter(|s| s.enabled) {
            let client = match McpClient::from_config(server_cfg).await {
                Ok(c) => Arc::new(c),
                Err(e) => {
                    warn!(server = %server_cfg.name, error = %e, "failed to connect to MCP server");
                    continue;
                }
            };
            let listed = match client.list_tools().await {
                Ok(res) => res,
                Err(e) => {
                    warn!(server = %server_cfg.name, error = %e, "failed to list MCP tools");
                    continue;
                }
            };

            for tool in listed.tools {
                let alias = unique_alias(
                    tool_alias(client.server_name(), tool.name.as_ref()),
                    &mut alias_counts,
                );
                let description = match &tool.description {
                    Some(desc) => format!("{} (MCP server '{}')", desc, server_cfg.name),
                    None => format!(
                        "Remote MCP tool '{}' provided by server '{}'",
                        tool.name, server_cfg.name
                    ),
                };
                let params = Value::Object(Arc::as_ref(&tool.input_schema).clone());
                registry.order.push(alias.clone());
                registry.lookup.insert(
                    alias.clone(),
                    RemoteTool {
                        remote_name: tool.name.to_string(),
                        def: ToolDef::function(alias, description, params),
                        client: client.clone(),
                    },
                );
            }
        }

        debug!(count = registry.order.len(), "registered MCP tools");
        registry
    }
}

#[async_trait::async_trait]
impl PluginManager for McpManager {
    async fn tool_defs(&self) -> Vec<ToolDef> {
        self.ensure_loaded().await;
        let guard = self.registry.read().await;
        guard
            .as_ref()
            .map(|r| {
                r.order
                    .iter()
                    .filter_map(|alias| r.lookup.get(alias).map(|t| t.def.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn call(&self, name: &str, args: Value) -> Result<ToolResult> {
        self.ensure_loaded().await;
        let tool = {
            let guard = self.registry.read().await;
            guard.as_ref().and_then(|r| r.lookup.get(name).cloned())
        };
        let Some(tool) = tool else {
            bail!("Unknown tool: {name}");
        };

        let arguments: Option<Map<String, Value>> = match args {
            Value::Null => None,
            Value::Object(map) => Some(map),
            other => bail!("MCP tool '{name}' expects object arguments, received {other}"),
        };
        let params = CallToolRequestParam {
            name: tool.remote_name.clone().into(),
            arguments,
        };
        let result = tool.client.call_tool(params).await.map_err(|e| {
            anyhow!(
                "MCP tool '{}' on server '{}' failed: {e}",
                tool.remote_name,
                tool.client.server_name()
            )
        })?;
        Ok(tool_result_from_mcp(&serde_json::to_value(&result)?))
    }
}

/// Converts a serialized `CallToolResult` into a [`ToolResult`]; text content
/// blocks are joined, other content is passed through as JSON.
fn tool_result_from_mcp(value: &Value) -> ToolResult {
    let is_error = value
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let blocks = value
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let texts: Vec<String> = blocks
        .iter()
        .map(|b| match b.get("text").and_then(Value::as_str) {
            Some(t) => t.to_string(),
            None => b.to_string(),
        })
        .collect();
    let text = if texts.is_empty() {
        value
            .get("structuredContent")
            .map(Value::to_string)
            .unwrap_or_default()
    } else {
        texts.join("\n")
    };
    if is_error {
        ToolResult::failure(text)
    } else {
        ToolResult::ok(text)
    }
}

fn tool_alias(server: &str, tool: &str) -> String {
    format!(
        "{PLUGIN_PREFIX}{}__{}",
        sanitize_identifier(server),
        sanitize_identifier(tool)
    )
}

fn sanitize_identifier(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        let mapped = match ch {
            c if c.is_ascii_alphanumeric() => c.to_ascii_lowercase(),
            '-' => '-',
            _ => '_',
        };
        result.push(mapped);
    }
    // Collapse "__" so the server/tool separator stays unambiguous.
    while result.contains("__") {
        result = result.replace("__", "_");
    }
    if result.is_empty() {
        "tool".to_string()
    } else {
        result
    }
}

fn unique_alias(base: String, counts: &mut HashMap<String, usize>) -> String {
    let counter = counts.entry(base.clone()).or_insert(0);
    *counter += 1;
    if *counter == 1 {
        base
    } else {
        format!("{base}_{counter}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aliases_are_prefixed_and_sanitized() {
        assert_eq!(tool_alias("Git Hub", "list.issues"), "mcp__git_hub__list_issues");
        assert_eq!(tool_alias("srv", "a__b"), "mcp__srv__a_b");
        assert_eq!(tool_alias("", "x"), "mcp__tool__x");
    }

    #[test]
    fn duplicate_aliases_get_suffixes() {
        let mut counts = HashMap::new();
        assert_eq!(unique_alias("mcp__a__t".into(), &mut counts), "mcp__a__t");
        assert_eq!(unique_alias("mcp__a__t".into(), &mut counts), "mcp__a__t_2");
        assert_eq!(unique_alias("mcp__a__u".into(), &mut counts), "mcp__a__u");
    }

    #[test]
    fn converts_text_content() {
        let r = tool_result_from_mcp(&json!({
            "content": [{"type": "text", "text": "one"}, {"type": "text", "text": "two"}]
        }));
        assert_eq!(r, ToolResult::ok("one\ntwo"));

        let r = tool_result_from_mcp(&json!({
            "content": [{"type": "text", "text": "bad input"}],
            "isError": true
        }));
        assert_eq!(r, ToolResult::failure("bad input"));
    }

    #[test]
    fn falls_back_to_structured_content() {
        let r = tool_result_from_mcp(&json!({"content": [], "structuredContent": {"n": 1}}));
        assert_eq!(r.output.as_deref(), Some("{\"n\":1}"));
    }

    #[tokio::test]
    async fn disabled_servers_are_not_contacted() {
        let mgr = McpManager::new(vec![McpServerConfig {
            name: "off".into(),
            enabled: false,
            address: "does-not-exist --stdio".into(),
            transport: "stdio".into(),
        }]);
        assert!(!mgr.has_enabled_servers());
        assert!(mgr.tool_defs().await.is_empty());
        let err = mgr.call("mcp__off__x", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Unknown tool"));
    }
}
