use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::llm::sanitize_tool_arguments;
use crate::llm::types::{ToolCall, ToolDef};
use crate::tools::{
    ExecuteBash, FsList, FsRead, FsWrite, PLUGIN_PREFIX, PluginManager, SearchText, TodoList,
    TodoRead, TodoWrite, ToolHandler, ToolResult,
};

/// Name to handler table plus the optional plugin fallback. Dispatch through
/// [`ToolRegistry::execute`] never fails: every problem becomes a failed
/// [`ToolResult`].
#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: Vec<Arc<dyn ToolHandler>>,
    index: HashMap<String, usize>,
    plugins: Option<Arc<dyn PluginManager>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .field("plugins", &self.plugins.is_some())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in tool set, operating inside `root`.
    pub fn builtin(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let todos = TodoList::default();
        let mut registry = Self::new();
        registry.register(Arc::new(FsRead::new(root.clone())));
        registry.register(Arc::new(FsWrite::new(root.clone())));
        registry.register(Arc::new(FsList::new(root.clone())));
        registry.register(Arc::new(SearchText::new(root.clone())));
        registry.register(Arc::new(ExecuteBash::new(root)));
        registry.register(Arc::new(TodoWrite::new(todos.clone())));
        registry.register(Arc::new(TodoRead::new(todos)));
        registry
    }

    /// Adds a handler; a handler with the same name is replaced in place.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.definition().function.name;
        match self.index.get(&name) {
            Some(&idx) => self.handlers[idx] = handler,
            None => {
                self.index.insert(name, self.handlers.len());
                self.handlers.push(handler);
            }
        }
    }

    pub fn with_plugins(mut self, plugins: Arc<dyn PluginManager>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers
            .iter()
            .map(|h| h.definition().function.name)
            .collect()
    }

    /// Schemas sent to the backend: local tools in registration order, then
    /// plugin tools.
    pub async fn defs(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.handlers.iter().map(|h| h.definition()).collect();
        if let Some(plugins) = &self.plugins {
            defs.extend(plugins.tool_defs().await);
        }
        defs
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let name = call.name();
        let raw = sanitize_tool_arguments(&call.function.arguments);
        let args: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(tool = %name, error = %e, "tool arguments are not valid JSON");
                return ToolResult::failure(format!("Failed to parse tool arguments: {e}"));
            }
        };

        let invocation: BoxFuture<'_, Result<ToolResult>> =
            if let Some(&idx) = self.index.get(name) {
                self.handlers[idx].call(args)
            } else if name.starts_with(PLUGIN_PREFIX)
                && let Some(plugins) = &self.plugins
            {
                plugins.call(name, args)
            } else {
                warn!(tool = %name, "no handler registered");
                return ToolResult::failure(format!("Unknown tool: {name}"));
            };

        debug!(tool = %name, id = %call.id, "executing tool");
        match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                debug!(tool = %name, error = %e, "tool returned an error");
                ToolResult::failure(format!("{e:#}"))
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(tool = %name, panic = %msg, "tool handler panicked");
                ToolResult::failure(format!("Tool {name} panicked: {msg}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Echo {
        seen: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait::async_trait]
    impl ToolHandler for Echo {
        fn definition(&self) -> ToolDef {
            ToolDef::function("echo", "echo args", json!({"type": "object"}))
        }

        async fn call(&self, args: Value) -> Result<ToolResult> {
            self.seen.lock().unwrap().push(args.clone());
            Ok(ToolResult::ok(args.to_string()))
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl ToolHandler for Failing {
        fn definition(&self) -> ToolDef {
            ToolDef::function("failing", "always errors", json!({"type": "object"}))
        }

        async fn call(&self, _args: Value) -> Result<ToolResult> {
            anyhow::bail!("disk on fire")
        }
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl ToolHandler for Panicking {
        fn definition(&self) -> ToolDef {
            ToolDef::function("panicking", "panics", json!({"type": "object"}))
        }

        async fn call(&self, _args: Value) -> Result<ToolResult> {
            panic!("handler exploded")
        }
    }

    struct Plugins;

    #[async_trait::async_trait]
    impl PluginManager for Plugins {
        async fn tool_defs(&self) -> Vec<ToolDef> {
            vec![ToolDef::function("mcp__srv__ping", "ping", json!({"type": "object"}))]
        }

        async fn call(&self, name: &str, _args: Value) -> Result<ToolResult> {
            if name == "mcp__srv__ping" {
                Ok(ToolResult::ok("pong"))
            } else {
                anyhow::bail!("Unknown plugin tool: {name}")
            }
        }
    }

    fn registry_with_echo() -> (ToolRegistry, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Echo { seen: seen.clone() }));
        reg.register(Arc::new(Failing));
        reg.register(Arc::new(Panicking));
        (reg, seen)
    }

    #[tokio::test]
    async fn unknown_tool_is_a_failure_result() {
        let (reg, _) = registry_with_echo();
        let r = reg.execute(&ToolCall::new("c1", "nope", "{}")).await;
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("Unknown tool: nope"));
    }

    #[tokio::test]
    async fn unparseable_arguments_are_reported() {
        let (reg, seen) = registry_with_echo();
        let r = reg.execute(&ToolCall::new("c1", "echo", "{\"a\":")).await;
        assert!(!r.success);
        assert!(
            r.error
                .as_deref()
                .unwrap()
                .starts_with("Failed to parse tool arguments:")
        );
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicated_arguments_are_repaired() {
        let (reg, seen) = registry_with_echo();
        let r = reg
            .execute(&ToolCall::new("c1", "echo", r#"{"a":1}{"a":1}"#))
            .await;
        assert!(r.success, "{r:?}");
        assert_eq!(seen.lock().unwrap().as_slice(), &[json!({"a": 1})]);
    }

    #[tokio::test]
    async fn empty_arguments_parse_as_empty_object() {
        let (reg, seen) = registry_with_echo();
        let r = reg.execute(&ToolCall::new("c1", "echo", "")).await;
        assert!(r.success);
        assert_eq!(seen.lock().unwrap().as_slice(), &[json!({})]);
    }

    #[tokio::test]
    async fn handler_errors_and_panics_are_contained() {
        let (reg, _) = registry_with_echo();
        let r = reg.execute(&ToolCall::new("c1", "failing", "{}")).await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("disk on fire"));

        let r = reg.execute(&ToolCall::new("c2", "panicking", "{}")).await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn plugin_prefix_is_delegated() {
        let (reg, _) = registry_with_echo();
        let reg = reg.with_plugins(Arc::new(Plugins));

        let r = reg.execute(&ToolCall::new("c1", "mcp__srv__ping", "{}")).await;
        assert_eq!(r, ToolResult::ok("pong"));

        let r = reg.execute(&ToolCall::new("c2", "mcp__srv__gone", "{}")).await;
        assert!(!r.success);

        let names: Vec<String> = reg
            .defs()
            .await
            .into_iter()
            .map(|d| d.function.name)
            .collect();
        assert_eq!(names, vec!["echo", "failing", "panicking", "mcp__srv__ping"]);
    }

    #[tokio::test]
    async fn prefixed_name_without_plugins_is_unknown() {
        let (reg, _) = registry_with_echo();
        let r = reg.execute(&ToolCall::new("c1", "mcp__srv__ping", "{}")).await;
        assert_eq!(r.error.as_deref(), Some("Unknown tool: mcp__srv__ping"));
    }

    #[test]
    fn register_replaces_same_name() {
        let (mut reg, _) = registry_with_echo();
        let seen = Arc::new(Mutex::new(Vec::new()));
        reg.register(Arc::new(Echo { seen }));
        assert_eq!(reg.names(), vec!["echo", "failing", "panicking"]);
    }

    #[test]
    fn builtin_registers_all_tools() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ToolRegistry::builtin(dir.path());
        assert_eq!(
            reg.names(),
            vec![
                "fs_read",
                "fs_write",
                "fs_list",
                "search_text",
                "execute_bash",
                "todo_write",
                "todo_read"
            ]
        );
    }
}
