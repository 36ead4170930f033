use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::types::ToolDef;

mod execute;
mod fs;
mod registry;
mod todo;

pub use execute::ExecuteBash;
pub use fs::{FsList, FsRead, FsWrite, SearchText};
pub use registry::ToolRegistry;
pub use todo::{TodoItem, TodoList, TodoRead, TodoWrite};

/// Tool names starting with this prefix are served by the [`PluginManager`].
pub const PLUGIN_PREFIX: &str = "mcp__";

/// Outcome of one tool invocation, fed back to the model as a `tool` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Shorter text for display; the model always sees `output`/`error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_output: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display_output = Some(display.into());
        self
    }

    /// The text sent back to the model.
    pub fn message_content(&self) -> String {
        if self.success {
            self.output.clone().unwrap_or_default()
        } else {
            self.error.clone().unwrap_or_else(|| "unknown error".to_string())
        }
    }

    /// The text shown to a user.
    pub fn display(&self) -> String {
        self.display_output
            .clone()
            .unwrap_or_else(|| self.message_content())
    }
}

/// A locally implemented tool.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDef;

    /// `args` is the parsed argument object. An `Err` is reported to the model
    /// as a failed [`ToolResult`].
    async fn call(&self, args: Value) -> Result<ToolResult>;
}

/// Source of externally provided tools (MCP servers). Names it serves carry
/// the [`PLUGIN_PREFIX`].
#[async_trait::async_trait]
pub trait PluginManager: Send + Sync {
    async fn tool_defs(&self) -> Vec<ToolDef>;

    async fn call(&self, name: &str, args: Value) -> Result<ToolResult>;
}

pub(crate) fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing required string argument: {key}"))
}

pub(crate) fn arg_usize(args: &Value, key: &str) -> Option<usize> {
    args.get(key).and_then(Value::as_u64).map(|v| v as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_serialization_skips_absent_fields() {
        let v = serde_json::to_value(ToolResult::ok("done")).unwrap();
        assert_eq!(v, json!({"success": true, "output": "done"}));
        let v = serde_json::to_value(ToolResult::failure("nope")).unwrap();
        assert_eq!(v, json!({"success": false, "error": "nope"}));
    }

    #[test]
    fn message_content_follows_success() {
        assert_eq!(ToolResult::ok("out").message_content(), "out");
        assert_eq!(
            ToolResult::failure("[Cancelled by user]").message_content(),
            "[Cancelled by user]"
        );
        let r = ToolResult::ok("long output").with_display("short");
        assert_eq!(r.display(), "short");
        assert_eq!(r.message_content(), "long output");
    }
}
