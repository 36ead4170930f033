use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::types::ToolCall;
use crate::tools::ToolResult;

/// Content of a tool-call entry whose execution has not finished.
pub const EXECUTING: &str = "Executing...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    User,
    Assistant,
    ToolCall,
    ToolResult,
    System,
}

/// Display-facing record of the conversation. Tool calls go through two
/// phases: a `ToolCall` entry is created before execution and replaced in
/// place by a `ToolResult` entry once the result is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub kind: EntryKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
}

impl ChatEntry {
    fn new(kind: EntryKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: Utc::now(),
            tool_call: None,
            tool_result: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(EntryKind::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(EntryKind::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(EntryKind::System, content)
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            tool_call: Some(call),
            ..Self::new(EntryKind::ToolCall, EXECUTING)
        }
    }

    pub fn tool_result(call: ToolCall, result: ToolResult) -> Self {
        Self {
            tool_call: Some(call),
            content: result.display(),
            tool_result: Some(result),
            ..Self::new(EntryKind::ToolResult, "")
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.tool_call.as_ref().map(|c| c.id.as_str())
    }
}

/// Incremental output of a streamed turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Assistant text as it arrives. Error replies are sent this way too.
    Content { content: String },
    /// The calls of a tool round, sent once before any of them run.
    ToolCalls { tool_calls: Vec<ToolCall> },
    ToolResult {
        tool_call_id: String,
        name: String,
        result: ToolResult,
    },
    TokenCount { tokens: usize },
    /// Last chunk of every turn; `message` carries a system notice when the
    /// turn ended early.
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}
