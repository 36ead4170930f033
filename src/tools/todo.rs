use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

use crate::llm::types::ToolDef;
use crate::tools::{ToolHandler, ToolResult};

const STATUSES: [&str; 3] = ["pending", "in_progress", "completed"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: String, // pending, in_progress, completed
}

/// Session-scoped todo list shared by `todo_write` and `todo_read`.
#[derive(Debug, Clone, Default)]
pub struct TodoList {
    items: Arc<Mutex<Vec<TodoItem>>>,
}

impl TodoList {
    /// Updates items with a matching id and appends the rest.
    pub fn merge(&self, incoming: Vec<TodoItem>) -> Result<Vec<TodoItem>> {
        for item in &incoming {
            if !STATUSES.contains(&item.status.as_str()) {
                bail!("invalid todo status '{}' for item {}", item.status, item.id);
            }
        }
        let mut items = self
            .items
            .lock()
            .map_err(|_| anyhow::anyhow!("todo list lock poisoned"))?;
        for new_item in incoming {
            if let Some(pos) = items.iter().position(|t| t.id == new_item.id) {
                items[pos] = new_item;
            } else {
                items.push(new_item);
            }
        }
        Ok(items.clone())
    }

    pub fn snapshot(&self) -> Vec<TodoItem> {
        self.items.lock().map(|i| i.clone()).unwrap_or_default()
    }
}

fn render(items: &[TodoItem]) -> String {
    if items.is_empty() {
        return "No todos.".to_string();
    }
    items
        .iter()
        .map(|t| {
            let mark = match t.status.as_str() {
                "completed" => "[x]",
                "in_progress" => "[~]",
                _ => "[ ]",
            };
            format!("{mark} {} ({})", t.content, t.id)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone)]
pub struct TodoWrite {
    list: TodoList,
}

impl TodoWrite {
    pub fn new(list: TodoList) -> Self {
        Self { list }
    }
}

#[async_trait::async_trait]
impl ToolHandler for TodoWrite {
    fn definition(&self) -> ToolDef {
        ToolDef::function(
            "todo_write",
            "Creates or updates the task list for this session. Items with an existing id are replaced; new ids are appended. Keep at most one item in_progress.",
            json!({
                "type": "object",
                "properties": {
                    "todos": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "content": {"type": "string", "minLength": 1},
                                "status": {"type": "string", "enum": STATUSES}
                            },
                            "required": ["id", "content", "status"]
                        }
                    }
                },
                "required": ["todos"]
            }),
        )
    }

    async fn call(&self, args: Value) -> Result<ToolResult> {
        let todos = args
            .get("todos")
            .cloned()
            .context("missing required argument: todos")?;
        let todos: Vec<TodoItem> =
            serde_json::from_value(todos).context("todos must be a list of {id, content, status}")?;
        let items = self.list.merge(todos)?;
        let json = serde_json::to_string_pretty(&json!({ "todos": items }))?;
        Ok(ToolResult::ok(json).with_display(render(&items)))
    }
}

#[derive(Debug, Clone)]
pub struct TodoRead {
    list: TodoList,
}

impl TodoRead {
    pub fn new(list: TodoList) -> Self {
        Self { list }
    }
}

#[async_trait::async_trait]
impl ToolHandler for TodoRead {
    fn definition(&self) -> ToolDef {
        ToolDef::function(
            "todo_read",
            "Returns the current task list for this session.",
            json!({"type": "object", "properties": {}}),
        )
    }

    async fn call(&self, _args: Value) -> Result<ToolResult> {
        let items = self.list.snapshot();
        let json = serde_json::to_string_pretty(&json!({ "todos": items }))?;
        Ok(ToolResult::ok(json).with_display(render(&items)))
    }
}
