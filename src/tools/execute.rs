use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::llm::types::ToolDef;
use crate::tools::{ToolHandler, ToolResult, arg_str};

/// Runs a shell command through `bash -c` in the project root.
#[derive(Debug, Clone)]
pub struct ExecuteBash {
    root: PathBuf,
}

impl ExecuteBash {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn run(&self, command: &str) -> Result<ToolResult> {
        debug!(command, root = %self.root.display(), "execute_bash");
        let output = Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute command: {command}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.success() {
            let mut text = stdout;
            if !stderr.is_empty() {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&stderr);
            }
            Ok(ToolResult::ok(text))
        } else {
            let mut result =
                ToolResult::failure(format!("Command failed with {}: {}", output.status, stderr));
            if !stdout.is_empty() {
                result.output = Some(stdout);
            }
            Ok(result)
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for ExecuteBash {
    fn definition(&self) -> ToolDef {
        ToolDef::function(
            "execute_bash",
            "Executes a bash command in the project root and returns its output. Use it for builds, tests, git and other shell tasks.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"}
                },
                "required": ["command"]
            }),
        )
    }

    async fn call(&self, args: Value) -> Result<ToolResult> {
        let command = arg_str(&args, "command")?;
        self.run(command).await
    }
}
