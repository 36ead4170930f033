//! Observers run after each completed turn.
use crate::llm::types::ChatMessage;
use anyhow::Result;

/// Trait definition for turn hooks
#[async_trait::async_trait]
pub trait TurnHook: Send + Sync {
    /// Name of the hook for identification
    fn name(&self) -> &str;

    /// Runs after a turn finishes.
    /// - `messages`: the complete conversation history
    /// - `final_msg`: the final assistant message, if the turn produced one
    async fn after_turn(
        &self,
        messages: &[ChatMessage],
        final_msg: Option<&ChatMessage>,
    ) -> Result<()>;
}

/// Collection of hooks to execute after each turn. Hook failures are logged
/// and never reach the caller.
#[derive(Default)]
pub struct HookManager {
    hooks: Vec<Box<dyn TurnHook>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hook(&mut self, hook: Box<dyn TurnHook>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn run_after_turn(&self, messages: &[ChatMessage], final_msg: Option<&ChatMessage>) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_turn(messages, final_msg).await {
                tracing::error!(hook = %hook.name(), error = %e, "turn hook failed");
            }
        }
    }
}
