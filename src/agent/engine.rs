use anyhow::{Result, anyhow};
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::cancel::{AbortHandle, AbortSlot};
use crate::agent::chat::{ChatEntry, StreamChunk};
use crate::agent::error::AgentError;
use crate::agent::store::ConversationStore;
use crate::agent::tokens::TokenCounter;
use crate::config::AgentConfig;
use crate::hooks::HookManager;
use crate::llm::types::{ChatMessage, ChoiceMessage, ToolCall, ToolDef};
use crate::llm::{
    ChatBackend, LlmErrorKind, delta, is_cancelled, is_context_overflow, sanitize_tool_arguments,
};
use crate::tools::{ToolRegistry, ToolResult};

pub const CANCELLED_PLACEHOLDER: &str = "[Cancelled by user]";
pub const CANCELLED_NOTICE: &str = "[Operation cancelled by user]";
pub const INTERRUPTED_PLACEHOLDER: &str = "[Error: interrupted]";
pub const COMPACTED_NOTICE: &str = "Conversation history was too long and has been compacted to the most recent messages. Please retry your request.";

pub fn round_limit_notice(max_rounds: usize) -> String {
    format!(
        "Maximum tool execution rounds ({max_rounds}) reached. Stopping to prevent infinite loops."
    )
}

type ChunkTx = UnboundedSender<StreamChunk>;

fn emit(tx: Option<&ChunkTx>, chunk: StreamChunk) {
    if let Some(tx) = tx {
        // The receiver goes away when a streaming caller stops listening.
        let _ = tx.send(chunk);
    }
}

/// How a turn ended without an error.
#[derive(Debug, PartialEq, Eq)]
enum TurnEnd {
    Answered,
    Cancelled,
    RoundLimit,
}

/// Drives one conversation: user message in, model and tool rounds until the
/// model answers, the round limit is hit, or the caller aborts.
///
/// Turn entry points take `&mut self`, so at most one turn runs per engine.
/// Use [`TurnEngine::abort_handle`] to cancel a turn from elsewhere.
pub struct TurnEngine {
    backend: Arc<dyn ChatBackend>,
    tools: ToolRegistry,
    store: ConversationStore,
    config: AgentConfig,
    abort: AbortSlot,
    tokens: TokenCounter,
    hooks: HookManager,
}

impl TurnEngine {
    pub fn new(backend: Arc<dyn ChatBackend>, tools: ToolRegistry, config: AgentConfig) -> Self {
        let interval = Duration::from_millis(config.token_update_interval_ms);
        Self {
            backend,
            tools,
            store: ConversationStore::new(None),
            config,
            abort: AbortSlot::default(),
            tokens: TokenCounter::new(interval),
            hooks: HookManager::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.store = ConversationStore::new(Some(prompt.into()));
        self
    }

    pub fn with_hooks(mut self, hooks: HookManager) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.handle()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.store.messages()
    }

    pub fn entries(&self) -> &[ChatEntry] {
        self.store.entries()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.current()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn load_history(&mut self, messages: Vec<ChatMessage>, entries: Vec<ChatEntry>) {
        self.store.load_history(messages, entries);
        self.tokens.recompute(self.store.messages());
    }

    pub fn clear(&mut self) {
        self.store.clear();
        self.tokens.recompute(self.store.messages());
    }

    /// Runs one turn and returns the entries it added, user entry first.
    pub async fn process_message(&mut self, text: &str) -> Vec<ChatEntry> {
        let start = self.store.entries().len();
        self.run_turn(text.to_string(), None).await;
        self.store.entries()[start..].to_vec()
    }

    /// Runs one turn, yielding chunks as they become known. The last chunk
    /// is always [`StreamChunk::Done`].
    pub fn process_message_stream(
        &mut self,
        text: impl Into<String>,
    ) -> impl Stream<Item = StreamChunk> + '_ {
        let text = text.into();
        let (tx, mut rx) = unbounded_channel();
        async_stream::stream! {
            let turn = self.run_turn(text, Some(tx));
            tokio::pin!(turn);
            let mut finished = false;
            loop {
                let next = tokio::select! {
                    biased;
                    chunk = rx.recv() => chunk,
                    _ = &mut turn, if !finished => {
                        finished = true;
                        continue;
                    }
                };
                match next {
                    Some(chunk) => yield chunk,
                    None => break,
                }
            }
        }
    }

    /// Runs `command` directly as an `execute_bash` call, outside the model
    /// loop. Messages record it like a model-requested call; the entries are
    /// the user line and the result.
    pub async fn run_shell_command(&mut self, command: &str) -> Vec<ChatEntry> {
        let start = self.store.entries().len();
        let guard = self.abort.arm();
        let cancel = guard.token();

        let args = serde_json::json!({ "command": command }).to_string();
        let call = ToolCall::new(format!("bash_{}", Uuid::new_v4().simple()), "execute_bash", args);
        info!(id = %call.id, command, "running shell command");

        self.settle_abandoned_calls();
        self.store.push_user(format!("!{command}"));
        self.store.begin_local_call(call.clone());
        let result = match self.execute_one(&call, &cancel).await {
            None => ToolResult::failure(CANCELLED_PLACEHOLDER),
            Some(Ok(result)) => result,
            Some(Err(e)) => ToolResult::failure(e.to_string()),
        };
        if let Err(e) = self.store.complete_tool_call(&call.id, result) {
            error!(error = %e, "shell command result had no pending entry");
        }
        self.tokens.recompute(self.store.messages());
        drop(guard);
        self.store.entries()[start..].to_vec()
    }

    async fn run_turn(&mut self, text: String, tx: Option<ChunkTx>) {
        let tx = tx.as_ref();
        let guard = self.abort.arm();
        let cancel = guard.token();
        debug!(chars = text.len(), "turn started");

        self.settle_abandoned_calls();
        let mut turn_start = self.store.messages().len();
        self.store.push_user(text);
        let tool_defs = self.tools.defs().await;
        let outcome = self.turn_loop(&tool_defs, &cancel, tx).await;

        // Every call that went pending gets a terminal result before control
        // returns; normally there is none left.
        for (call, result) in self.store.resolve_dangling(INTERRUPTED_PLACEHOLDER) {
            emit(
                tx,
                StreamChunk::ToolResult {
                    tool_call_id: call.id.clone(),
                    name: call.function.name.clone(),
                    result,
                },
            );
        }

        let notice = match outcome {
            Ok(TurnEnd::Answered) => None,
            Ok(TurnEnd::Cancelled) => Some(CANCELLED_NOTICE.to_string()),
            Ok(TurnEnd::RoundLimit) => Some(round_limit_notice(self.config.max_tool_rounds)),
            Err(e) if is_cancelled(&e) => Some(CANCELLED_NOTICE.to_string()),
            Err(e) if is_context_overflow(&e) => {
                warn!(error = %e, keep = self.config.compact_keep_messages, "context overflow; compacting history");
                self.store.compact(self.config.compact_keep_messages);
                turn_start = self.store.messages().len();
                Some(COMPACTED_NOTICE.to_string())
            }
            Err(e) => {
                error!(error = %e, "turn failed");
                let reply = format!("Sorry, I encountered an error: {e}");
                self.store.push_error_reply(reply.clone());
                emit(tx, StreamChunk::Content { content: reply });
                None
            }
        };
        if let Some(text) = &notice {
            self.store.push_notice(text.clone());
        }

        let tokens = self.tokens.recompute(self.store.messages());
        emit(tx, StreamChunk::TokenCount { tokens });

        if !self.hooks.is_empty() {
            self.hooks
                .run_after_turn(
                    self.store.messages(),
                    self.store.last_assistant_message(turn_start),
                )
                .await;
        }
        drop(guard);
        debug!(tokens, "turn finished");
        emit(tx, StreamChunk::Done { message: notice });
    }

    /// A turn whose future was dropped mid-round (for example an abandoned
    /// stream) leaves calls pending; close them before anything new is sent.
    fn settle_abandoned_calls(&mut self) {
        let settled = self.store.resolve_dangling(INTERRUPTED_PLACEHOLDER);
        if !settled.is_empty() {
            warn!(count = settled.len(), "closed tool calls left by an abandoned turn");
        }
    }

    async fn turn_loop(
        &mut self,
        tool_defs: &[ToolDef],
        cancel: &CancellationToken,
        tx: Option<&ChunkTx>,
    ) -> Result<TurnEnd> {
        let mut rounds = 0usize;
        let mut retried_empty = false;
        let mut followed_up_short = false;
        let mut had_tool_round = false;

        loop {
            if cancel.is_cancelled() {
                return Ok(TurnEnd::Cancelled);
            }

            let msg = self.request_response(tool_defs, cancel, tx).await?;

            if !msg.tool_calls.is_empty() {
                rounds += 1;
                if rounds > self.config.max_tool_rounds {
                    warn!(rounds, max = self.config.max_tool_rounds, "max tool rounds reached");
                    return Ok(TurnEnd::RoundLimit);
                }
                let calls = prepare_calls(msg.tool_calls);
                debug!(round = rounds, calls = calls.len(), "tool round");
                self.store.begin_tool_round(msg.content, calls.clone());
                emit(
                    tx,
                    StreamChunk::ToolCalls {
                        tool_calls: calls.clone(),
                    },
                );

                for (i, call) in calls.iter().enumerate() {
                    if cancel.is_cancelled() {
                        self.cancel_remaining(&calls[i..], tx);
                        return Ok(TurnEnd::Cancelled);
                    }
                    let result = match self.execute_one(call, cancel).await {
                        None => {
                            self.cancel_remaining(&calls[i..], tx);
                            return Ok(TurnEnd::Cancelled);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(result)) => result,
                    };
                    self.store.complete_tool_call(&call.id, result.clone())?;
                    emit(
                        tx,
                        StreamChunk::ToolResult {
                            tool_call_id: call.id.clone(),
                            name: call.function.name.clone(),
                            result,
                        },
                    );
                }

                had_tool_round = true;
                let tokens = self.tokens.recompute(self.store.messages());
                emit(tx, StreamChunk::TokenCount { tokens });
                continue;
            }

            let content = msg.content.unwrap_or_default();
            if content.trim().is_empty() {
                if !retried_empty {
                    retried_empty = true;
                    debug!("empty response; requesting once more");
                    continue;
                }
                warn!("backend returned an empty response twice; ending turn");
                return Ok(TurnEnd::Answered);
            }

            let short = content.chars().count() <= self.config.short_response_followup_chars;
            self.store.push_assistant(content);
            if short && had_tool_round && !followed_up_short {
                followed_up_short = true;
                debug!("short answer after tool use; requesting a follow-up");
                continue;
            }
            return Ok(TurnEnd::Answered);
        }
    }

    /// One model response, atomic or streamed and reduced.
    async fn request_response(
        &mut self,
        tool_defs: &[ToolDef],
        cancel: &CancellationToken,
        tx: Option<&ChunkTx>,
    ) -> Result<ChoiceMessage> {
        let messages = self.store.messages().to_vec();
        let backend = self.backend.clone();

        if !self.config.stream {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(anyhow!(LlmErrorKind::Cancelled)),
                res = backend.chat(messages, tool_defs, cancel.clone()) => res?,
            };
            if let Some(content) = msg.content.as_deref()
                && !content.is_empty()
            {
                emit(
                    tx,
                    StreamChunk::Content {
                        content: content.to_string(),
                    },
                );
            }
            return Ok(msg);
        }

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(anyhow!(LlmErrorKind::Cancelled)),
            res = backend.chat_stream(messages, tool_defs, cancel.clone()) => res?,
        };

        let mut acc = Value::Object(Map::new());
        let mut streamed_chars = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(anyhow!(LlmErrorKind::Cancelled)),
                next = stream.next() => next,
            };
            let Some(fragment) = next else {
                break;
            };
            let fragment = fragment?;
            if let Some(text) = fragment.get("content").and_then(Value::as_str)
                && !text.is_empty()
            {
                streamed_chars += text.chars().count();
                emit(
                    tx,
                    StreamChunk::Content {
                        content: text.to_string(),
                    },
                );
                if let Some(tokens) = self
                    .tokens
                    .streaming_update(self.store.messages(), streamed_chars)
                {
                    emit(tx, StreamChunk::TokenCount { tokens });
                }
            }
            acc = delta::reduce(acc, &fragment);
        }
        Ok(delta::into_choice_message(acc))
    }

    /// Runs one call under the tool timeout. `None` means the turn was
    /// cancelled while the tool ran.
    async fn execute_one(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Option<Result<ToolResult, AgentError>> {
        let timeout_ms = self.config.tool_timeout_ms;
        let run = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.tools.execute(call),
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = run => Some(res.map_err(|_| {
                warn!(tool = %call.name(), timeout_ms, "tool timed out");
                AgentError::ToolTimeout {
                    name: call.function.name.clone(),
                    timeout_ms,
                }
            })),
        }
    }

    fn cancel_remaining(&mut self, calls: &[ToolCall], tx: Option<&ChunkTx>) {
        info!(remaining = calls.len(), "turn cancelled; skipping remaining tool calls");
        for call in calls {
            let result = ToolResult::failure(CANCELLED_PLACEHOLDER);
            if let Err(e) = self.store.complete_tool_call(&call.id, result.clone()) {
                error!(error = %e, "cancelled call had no pending entry");
                continue;
            }
            emit(
                tx,
                StreamChunk::ToolResult {
                    tool_call_id: call.id.clone(),
                    name: call.function.name.clone(),
                    result,
                },
            );
        }
    }
}

/// Sanitises arguments and gives every call a unique, non-empty id.
fn prepare_calls(mut calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    for call in &mut calls {
        call.function.arguments = sanitize_tool_arguments(&call.function.arguments);
        if call.id.is_empty() || !seen.insert(call.id.clone()) {
            call.id = format!("call_{}", Uuid::new_v4().simple());
            seen.insert(call.id.clone());
        }
    }
    calls
}
