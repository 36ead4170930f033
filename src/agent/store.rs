use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::agent::chat::{ChatEntry, EntryKind};
use crate::agent::error::AgentError;
use crate::llm::types::{ChatMessage, Role, ToolCall};
use crate::tools::ToolResult;

/// Backend message log plus display entries.
///
/// The two lists stay parallel at tool boundaries: every call in an assistant
/// message has a `ToolCall`/`ToolResult` entry with the same id, and each
/// `tool` message follows its call in the same relative order.
#[derive(Debug, Default, Clone)]
pub struct ConversationStore {
    messages: Vec<ChatMessage>,
    entries: Vec<ChatEntry>,
    /// Call id to the index of its pending `ToolCall` entry.
    pending: HashMap<String, usize>,
}

impl ConversationStore {
    pub fn new(system_prompt: Option<String>) -> Self {
        let mut store = Self::default();
        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            store.messages.push(ChatMessage::system(prompt));
        }
        store
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The last plain assistant answer at or after message index `since`.
    pub fn last_assistant_message(&self, since: usize) -> Option<&ChatMessage> {
        self.messages
            .get(since..)?
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && m.tool_calls.is_empty())
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.messages.push(ChatMessage::user(text.clone()));
        self.entries.push(ChatEntry::user(text));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.messages.push(ChatMessage::assistant(text.clone()));
        self.entries.push(ChatEntry::assistant(text));
    }

    /// Display-only assistant entry; the backend never sees it.
    pub fn push_error_reply(&mut self, text: impl Into<String>) {
        self.entries.push(ChatEntry::assistant(text));
    }

    /// Display-only system notice.
    pub fn push_notice(&mut self, text: impl Into<String>) {
        self.entries.push(ChatEntry::system(text));
    }

    /// Records an assistant message that requests `calls` in both lists and
    /// opens one pending entry per call.
    pub fn begin_tool_round(&mut self, content: Option<String>, calls: Vec<ToolCall>) {
        let content = content.filter(|c| !c.trim().is_empty());
        self.entries
            .push(ChatEntry::assistant(content.clone().unwrap_or_default()));
        self.open_calls(content, calls);
    }

    /// Like [`Self::begin_tool_round`] for a call the user issued directly;
    /// only the pending call is shown.
    pub fn begin_local_call(&mut self, call: ToolCall) {
        self.open_calls(None, vec![call]);
    }

    fn open_calls(&mut self, content: Option<String>, calls: Vec<ToolCall>) {
        for call in &calls {
            self.pending.insert(call.id.clone(), self.entries.len());
            self.entries.push(ChatEntry::tool_call(call.clone()));
        }
        self.messages
            .push(ChatMessage::assistant_with_tools(content, calls));
    }

    /// Replaces the pending entry for `id` with its result and appends the
    /// matching `tool` message.
    pub fn complete_tool_call(&mut self, id: &str, result: ToolResult) -> Result<(), AgentError> {
        let idx = self
            .pending
            .remove(id)
            .ok_or_else(|| AgentError::UnknownToolCall(id.to_string()))?;
        let call = self.entries[idx]
            .tool_call
            .clone()
            .ok_or_else(|| AgentError::UnknownToolCall(id.to_string()))?;
        self.messages
            .push(ChatMessage::tool(id, result.message_content()));
        self.entries[idx] = ChatEntry::tool_result(call, result);
        Ok(())
    }

    /// Gives every pending call `placeholder` as a failed result, in the order
    /// the calls were made. Returns what was resolved.
    pub fn resolve_dangling(&mut self, placeholder: &str) -> Vec<(ToolCall, ToolResult)> {
        let mut pending: Vec<(String, usize)> = self.pending.drain().collect();
        pending.sort_by_key(|(_, idx)| *idx);
        let mut resolved = Vec::with_capacity(pending.len());
        for (id, idx) in pending {
            let Some(call) = self.entries[idx].tool_call.clone() else {
                continue;
            };
            warn!(id = %id, tool = %call.name(), placeholder, "resolving dangling tool call");
            let result = ToolResult::failure(placeholder);
            self.messages
                .push(ChatMessage::tool(id, result.message_content()));
            self.entries[idx] = ChatEntry::tool_result(call.clone(), result.clone());
            resolved.push((call, result));
        }
        resolved
    }

    /// Replaces the whole conversation. Tool calls without a result and tool
    /// messages without a call are dropped, as are unfinished tool-call entries.
    pub fn load_history(&mut self, messages: Vec<ChatMessage>, entries: Vec<ChatEntry>) {
        self.messages = drop_orphans(messages);
        self.entries = entries
            .into_iter()
            .filter(|e| e.kind != EntryKind::ToolCall)
            .collect();
        self.pending.clear();
    }

    /// Keeps the system prompt plus the last `keep` messages, then drops any
    /// tool pairs the cut split apart.
    pub fn compact(&mut self, keep: usize) {
        let before = self.messages.len();
        let system = self
            .messages
            .first()
            .filter(|m| m.role == Role::System)
            .cloned();
        let body_start = usize::from(system.is_some());
        let body = &self.messages[body_start..];
        let tail_start = body.len().saturating_sub(keep);
        let mut kept: Vec<ChatMessage> = system.into_iter().collect();
        kept.extend_from_slice(&body[tail_start..]);
        self.messages = drop_orphans(kept);
        debug!(before, after = self.messages.len(), "compacted conversation history");
    }

    /// Empties the conversation, keeping only the system prompt.
    pub fn clear(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
        self.messages.truncate(1);
        self.entries.clear();
        self.pending.clear();
    }
}

fn drop_orphans(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let answered: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.clone())
        .collect();
    let requested: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter().map(|c| c.id.clone()))
        .collect();

    messages
        .into_iter()
        .filter_map(|mut m| match m.role {
            Role::Assistant if !m.tool_calls.is_empty() => {
                m.tool_calls.retain(|c| answered.contains(&c.id));
                if m.tool_calls.is_empty() && m.content_str().trim().is_empty() {
                    None
                } else {
                    Some(m)
                }
            }
            Role::Tool => match &m.tool_call_id {
                Some(id) if requested.contains(id) => Some(m),
                _ => None,
            },
            _ => Some(m),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall::new(id, "fs_read", "{}")
    }

    #[test]
    fn completing_a_call_replaces_entry_in_place() {
        let mut store = ConversationStore::new(None);
        store.push_user("read two files");
        store.begin_tool_round(Some("Looking.".into()), vec![call("a"), call("b")]);
        assert_eq!(store.entries().len(), 4);
        assert!(store.has_pending());

        store.complete_tool_call("b", ToolResult::ok("B")).unwrap();
        store.complete_tool_call("a", ToolResult::ok("A")).unwrap();
        assert!(!store.has_pending());

        let kinds: Vec<EntryKind> = store.entries().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EntryKind::User,
                EntryKind::Assistant,
                EntryKind::ToolResult,
                EntryKind::ToolResult
            ]
        );
        assert_eq!(store.entries()[2].call_id(), Some("a"));
        assert_eq!(store.entries()[3].content, "B");
        assert_eq!(store.messages().len(), 4);
    }

    #[test]
    fn completing_unknown_call_is_an_error() {
        let mut store = ConversationStore::new(None);
        assert_eq!(
            store.complete_tool_call("zzz", ToolResult::ok("")),
            Err(AgentError::UnknownToolCall("zzz".into()))
        );
    }

    #[test]
    fn resolve_dangling_fills_in_call_order() {
        let mut store = ConversationStore::new(None);
        store.begin_tool_round(None, vec![call("a"), call("b"), call("c")]);
        store.complete_tool_call("a", ToolResult::ok("A")).unwrap();

        let resolved = store.resolve_dangling("[Error: interrupted]");
        let ids: Vec<&str> = resolved.iter().map(|(c, _)| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(store.resolve_dangling("[Error: interrupted]").is_empty());

        let tool_ids: Vec<&str> = store
            .messages()
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(tool_ids, vec!["a", "b", "c"]);
        assert_eq!(store.messages()[3].content_str(), "[Error: interrupted]");
        let kinds: Vec<EntryKind> = store.entries().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EntryKind::Assistant,
                EntryKind::ToolResult,
                EntryKind::ToolResult,
                EntryKind::ToolResult
            ]
        );
    }

    #[test]
    fn tool_round_without_text_still_gets_an_assistant_entry() {
        let mut store = ConversationStore::new(None);
        store.push_user("list");
        store.begin_tool_round(None, vec![call("a")]);
        assert_eq!(store.entries().len(), 3);
        assert_eq!(store.entries()[1].kind, EntryKind::Assistant);
        assert_eq!(store.entries()[1].content, "");
        assert_eq!(store.entries()[2].kind, EntryKind::ToolCall);
        assert_eq!(store.messages().len(), 2);
    }

    #[test]
    fn local_call_shows_only_the_call() {
        let mut store = ConversationStore::new(None);
        store.push_user("!ls");
        store.begin_local_call(call("bash_1"));
        store.complete_tool_call("bash_1", ToolResult::ok("out")).unwrap();
        let kinds: Vec<EntryKind> = store.entries().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EntryKind::User, EntryKind::ToolResult]);
        assert_eq!(store.messages().len(), 3);
    }

    #[test]
    fn last_assistant_message_only_looks_past_the_mark() {
        let mut store = ConversationStore::new(None);
        store.push_user("one");
        store.push_assistant("first answer");
        let mark = store.messages().len();
        store.push_user("two");
        assert!(store.last_assistant_message(mark).is_none());
        store.push_assistant("second answer");
        assert_eq!(
            store.last_assistant_message(mark).map(|m| m.content_str()),
            Some("second answer")
        );
        assert_eq!(
            store.last_assistant_message(0).map(|m| m.content_str()),
            Some("second answer")
        );
        assert!(store.last_assistant_message(99).is_none());
    }

    #[test]
    fn load_history_drops_orphans() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage::assistant_with_tools(None, vec![call("a"), call("lost")]),
            ChatMessage::tool("a", "A"),
            ChatMessage::tool("stray", "no owner"),
            ChatMessage::assistant_with_tools(None, vec![call("gone")]),
            ChatMessage::assistant_with_tools(Some("keep me".into()), vec![call("gone2")]),
        ];
        let entries = vec![
            ChatEntry::user("hi"),
            ChatEntry::tool_call(call("lost")),
        ];
        let mut store = ConversationStore::new(None);
        store.load_history(messages, entries);

        let msgs = store.messages();
        assert_eq!(msgs.len(), 5);
        assert_eq!(msgs[2].tool_calls.len(), 1);
        assert_eq!(msgs[2].tool_calls[0].id, "a");
        assert_eq!(msgs[3].tool_call_id.as_deref(), Some("a"));
        assert_eq!(msgs[4].content_str(), "keep me");
        assert!(msgs[4].tool_calls.is_empty());
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn compact_keeps_system_and_tail_without_splitting_pairs() {
        let mut store = ConversationStore::new(Some("sys".into()));
        for i in 0..5 {
            store.push_user(format!("q{i}"));
            store.push_assistant(format!("a{i}"));
        }
        store.begin_tool_round(None, vec![call("t")]);
        store.complete_tool_call("t", ToolResult::ok("T")).unwrap();
        store.push_assistant("done");

        // Keeping 2 cuts between the call and its result.
        store.compact(2);
        let msgs = store.messages();
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].content_str(), "done");

        let mut store = ConversationStore::new(Some("sys".into()));
        for i in 0..30 {
            store.push_user(format!("q{i}"));
        }
        store.compact(20);
        assert_eq!(store.messages().len(), 21);
        assert_eq!(store.messages()[1].content_str(), "q10");
    }

    #[test]
    fn clear_keeps_system_prompt() {
        let mut store = ConversationStore::new(Some("sys".into()));
        store.push_user("hi");
        store.clear();
        assert_eq!(store.messages().len(), 1);
        assert!(store.entries().is_empty());

        let mut store = ConversationStore::new(None);
        store.push_user("hi");
        store.clear();
        assert!(store.messages().is_empty());
    }
}
