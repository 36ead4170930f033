use std::time::{Duration, Instant};

use crate::llm::types::ChatMessage;

const CHARS_PER_TOKEN: usize = 4;
const MESSAGE_OVERHEAD: usize = 4;

/// Rough token estimate for a message list: a quarter token per character
/// plus a fixed overhead per message.
pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(message_tokens).sum()
}

fn message_tokens(msg: &ChatMessage) -> usize {
    let mut chars = msg.content_str().chars().count();
    for call in &msg.tool_calls {
        chars += call.function.name.len() + call.function.arguments.chars().count();
    }
    if let Some(id) = &msg.tool_call_id {
        chars += id.len();
    }
    chars.div_ceil(CHARS_PER_TOKEN) + MESSAGE_OVERHEAD
}

/// Tracks the conversation token estimate and rate-limits updates while a
/// response is streaming.
#[derive(Debug)]
pub struct TokenCounter {
    current: usize,
    interval: Duration,
    last_update: Option<Instant>,
}

impl TokenCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            current: 0,
            interval,
            last_update: None,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Full recount; always reported.
    pub fn recompute(&mut self, messages: &[ChatMessage]) -> usize {
        self.current = estimate_tokens(messages);
        self.last_update = Some(Instant::now());
        self.current
    }

    /// Estimate while `streamed_chars` of a response have arrived on top of
    /// `messages`. Returns `None` when the previous update is too recent.
    pub fn streaming_update(
        &mut self,
        messages: &[ChatMessage],
        streamed_chars: usize,
    ) -> Option<usize> {
        if !self.due(Instant::now()) {
            return None;
        }
        self.current = estimate_tokens(messages) + streamed_chars.div_ceil(CHARS_PER_TOKEN);
        Some(self.current)
    }

    fn due(&mut self, now: Instant) -> bool {
        match self.last_update {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_update = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ToolCall;

    #[test]
    fn estimate_counts_content_calls_and_overhead() {
        let msgs = vec![
            ChatMessage::user("12345678"),
            ChatMessage::assistant_with_tools(None, vec![ToolCall::new("c", "abcd", "{}")]),
        ];
        // 8/4 + 4, then (4 + 2)/4 rounded up + 4
        assert_eq!(estimate_tokens(&msgs), 6 + 6);
        assert_eq!(estimate_tokens(&[]), 0);
    }

    #[test]
    fn streaming_updates_are_throttled() {
        let mut counter = TokenCounter::new(Duration::from_millis(250));
        let start = Instant::now();
        assert!(counter.due(start));
        assert!(!counter.due(start + Duration::from_millis(100)));
        assert!(!counter.due(start + Duration::from_millis(249)));
        assert!(counter.due(start + Duration::from_millis(250)));
        assert!(!counter.due(start + Duration::from_millis(300)));
    }

    #[test]
    fn first_streaming_update_is_reported() {
        let mut counter = TokenCounter::new(Duration::from_millis(250));
        let msgs = vec![ChatMessage::user("abcd")];
        assert_eq!(counter.streaming_update(&msgs, 8), Some(5 + 2));
        assert_eq!(counter.streaming_update(&msgs, 16), None);
        assert_eq!(counter.current(), 7);
    }
}
