//! The turn-taking core: one user message in, model responses and tool
//! executions interleaved until the model produces a final answer.

mod cancel;
mod chat;
mod engine;
mod error;
mod store;
mod tokens;

pub use cancel::{AbortHandle, AbortSlot, TurnGuard};
pub use chat::{ChatEntry, EXECUTING, EntryKind, StreamChunk};
pub use engine::{
    CANCELLED_NOTICE, CANCELLED_PLACEHOLDER, COMPACTED_NOTICE, INTERRUPTED_PLACEHOLDER,
    TurnEngine, round_limit_notice,
};
pub use error::AgentError;
pub use store::ConversationStore;
pub use tokens::{TokenCounter, estimate_tokens};
