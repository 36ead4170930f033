use anyhow::Result;
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::llm::types::{ChatMessage, ChoiceMessage, ToolDef};

/// Raw `choices[0].delta` fragments, in arrival order. The stream ends when
/// the backend finishes the response.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<serde_json::Value>> + Send>>;

/// The model backend as seen by the turn engine.
///
/// Implementations must honour `cancel` by aborting the underlying transport
/// and returning [`crate::llm::LlmErrorKind::Cancelled`].
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDef],
        cancel: CancellationToken,
    ) -> Result<ChoiceMessage>;

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDef],
        cancel: CancellationToken,
    ) -> Result<DeltaStream>;
}
