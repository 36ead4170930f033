mod args;
mod backend;
mod client_core;
pub mod delta;
mod stream;
pub mod types;

use reqwest::StatusCode;

pub use args::sanitize_tool_arguments;
pub use backend::{ChatBackend, DeltaStream};
pub use client_core::*;
pub use types::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmErrorKind {
    #[error("rate limited by backend")]
    RateLimited,
    #[error("backend server error")]
    Server,
    #[error("network error")]
    Network,
    #[error("request timed out")]
    Timeout,
    #[error("client error")]
    Client,
    #[error("failed to deserialize backend response")]
    Deserialize,
    #[error("request cancelled")]
    Cancelled,
    #[error("context length exceeded")]
    ContextLengthExceeded,
    #[error("unknown backend error")]
    Unknown,
}

pub fn classify_error(status: Option<StatusCode>, err: &anyhow::Error) -> LlmErrorKind {
    if let Some(kind) = err.downcast_ref::<LlmErrorKind>() {
        return kind.clone();
    }
    if let Some(st) = status {
        if st == StatusCode::TOO_MANY_REQUESTS {
            return LlmErrorKind::RateLimited;
        }
        if st.is_server_error() {
            return LlmErrorKind::Server;
        }
        if st.is_client_error() {
            return LlmErrorKind::Client;
        }
    }
    if let Some(e) = err.downcast_ref::<reqwest::Error>() {
        if e.is_timeout() {
            return LlmErrorKind::Timeout;
        }
        if e.is_connect() || e.is_body() || e.is_request() {
            return LlmErrorKind::Network;
        }
    }
    LlmErrorKind::Unknown
}

/// True when the backend rejected the request because the conversation no
/// longer fits in the model's context window.
pub fn is_context_overflow(err: &anyhow::Error) -> bool {
    if let Some(LlmErrorKind::ContextLengthExceeded) = err.downcast_ref::<LlmErrorKind>() {
        return true;
    }
    err.chain().any(|cause| {
        let text = cause.to_string().to_lowercase();
        text.contains("context_length_exceeded")
            || text.contains("maximum context length")
            || text.contains("context window")
    })
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<LlmErrorKind>(),
        Some(LlmErrorKind::Cancelled)
    )
}

/// Detects the context-overflow shape in an error response body.
pub(crate) fn body_signals_context_overflow(status: StatusCode, body: &str) -> bool {
    if status != StatusCode::BAD_REQUEST && status != StatusCode::PAYLOAD_TOO_LARGE {
        return false;
    }
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body)
        && let Some(code) = json
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|c| c.as_str())
        && code == "context_length_exceeded"
    {
        return true;
    }
    body.to_lowercase().contains("maximum context length")
}
