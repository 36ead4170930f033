use anyhow::{Context, Result};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::LlmConfig;
use crate::llm::LlmErrorKind;
use crate::llm::backend::{ChatBackend, DeltaStream};
use crate::llm::types::{ChatMessage, ChatRequest, ChoiceMessage, ToolDef};

pub(super) mod network;

#[derive(Debug, Clone)]
pub struct OpenAIClient {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub(crate) inner: reqwest::Client,
    pub llm_cfg: LlmConfig,
    /// Total tokens reported by the backend for the latest response
    pub tokens_used: Arc<AtomicU32>,
    /// Prompt tokens reported by the backend for the latest response
    pub prompt_tokens_used: Arc<AtomicU32>,
}

impl OpenAIClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .build()
            .context("build http client")?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            inner,
            llm_cfg: LlmConfig::default(),
            tokens_used: Arc::new(AtomicU32::new(0)),
            prompt_tokens_used: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn with_llm_config(mut self, cfg: LlmConfig) -> Self {
        let builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms));
        // Keep the default client if the tuned one cannot be built.
        if let Ok(c) = builder.build() {
            self.inner = c;
        }
        self.llm_cfg = cfg;
        self
    }

    pub(crate) fn endpoint(&self) -> String {
        let mut base = self.base_url.trim_end_matches('/').to_string();
        if let Some(pos) = base.rfind("/v1") {
            base.truncate(pos);
            base = base.trim_end_matches('/').to_string();
        }
        format!("{base}/v1/chat/completions")
    }

    pub(crate) fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("X-Title", HeaderValue::from_static("codeturn"));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .context("api key is not a valid header value")?;
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }

    pub(crate) fn request(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDef],
        stream: bool,
    ) -> ChatRequest {
        let (tools, tool_choice) = if tools.is_empty() {
            (None, None)
        } else {
            (Some(tools.to_vec()), Some(serde_json::json!("auto")))
        };
        ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: None,
            tools,
            tool_choice,
            stream: stream.then_some(true),
        }
    }

    pub fn get_tokens_used(&self) -> u32 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    pub fn set_tokens(&self, tokens: u32) {
        self.tokens_used.store(tokens, Ordering::Relaxed);
    }

    pub fn get_prompt_tokens_used(&self) -> u32 {
        self.prompt_tokens_used.load(Ordering::Relaxed)
    }

    pub fn set_prompt_tokens(&self, tokens: u32) {
        self.prompt_tokens_used.store(tokens, Ordering::Relaxed);
    }

    pub async fn chat_once(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDef],
        cancel: Option<CancellationToken>,
    ) -> Result<ChoiceMessage> {
        network::chat_once(self, messages, tools, cancel.unwrap_or_default()).await
    }

    pub(crate) fn should_retry(kind: &LlmErrorKind) -> bool {
        matches!(
            kind,
            LlmErrorKind::RateLimited
                | LlmErrorKind::Server
                | LlmErrorKind::Network
                | LlmErrorKind::Timeout
        )
    }

    pub(crate) fn backoff_delay(&self, attempt: usize, retry_after_secs: Option<u64>) -> Duration {
        if self.llm_cfg.respect_retry_after
            && let Some(secs) = retry_after_secs
        {
            return Duration::from_secs(secs);
        }
        let base = self.llm_cfg.retry_base_ms;
        let shift = (attempt.saturating_sub(1)).min(16) as u32;
        let exp = base.saturating_mul(1u64 << shift);
        let jitter = self.llm_cfg.retry_jitter_ms as i64;
        let half = jitter / 2;
        let rnd = fastrand::i64(-half..=half).max(0) as u64;
        Duration::from_millis(exp.saturating_add(rnd))
    }
}

#[async_trait::async_trait]
impl ChatBackend for OpenAIClient {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDef],
        cancel: CancellationToken,
    ) -> Result<ChoiceMessage> {
        network::chat_once(self, messages, tools, cancel).await
    }

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDef],
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        self.open_delta_stream(messages, tools, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{delta, is_cancelled, is_context_overflow};
    use futures::StreamExt;
    use httptest::{Expectation, Server, cycle, matchers::*, responders::*};
    use serde_json::{Map, Value, json};

    fn fast_cfg(max_retries: usize) -> LlmConfig {
        LlmConfig {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 5_000,
            max_retries,
            retry_base_ms: 1,
            retry_jitter_ms: 0,
            respect_retry_after: false,
        }
    }

    fn client_for(server: &Server, max_retries: usize) -> OpenAIClient {
        OpenAIClient::new(format!("{}/", server.url_str("")), "test-key", "gpt-test")
            .unwrap()
            .with_llm_config(fast_cfg(max_retries))
    }

    #[tokio::test]
    async fn chat_once_happy_path() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v1/chat/completions"),
                request::headers(contains(("authorization", "Bearer test-key"))),
            ])
            .respond_with(json_encoded(json!({
                "id": "test",
                "choices": [
                    {"index":0, "message": {"role":"assistant","content":"hello"}}
                ],
                "usage": {"prompt_tokens": 7, "completion_tokens": 1, "total_tokens": 8}
            }))),
        );

        let client = client_for(&server, 0);
        let msg = client
            .chat(vec![ChatMessage::user("hi")], &[], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(msg.content.as_deref(), Some("hello"));
        assert!(msg.tool_calls.is_empty());
        assert_eq!(client.get_tokens_used(), 8);
        assert_eq!(client.get_prompt_tokens_used(), 7);
    }

    #[tokio::test]
    async fn chat_once_parses_tool_calls() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .respond_with(json_encoded(json!({
                    "id": "test",
                    "choices": [{"index": 0, "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{"id": "call_1", "type": "function",
                            "function": {"name": "fs_read", "arguments": "{\"path\":\"a.txt\"}"}}]
                    }}]
                }))),
        );

        let tools = vec![ToolDef::function(
            "fs_read",
            "read a file",
            json!({"type": "object"}),
        )];
        let msg = client_for(&server, 0)
            .chat(vec![ChatMessage::user("read")], &tools, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].function.name, "fs_read");
        assert_eq!(msg.tool_calls[0].function.arguments, "{\"path\":\"a.txt\"}");
    }

    #[tokio::test]
    async fn chat_once_retries_on_500_then_succeeds() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .times(2)
                .respond_with(cycle![
                    status_code(500).body("oops"),
                    json_encoded(json!({
                        "id": "test",
                        "choices": [{"index":0, "message": {"role":"assistant","content":"ok"}}]
                    })),
                ]),
        );
        let msg = client_for(&server, 1)
            .chat(vec![ChatMessage::user("hi")], &[], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(msg.content.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn chat_once_400_is_error_without_retry() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .times(1)
                .respond_with(status_code(400).body("bad")),
        );
        let err = client_for(&server, 3)
            .chat(vec![ChatMessage::user("hi")], &[], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{err}").contains("400"));
        assert!(!is_context_overflow(&err));
    }

    #[tokio::test]
    async fn context_length_exceeded_is_classified() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .respond_with(status_code(400).body(
                    r#"{"error":{"code":"context_length_exceeded","message":"This model's maximum context length is 8192 tokens."}}"#,
                )),
        );
        let err = client_for(&server, 2)
            .chat(vec![ChatMessage::user("hi")], &[], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(is_context_overflow(&err));
        assert_eq!(
            err.downcast_ref::<LlmErrorKind>(),
            Some(&LlmErrorKind::ContextLengthExceeded)
        );
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let client = OpenAIClient::new("http://127.0.0.1:9/v1", "x", "m").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .chat(vec![ChatMessage::user("hi")], &[], cancel.clone())
            .await
            .unwrap_err();
        assert!(is_cancelled(&err));
        let err = match client.chat_stream(vec![ChatMessage::user("hi")], &[], cancel).await {
            Ok(_) => panic!("stream should not open"),
            Err(e) => e,
        };
        assert!(is_cancelled(&err));
    }

    #[tokio::test]
    async fn chat_stream_yields_raw_deltas() {
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"type\":\"function\",\"function\":{\"name\":\"fs_list\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{}\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        );
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .respond_with(
                    status_code(200)
                        .insert_header("content-type", "text/event-stream")
                        .body(body),
                ),
        );

        let client = client_for(&server, 0);
        let mut stream = client
            .chat_stream(vec![ChatMessage::user("hi")], &[], CancellationToken::new())
            .await
            .unwrap();
        let mut acc = Value::Object(Map::new());
        while let Some(d) = stream.next().await {
            acc = delta::reduce(acc, &d.unwrap());
        }
        let msg = delta::into_choice_message(acc);
        assert_eq!(msg.content.as_deref(), Some("Hello"));
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].id, "c1");
        assert_eq!(msg.tool_calls[0].function.arguments, "{}");
        assert_eq!(client.get_tokens_used(), 5);
    }

    #[test]
    fn endpoint_normalization() {
        let c = OpenAIClient::new("https://api.example.com/v1/", "x", "m").unwrap();
        assert_eq!(c.endpoint(), "https://api.example.com/v1/chat/completions");
        let c2 = OpenAIClient::new("https://api.example.com/", "x", "m").unwrap();
        assert_eq!(c2.endpoint(), "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn request_omits_empty_tools() {
        let c = OpenAIClient::new("https://api.example.com/", "x", "m").unwrap();
        let req = c.request(vec![ChatMessage::user("hi")], &[], false);
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("tools").is_none());
        assert!(v.get("stream").is_none());

        let tools = vec![ToolDef::function("t", "d", json!({"type": "object"}))];
        let v = serde_json::to_value(c.request(vec![], &tools, true)).unwrap();
        assert_eq!(v["tools"][0]["function"]["name"], "t");
        assert_eq!(v["tool_choice"], "auto");
        assert_eq!(v["stream"], true);
    }

    #[test]
    fn backoff_prefers_retry_after() {
        let mut c = OpenAIClient::new("https://api.example.com/", "x", "m").unwrap();
        c.llm_cfg = LlmConfig {
            retry_base_ms: 100,
            retry_jitter_ms: 0,
            respect_retry_after: true,
            ..LlmConfig::default()
        };
        assert_eq!(c.backoff_delay(1, Some(2)), Duration::from_secs(2));
        assert_eq!(c.backoff_delay(1, None), Duration::from_millis(100));
        assert_eq!(c.backoff_delay(3, None), Duration::from_millis(400));
    }
}
