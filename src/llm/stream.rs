use anyhow::{Result, anyhow};
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::LlmErrorKind;
use crate::llm::backend::DeltaStream;
use crate::llm::client_core::{OpenAIClient, network};
use crate::llm::types::{ChatMessage, ToolDef};

#[derive(Debug, PartialEq)]
pub(crate) enum SseLine {
    Skip,
    Done,
    Data(Value),
}

/// Interprets one line of a `text/event-stream` body.
pub(crate) fn parse_sse_line(line: &str) -> SseLine {
    let s = line.trim();
    if s.is_empty() || s.starts_with(':') || s.starts_with("event:") || s.starts_with("id:") {
        return SseLine::Skip;
    }
    let payload = s.strip_prefix("data:").map(str::trim).unwrap_or(s);
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(v) => SseLine::Data(v),
        Err(e) => {
            warn!(payload, err = %e, "failed to parse stream chunk");
            SseLine::Skip
        }
    }
}

impl OpenAIClient {
    /// Opens a streamed completion and yields each `choices[0].delta` object
    /// unmodified. Only establishing the stream is retried; mid-stream
    /// failures end the stream with an error.
    pub(crate) async fn open_delta_stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDef],
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        let req = self.request(messages, tools, true);
        let resp = network::send_with_retry(self, &req, &cancel, "chat_stream").await?;

        let mut byte_stream = resp.bytes_stream();
        let mut buf = Vec::<u8>::new();
        let client = self.clone();

        let stream = async_stream::try_stream! {
            'read: loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!("chat_stream cancelled during byte stream read");
                        Err(anyhow!(LlmErrorKind::Cancelled))
                    }
                    chunk = byte_stream.next() => match chunk {
                        Some(Ok(bytes)) => Ok(bytes),
                        Some(Err(e)) => Err(anyhow::Error::new(e).context("byte stream read error")),
                        None => break 'read,
                    }
                }?;

                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let Ok(text) = std::str::from_utf8(&line) else {
                        warn!("dropping non-utf8 stream line");
                        continue;
                    };
                    match parse_sse_line(text) {
                        SseLine::Skip => {}
                        SseLine::Done => break 'read,
                        SseLine::Data(json) => {
                            debug!(response_chunk = %json, "llm chat_stream response");
                            if let Some(err) = json.get("error") {
                                Err::<(), _>(anyhow!("stream error: {err}"))?;
                            }
                            if let Some(usage) = json.get("usage")
                                && let Some(total) = usage.get("total_tokens").and_then(Value::as_u64)
                            {
                                client.set_tokens(total as u32);
                                if let Some(prompt) = usage.get("prompt_tokens").and_then(Value::as_u64) {
                                    client.set_prompt_tokens(prompt as u32);
                                }
                            }
                            if let Some(delta) = json
                                .get("choices")
                                .and_then(|c| c.get(0))
                                .and_then(|c| c.get("delta"))
                                && delta.as_object().is_some_and(|o| !o.is_empty())
                            {
                                yield delta.clone();
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
