use anyhow::{Context, Result, anyhow};
use reqwest::header::RETRY_AFTER;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::OpenAIClient;
use crate::llm::types::{ChatMessage, ChatRequest, ChatResponse, ChoiceMessage, ToolDef};
use crate::llm::{LlmErrorKind, body_signals_context_overflow, classify_error};

pub(crate) async fn chat_once(
    client: &OpenAIClient,
    messages: Vec<ChatMessage>,
    tools: &[ToolDef],
    cancel: CancellationToken,
) -> Result<ChoiceMessage> {
    let req = client.request(messages, tools, false);
    let resp = send_with_retry(client, &req, &cancel, "chat_once").await?;

    let response_text = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!("chat_once cancelled during body read");
            return Err(anyhow!(LlmErrorKind::Cancelled));
        }
        res = resp.text() => res.context("read chat response body")?,
    };
    debug!(body = %response_text, "llm chat_once response");

    let body: ChatResponse = serde_json::from_str(&response_text).map_err(|e| {
        error!(err = %e, "llm chat_once deserialize error");
        anyhow!(LlmErrorKind::Deserialize).context(format!("parse chat response: {e}"))
    })?;

    if let Some(usage) = &body.usage {
        client.set_tokens(usage.total_tokens);
        client.set_prompt_tokens(usage.prompt_tokens);
    }

    body.choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| anyhow!("no choices returned"))
}

/// Sends `req` and returns the first successful response. Transient failures
/// (rate limits, 5xx, network errors, timeouts) are retried with backoff; a
/// context-overflow rejection is reported as
/// [`LlmErrorKind::ContextLengthExceeded`] without retrying.
pub(crate) async fn send_with_retry(
    client: &OpenAIClient,
    req: &ChatRequest,
    cancel: &CancellationToken,
    label: &'static str,
) -> Result<reqwest::Response> {
    let url = client.endpoint();
    let headers = client.headers()?;

    if let Ok(payload) = serde_json::to_string_pretty(req) {
        debug!(payload = %payload, endpoint = %url, label, "sending chat.completions payload");
    }

    let max_attempts = client.llm_cfg.max_retries.saturating_add(1);
    for attempt in 1..=max_attempts {
        let fut = client
            .inner
            .post(&url)
            .headers(headers.clone())
            .json(req)
            .send();

        let resp_res = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(label, "request cancelled before send");
                return Err(anyhow!(LlmErrorKind::Cancelled));
            }
            res = fut => res,
        };

        let resp = match resp_res {
            Ok(resp) => resp,
            Err(e) => {
                error!(attempt, label, err = %e, "llm send error");
                let err = anyhow::Error::new(e).context("send chat request");
                let kind = classify_error(None, &err);
                if OpenAIClient::should_retry(&kind) && attempt < max_attempts {
                    sleep_or_cancel(client.backoff_delay(attempt, None), cancel).await?;
                    continue;
                }
                return Err(err);
            }
        };

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(label, "request cancelled during error body read");
                return Err(anyhow!(LlmErrorKind::Cancelled));
            }
            res = resp.text() => res.unwrap_or_default(),
        };
        error!(attempt, label, status = %status.as_u16(), body = %text, "llm non-success status");

        if body_signals_context_overflow(status, &text) {
            warn!(label, "backend reports context length exceeded");
            return Err(anyhow!(LlmErrorKind::ContextLengthExceeded)
                .context(format!("chat error: {status} - {text}")));
        }

        let err = anyhow!("chat error: {} - {}", status, text);
        let kind = classify_error(Some(status), &err);
        if OpenAIClient::should_retry(&kind) && attempt < max_attempts {
            let wait = client.backoff_delay(attempt, retry_after);
            info!(attempt, label, kind = ?kind, wait_ms = %wait.as_millis(), "retrying request");
            sleep_or_cancel(wait, cancel).await?;
            continue;
        }
        return Err(err);
    }

    Err(anyhow!("no request attempts were made"))
}

async fn sleep_or_cancel(wait: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!("request cancelled during retry sleep");
            Err(anyhow!(LlmErrorKind::Cancelled))
        }
        _ = tokio::time::sleep(wait) => Ok(()),
    }
}
