//! Retry policy for LLM calls.
//!
//! Rate limits and transient failures retry with exponential backoff
//! (`base × 2^attempt`); timeouts retry exactly once; everything else
//! surfaces to the caller untouched.  Context overflow in particular is
//! never retried here — the loop owns its recovery chain.

use std::sync::Arc;

use crate::ai::error::LlmError;
use crate::ai::provider::{ChatStream, LlmProvider, Result};
use crate::ai::types::{ChatRequest, ChatResponse};
use crate::config::ReactLoopConfig;

/// Call `provider.chat` under the retry policy.
pub async fn chat_with_retry(
    provider: &Arc<dyn LlmProvider>,
    request: &ChatRequest,
    config: &ReactLoopConfig,
) -> Result<ChatResponse> {
    let mut attempt: u32 = 0;
    loop {
        match provider.chat(request.clone()).await {
            Ok(response) => return Ok(response),
            Err(err) => {
                let budget = err.retry_budget(config.llm_max_retries);
                if attempt >= budget {
                    return Err(err);
                }
                if err.wants_backoff() {
                    let delay = config.llm_retry_base_delay() * 2u32.saturating_pow(attempt);
                    tokio::time::sleep(delay).await;
                }
                tracing::warn!(
                    provider = provider.provider_name(),
                    attempt = attempt + 1,
                    error = %err,
                    "retrying LLM call"
                );
                attempt += 1;
            }
        }
    }
}

/// Open a stream under the same retry policy.  Only stream initiation is
/// retried; mid-stream failures propagate to the consumer.
pub async fn stream_with_retry(
    provider: &Arc<dyn LlmProvider>,
    request: &ChatRequest,
    config: &ReactLoopConfig,
) -> Result<ChatStream> {
    let mut attempt: u32 = 0;
    loop {
        match provider.stream(request.clone()).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                let budget = err.retry_budget(config.llm_max_retries);
                if attempt >= budget {
                    return Err(err);
                }
                if err.wants_backoff() {
                    let delay = config.llm_retry_base_delay() * 2u32.saturating_pow(attempt);
                    tokio::time::sleep(delay).await;
                }
                tracing::warn!(
                    provider = provider.provider_name(),
                    attempt = attempt + 1,
                    error = %err,
                    "retrying LLM stream"
                );
                attempt += 1;
            }
        }
    }
}
