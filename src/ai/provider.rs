use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::error::LlmError;
use super::types::{ChatRequest, ChatResponse, StreamChunk};

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Type alias for a streaming chat response.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Contract for LLM provider clients.
///
/// Implementations live outside this crate; they are responsible for mapping
/// provider-specific failures into the [`LlmError`] taxonomy at the boundary.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete a chat request and return the full response.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// Stream a chat response as incremental chunks.
    async fn stream(&self, request: ChatRequest) -> Result<ChatStream>;

    /// Provider name, for logging.
    fn provider_name(&self) -> &str;
}
