//! LLM provider contract, message types, error taxonomy and context
//! management.

pub mod context;
pub mod error;
pub mod provider;
pub mod retry;
pub mod types;

pub use context::ContextManager;
pub use error::LlmError;
pub use provider::{ChatStream, LlmProvider};
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, Role, StreamChunk, TokenUsage, ToolCall, ToolInfo,
};
