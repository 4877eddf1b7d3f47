//! Core types and the `MemoryProvider` trait for conversation memory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ai::types::ChatMessage;

// ─── Fact ─────────────────────────────────────────────────────────────────────

/// A recalled long-term memory, returned by [`MemoryProvider::search()`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    /// The text content of this memory.
    pub content: String,
    /// Relevance score in [0, 1] — higher is more relevant.
    pub score: f32,
}

// ─── MemoryProvider trait ─────────────────────────────────────────────────────

/// Abstraction over conversation history and long-term memory.
///
/// Implementations may back the store with an in-process map, a database, or
/// a remote vector store.  `search` results must be sorted by descending
/// `score`.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    /// Load the most recent `limit` messages of a conversation.
    async fn get_history(
        &self,
        tenant_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, String>;

    /// Append messages to a conversation.
    async fn save_history(
        &self,
        tenant_id: &str,
        session_id: &str,
        messages: &[ChatMessage],
    ) -> Result<(), String>;

    /// Search long-term memory for facts relevant to `query`.
    async fn search(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Fact>, String>;

    /// Hand messages to the memory layer for long-term extraction.  With
    /// `infer` set, the layer decides what is worth keeping.
    async fn add(
        &self,
        tenant_id: &str,
        messages: &[ChatMessage],
        infer: bool,
    ) -> Result<(), String>;
}
