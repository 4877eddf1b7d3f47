//! Process-local memory provider, used by tests and demos.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::traits::{Fact, MemoryProvider};
use crate::ai::types::ChatMessage;

/// Keeps conversation history and facts in process memory.
///
/// Fact search is substring-based; relevance ordering is insertion order.
/// Good enough for tests — a real deployment plugs in a vector store.
#[derive(Default)]
pub struct InMemoryMemory {
    histories: RwLock<HashMap<(String, String), Vec<ChatMessage>>>,
    facts: RwLock<HashMap<String, Vec<String>>>,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a fact directly, bypassing extraction.
    pub async fn insert_fact(&self, tenant_id: &str, content: impl Into<String>) {
        self.facts
            .write()
            .await
            .entry(tenant_id.to_string())
            .or_default()
            .push(content.into());
    }
}

#[async_trait]
impl MemoryProvider for InMemoryMemory {
    async fn get_history(
        &self,
        tenant_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, String> {
        let histories = self.histories.read().await;
        let messages = histories
            .get(&(tenant_id.to_string(), session_id.to_string()))
            .cloned()
            .unwrap_or_default();
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }

    async fn save_history(
        &self,
        tenant_id: &str,
        session_id: &str,
        messages: &[ChatMessage],
    ) -> Result<(), String> {
        self.histories
            .write()
            .await
            .entry((tenant_id.to_string(), session_id.to_string()))
            .or_default()
            .extend_from_slice(messages);
        Ok(())
    }

    async fn search(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Fact>, String> {
        let query = query.to_lowercase();
        let facts = self.facts.read().await;
        Ok(facts
            .get(tenant_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|f| {
                        query.is_empty()
                            || query
                                .split_whitespace()
                                .any(|w| f.to_lowercase().contains(w))
                    })
                    .take(limit)
                    .map(|f| Fact {
                        content: f.clone(),
                        score: 1.0,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add(
        &self,
        tenant_id: &str,
        messages: &[ChatMessage],
        _infer: bool,
    ) -> Result<(), String> {
        let mut facts = self.facts.write().await;
        let entries = facts.entry(tenant_id.to_string()).or_default();
        for msg in messages {
            if !msg.content.is_empty() {
                entries.push(msg.content.clone());
            }
        }
        Ok(())
    }
}
