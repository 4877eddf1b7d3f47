//! Typed events emitted by the streaming message path.
//!
//! Event ordering guarantees: `MessageStart` precedes any `MessageChunk` of
//! the same assistant turn; every `ToolCallStart` is followed by exactly one
//! `ToolCallEnd` or `Error` carrying the same `tool_call_id`; a parked
//! agent's `StateChange` is emitted before the terminal `Done`; `Done` is
//! always last.

use serde::{Deserialize, Serialize};

use crate::agents::session::AgentStatus;

/// One event in a streamed message lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentEvent {
    MessageStart,
    MessageChunk {
        delta: String,
    },
    MessageEnd,
    StateChange {
        agent_id: String,
        agent_name: String,
        status: AgentStatus,
    },
    FieldCollected {
        agent_id: String,
        field: String,
    },
    FieldValidated {
        agent_id: String,
        field: String,
        valid: bool,
    },
    ToolCallStart {
        tool_call_id: String,
        name: String,
    },
    ToolCallEnd {
        tool_call_id: String,
        name: String,
        duration_ms: u64,
    },
    ToolResult {
        tool_call_id: String,
        is_error: bool,
        result_chars: usize,
    },
    Error {
        message: String,
    },
    Done,
}

// ─── EventSink ────────────────────────────────────────────────────────────────

/// Cloneable handle for emitting [`AgentEvent`]s to a stream consumer.
///
/// Emission is fire-and-forget: a dropped receiver never fails the loop.
#[derive(Clone)]
pub struct EventSink {
    tx: tokio::sync::mpsc::Sender<AgentEvent>,
}

impl EventSink {
    /// Create a sink and its receiving half.
    pub fn channel(buffer: usize) -> (Self, tokio::sync::mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event).await;
    }
}
