//! Trigger engine contract.
//!
//! Scheduled and reactive triggers live outside the core.  Inbound, a firing
//! trigger synthesizes a virtual user message routed through the normal
//! message path; outbound, the core reports pending approvals and marks a
//! triggered task expired when its approval lapses unanswered.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agent::approval::ApprovalRequest;

/// Metadata value identifying trigger-originated messages.
pub const TRIGGER_SOURCE: &str = "trigger";

/// An approval surfaced to the trigger engine, tagged with its origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    #[serde(flatten)]
    pub request: ApprovalRequest,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Outbound contract to the trigger engine.
#[async_trait]
pub trait TriggerEngine: Send + Sync {
    /// Mark a triggered task as expired after its approval window lapsed.
    async fn mark_expired(&self, task_id: &str) -> Result<(), String>;
}

/// Build the metadata object for a trigger-synthesized message.
///
/// The core does not distinguish trigger-originated from user-originated
/// messages beyond this metadata.
pub fn trigger_metadata(task_id: &str) -> serde_json::Value {
    json!({ "source": TRIGGER_SOURCE, "task_id": task_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_metadata_shape() {
        let meta = trigger_metadata("task-42");
        assert_eq!(meta["source"], TRIGGER_SOURCE);
        assert_eq!(meta["task_id"], "task-42");
    }
}
