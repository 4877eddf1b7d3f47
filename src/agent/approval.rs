//! Approval requests and their resolution.
//!
//! An approval-gated agent parks in the pool and surfaces an
//! [`ApprovalRequest`]; the user's next message resolves it with one of the
//! verbs `approve`, `edit { ... }` or `cancel`.  When one assistant turn
//! parks several agents, all of their requests are batched into the same
//! loop result.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agents::pool::{AgentPool, PooledAgent};
use crate::agents::session::{AgentResult, AgentSession, AgentStatus};
use crate::config::ReactLoopConfig;
use crate::tools::traits::ToolExecutionContext;

/// Content of the tool message appended when the user cancels an action.
pub const CANCELLED_MESSAGE: &str = "User cancelled this action.";

// ─── ApprovalRequest ──────────────────────────────────────────────────────────

/// A pending confirmation surfaced to the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub agent_id: String,
    pub agent_name: String,
    pub action_summary: String,
    /// The collected fields the action would run with.
    pub details: Map<String, Value>,
    pub options: Vec<String>,
    pub timeout_minutes: i64,
    pub allow_modification: bool,
}

// ─── ApprovalDecision ─────────────────────────────────────────────────────────

/// Parsed resolution verb.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    Approve,
    Edit(Map<String, Value>),
    Cancel,
}

/// Parse a user reply into a decision.  Returns `None` when the reply is not
/// an approval verb.
pub fn parse_decision(text: &str) -> Option<ApprovalDecision> {
    let trimmed = text.trim();
    match trimmed.to_lowercase().as_str() {
        "approve" | "approved" | "yes" | "ok" => return Some(ApprovalDecision::Approve),
        "cancel" | "cancelled" | "no" | "deny" => return Some(ApprovalDecision::Cancel),
        _ => {}
    }
    if let Some(rest) = trimmed.strip_prefix("edit") {
        if let Ok(Value::Object(fields)) = serde_json::from_str(rest.trim()) {
            return Some(ApprovalDecision::Edit(fields));
        }
    }
    None
}

// ─── ApprovalOutcome ──────────────────────────────────────────────────────────

/// Result of resolving an approval.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalOutcome {
    /// The agent reached a terminal state; its pool entry is gone.  The
    /// content becomes a tool message so the planner can follow up.
    Resolved { content: String, is_error: bool },
    /// The agent is parked again (an edit invalidated a field, or it asked
    /// for more input); the prompt goes straight back to the user.
    StillWaiting { prompt: String },
}

// ─── ApprovalCoordinator ──────────────────────────────────────────────────────

/// Builds, batches and resolves approval requests against the pool.
pub struct ApprovalCoordinator {
    pool: Arc<AgentPool>,
    config: ReactLoopConfig,
}

impl ApprovalCoordinator {
    pub fn new(pool: Arc<AgentPool>, config: ReactLoopConfig) -> Self {
        Self { pool, config }
    }

    /// Build a request from a parked agent's prompt and collected fields.
    pub fn build_request(&self, session: &AgentSession) -> ApprovalRequest {
        ApprovalRequest {
            agent_id: session.agent_id.clone(),
            agent_name: session.agent_type().to_string(),
            action_summary: session.approval_prompt(),
            details: session.collected_fields.clone(),
            options: vec![
                "approve".to_string(),
                "edit".to_string(),
                "cancel".to_string(),
            ],
            timeout_minutes: self.config.approval_timeout_minutes,
            allow_modification: true,
        }
    }

    /// Deadline recorded on the pool entry for a fresh request.
    pub fn deadline(&self) -> chrono::DateTime<Utc> {
        Utc::now() + Duration::minutes(self.config.approval_timeout_minutes)
    }

    /// Resolve a pending approval with the user's decision.
    pub async fn resolve(
        &self,
        pooled: PooledAgent,
        decision: ApprovalDecision,
        ctx: &ToolExecutionContext,
    ) -> ApprovalOutcome {
        let PooledAgent { entry, mut session } = pooled;

        let result = match decision {
            ApprovalDecision::Cancel => {
                self.pool.remove(&entry.tenant_id, &entry.agent_id).await;
                return ApprovalOutcome::Resolved {
                    content: CANCELLED_MESSAGE.to_string(),
                    is_error: true,
                };
            }
            ApprovalDecision::Approve => session.approve(ctx).await,
            ApprovalDecision::Edit(fields) => session.apply_edit(&fields, ctx).await,
        };

        match result {
            AgentResult::Completed { text } => {
                self.pool.remove(&entry.tenant_id, &entry.agent_id).await;
                ApprovalOutcome::Resolved {
                    content: text,
                    is_error: false,
                }
            }
            AgentResult::Error { message } => {
                self.pool.remove(&entry.tenant_id, &entry.agent_id).await;
                ApprovalOutcome::Resolved {
                    content: message,
                    is_error: true,
                }
            }
            AgentResult::WaitingForInput { prompt } => {
                self.pool
                    .put(session, AgentStatus::WaitingForInput, None, entry.task_id)
                    .await;
                ApprovalOutcome::StillWaiting { prompt }
            }
            AgentResult::WaitingForApproval { prompt } => {
                self.pool
                    .put(
                        session,
                        AgentStatus::WaitingForApproval,
                        Some(self.deadline()),
                        entry.task_id,
                    )
                    .await;
                ApprovalOutcome::StillWaiting { prompt }
            }
        }
    }
}
