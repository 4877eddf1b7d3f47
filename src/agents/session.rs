//! A live agent instance and its state machine.
//!
//! ```text
//! seed_fields(arguments)
//!       │
//!       ▼
//! Collecting ──missing required field──► WaitingForInput (parked)
//!       │                                      │ user reply binds the
//!       │ all required present                 │ awaited field
//!       ▼                                      ▼
//! needs_approval? ──yes──► AwaitingApproval (parked) ──approve/edit──┐
//!       │ no                                   │ cancel → removed    │
//!       ▼                                      ▼                     ▼
//!    execute ────────────────────────► Completed / Error
//! ```
//!
//! Each state maps to one handler; `handle_message` dispatches on the tagged
//! state rather than on a class hierarchy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use super::definition::AgentDefinition;
use crate::agent::events::AgentEvent;
use crate::tools::traits::ToolExecutionContext;

// ─── AgentStatus ──────────────────────────────────────────────────────────────

/// Non-terminal status of a pooled agent.  Terminal agents (completed,
/// errored, cancelled) never live in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    WaitingForInput,
    WaitingForApproval,
    Paused,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::WaitingForInput => "waiting_for_input",
            AgentStatus::WaitingForApproval => "waiting_for_approval",
            AgentStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting_for_input" => Some(AgentStatus::WaitingForInput),
            "waiting_for_approval" => Some(AgentStatus::WaitingForApproval),
            "paused" => Some(AgentStatus::Paused),
            _ => None,
        }
    }
}

// ─── AgentResult ──────────────────────────────────────────────────────────────

/// Outcome of advancing an agent by one message.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentResult {
    Completed { text: String },
    WaitingForInput { prompt: String },
    WaitingForApproval { prompt: String },
    Error { message: String },
}

// ─── AgentSession ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Collecting,
    AwaitingApproval,
}

/// A live instance of an agent type, tracking collected fields and the
/// current state.
#[derive(Clone)]
pub struct AgentSession {
    pub agent_id: String,
    pub tenant_id: String,
    pub definition: Arc<AgentDefinition>,
    pub collected_fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    state: SessionState,
    /// Name of the field the last prompt asked for, if any.
    awaiting_field: Option<String>,
}

impl AgentSession {
    pub fn new(definition: Arc<AgentDefinition>, tenant_id: impl Into<String>) -> Self {
        Self {
            agent_id: format!("{}-{}", definition.name, uuid::Uuid::new_v4().simple()),
            tenant_id: tenant_id.into(),
            definition,
            collected_fields: Map::new(),
            created_at: Utc::now(),
            state: SessionState::Collecting,
            awaiting_field: None,
        }
    }

    /// Rebuild a session from a persisted pool entry.
    pub fn restore(
        definition: Arc<AgentDefinition>,
        tenant_id: String,
        agent_id: String,
        collected_fields: Map<String, Value>,
        status: AgentStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        let state = match status {
            AgentStatus::WaitingForApproval => SessionState::AwaitingApproval,
            _ => SessionState::Collecting,
        };
        let mut session = Self {
            agent_id,
            tenant_id,
            definition,
            collected_fields,
            created_at,
            state,
            awaiting_field: None,
        };
        if session.state == SessionState::Collecting {
            session.awaiting_field = session.next_missing_required().map(|f| f.name.clone());
        }
        session
    }

    pub fn agent_type(&self) -> &str {
        &self.definition.name
    }

    /// Seed fields from tool-call arguments.  Unknown keys and the free-form
    /// `task_instruction` are ignored; invalid values are rejected and left
    /// uncollected rather than silently accepted.
    pub async fn seed_fields(&mut self, args: &Map<String, Value>, ctx: &ToolExecutionContext) {
        for (key, value) in args {
            if key == "task_instruction" {
                continue;
            }
            let Some(field) = self.definition.field(key).cloned() else {
                tracing::debug!(agent = %self.agent_type(), field = %key, "ignoring unknown field");
                continue;
            };
            match field.validate(value) {
                Ok(()) => {
                    self.collected_fields.insert(key.clone(), value.clone());
                    self.emit_field_events(ctx, key, true).await;
                }
                Err(reason) => {
                    tracing::warn!(
                        agent = %self.agent_type(),
                        field = %key,
                        %reason,
                        "rejecting invalid field value"
                    );
                    self.emit_validated(ctx, key, false).await;
                }
            }
        }
    }

    /// Advance the session by one incoming message.
    pub async fn handle_message(&mut self, text: &str, ctx: &ToolExecutionContext) -> AgentResult {
        match self.state {
            SessionState::Collecting => self.on_collecting(text, ctx).await,
            SessionState::AwaitingApproval => self.on_awaiting_approval(),
        }
    }

    /// Approve a pending action and execute it.
    pub async fn approve(&mut self, ctx: &ToolExecutionContext) -> AgentResult {
        if self.state != SessionState::AwaitingApproval {
            return AgentResult::Error {
                message: format!("agent {} has no pending approval", self.agent_id),
            };
        }
        self.execute(ctx).await
    }

    /// Re-seed fields from an edit and, when everything still validates,
    /// execute.  A field made invalid or missing drops back to collection.
    pub async fn apply_edit(
        &mut self,
        fields: &Map<String, Value>,
        ctx: &ToolExecutionContext,
    ) -> AgentResult {
        self.seed_fields(fields, ctx).await;
        if let Some(field) = self.next_missing_required() {
            let prompt = field.prompt();
            let field_name = field.name.clone();
            self.state = SessionState::Collecting;
            self.awaiting_field = Some(field_name);
            return AgentResult::WaitingForInput { prompt };
        }
        self.execute(ctx).await
    }

    /// The user-facing summary shown in an approval request.
    pub fn approval_prompt(&self) -> String {
        let mut prompt = self
            .definition
            .approval_prompt
            .clone()
            .unwrap_or_else(|| format!("I'm ready to run {}.", self.definition.name));
        if !self.collected_fields.is_empty() {
            prompt.push('\n');
            for (key, value) in &self.collected_fields {
                prompt.push_str(&format!("- {key}: {value}\n"));
            }
        }
        prompt.push_str("Reply 'approve' to continue, 'edit {...}' to change parameters, or 'cancel' to stop.");
        prompt
    }

    // ── State handlers ───────────────────────────────────────────────────────

    async fn on_collecting(&mut self, text: &str, ctx: &ToolExecutionContext) -> AgentResult {
        // Bind the reply to the field the last prompt asked for.
        if let Some(field_name) = self.awaiting_field.take() {
            if let Some(field) = self.definition.field(&field_name).cloned() {
                if !text.trim().is_empty() {
                    match field.coerce_text(text) {
                        Ok(value) => {
                            self.collected_fields.insert(field_name.clone(), value);
                            self.emit_field_events(ctx, &field_name, true).await;
                        }
                        Err(reason) => {
                            self.emit_validated(ctx, &field_name, false).await;
                            self.awaiting_field = Some(field_name);
                            return AgentResult::WaitingForInput {
                                prompt: format!("{reason}. {}", field.prompt()),
                            };
                        }
                    }
                } else {
                    self.awaiting_field = Some(field_name.clone());
                    return AgentResult::WaitingForInput {
                        prompt: field.prompt(),
                    };
                }
            }
        }

        if let Some(field) = self.next_missing_required() {
            let prompt = field.prompt();
            self.awaiting_field = Some(field.name.clone());
            return AgentResult::WaitingForInput { prompt };
        }

        if self.definition.needs_approval {
            self.state = SessionState::AwaitingApproval;
            return AgentResult::WaitingForApproval {
                prompt: self.approval_prompt(),
            };
        }

        self.execute(ctx).await
    }

    fn on_awaiting_approval(&self) -> AgentResult {
        // Approval verbs are resolved by the coordinator; anything else
        // re-presents the request.
        AgentResult::WaitingForApproval {
            prompt: self.approval_prompt(),
        }
    }

    // ── Internal ─────────────────────────────────────────────────────────────

    fn next_missing_required(&self) -> Option<&super::fields::InputField> {
        self.definition
            .input_fields
            .iter()
            .find(|f| f.required && !self.collected_fields.contains_key(&f.name))
    }

    async fn execute(&mut self, ctx: &ToolExecutionContext) -> AgentResult {
        let mut fields = self.collected_fields.clone();
        for field in &self.definition.input_fields {
            if !fields.contains_key(&field.name) {
                if let Some(default) = &field.default {
                    fields.insert(field.name.clone(), default.clone());
                }
            }
        }
        match self.definition.execute(fields, ctx.clone()).await {
            Ok(text) => AgentResult::Completed { text },
            Err(message) => AgentResult::Error { message },
        }
    }

    async fn emit_field_events(&self, ctx: &ToolExecutionContext, field: &str, valid: bool) {
        if let Some(events) = &ctx.events {
            events
                .emit(AgentEvent::FieldCollected {
                    agent_id: self.agent_id.clone(),
                    field: field.to_string(),
                })
                .await;
        }
        self.emit_validated(ctx, field, valid).await;
    }

    async fn emit_validated(&self, ctx: &ToolExecutionContext, field: &str, valid: bool) {
        if let Some(events) = &ctx.events {
            events
                .emit(AgentEvent::FieldValidated {
                    agent_id: self.agent_id.clone(),
                    field: field.to_string(),
                    valid,
                })
                .await;
        }
    }
}
