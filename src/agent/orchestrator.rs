//! Per-message lifecycle.
//!
//! For each incoming message: load context through the memory collaborator,
//! apply the policy gate, route to a pending agent if one is parked for the
//! tenant, otherwise run the reasoning loop, then persist what happened.
//! Messages for a single tenant are processed strictly in order behind a
//! per-tenant lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::approval::{parse_decision, ApprovalCoordinator, ApprovalOutcome};
use crate::agent::events::{AgentEvent, EventSink};
use crate::agent::loop_::{ReactLoop, ReactLoopResult, ToolCallRecord};
use crate::agents::pool::AgentPool;
use crate::agents::registry::AgentRegistry;
use crate::agents::session::{AgentResult, AgentStatus};
use crate::ai::provider::LlmProvider;
use crate::ai::types::{ChatMessage, TokenUsage, ToolCall, ToolInfo};
use crate::config::ReactLoopConfig;
use crate::error::OrchestratorError;
use crate::memory::traits::MemoryProvider;
use crate::services::credential_store::CredentialStore;
use crate::tools::invoker::ToolInvoker;
use crate::tools::registry::ToolRegistry;
use crate::tools::traits::ToolExecutionContext;
use crate::triggers::{PendingApproval, TRIGGER_SOURCE};

/// Facts recalled from long-term memory per message.
const RECALL_LIMIT: usize = 5;

// ─── IncomingMessage ──────────────────────────────────────────────────────────

/// One message entering the orchestrator, from a user or a trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub tenant_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
    /// Conversation the message belongs to.
    #[serde(default = "default_session")]
    pub session_id: String,
}

fn default_session() -> String {
    "main".to_string()
}

impl IncomingMessage {
    pub fn new(tenant_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            text: text.into(),
            metadata: Value::Null,
            session_id: default_session(),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Synthesize the virtual message for a firing trigger.
    pub fn from_trigger(
        tenant_id: impl Into<String>,
        text: impl Into<String>,
        task_id: &str,
    ) -> Self {
        Self::new(tenant_id, text).with_metadata(crate::triggers::trigger_metadata(task_id))
    }
}

// ─── MessagePolicy ────────────────────────────────────────────────────────────

/// Gate applied before any model call.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Allow,
    /// Rejected with the response text to return.
    Reject(String),
}

/// Pluggable policy gate (rate limits, tiers, safety).
#[async_trait]
pub trait MessagePolicy: Send + Sync {
    async fn should_process(&self, message: &IncomingMessage) -> PolicyDecision;
}

/// Default policy: everything is allowed.
pub struct AllowAllPolicy;

#[async_trait]
impl MessagePolicy for AllowAllPolicy {
    async fn should_process(&self, _message: &IncomingMessage) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

// ─── Orchestrator ─────────────────────────────────────────────────────────────

/// Drives the whole per-message lifecycle.
pub struct Orchestrator {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    agents: Arc<AgentRegistry>,
    pool: Arc<AgentPool>,
    memory: Arc<dyn MemoryProvider>,
    credentials: Option<Arc<dyn CredentialStore>>,
    policy: Arc<dyn MessagePolicy>,
    invoker: Arc<ToolInvoker>,
    approvals: ApprovalCoordinator,
    config: ReactLoopConfig,
    persona: String,
    tenant_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        agents: Arc<AgentRegistry>,
        pool: Arc<AgentPool>,
        memory: Arc<dyn MemoryProvider>,
        config: ReactLoopConfig,
    ) -> Self {
        let invoker = Arc::new(ToolInvoker::new(
            tools.clone(),
            agents.clone(),
            pool.clone(),
            config.clone(),
        ));
        Self {
            provider,
            tools,
            agents,
            approvals: ApprovalCoordinator::new(pool.clone(), config.clone()),
            pool,
            memory,
            credentials: None,
            policy: Arc::new(AllowAllPolicy),
            invoker,
            config,
            persona: "You are a helpful personal assistant.".to_string(),
            tenant_locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn MessagePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    // ── Public entry points ──────────────────────────────────────────────────

    /// Handle one message to completion and return the structured result.
    #[tracing::instrument(
        name = "orchestrator.handle_message",
        skip_all,
        fields(tenant = %message.tenant_id, text_len = message.text.len())
    )]
    pub async fn handle_message(
        &self,
        message: IncomingMessage,
    ) -> Result<ReactLoopResult, OrchestratorError> {
        let lock = self.tenant_lock(&message.tenant_id).await;
        let _serialized = lock.lock().await;
        self.process(message, None).await
    }

    /// Handle one message, emitting the event stream as it goes.  The
    /// terminal event is always [`AgentEvent::Done`].
    pub fn stream_message(
        self: &Arc<Self>,
        message: IncomingMessage,
    ) -> tokio::sync::mpsc::Receiver<AgentEvent> {
        let (sink, rx) = EventSink::channel(64);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let lock = this.tenant_lock(&message.tenant_id).await;
            let _serialized = lock.lock().await;
            if let Err(err) = this.process(message, Some(sink.clone())).await {
                sink.emit(AgentEvent::Error {
                    message: err.to_string(),
                })
                .await;
            }
            sink.emit(AgentEvent::Done).await;
        });
        rx
    }

    /// Approval requests currently parked for a tenant, tagged with their
    /// origin for the trigger engine.
    pub async fn list_pending_approvals(&self, tenant_id: &str) -> Vec<PendingApproval> {
        self.pool
            .pending_approvals(tenant_id)
            .await
            .into_iter()
            .map(|pooled| PendingApproval {
                request: self.approvals.build_request(&pooled.session),
                source: match pooled.entry.task_id {
                    Some(_) => TRIGGER_SOURCE.to_string(),
                    None => "user".to_string(),
                },
                task_id: pooled.entry.task_id,
            })
            .collect()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    async fn process(
        &self,
        message: IncomingMessage,
        events: Option<EventSink>,
    ) -> Result<ReactLoopResult, OrchestratorError> {
        // Policy gate: rejected messages never reach the model.
        if let PolicyDecision::Reject(reason) = self.policy.should_process(&message).await {
            tracing::info!(tenant = %message.tenant_id, "message rejected by policy");
            if let Some(sink) = &events {
                emit_whole_message(sink, &reason).await;
            }
            return Ok(direct_result(reason, vec![]));
        }

        let mut ctx = ToolExecutionContext::new(&message.tenant_id)
            .with_metadata(message.metadata.clone());
        if let Some(creds) = &self.credentials {
            ctx = ctx.with_credentials(creds.clone());
        }
        if let Some(sink) = &events {
            ctx = ctx.with_events(sink.clone());
        }

        let mut messages = self.build_llm_messages(&message).await?;
        let history_len = messages.len();

        // A parked agent gets the message before the planner does.
        let routed = self.route_to_pending_agent(&message, &mut messages, &ctx).await;
        let result = match routed {
            PendingRoute::Direct(result) => {
                if let Some(sink) = &events {
                    emit_whole_message(sink, &result.response).await;
                }
                result
            }
            PendingRoute::Continue => {
                let loop_ = ReactLoop::new(self.provider.clone(), self.invoker.clone(), self.config.clone());
                loop_.run(&mut messages, &self.tool_catalog(), &ctx).await?
            }
        };

        self.post_process(&message, &messages[history_len.min(messages.len())..])
            .await;
        Ok(result)
    }

    /// Shared message assembly for both entry points: system prompt (persona
    /// + time + recalled facts) followed by conversation history.
    async fn build_llm_messages(
        &self,
        message: &IncomingMessage,
    ) -> Result<Vec<ChatMessage>, OrchestratorError> {
        let history = self
            .memory
            .get_history(
                &message.tenant_id,
                &message.session_id,
                self.config.max_history_messages,
            )
            .await
            .map_err(OrchestratorError::Memory)?;

        let facts = match self
            .memory
            .search(&message.tenant_id, &message.text, RECALL_LIMIT)
            .await
        {
            Ok(facts) => facts,
            Err(reason) => {
                tracing::warn!(%reason, "memory recall failed; continuing without facts");
                vec![]
            }
        };

        let mut system = format!(
            "{}\nCurrent time: {}",
            self.persona,
            Utc::now().to_rfc3339()
        );
        if !facts.is_empty() {
            system.push_str("\nRelevant facts from memory:");
            for fact in &facts {
                system.push_str(&format!("\n- {}", fact.content));
            }
        }

        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(history);
        Ok(messages)
    }

    /// Route the message to a parked agent, if any.
    async fn route_to_pending_agent(
        &self,
        message: &IncomingMessage,
        messages: &mut Vec<ChatMessage>,
        ctx: &ToolExecutionContext,
    ) -> PendingRoute {
        let Some(pooled) = self.pool.find_pending(&message.tenant_id).await else {
            messages.push(ChatMessage::user(&message.text));
            return PendingRoute::Continue;
        };

        let agent_type = pooled.session.agent_type().to_string();
        match pooled.entry.status {
            AgentStatus::WaitingForApproval => {
                let Some(decision) = parse_decision(&message.text) else {
                    // Not an approval verb: re-present the request.
                    let prompt = pooled.session.approval_prompt();
                    let request = self.approvals.build_request(&pooled.session);
                    push_direct_exchange(messages, &message.text, &prompt);
                    return PendingRoute::Direct(direct_result(prompt, vec![request]));
                };
                match self.approvals.resolve(pooled, decision, ctx).await {
                    ApprovalOutcome::Resolved { content, is_error } => {
                        messages.push(ChatMessage::user(&message.text));
                        push_agent_pair(messages, &agent_type, &content, is_error);
                        PendingRoute::Continue
                    }
                    ApprovalOutcome::StillWaiting { prompt } => {
                        push_direct_exchange(messages, &message.text, &prompt);
                        PendingRoute::Direct(direct_result(prompt, vec![]))
                    }
                }
            }
            AgentStatus::WaitingForInput | AgentStatus::Paused => {
                let mut session = pooled.session;
                match session.handle_message(&message.text, ctx).await {
                    AgentResult::WaitingForInput { prompt } => {
                        self.pool
                            .put(
                                session,
                                AgentStatus::WaitingForInput,
                                None,
                                pooled.entry.task_id,
                            )
                            .await;
                        push_direct_exchange(messages, &message.text, &prompt);
                        PendingRoute::Direct(direct_result(prompt, vec![]))
                    }
                    AgentResult::WaitingForApproval { prompt } => {
                        let request = self.approvals.build_request(&session);
                        self.pool
                            .put(
                                session,
                                AgentStatus::WaitingForApproval,
                                Some(self.approvals.deadline()),
                                pooled.entry.task_id,
                            )
                            .await;
                        push_direct_exchange(messages, &message.text, &prompt);
                        PendingRoute::Direct(direct_result(prompt, vec![request]))
                    }
                    AgentResult::Completed { text } => {
                        self.pool
                            .remove(&message.tenant_id, &pooled.entry.agent_id)
                            .await;
                        messages.push(ChatMessage::user(&message.text));
                        push_agent_pair(messages, &agent_type, &text, false);
                        PendingRoute::Continue
                    }
                    AgentResult::Error { message: error } => {
                        self.pool
                            .remove(&message.tenant_id, &pooled.entry.agent_id)
                            .await;
                        messages.push(ChatMessage::user(&message.text));
                        push_agent_pair(messages, &agent_type, &error, true);
                        PendingRoute::Continue
                    }
                }
            }
        }
    }

    /// Plain tools plus agents exposed as tools.  Agents win a name clash —
    /// the invoker dispatches to them first.
    fn tool_catalog(&self) -> Vec<ToolInfo> {
        let agent_infos = self.agents.tool_catalog();
        let mut catalog: Vec<ToolInfo> = self
            .tools
            .list()
            .into_iter()
            .filter(|t| !agent_infos.iter().any(|a| a.name == t.name))
            .collect();
        catalog.extend(agent_infos);
        catalog.sort_by(|a, b| a.name.cmp(&b.name));
        catalog
    }

    /// Persist the turn and hand it to long-term extraction in the
    /// background.
    async fn post_process(&self, message: &IncomingMessage, new_messages: &[ChatMessage]) {
        if new_messages.is_empty() {
            return;
        }
        if let Err(reason) = self
            .memory
            .save_history(&message.tenant_id, &message.session_id, new_messages)
            .await
        {
            tracing::error!(%reason, "failed to persist conversation history");
        }

        let memory = self.memory.clone();
        let tenant = message.tenant_id.clone();
        let batch: Vec<ChatMessage> = new_messages.to_vec();
        tokio::spawn(async move {
            if let Err(reason) = memory.add(&tenant, &batch, true).await {
                tracing::warn!(%reason, "long-term memory extraction failed");
            }
        });
    }

    async fn tenant_lock(&self, tenant_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.tenant_locks.lock().await;
        locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

enum PendingRoute {
    /// Respond without entering the loop.
    Direct(ReactLoopResult),
    /// Enter the loop with the (possibly augmented) message list.
    Continue,
}

fn direct_result(
    response: String,
    pending_approvals: Vec<crate::agent::approval::ApprovalRequest>,
) -> ReactLoopResult {
    ReactLoopResult {
        response,
        turns: 0,
        tool_call_records: Vec::<ToolCallRecord>::new(),
        token_usage: TokenUsage::default(),
        duration_ms: 0,
        pending_approvals,
    }
}

/// Record a prompt answered without the planner: the user's reply plus the
/// agent's next question, persisted as an ordinary exchange.
fn push_direct_exchange(messages: &mut Vec<ChatMessage>, user_text: &str, prompt: &str) {
    messages.push(ChatMessage::user(user_text));
    messages.push(ChatMessage::assistant(prompt));
}

/// Append a synthesized assistant/tool pair carrying a resumed agent's
/// result, keeping the pairing invariant intact for the planner.
fn push_agent_pair(messages: &mut Vec<ChatMessage>, agent_type: &str, content: &str, is_error: bool) {
    let call = ToolCall::new(agent_type, json!({}));
    let call_id = call.id.clone();
    messages.push(ChatMessage::assistant_with_tool_calls("", vec![call]));
    messages.push(ChatMessage::tool_result(call_id, content, is_error));
}

/// Emit a response that never went through the model as a single chunk.
async fn emit_whole_message(sink: &EventSink, text: &str) {
    sink.emit(AgentEvent::MessageStart).await;
    sink.emit(AgentEvent::MessageChunk {
        delta: text.to_string(),
    })
    .await;
    sink.emit(AgentEvent::MessageEnd).await;
}
