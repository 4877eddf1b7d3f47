//! `ReactLoop` — the core reasoning loop.
//!
//! # Algorithm
//!
//! ```text
//! trim_if_needed(messages)
//!       │
//!       ▼
//! LLM call (retry policy, overflow recovery chain)
//!       │
//!       ├─ no tool calls ──► return final response
//!       ▼ tool calls present
//! fan out all calls concurrently, each under its own timeout
//!       │
//!       ▼
//! append one tool message per call, in call order
//!       ├─ an agent parked? ──► break, return prompt + pending approvals
//!       ▼
//! turns += 1; turns < max_turns ──► repeat
//!       │
//!       ▼
//! final LLM call with no tools → forced text answer
//! ```
//!
//! The loop never fails because a tool failed: every tool error becomes an
//! `is_error` tool message and the planner decides what to do next.

use std::sync::{
    atomic::{AtomicBool, Ordering as AtomicOrdering},
    Arc,
};
use std::time::Instant;

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::agent::approval::ApprovalRequest;
use crate::agent::events::{AgentEvent, EventSink};
use crate::ai::context::ContextManager;
use crate::ai::error::LlmError;
use crate::ai::provider::LlmProvider;
use crate::ai::retry::{chat_with_retry, stream_with_retry};
use crate::ai::types::{
    ChatMessage, ChatRequest, ChatResponse, TokenUsage, ToolCall, ToolInfo,
};
use crate::config::ReactLoopConfig;
use crate::error::OrchestratorError;
use crate::tools::invoker::{ToolInvoker, ToolOutcome};
use crate::tools::traits::ToolExecutionContext;

/// Instruction appended when the turn budget runs out.
const FINAL_INSTRUCTION: &str =
    "You have executed enough steps. Provide a final answer from the information gathered so far.";

/// Response surfaced when overflow recovery is exhausted.
const TOO_LONG_RESPONSE: &str =
    "This conversation has grown too long to continue. Please start a new conversation.";

/// Character cap for the argument summary kept in a tool-call record.
const ARGS_SUMMARY_MAX: usize = 120;

// ─── ToolCallRecord ───────────────────────────────────────────────────────────

/// Status recorded for one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Completed,
    WaitingForInput,
    WaitingForApproval,
    Error,
    /// The call produced no result (it was never executed).
    Null,
}

/// Telemetry for one tool call of a loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub args_summary: String,
    pub duration_ms: u64,
    pub success: bool,
    pub result_status: ResultStatus,
    pub result_chars: usize,
    /// Approximate tokens the result contributed to the context.
    pub token_attribution: u64,
}

// ─── ReactLoopResult ──────────────────────────────────────────────────────────

/// Structured outcome of one loop run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactLoopResult {
    /// Final assistant text, or the prompt of a parked agent.
    pub response: String,
    /// Number of LLM calls made.  At most `max_turns + 1` (the `+1` is the
    /// forced summary call).
    pub turns: usize,
    pub tool_call_records: Vec<ToolCallRecord>,
    pub token_usage: TokenUsage,
    pub duration_ms: u64,
    /// Approval requests parked by the final assistant turn, batched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_approvals: Vec<ApprovalRequest>,
}

// ─── ReactLoop ────────────────────────────────────────────────────────────────

/// The iterative planner.  Stateless between runs; conversation state lives
/// in the message list owned by the caller.
pub struct ReactLoop {
    provider: Arc<dyn LlmProvider>,
    invoker: Arc<ToolInvoker>,
    context: ContextManager,
    config: ReactLoopConfig,
    /// Optional cancellation flag, checked at every turn boundary.
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl ReactLoop {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        invoker: Arc<ToolInvoker>,
        config: ReactLoopConfig,
    ) -> Self {
        Self {
            provider,
            invoker,
            context: ContextManager::new(config.clone()),
            config,
            cancel_flag: None,
        }
    }

    /// Attach a cancellation flag.  When set, the loop aborts at the next
    /// turn boundary without pooling any partial state.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(flag);
        self
    }

    /// Run the loop against `messages`, mutating it in place.  New assistant
    /// and tool messages are appended as the loop proceeds; the caller
    /// persists or discards the updated history.
    #[tracing::instrument(
        name = "react.run",
        skip_all,
        fields(
            tenant = %ctx.tenant_id,
            catalog_len = catalog.len(),
            history_len = messages.len(),
        )
    )]
    pub async fn run(
        &self,
        messages: &mut Vec<ChatMessage>,
        catalog: &[ToolInfo],
        ctx: &ToolExecutionContext,
    ) -> Result<ReactLoopResult, OrchestratorError> {
        let started = Instant::now();
        let mut usage = TokenUsage::default();
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut turns = 0usize;

        loop {
            if self.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            self.context.trim_if_needed(messages);

            let Some(response) = self.call_llm(messages, catalog, ctx, &mut usage).await? else {
                return Ok(finish(
                    TOO_LONG_RESPONSE.to_string(),
                    turns,
                    records,
                    usage,
                    started,
                    vec![],
                ));
            };
            turns += 1;

            // A turn with zero tool calls is final, even with empty content.
            if response.tool_calls.is_empty() {
                messages.push(ChatMessage::assistant(response.content.clone()));
                return Ok(finish(
                    response.content,
                    turns,
                    records,
                    usage,
                    started,
                    vec![],
                ));
            }

            // With no turn budget at all, the first response is returned
            // as-is and nothing executes.
            if self.config.max_turns == 0 {
                messages.push(ChatMessage::assistant(response.content.clone()));
                return Ok(finish(
                    response.content,
                    turns,
                    records,
                    usage,
                    started,
                    vec![],
                ));
            }

            let calls = response.tool_calls.clone();
            messages.push(ChatMessage::assistant_with_tool_calls(
                response.content.clone(),
                calls.clone(),
            ));

            if let Some(events) = &ctx.events {
                for call in &calls {
                    events
                        .emit(AgentEvent::ToolCallStart {
                            tool_call_id: call.id.clone(),
                            name: call.name.clone(),
                        })
                        .await;
                }
            }

            // Fan out all calls concurrently; `join_all` yields results in
            // call order regardless of completion order, and a failure in
            // one call never disturbs its siblings.
            let outcomes = futures::future::join_all(calls.iter().map(|call| async move {
                let call_started = Instant::now();
                let outcome = self.invoker.invoke(call, ctx).await;
                (outcome, call_started.elapsed())
            }))
            .await;

            let mut pending_approvals: Vec<ApprovalRequest> = Vec::new();
            let mut parked_prompts: Vec<String> = Vec::new();

            for (call, (outcome, elapsed)) in calls.iter().zip(outcomes) {
                let content = match &outcome {
                    ToolOutcome::Completed { text } => {
                        let truncated = self.context.truncate_tool_result(text);
                        messages.push(ChatMessage::tool_result(&call.id, &truncated, false));
                        truncated
                    }
                    ToolOutcome::Error { message } => {
                        messages.push(ChatMessage::tool_result(&call.id, message, true));
                        message.clone()
                    }
                    ToolOutcome::WaitingInput { prompt, .. } => {
                        messages.push(ChatMessage::tool_result(&call.id, prompt, false));
                        parked_prompts.push(prompt.clone());
                        prompt.clone()
                    }
                    ToolOutcome::WaitingApproval { request, .. } => {
                        let prompt = request.action_summary.clone();
                        messages.push(ChatMessage::tool_result(&call.id, &prompt, false));
                        parked_prompts.push(prompt.clone());
                        pending_approvals.push(request.clone());
                        prompt
                    }
                };

                if let Some(events) = &ctx.events {
                    events
                        .emit(AgentEvent::ToolCallEnd {
                            tool_call_id: call.id.clone(),
                            name: call.name.clone(),
                            duration_ms: elapsed.as_millis() as u64,
                        })
                        .await;
                    events
                        .emit(AgentEvent::ToolResult {
                            tool_call_id: call.id.clone(),
                            is_error: matches!(outcome, ToolOutcome::Error { .. }),
                            result_chars: content.len(),
                        })
                        .await;
                }

                records.push(record(call, &outcome, &content, elapsed));
            }

            // A parked agent ends the loop for this message; the user must
            // answer before planning can continue.  All tool messages were
            // appended first so the pairing invariant holds.
            if !parked_prompts.is_empty() {
                let response = parked_prompts.join("\n\n");
                // The prompt never went through the model, so the streaming
                // path emits it here as a single chunk.
                if let Some(events) = &ctx.events {
                    events.emit(AgentEvent::MessageStart).await;
                    events
                        .emit(AgentEvent::MessageChunk {
                            delta: response.clone(),
                        })
                        .await;
                    events.emit(AgentEvent::MessageEnd).await;
                }
                return Ok(finish(
                    response,
                    turns,
                    records,
                    usage,
                    started,
                    pending_approvals,
                ));
            }

            if turns >= self.config.max_turns {
                messages.push(ChatMessage::system(FINAL_INSTRUCTION));
                let Some(final_response) =
                    self.call_llm(messages, &[], ctx, &mut usage).await?
                else {
                    return Ok(finish(
                        TOO_LONG_RESPONSE.to_string(),
                        turns,
                        records,
                        usage,
                        started,
                        vec![],
                    ));
                };
                turns += 1;
                messages.push(ChatMessage::assistant(final_response.content.clone()));
                return Ok(finish(
                    final_response.content,
                    turns,
                    records,
                    usage,
                    started,
                    vec![],
                ));
            }
        }
    }

    // ── LLM call with overflow recovery ──────────────────────────────────────

    /// Call the provider under the retry policy, recovering from context
    /// overflow with the trimming chain.  `Ok(None)` means every recovery
    /// step was exhausted and the conversation cannot continue.
    async fn call_llm(
        &self,
        messages: &mut Vec<ChatMessage>,
        tools: &[ToolInfo],
        ctx: &ToolExecutionContext,
        usage: &mut TokenUsage,
    ) -> Result<Option<ChatResponse>, OrchestratorError> {
        let mut recovery_step = 0usize;
        loop {
            let request = ChatRequest::new(messages.clone()).with_tools(tools.to_vec());
            let result = match &ctx.events {
                Some(events) => self.stream_llm(request, events).await,
                None => chat_with_retry(&self.provider, &request, &self.config).await,
            };
            match result {
                Ok(response) => {
                    usage.accumulate(response.usage);
                    return Ok(Some(response));
                }
                Err(LlmError::ContextOverflow(reason)) => {
                    tracing::warn!(%reason, step = recovery_step, "recovering from context overflow");
                    loop {
                        let changed = match recovery_step {
                            0 => self.context.trim_if_needed(messages),
                            1 => self.context.truncate_all_tool_results(messages),
                            2 => self.context.force_trim(messages),
                            _ => return Ok(None),
                        };
                        recovery_step += 1;
                        if changed {
                            break;
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Stream a chat call, forwarding content chunks as events and
    /// accumulating the full response.
    async fn stream_llm(
        &self,
        request: ChatRequest,
        events: &EventSink,
    ) -> Result<ChatResponse, LlmError> {
        let mut stream = stream_with_retry(&self.provider, &request, &self.config).await?;

        let mut content = String::new();
        let mut message_started = false;
        let mut usage: Option<TokenUsage> = None;
        // index → (id, name, accumulated argument fragments)
        let mut partial_calls: Vec<(String, String, String)> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if let Some(delta) = chunk.delta_content {
                if !delta.is_empty() {
                    if !message_started {
                        events.emit(AgentEvent::MessageStart).await;
                        message_started = true;
                    }
                    content.push_str(&delta);
                    events.emit(AgentEvent::MessageChunk { delta }).await;
                }
            }
            if let Some(delta) = chunk.delta_tool_call {
                if partial_calls.len() <= delta.index {
                    partial_calls.resize(delta.index + 1, Default::default());
                }
                let entry = &mut partial_calls[delta.index];
                if let Some(id) = delta.id {
                    entry.0 = id;
                }
                if let Some(name) = delta.name {
                    entry.1 = name;
                }
                if let Some(fragment) = delta.arguments {
                    entry.2.push_str(&fragment);
                }
            }
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
        }

        if message_started {
            events.emit(AgentEvent::MessageEnd).await;
        }

        let tool_calls: Vec<ToolCall> = partial_calls
            .into_iter()
            .filter(|(id, name, _)| !id.is_empty() && !name.is_empty())
            .map(|(id, name, args)| ToolCall {
                id,
                name,
                arguments: serde_json::from_str(&args)
                    .unwrap_or(serde_json::Value::Object(Default::default())),
            })
            .collect();

        Ok(ChatResponse {
            content,
            tool_calls,
            usage,
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .is_some_and(|f| f.load(AtomicOrdering::SeqCst))
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn finish(
    response: String,
    turns: usize,
    tool_call_records: Vec<ToolCallRecord>,
    token_usage: TokenUsage,
    started: Instant,
    pending_approvals: Vec<ApprovalRequest>,
) -> ReactLoopResult {
    ReactLoopResult {
        response,
        turns,
        tool_call_records,
        token_usage,
        duration_ms: started.elapsed().as_millis() as u64,
        pending_approvals,
    }
}

fn record(
    call: &ToolCall,
    outcome: &ToolOutcome,
    content: &str,
    elapsed: std::time::Duration,
) -> ToolCallRecord {
    let (success, result_status) = match outcome {
        ToolOutcome::Completed { .. } => (true, ResultStatus::Completed),
        ToolOutcome::WaitingInput { .. } => (true, ResultStatus::WaitingForInput),
        ToolOutcome::WaitingApproval { .. } => (true, ResultStatus::WaitingForApproval),
        ToolOutcome::Error { .. } => (false, ResultStatus::Error),
    };
    ToolCallRecord {
        name: call.name.clone(),
        args_summary: summarize_args(&call.arguments),
        duration_ms: elapsed.as_millis() as u64,
        success,
        result_status,
        result_chars: content.len(),
        token_attribution: ContextManager::estimate_tokens(content) as u64,
    }
}

fn summarize_args(arguments: &serde_json::Value) -> String {
    let raw = arguments.to_string();
    if raw.len() <= ARGS_SUMMARY_MAX {
        return raw;
    }
    let mut cut = ARGS_SUMMARY_MAX;
    while cut > 0 && !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &raw[..cut])
}
