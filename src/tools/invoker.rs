//! Tool dispatch.
//!
//! Routes a tool call to a plain tool or an agent exposed as a tool, each
//! under its own deadline.  Every failure mode is folded into
//! [`ToolOutcome`] — the reasoning loop never sees an error type from here,
//! it pattern-matches on outcomes.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::time::timeout;

use super::registry::ToolRegistry;
use super::traits::ToolExecutionContext;
use crate::agent::approval::{ApprovalCoordinator, ApprovalRequest};
use crate::agent::events::AgentEvent;
use crate::agents::pool::AgentPool;
use crate::agents::registry::AgentRegistry;
use crate::agents::session::{AgentResult, AgentSession, AgentStatus};
use crate::ai::types::ToolCall;
use crate::config::ReactLoopConfig;
use crate::triggers::TRIGGER_SOURCE;

// ─── ToolOutcome ──────────────────────────────────────────────────────────────

/// Outcome of one tool call.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// The tool (or agent) finished; `text` becomes the tool message.
    Completed { text: String },
    /// An agent parked waiting for user input; its prompt goes to the user.
    WaitingInput { prompt: String, agent_id: String },
    /// An agent parked waiting for confirmation.
    WaitingApproval {
        request: ApprovalRequest,
        agent_id: String,
    },
    /// Anything that went wrong: unknown tool, bad arguments, execution
    /// failure or timeout.  Becomes an `is_error` tool message.
    Error { message: String },
}

impl ToolOutcome {
    pub fn is_parked(&self) -> bool {
        matches!(
            self,
            ToolOutcome::WaitingInput { .. } | ToolOutcome::WaitingApproval { .. }
        )
    }
}

// ─── ToolInvoker ──────────────────────────────────────────────────────────────

/// Dispatches tool calls from the reasoning loop.
pub struct ToolInvoker {
    tools: Arc<ToolRegistry>,
    agents: Arc<AgentRegistry>,
    pool: Arc<AgentPool>,
    approvals: ApprovalCoordinator,
    config: ReactLoopConfig,
}

impl ToolInvoker {
    pub fn new(
        tools: Arc<ToolRegistry>,
        agents: Arc<AgentRegistry>,
        pool: Arc<AgentPool>,
        config: ReactLoopConfig,
    ) -> Self {
        Self {
            tools,
            agents,
            approvals: ApprovalCoordinator::new(pool.clone(), config.clone()),
            pool,
            config,
        }
    }

    /// Execute one tool call under the appropriate timeout.
    pub async fn invoke(&self, call: &ToolCall, ctx: &ToolExecutionContext) -> ToolOutcome {
        let args = match &call.arguments {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => {
                return ToolOutcome::Error {
                    message: format!("Tool {} arguments must be a JSON object", call.name),
                };
            }
        };

        if let Some(definition) = self.agents.get(&call.name) {
            if definition.expose_as_tool {
                return self.invoke_agent(definition, args, ctx).await;
            }
        }

        if let Some(tool) = self.tools.get(&call.name) {
            return self.invoke_plain(&call.name, tool, args, ctx).await;
        }

        ToolOutcome::Error {
            message: format!("Tool {} is not registered", call.name),
        }
    }

    // ── Plain tool path ──────────────────────────────────────────────────────

    async fn invoke_plain(
        &self,
        name: &str,
        tool: Arc<dyn super::traits::Tool>,
        args: Map<String, Value>,
        ctx: &ToolExecutionContext,
    ) -> ToolOutcome {
        match timeout(
            self.config.tool_timeout(),
            tool.execute(Value::Object(args), ctx),
        )
        .await
        {
            Ok(Ok(result)) if result.success => ToolOutcome::Completed {
                text: result.output,
            },
            Ok(Ok(result)) => ToolOutcome::Error {
                message: result.output,
            },
            Ok(Err(message)) => ToolOutcome::Error { message },
            Err(_) => ToolOutcome::Error {
                message: format!(
                    "Tool {} timed out after {}s",
                    name, self.config.tool_execution_timeout_secs
                ),
            },
        }
    }

    // ── Agent-tool path ──────────────────────────────────────────────────────

    async fn invoke_agent(
        &self,
        definition: Arc<crate::agents::definition::AgentDefinition>,
        args: Map<String, Value>,
        ctx: &ToolExecutionContext,
    ) -> ToolOutcome {
        let name = definition.name.clone();
        let task_instruction = args
            .get("task_instruction")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let mut session = AgentSession::new(definition, &ctx.tenant_id);

        let result = timeout(self.config.agent_tool_timeout(), async {
            session.seed_fields(&args, ctx).await;
            session.handle_message(&task_instruction, ctx).await
        })
        .await;

        // A timeout before the agent reached a waiting state discards the
        // instance entirely; nothing is pooled.
        let Ok(result) = result else {
            return ToolOutcome::Error {
                message: format!(
                    "Agent {} timed out after {}s",
                    name, self.config.agent_tool_execution_timeout_secs
                ),
            };
        };

        match result {
            AgentResult::Completed { text } => ToolOutcome::Completed { text },
            AgentResult::Error { message } => ToolOutcome::Error { message },
            AgentResult::WaitingForInput { prompt } => {
                let agent_id = session.agent_id.clone();
                self.emit_state_change(ctx, &session, AgentStatus::WaitingForInput)
                    .await;
                self.pool
                    .put(
                        session,
                        AgentStatus::WaitingForInput,
                        None,
                        task_id_from(ctx),
                    )
                    .await;
                ToolOutcome::WaitingInput { prompt, agent_id }
            }
            AgentResult::WaitingForApproval { .. } => {
                let agent_id = session.agent_id.clone();
                let request = self.approvals.build_request(&session);
                self.emit_state_change(ctx, &session, AgentStatus::WaitingForApproval)
                    .await;
                self.pool
                    .put(
                        session,
                        AgentStatus::WaitingForApproval,
                        Some(self.approvals.deadline()),
                        task_id_from(ctx),
                    )
                    .await;
                ToolOutcome::WaitingApproval { request, agent_id }
            }
        }
    }

    async fn emit_state_change(
        &self,
        ctx: &ToolExecutionContext,
        session: &AgentSession,
        status: AgentStatus,
    ) {
        if let Some(events) = &ctx.events {
            events
                .emit(AgentEvent::StateChange {
                    agent_id: session.agent_id.clone(),
                    agent_name: session.agent_type().to_string(),
                    status,
                })
                .await;
        }
    }
}

/// Triggered-task id carried in the message metadata, when present.
fn task_id_from(ctx: &ToolExecutionContext) -> Option<String> {
    let meta = ctx.metadata.as_object()?;
    if meta.get("source").and_then(Value::as_str) != Some(TRIGGER_SOURCE) {
        return None;
    }
    meta.get("task_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::definition::AgentDefinition;
    use crate::agents::fields::{FieldType, InputField};
    use crate::config::PoolConfig;
    use crate::tools::traits::{Tool, ToolResult};
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(
            &self,
            args: Value,
            _ctx: &ToolExecutionContext,
        ) -> Result<ToolResult, String> {
            let msg = args
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("(empty)")
                .to_string();
            Ok(ToolResult::ok(msg))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "never finishes in time"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(
            &self,
            _args: Value,
            _ctx: &ToolExecutionContext,
        ) -> Result<ToolResult, String> {
            tokio::time::sleep(std::time::Duration::from_secs(3_600)).await;
            Ok(ToolResult::ok("too late"))
        }
    }

    fn invoker(config: ReactLoopConfig) -> (ToolInvoker, Arc<AgentPool>) {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool));
        tools.register(Arc::new(SlowTool));

        let mut agents = AgentRegistry::new();
        agents.register(
            AgentDefinition::builder("greet")
                .description("Greets someone by name")
                .field(InputField::new("name", FieldType::String, "who to greet"))
                .run(|fields, _| async move {
                    Ok(format!(
                        "Hello, {}!",
                        fields.get("name").and_then(Value::as_str).unwrap_or("?")
                    ))
                })
                .build()
                .unwrap(),
        );
        agents.register(
            AgentDefinition::builder("send_email")
                .description("Send an email")
                .field(InputField::new("recipient", FieldType::String, "address"))
                .field(InputField::new("subject", FieldType::String, "subject line"))
                .run(|_, _| async { Ok("sent".to_string()) })
                .build()
                .unwrap(),
        );

        let agents = Arc::new(agents);
        let pool = Arc::new(AgentPool::new(PoolConfig::default(), agents.clone()));
        (
            ToolInvoker::new(Arc::new(tools), agents, pool.clone(), config),
            pool,
        )
    }

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall::new(name, arguments)
    }

    #[tokio::test]
    async fn plain_tool_completes() {
        let (invoker, _) = invoker(ReactLoopConfig::default());
        let ctx = ToolExecutionContext::new("t1");
        let outcome = invoker
            .invoke(&call("echo", json!({"message": "ping"})), &ctx)
            .await;
        assert!(matches!(outcome, ToolOutcome::Completed { text } if text == "ping"));
    }

    #[tokio::test]
    async fn unknown_tool_is_error_not_panic() {
        let (invoker, _) = invoker(ReactLoopConfig::default());
        let ctx = ToolExecutionContext::new("t1");
        let outcome = invoker.invoke(&call("nonexistent", json!({})), &ctx).await;
        let ToolOutcome::Error { message } = outcome else {
            panic!("expected error outcome");
        };
        assert_eq!(message, "Tool nonexistent is not registered");
    }

    #[tokio::test]
    async fn non_object_arguments_rejected() {
        let (invoker, _) = invoker(ReactLoopConfig::default());
        let ctx = ToolExecutionContext::new("t1");
        let outcome = invoker.invoke(&call("echo", json!([1, 2])), &ctx).await;
        let ToolOutcome::Error { message } = outcome else {
            panic!("expected error outcome");
        };
        assert!(message.contains("JSON object"));
    }

    #[tokio::test(start_paused = true)]
    async fn plain_tool_timeout_is_error() {
        let (invoker, _) = invoker(ReactLoopConfig {
            tool_execution_timeout_secs: 1,
            ..Default::default()
        });
        let ctx = ToolExecutionContext::new("t1");
        let outcome = invoker.invoke(&call("slow", json!({})), &ctx).await;
        let ToolOutcome::Error { message } = outcome else {
            panic!("expected timeout error");
        };
        assert!(message.contains("timed out"));
    }

    #[tokio::test]
    async fn agent_with_complete_args_runs_without_pooling() {
        let (invoker, pool) = invoker(ReactLoopConfig::default());
        let ctx = ToolExecutionContext::new("t1");
        let outcome = invoker
            .invoke(
                &call("greet", json!({"name": "Ada", "task_instruction": "greet Ada"})),
                &ctx,
            )
            .await;
        assert!(matches!(outcome, ToolOutcome::Completed { text } if text == "Hello, Ada!"));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn agent_missing_field_parks_in_pool() {
        let (invoker, pool) = invoker(ReactLoopConfig::default());
        let ctx = ToolExecutionContext::new("t1");
        let outcome = invoker
            .invoke(
                &call("send_email", json!({"recipient": "alice@x.com"})),
                &ctx,
            )
            .await;
        let ToolOutcome::WaitingInput { prompt, agent_id } = outcome else {
            panic!("expected WaitingInput");
        };
        assert!(prompt.contains("subject"));
        assert!(pool.get("t1", &agent_id).await.is_some());
    }

    #[tokio::test]
    async fn unknown_argument_keys_are_ignored() {
        let (invoker, _) = invoker(ReactLoopConfig::default());
        let ctx = ToolExecutionContext::new("t1");
        let outcome = invoker
            .invoke(
                &call("greet", json!({"name": "Ada", "mood": "cheerful"})),
                &ctx,
            )
            .await;
        assert!(matches!(outcome, ToolOutcome::Completed { .. }));
    }
}
