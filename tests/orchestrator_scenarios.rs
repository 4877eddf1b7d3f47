//! End-to-end scenarios through the public orchestrator API, with a
//! scripted provider standing in for the LLM.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use concierge::agent::events::AgentEvent;
use concierge::agents::session::AgentStatus;
use concierge::agents::{AgentDefinition, AgentPool, AgentRegistry, FieldType, InputField, MemoryPoolStore, PoolStore};
use concierge::ai::provider::{ChatStream, Result as LlmResult};
use concierge::ai::types::{ChatRequest, ChatResponse, StreamChunk, TokenUsage, ToolCallDelta};
use concierge::config::{PoolConfig, ReactLoopConfig};
use concierge::memory::InMemoryMemory;
use concierge::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ─── Scripted provider ────────────────────────────────────────────────────────

/// Returns scripted responses in order, over both `chat` and `stream`.
struct ScriptedProvider {
    responses: Mutex<Vec<ChatResponse>>,
    index: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
            index: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn text(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.to_string(),
            tool_calls: vec![],
            usage: Some(TokenUsage::new(20, 10)),
        }
    }

    fn call(name: &str, id: &str, arguments: Value) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }],
            usage: Some(TokenUsage::new(20, 10)),
        }
    }

    fn next(&self) -> ChatResponse {
        let i = self.index.fetch_add(1, Ordering::SeqCst);
        let responses = self.responses.lock().unwrap();
        responses
            .get(i)
            .cloned()
            .unwrap_or_else(|| Self::text("No more scripted responses"))
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, request: ChatRequest) -> LlmResult<ChatResponse> {
        self.requests.lock().unwrap().push(request);
        Ok(self.next())
    }

    async fn stream(&self, request: ChatRequest) -> LlmResult<ChatStream> {
        self.requests.lock().unwrap().push(request);
        let response = self.next();

        let mut chunks: Vec<LlmResult<StreamChunk>> = Vec::new();
        // Content in two chunks to exercise accumulation.
        let content = response.content;
        if !content.is_empty() {
            let mid = content.len() / 2;
            let mid = (0..=mid).rev().find(|i| content.is_char_boundary(*i)).unwrap_or(0);
            chunks.push(Ok(StreamChunk {
                delta_content: Some(content[..mid].to_string()),
                ..Default::default()
            }));
            chunks.push(Ok(StreamChunk {
                delta_content: Some(content[mid..].to_string()),
                ..Default::default()
            }));
        }
        for (index, call) in response.tool_calls.iter().enumerate() {
            chunks.push(Ok(StreamChunk {
                delta_tool_call: Some(ToolCallDelta {
                    index,
                    id: Some(call.id.clone()),
                    name: Some(call.name.clone()),
                    arguments: Some(call.arguments.to_string()),
                }),
                ..Default::default()
            }));
        }
        chunks.push(Ok(StreamChunk {
            usage: response.usage,
            ..Default::default()
        }));

        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }
}

// ─── Fixtures ─────────────────────────────────────────────────────────────────

struct WeatherTool;

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }
    fn description(&self) -> &str {
        "Current weather for a city"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]})
    }
    async fn execute(&self, args: Value, _ctx: &ToolExecutionContext) -> Result<ToolResult, String> {
        let city = args.get("city").and_then(Value::as_str).unwrap_or("?");
        Ok(ToolResult::ok(format!(r#"{{"city":"{city}","temp_c":18,"cond":"clear"}}"#)))
    }
}

fn email_agent(needs_approval: bool) -> AgentDefinition {
    AgentDefinition::builder("send_email")
        .description("Send an email on the user's behalf")
        .field(InputField::new("recipient", FieldType::String, "destination address"))
        .field(InputField::new("subject", FieldType::String, "subject line"))
        .field(InputField::new("body", FieldType::String, "message body"))
        .needs_approval(needs_approval)
        .run(|fields, _ctx| async move {
            Ok(format!(
                "Email '{}' sent to {}",
                fields.get("subject").and_then(Value::as_str).unwrap_or(""),
                fields.get("recipient").and_then(Value::as_str).unwrap_or("")
            ))
        })
        .build()
        .unwrap()
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    provider: Arc<ScriptedProvider>,
    pool: Arc<AgentPool>,
    memory: Arc<InMemoryMemory>,
}

fn harness(
    responses: Vec<ChatResponse>,
    needs_approval: bool,
    config: ReactLoopConfig,
) -> Harness {
    harness_with_store(responses, needs_approval, config, None)
}

fn harness_with_store(
    responses: Vec<ChatResponse>,
    needs_approval: bool,
    config: ReactLoopConfig,
    store: Option<Arc<dyn PoolStore>>,
) -> Harness {
    let provider = ScriptedProvider::new(responses);

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(WeatherTool));

    let mut agents = AgentRegistry::new();
    agents.register(email_agent(needs_approval));
    let agents = Arc::new(agents);

    let mut pool = AgentPool::new(PoolConfig::default(), agents.clone());
    if let Some(store) = store {
        pool = pool.with_store(store);
    }
    let pool = Arc::new(pool);

    let memory = Arc::new(InMemoryMemory::new());

    let orchestrator = Arc::new(Orchestrator::new(
        provider.clone(),
        Arc::new(tools),
        agents,
        pool.clone(),
        memory.clone(),
        config,
    ));

    Harness {
        orchestrator,
        provider,
        pool,
        memory,
    }
}

// ─── S1: single plain tool ────────────────────────────────────────────────────

#[tokio::test]
async fn s1_single_plain_tool() {
    init_tracing();
    let h = harness(
        vec![
            ScriptedProvider::call("get_weather", "call_1", json!({"city": "Tokyo"})),
            ScriptedProvider::text("Tokyo is 18°C and clear."),
        ],
        false,
        ReactLoopConfig::default(),
    );

    let result = h
        .orchestrator
        .handle_message(IncomingMessage::new("t1", "What's the weather in Tokyo?"))
        .await
        .unwrap();

    assert_eq!(result.response, "Tokyo is 18°C and clear.");
    assert_eq!(result.turns, 2);
    assert_eq!(result.tool_call_records.len(), 1);
    assert_eq!(result.tool_call_records[0].name, "get_weather");
    assert!(result.tool_call_records[0].success);
    assert_eq!(result.token_usage.total, 60);
}

// ─── S2: parallel fan-out ─────────────────────────────────────────────────────

#[tokio::test]
async fn s2_parallel_fanout_appends_in_call_order() {
    let two_calls = ChatResponse {
        content: String::new(),
        tool_calls: vec![
            ToolCall {
                id: "call_tokyo".to_string(),
                name: "get_weather".to_string(),
                arguments: json!({"city": "Tokyo"}),
            },
            ToolCall {
                id: "call_paris".to_string(),
                name: "get_weather".to_string(),
                arguments: json!({"city": "Paris"}),
            },
        ],
        usage: None,
    };
    let h = harness(
        vec![two_calls, ScriptedProvider::text("Both are 18°C and clear.")],
        false,
        ReactLoopConfig::default(),
    );

    let result = h
        .orchestrator
        .handle_message(IncomingMessage::new("t1", "Weather in Tokyo and Paris."))
        .await
        .unwrap();

    assert_eq!(result.turns, 2);
    assert_eq!(result.tool_call_records.len(), 2);
    assert!(result.tool_call_records.iter().all(|r| r.success));

    // The persisted conversation holds the tool messages in call order.
    let history = h.memory.get_history("t1", "main", 50).await.unwrap();
    let tool_ids: Vec<&str> = history
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assert_eq!(tool_ids, vec!["call_tokyo", "call_paris"]);
}

// ─── S3: agent-tool needing input across messages ─────────────────────────────

#[tokio::test]
async fn s3_agent_collects_fields_across_messages() {
    let h = harness(
        vec![
            ScriptedProvider::call(
                "send_email",
                "call_email",
                json!({"recipient": "alice@x.com", "task_instruction": "send an email to alice"}),
            ),
            // After the agent completes, the planner wraps up.
            ScriptedProvider::text("Done, your email is on its way."),
        ],
        false,
        ReactLoopConfig::default(),
    );

    // Message 1: the planner calls the agent; it parks for the subject.
    let result = h
        .orchestrator
        .handle_message(IncomingMessage::new("t1", "Send an email to alice@x.com."))
        .await
        .unwrap();
    assert!(result.response.contains("subject"));
    assert_eq!(result.turns, 1);
    assert_eq!(h.pool.len().await, 1);

    // Message 2: the reply binds `subject`; the agent now asks for `body`.
    let result = h
        .orchestrator
        .handle_message(IncomingMessage::new("t1", "Re: lunch"))
        .await
        .unwrap();
    assert!(result.response.contains("body"));
    assert_eq!(result.turns, 0); // answered directly, no planner call
    assert_eq!(h.pool.len().await, 1);

    // Message 3: the last field completes the agent and the loop resumes.
    let result = h
        .orchestrator
        .handle_message(IncomingMessage::new("t1", "See you at noon!"))
        .await
        .unwrap();
    assert_eq!(result.response, "Done, your email is on its way.");
    assert!(h.pool.is_empty().await);
}

// ─── S4: approval flow with cancel ────────────────────────────────────────────

#[tokio::test]
async fn s4_approval_cancel_resumes_with_error_tool_message() {
    let h = harness(
        vec![
            ScriptedProvider::call(
                "send_email",
                "call_email",
                json!({
                    "recipient": "alice@x.com",
                    "subject": "hi",
                    "body": "hello",
                }),
            ),
            ScriptedProvider::text("Understood, I won't send it."),
        ],
        true,
        ReactLoopConfig::default(),
    );

    // Message 1: complete args, agent parks for approval.
    let result = h
        .orchestrator
        .handle_message(IncomingMessage::new("t1", "Email alice saying hello."))
        .await
        .unwrap();
    assert_eq!(result.pending_approvals.len(), 1);
    assert_eq!(result.pending_approvals[0].agent_name, "send_email");
    assert_eq!(
        result.pending_approvals[0].options,
        vec!["approve", "edit", "cancel"]
    );
    assert_eq!(h.pool.len().await, 1);

    // Message 2: cancel. The planner sees an error tool message and
    // composes a reply.
    let result = h
        .orchestrator
        .handle_message(IncomingMessage::new("t1", "cancel"))
        .await
        .unwrap();
    assert_eq!(result.response, "Understood, I won't send it.");
    assert!(h.pool.is_empty().await);

    let history = h.memory.get_history("t1", "main", 50).await.unwrap();
    let cancelled = history
        .iter()
        .find(|m| m.role == Role::Tool && m.is_error)
        .expect("cancellation tool message");
    assert_eq!(cancelled.content, "User cancelled this action.");
}

#[tokio::test]
async fn s4b_approval_approve_executes_agent() {
    let h = harness(
        vec![
            ScriptedProvider::call(
                "send_email",
                "call_email",
                json!({"recipient": "alice@x.com", "subject": "hi", "body": "hello"}),
            ),
            ScriptedProvider::text("Sent! Anything else?"),
        ],
        true,
        ReactLoopConfig::default(),
    );

    h.orchestrator
        .handle_message(IncomingMessage::new("t1", "Email alice."))
        .await
        .unwrap();

    let result = h
        .orchestrator
        .handle_message(IncomingMessage::new("t1", "approve"))
        .await
        .unwrap();
    assert_eq!(result.response, "Sent! Anything else?");
    assert!(h.pool.is_empty().await);

    let history = h.memory.get_history("t1", "main", 50).await.unwrap();
    let agent_result = history
        .iter()
        .find(|m| m.role == Role::Tool && m.content.contains("sent to alice@x.com"))
        .expect("agent result tool message");
    assert!(!agent_result.is_error);
}

// ─── S5: context overflow recovery ────────────────────────────────────────────

#[tokio::test]
async fn s5_overflow_recovery_shortens_giant_history() {
    use concierge::ai::error::LlmError as Llm;

    /// Overflows while any single message exceeds 100 kB.
    struct SizeSensitive {
        inner: Arc<ScriptedProvider>,
    }

    #[async_trait]
    impl LlmProvider for SizeSensitive {
        async fn chat(&self, request: ChatRequest) -> LlmResult<ChatResponse> {
            if request.messages.iter().any(|m| m.content.len() > 100_000) {
                return Err(Llm::ContextOverflow("request too large".to_string()));
            }
            self.inner.chat(request).await
        }
        async fn stream(&self, request: ChatRequest) -> LlmResult<ChatStream> {
            self.inner.stream(request).await
        }
        fn provider_name(&self) -> &str {
            "size-sensitive"
        }
    }

    let scripted = ScriptedProvider::new(vec![ScriptedProvider::text("Recovered.")]);
    let provider = Arc::new(SizeSensitive {
        inner: scripted.clone(),
    });

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(WeatherTool));
    let agents = Arc::new(AgentRegistry::new());
    let pool = Arc::new(AgentPool::new(PoolConfig::default(), agents.clone()));
    let memory = Arc::new(InMemoryMemory::new());

    // A previous turn left a 500 kB tool result in the conversation.
    memory
        .save_history(
            "t1",
            "main",
            &[
                ChatMessage::user("fetch the logs"),
                ChatMessage::assistant_with_tool_calls(
                    "",
                    vec![ToolCall {
                        id: "call_big".to_string(),
                        name: "get_weather".to_string(),
                        arguments: json!({}),
                    }],
                ),
                ChatMessage::tool_result("call_big", "x".repeat(500_000), false),
            ],
        )
        .await
        .unwrap();

    let orchestrator = Arc::new(Orchestrator::new(
        provider,
        Arc::new(tools),
        agents,
        pool,
        memory.clone(),
        ReactLoopConfig {
            max_tool_result_chars: 10_000,
            ..Default::default()
        },
    ));

    let result = orchestrator
        .handle_message(IncomingMessage::new("t1", "summarize the logs"))
        .await
        .unwrap();

    assert_eq!(result.response, "Recovered.");
    assert_eq!(result.turns, 1);

    // The persisted turn shows the loop succeeded after shortening.
    let history = memory.get_history("t1", "main", 50).await.unwrap();
    assert!(history.iter().any(|m| m.content == "Recovered."));
}

// ─── S6: schema version mismatch on restart ───────────────────────────────────

#[tokio::test]
async fn s6_schema_mismatch_discards_restored_entry() {
    init_tracing();
    let store: Arc<dyn PoolStore> = Arc::new(MemoryPoolStore::new());

    // First process: agent parks awaiting input, entry is persisted.
    {
        let h = harness_with_store(
            vec![ScriptedProvider::call(
                "send_email",
                "call_email",
                json!({"recipient": "alice@x.com"}),
            )],
            false,
            ReactLoopConfig::default(),
            Some(store.clone()),
        );
        let result = h
            .orchestrator
            .handle_message(IncomingMessage::new("t1", "Send an email to alice."))
            .await
            .unwrap();
        assert!(result.response.contains("subject"));
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }

    // Second process: the agent type gained a field, so its schema version
    // changed; the restored entry is discarded.
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text("Fresh start.")]);
    let mut agents = AgentRegistry::new();
    agents.register(
        AgentDefinition::builder("send_email")
            .field(InputField::new("recipient", FieldType::String, "address"))
            .field(InputField::new("subject", FieldType::String, "subject"))
            .field(InputField::new("body", FieldType::String, "body"))
            .field(InputField::new("cc", FieldType::String, "cc list").optional())
            .run(|_, _| async { Ok("sent".to_string()) })
            .build()
            .unwrap(),
    );
    let agents = Arc::new(agents);
    let pool = Arc::new(
        AgentPool::new(PoolConfig::default(), agents.clone()).with_store(store.clone()),
    );
    assert_eq!(pool.restore().await.unwrap(), 0);

    let orchestrator = Arc::new(Orchestrator::new(
        provider.clone(),
        Arc::new(ToolRegistry::new()),
        agents,
        pool.clone(),
        Arc::new(InMemoryMemory::new()),
        ReactLoopConfig::default(),
    ));

    // No pending agent: the message enters a fresh loop.
    let result = orchestrator
        .handle_message(IncomingMessage::new("t1", "hello again"))
        .await
        .unwrap();
    assert_eq!(result.response, "Fresh start.");
    assert!(pool.is_empty().await);
}

// ─── Policy gate ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn rejected_message_never_reaches_the_model() {
    struct DenyAll;

    #[async_trait]
    impl MessagePolicy for DenyAll {
        async fn should_process(
            &self,
            _message: &IncomingMessage,
        ) -> concierge::agent::PolicyDecision {
            concierge::agent::PolicyDecision::Reject(
                "You've hit your daily message limit.".to_string(),
            )
        }
    }

    let provider = ScriptedProvider::new(vec![ScriptedProvider::text("never used")]);
    let agents = Arc::new(AgentRegistry::new());
    let pool = Arc::new(AgentPool::new(PoolConfig::default(), agents.clone()));
    let orchestrator = Arc::new(
        Orchestrator::new(
            provider.clone(),
            Arc::new(ToolRegistry::new()),
            agents,
            pool,
            Arc::new(InMemoryMemory::new()),
            ReactLoopConfig::default(),
        )
        .with_policy(Arc::new(DenyAll)),
    );

    let result = orchestrator
        .handle_message(IncomingMessage::new("t1", "hi"))
        .await
        .unwrap();
    assert_eq!(result.response, "You've hit your daily message limit.");
    assert_eq!(result.turns, 0);
    assert_eq!(provider.request_count(), 0);
}

// ─── Streaming ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_emits_ordered_events_with_terminal_done() {
    let h = harness(
        vec![
            ScriptedProvider::call("get_weather", "call_1", json!({"city": "Tokyo"})),
            ScriptedProvider::text("Tokyo is 18°C and clear."),
        ],
        false,
        ReactLoopConfig::default(),
    );

    let mut rx = h
        .orchestrator
        .stream_message(IncomingMessage::new("t1", "Weather in Tokyo?"));

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert_eq!(events.last(), Some(&AgentEvent::Done));

    let start_idx = events
        .iter()
        .position(|e| matches!(e, AgentEvent::ToolCallStart { .. }))
        .expect("tool call start");
    let end_idx = events
        .iter()
        .position(|e| matches!(e, AgentEvent::ToolCallEnd { tool_call_id, .. } if tool_call_id == "call_1"))
        .expect("tool call end");
    assert!(start_idx < end_idx);

    // MESSAGE_START precedes the first chunk, and the chunks rebuild the
    // final response.
    let msg_start = events
        .iter()
        .position(|e| matches!(e, AgentEvent::MessageStart))
        .expect("message start");
    let first_chunk = events
        .iter()
        .position(|e| matches!(e, AgentEvent::MessageChunk { .. }))
        .expect("message chunk");
    assert!(msg_start < first_chunk);

    let rebuilt: String = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::MessageChunk { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert!(rebuilt.contains("Tokyo is 18°C and clear."));
}

#[tokio::test]
async fn stream_emits_state_change_before_done_for_parked_agent() {
    let h = harness(
        vec![ScriptedProvider::call(
            "send_email",
            "call_email",
            json!({"recipient": "alice@x.com"}),
        )],
        false,
        ReactLoopConfig::default(),
    );

    let mut rx = h
        .orchestrator
        .stream_message(IncomingMessage::new("t1", "Send an email to alice."));

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let state_idx = events
        .iter()
        .position(|e| {
            matches!(
                e,
                AgentEvent::StateChange {
                    status: AgentStatus::WaitingForInput,
                    ..
                }
            )
        })
        .expect("state change for parked agent");
    let done_idx = events
        .iter()
        .position(|e| matches!(e, AgentEvent::Done))
        .expect("done event");
    assert!(state_idx < done_idx);

    // Field events surfaced for the seeded argument.
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::FieldCollected { field, .. } if field == "recipient")));
}

// ─── Triggers ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn trigger_message_tags_pending_approval_with_task() {
    let h = harness(
        vec![ScriptedProvider::call(
            "send_email",
            "call_email",
            json!({"recipient": "alice@x.com", "subject": "digest", "body": "daily digest"}),
        )],
        true,
        ReactLoopConfig::default(),
    );

    let message = IncomingMessage::from_trigger("t1", "Send the daily digest.", "task-7");
    let result = h.orchestrator.handle_message(message).await.unwrap();
    assert_eq!(result.pending_approvals.len(), 1);

    let pending = h.orchestrator.list_pending_approvals("t1").await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].source, "trigger");
    assert_eq!(pending[0].task_id.as_deref(), Some("task-7"));
}

// ─── Memory injection ─────────────────────────────────────────────────────────

#[tokio::test]
async fn recalled_facts_enter_the_system_prompt() {
    let h = harness(
        vec![ScriptedProvider::text("Of course — metric it is.")],
        false,
        ReactLoopConfig::default(),
    );
    h.memory.insert_fact("t1", "User prefers metric units").await;

    h.orchestrator
        .handle_message(IncomingMessage::new("t1", "what units do I use in metric?"))
        .await
        .unwrap();

    let request = h.provider.requests.lock().unwrap()[0].clone();
    let system = &request.messages[0];
    assert_eq!(system.role, Role::System);
    assert!(system.content.contains("User prefers metric units"));
}
