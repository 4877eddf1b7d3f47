use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::events::EventSink;
use crate::services::credential_store::CredentialStore;

/// The result of executing a [`Tool`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Human-readable output handed back to the model.
    pub output: String,
    /// Whether the tool considered the execution successful.
    pub success: bool,
    /// Optional structured metadata for machine consumption.
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            metadata: None,
        }
    }

    pub fn err(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: false,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ─── ToolExecutionContext ─────────────────────────────────────────────────────

/// Per-invocation context handed to every tool and agent execution.
#[derive(Clone)]
pub struct ToolExecutionContext {
    /// Tenant on whose behalf the tool runs.
    pub tenant_id: String,
    /// Handle to the credential backend, when one is configured.
    pub credentials: Option<Arc<dyn CredentialStore>>,
    /// Arbitrary request metadata (message source, trigger task id, ...).
    pub metadata: Value,
    /// Event sink of the streaming path, when the message is streamed.
    pub events: Option<EventSink>,
}

impl ToolExecutionContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            credentials: None,
            metadata: Value::Null,
            events: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }
}

// ─── Tool trait ───────────────────────────────────────────────────────────────

/// A capability the reasoning loop can invoke.
///
/// Implementations must be `Send + Sync` so they can be held in a shared
/// `Arc<dyn Tool>` registry.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable machine identifier (snake_case), e.g. `"get_weather"`.
    fn name(&self) -> &str;

    /// Human-readable description used in LLM tool payloads.
    fn description(&self) -> &str;

    /// JSON Schema object describing the tool's accepted parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, args: Value, ctx: &ToolExecutionContext)
        -> Result<ToolResult, String>;
}
