//! Tenant-aware conversational agent orchestrator.
//!
//! Drives a Reason-Act loop over an LLM function-calling interface:
//! a user message arrives, the planner invokes tools (including stateful
//! agents exposed as tools), and a natural-language response comes back.
//! Agents that stop for input or approval park in a per-tenant pool and
//! resume on the next message, surviving process restarts behind a
//! schema-version guard.

pub mod agent;
pub mod agents;
pub mod ai;
pub mod config;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod services;
pub mod tools;
pub mod triggers;

/// Convenience re-exports for the most commonly used traits and types.
///
/// ```rust
/// use concierge::prelude::*;
/// ```
pub mod prelude {
    // AI provider contract
    pub use crate::ai::provider::LlmProvider;
    pub use crate::ai::types::{ChatMessage, ChatRequest, ChatResponse, Role, TokenUsage, ToolCall, ToolInfo};
    pub use crate::ai::{ContextManager, LlmError};

    // Tool system
    pub use crate::tools::{Tool, ToolExecutionContext, ToolInvoker, ToolOutcome, ToolRegistry, ToolResult};

    // Agents
    pub use crate::agents::{
        AgentBuilder, AgentDefinition, AgentPool, AgentRegistry, AgentResult, AgentSession,
        AgentStatus, FieldType, InputField, PoolStore, SqlitePoolStore,
    };

    // Loop and orchestrator
    pub use crate::agent::{
        AgentEvent, ApprovalRequest, IncomingMessage, MessagePolicy, Orchestrator, ReactLoop,
        ReactLoopResult, ToolCallRecord,
    };

    // Collaborator contracts
    pub use crate::memory::{Fact, MemoryProvider};
    pub use crate::services::{CredentialBag, CredentialStore};
    pub use crate::triggers::TriggerEngine;

    // Configuration
    pub use crate::config::{PoolConfig, ReactLoopConfig};

    // Errors
    pub use crate::error::OrchestratorError;
}
