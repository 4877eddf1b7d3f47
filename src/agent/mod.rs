//! The reasoning loop, approvals, streaming events and the per-message
//! orchestrator.

pub mod approval;
pub mod events;
pub mod loop_;
pub mod orchestrator;

pub use approval::{ApprovalCoordinator, ApprovalDecision, ApprovalRequest};
pub use events::{AgentEvent, EventSink};
pub use loop_::{ReactLoop, ReactLoopResult, ResultStatus, ToolCallRecord};
pub use orchestrator::{
    AllowAllPolicy, IncomingMessage, MessagePolicy, Orchestrator, PolicyDecision,
};
