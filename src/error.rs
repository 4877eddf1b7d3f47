//! Top-level error taxonomy.

use thiserror::Error;

use crate::ai::error::LlmError;

/// Failures that surface from message handling.
///
/// Tool failures never appear here — they are folded into tool messages and
/// delegated back to the planner.  Recoverable provider errors are retried
/// or degraded inside the loop; what remains is genuinely terminal.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Unrecoverable provider failure (auth, fatal, or retries exhausted).
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// The message task was cancelled cooperatively.
    #[error("message handling cancelled")]
    Cancelled,

    /// The memory collaborator failed while assembling context.
    #[error("memory provider error: {0}")]
    Memory(String),
}
