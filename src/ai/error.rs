//! Provider error taxonomy.
//!
//! Provider-specific status codes and messages are mapped into these six
//! kinds at the client boundary; everything above the provider trait works
//! exclusively in terms of this classification.

use thiserror::Error;

/// Classified failure of an LLM provider call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    /// The provider throttled the request.  Retried with exponential backoff.
    #[error("rate limited by provider: {0}")]
    RateLimit(String),

    /// Messages plus tools exceed the model's context window.  Recovered by
    /// the trimming chain, never retried blindly.
    #[error("context window exceeded: {0}")]
    ContextOverflow(String),

    /// Invalid or missing credentials.  Never retried.
    #[error("provider authentication failed: {0}")]
    Auth(String),

    /// The request timed out.  Retried once.
    #[error("provider request timed out: {0}")]
    Timeout(String),

    /// A transient failure (connection reset, 5xx).  Retried.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Anything unrecoverable.  Never retried.
    #[error("fatal provider error: {0}")]
    Fatal(String),
}

impl LlmError {
    /// How many retry attempts this error kind allows, given the configured
    /// maximum.  Zero means surface immediately.
    pub fn retry_budget(&self, llm_max_retries: u32) -> u32 {
        match self {
            LlmError::RateLimit(_) | LlmError::Transient(_) => llm_max_retries,
            LlmError::Timeout(_) => 1,
            LlmError::ContextOverflow(_) | LlmError::Auth(_) | LlmError::Fatal(_) => 0,
        }
    }

    /// Whether backoff applies between retries of this kind.
    pub fn wants_backoff(&self) -> bool {
        matches!(self, LlmError::RateLimit(_) | LlmError::Transient(_))
    }
}
