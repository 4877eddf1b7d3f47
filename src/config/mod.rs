//! Runtime configuration for the orchestrator.
//!
//! All fields have `#[serde(default)]` so a partially-filled config source
//! works correctly.  Missing sections fall back to their `Default` impl.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── ReactLoopConfig ──────────────────────────────────────────────────────────

/// Tuning knobs for the reasoning loop, context management and retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReactLoopConfig {
    /// Maximum number of tool-call → response turns before the loop forces a
    /// final text answer.
    pub max_turns: usize,
    /// Timeout in seconds for a single plain tool execution.
    pub tool_execution_timeout_secs: u64,
    /// Timeout in seconds for a single agent-tool execution.
    pub agent_tool_execution_timeout_secs: u64,
    /// Maximum share of the context window a single tool result may occupy.
    pub max_tool_result_share: f64,
    /// Absolute cap on a single tool result, in characters.
    pub max_tool_result_chars: usize,
    /// Context window size of the target model, in tokens.
    pub context_token_limit: usize,
    /// Fraction of the context window at which preemptive trimming kicks in.
    pub context_trim_threshold: f64,
    /// Number of non-system messages retained by a preemptive trim.
    pub max_history_messages: usize,
    /// Maximum retry attempts for retryable LLM errors.
    pub llm_max_retries: u32,
    /// Base delay for exponential backoff between LLM retries, in milliseconds.
    pub llm_retry_base_delay_ms: u64,
    /// Minutes before an unanswered approval request expires.
    pub approval_timeout_minutes: i64,
}

impl Default for ReactLoopConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            tool_execution_timeout_secs: 30,
            agent_tool_execution_timeout_secs: 120,
            max_tool_result_share: 0.3,
            max_tool_result_chars: 400_000,
            context_token_limit: 128_000,
            context_trim_threshold: 0.8,
            max_history_messages: 40,
            llm_max_retries: 2,
            llm_retry_base_delay_ms: 1_000,
            approval_timeout_minutes: 30,
        }
    }
}

impl ReactLoopConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_execution_timeout_secs)
    }

    pub fn agent_tool_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_tool_execution_timeout_secs)
    }

    pub fn llm_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.llm_retry_base_delay_ms)
    }
}

// ─── PoolConfig ───────────────────────────────────────────────────────────────

/// Configuration for the per-tenant agent pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum live entries per tenant; overflow evicts the oldest.
    pub max_agents_per_tenant: usize,
    /// Seconds a parked agent may live before the pool expires it.
    pub entry_ttl_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_agents_per_tenant: 8,
            entry_ttl_secs: 3_600,
        }
    }
}

impl PoolConfig {
    pub fn entry_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.entry_ttl_secs as i64)
    }

    /// Sweep period for the background expiry task: a quarter of the TTL,
    /// never below one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs((self.entry_ttl_secs / 4).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn react_loop_defaults() {
        let cfg = ReactLoopConfig::default();
        assert_eq!(cfg.max_turns, 10);
        assert_eq!(cfg.tool_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.agent_tool_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.context_token_limit, 128_000);
        assert_eq!(cfg.llm_max_retries, 2);
    }

    #[test]
    fn pool_sweep_is_quarter_ttl() {
        let cfg = PoolConfig {
            entry_ttl_secs: 3_600,
            ..Default::default()
        };
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(900));

        let tiny = PoolConfig {
            entry_ttl_secs: 2,
            ..Default::default()
        };
        assert_eq!(tiny.sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let cfg: ReactLoopConfig = serde_json::from_str(r#"{"max_turns": 3}"#).unwrap();
        assert_eq!(cfg.max_turns, 3);
        assert_eq!(cfg.max_history_messages, 40);
    }
}
