//! Context-window management for LLM requests.
//!
//! Three defenses, applied in order of increasing severity:
//!
//! 1. per-result truncation at tool-result append time
//! 2. preemptive history trim before each LLM call
//! 3. force-trim during overflow recovery
//!
//! Token counting is approximate (4 characters per token over serialized
//! content); the trim threshold leaves enough headroom that the estimate
//! never needs to be exact.
//!
//! Every trim preserves the pairing invariant: an assistant turn's
//! `tool_calls` and the tool messages answering them are kept or dropped
//! together, never split.

use std::collections::HashSet;

use crate::ai::types::{ChatMessage, Role};
use crate::config::ReactLoopConfig;

/// Marker appended to every shortened tool result.
const TRUNCATION_MARKER: &str = "\n[...truncated]";

/// Non-system messages retained by a force-trim.
const FORCE_TRIM_KEEP: usize = 5;

/// Manages token accounting and history trimming for a message list.
///
/// Operates on per-request message lists only — no shared state.
#[derive(Debug, Clone)]
pub struct ContextManager {
    config: ReactLoopConfig,
}

impl ContextManager {
    pub fn new(config: ReactLoopConfig) -> Self {
        Self { config }
    }

    // ── Token accounting ──────────────────────────────────────────────────────

    /// Approximate token count of a text: ~4 characters per token.
    pub fn estimate_tokens(text: &str) -> usize {
        text.len().div_ceil(4)
    }

    /// Approximate token count of a message list, including serialized
    /// tool-call arguments and a small per-message overhead.
    pub fn estimate_message_tokens(messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .map(|m| {
                let call_chars: usize = m
                    .tool_calls
                    .iter()
                    .map(|c| c.name.len() + c.arguments.to_string().len())
                    .sum();
                Self::estimate_tokens(&m.content) + call_chars.div_ceil(4) + 4
            })
            .sum()
    }

    // ── Defense 1: per-result truncation ──────────────────────────────────────

    /// Character cap for a single tool result.
    pub fn max_result_chars(&self) -> usize {
        let share_cap = (self.config.context_token_limit as f64
            * self.config.max_tool_result_share
            * 4.0) as usize;
        share_cap.min(self.config.max_tool_result_chars)
    }

    /// Shorten an oversized tool result, preferring a newline boundary in the
    /// second half of the cut so that truncation lands between lines when it
    /// reasonably can.
    pub fn truncate_tool_result(&self, result: &str) -> String {
        let max_chars = self.max_result_chars();
        if result.len() <= max_chars {
            return result.to_string();
        }

        let mut cut = max_chars;
        while cut > 0 && !result.is_char_boundary(cut) {
            cut -= 1;
        }

        let mut half = cut / 2;
        while half > 0 && !result.is_char_boundary(half) {
            half -= 1;
        }
        if let Some(newline) = result[half..cut].rfind('\n') {
            cut = half + newline;
        }

        let mut out = result[..cut].to_string();
        out.push_str(TRUNCATION_MARKER);
        out
    }

    /// Rewrite every tool message in place using the per-result cap.
    /// Returns `true` if anything was shortened.
    pub fn truncate_all_tool_results(&self, messages: &mut [ChatMessage]) -> bool {
        let mut changed = false;
        for msg in messages.iter_mut().filter(|m| m.role == Role::Tool) {
            if msg.content.len() > self.max_result_chars() {
                msg.content = self.truncate_tool_result(&msg.content);
                changed = true;
            }
        }
        changed
    }

    // ── Defenses 2 and 3: history trims ───────────────────────────────────────

    /// Preemptive trim before an LLM call.  Returns `true` if messages were
    /// dropped.
    pub fn trim_if_needed(&self, messages: &mut Vec<ChatMessage>) -> bool {
        let threshold = (self.config.context_token_limit as f64
            * self.config.context_trim_threshold) as usize;
        if Self::estimate_message_tokens(messages) <= threshold {
            return false;
        }
        self.keep_recent(messages, self.config.max_history_messages)
    }

    /// Last-resort trim during overflow recovery: system messages plus the
    /// five most recent non-system messages.
    pub fn force_trim(&self, messages: &mut Vec<ChatMessage>) -> bool {
        self.keep_recent(messages, FORCE_TRIM_KEEP)
    }

    /// Keep all system messages plus the last `keep` non-system messages,
    /// then repair the pairing invariant at the cut.
    fn keep_recent(&self, messages: &mut Vec<ChatMessage>, keep: usize) -> bool {
        let before = messages.len();
        let non_system = messages.iter().filter(|m| m.role != Role::System).count();
        let drop_count = non_system.saturating_sub(keep);

        let mut dropped = 0;
        let mut kept: Vec<ChatMessage> = Vec::with_capacity(messages.len());
        for msg in messages.drain(..) {
            if msg.role != Role::System && dropped < drop_count {
                dropped += 1;
                continue;
            }
            kept.push(msg);
        }
        repair_pairing(&mut kept);
        *messages = kept;
        messages.len() != before
    }
}

/// Drop messages that would violate the pairing invariant: tool messages
/// whose assistant turn was cut, and assistant turns whose tool calls are not
/// all answered by the tool messages that follow them.
pub fn repair_pairing(messages: &mut Vec<ChatMessage>) {
    // Pass 1: orphaned tool messages.
    let mut pending: HashSet<String> = HashSet::new();
    let mut kept: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for msg in messages.drain(..) {
        match msg.role {
            Role::Assistant => {
                pending = msg.tool_calls.iter().map(|c| c.id.clone()).collect();
                kept.push(msg);
            }
            Role::Tool => {
                let id = msg.tool_call_id.clone().unwrap_or_default();
                if pending.remove(&id) {
                    kept.push(msg);
                }
            }
            Role::User => {
                pending.clear();
                kept.push(msg);
            }
            Role::System => kept.push(msg),
        }
    }

    // Pass 2: assistant turns with unsatisfied tool calls (and their partial
    // results) are removed as a unit.
    let mut result: Vec<ChatMessage> = Vec::with_capacity(kept.len());
    let mut i = 0;
    while i < kept.len() {
        let msg = &kept[i];
        if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
            let ids: HashSet<&str> = msg.tool_calls.iter().map(|c| c.id.as_str()).collect();
            let mut j = i + 1;
            let mut answered = 0;
            while j < kept.len() && kept[j].role == Role::Tool {
                if kept[j]
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| ids.contains(id))
                {
                    answered += 1;
                }
                j += 1;
            }
            if answered == ids.len() {
                result.extend(kept[i..j].iter().cloned());
            }
            i = j;
        } else {
            result.push(kept[i].clone());
            i += 1;
        }
    }
    *messages = result;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::ToolCall;
    use serde_json::json;

    fn manager(limit: usize) -> ContextManager {
        ContextManager::new(ReactLoopConfig {
            context_token_limit: limit,
            ..Default::default()
        })
    }

    fn turn(id: &str, result: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![ToolCall {
                    id: id.to_string(),
                    name: "t".to_string(),
                    arguments: json!({}),
                }],
            ),
            ChatMessage::tool_result(id, result, false),
        ]
    }

    #[test]
    fn estimate_is_quarter_of_chars() {
        assert_eq!(ContextManager::estimate_tokens("abcd"), 1);
        assert_eq!(ContextManager::estimate_tokens("abcde"), 2);
    }

    #[test]
    fn short_result_unchanged() {
        let cm = manager(128_000);
        assert_eq!(cm.truncate_tool_result("short"), "short");
    }

    #[test]
    fn long_result_cut_with_marker() {
        let cm = ContextManager::new(ReactLoopConfig {
            max_tool_result_chars: 100,
            ..Default::default()
        });
        let long = "x".repeat(500);
        let out = cm.truncate_tool_result(&long);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert!(out.len() <= 100 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn truncation_prefers_newline_in_second_half() {
        let cm = ContextManager::new(ReactLoopConfig {
            max_tool_result_chars: 100,
            ..Default::default()
        });
        // Newline at position 80 — inside the second half of the cut.
        let mut text = "a".repeat(80);
        text.push('\n');
        text.push_str(&"b".repeat(200));
        let out = cm.truncate_tool_result(&text);
        assert_eq!(&out[..80], &"a".repeat(80));
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert!(!out.trim_end_matches(TRUNCATION_MARKER).contains('b'));
    }

    #[test]
    fn truncation_ignores_newline_in_first_half() {
        let cm = ContextManager::new(ReactLoopConfig {
            max_tool_result_chars: 100,
            ..Default::default()
        });
        let mut text = "a".repeat(10);
        text.push('\n');
        text.push_str(&"b".repeat(300));
        let out = cm.truncate_tool_result(&text);
        // The cut stays at the cap, not back at position 10.
        assert!(out.len() > 50);
    }

    #[test]
    fn result_cap_is_min_of_share_and_absolute() {
        let cm = ContextManager::new(ReactLoopConfig {
            context_token_limit: 1_000,
            max_tool_result_share: 0.3,
            max_tool_result_chars: 400_000,
            ..Default::default()
        });
        // 1000 × 0.3 × 4 = 1200 < 400000
        assert_eq!(cm.max_result_chars(), 1200);
    }

    #[test]
    fn trim_noop_under_threshold() {
        let cm = manager(128_000);
        let mut messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        assert!(!cm.trim_if_needed(&mut messages));
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn trim_keeps_system_and_recent_tail() {
        let cm = ContextManager::new(ReactLoopConfig {
            context_token_limit: 100,
            context_trim_threshold: 0.8,
            max_history_messages: 4,
            ..Default::default()
        });
        let mut messages = vec![ChatMessage::system("persona")];
        for i in 0..20 {
            messages.push(ChatMessage::user(format!("message number {i} with padding")));
        }
        assert!(cm.trim_if_needed(&mut messages));
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages.len(), 5);
        assert!(messages[4].content.contains("19"));
    }

    #[test]
    fn trim_drops_orphaned_tool_messages_at_cut() {
        let cm = ContextManager::new(ReactLoopConfig {
            context_token_limit: 10,
            context_trim_threshold: 0.1,
            max_history_messages: 2,
            ..Default::default()
        });
        let mut messages = vec![ChatMessage::system("sys"), ChatMessage::user("do it")];
        messages.extend(turn("call_a", "result a"));
        messages.push(ChatMessage::user("and again"));
        // Tail of 2 non-system messages would start with the tool message of
        // call_a; the repair must drop it rather than leave an orphan.
        assert!(cm.trim_if_needed(&mut messages));
        assert!(messages.iter().all(|m| m.role != Role::Tool));
        assert!(
            messages
                .iter()
                .all(|m| m.role != Role::Assistant || m.tool_calls.is_empty())
        );
    }

    #[test]
    fn force_trim_drops_unsatisfied_assistant_turn() {
        let cm = manager(128_000);
        let mut messages = vec![ChatMessage::system("sys"), ChatMessage::user("go")];
        // Assistant turn whose tool call was never answered.
        messages.push(ChatMessage::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                id: "call_x".to_string(),
                name: "slow".to_string(),
                arguments: json!({}),
            }],
        ));
        cm.force_trim(&mut messages);
        assert!(
            messages
                .iter()
                .all(|m| m.role != Role::Assistant || m.tool_calls.is_empty())
        );
    }

    #[test]
    fn force_trim_keeps_paired_turns_whole() {
        let cm = manager(128_000);
        let mut messages = vec![ChatMessage::system("sys")];
        for i in 0..6 {
            messages.push(ChatMessage::user(format!("u{i}")));
        }
        messages.extend(turn("call_b", "result b"));
        cm.force_trim(&mut messages);
        // The complete pair survives when it falls inside the kept tail.
        let has_assistant = messages
            .iter()
            .any(|m| m.role == Role::Assistant && !m.tool_calls.is_empty());
        let has_tool = messages.iter().any(|m| m.role == Role::Tool);
        assert_eq!(has_assistant, has_tool);
        let non_system = messages.iter().filter(|m| m.role != Role::System).count();
        assert!(non_system <= 5);
    }

    #[test]
    fn truncate_all_rewrites_only_oversized_tool_messages() {
        let cm = ContextManager::new(ReactLoopConfig {
            max_tool_result_chars: 50,
            ..Default::default()
        });
        let mut messages = vec![
            ChatMessage::user("u".repeat(500)),
            ChatMessage::tool_result("call_1", "tiny", false),
            ChatMessage::tool_result("call_2", "g".repeat(500), false),
        ];
        assert!(cm.truncate_all_tool_results(&mut messages));
        assert_eq!(messages[0].content.len(), 500);
        assert_eq!(messages[1].content, "tiny");
        assert!(messages[2].content.ends_with(TRUNCATION_MARKER));
        assert!(messages[2].content.len() <= 50 + TRUNCATION_MARKER.len());
    }
}
