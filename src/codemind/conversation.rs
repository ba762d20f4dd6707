//! Append-only conversation log and cumulative session statistics.
//!
//! A [`Conversation`] always starts with exactly one system message and keeps
//! it at index 0 for its entire life. The agent loop appends user, assistant,
//! and tool messages during a turn; compaction replaces everything after the
//! system message with a model-written summary via
//! [`Conversation::replace_tail`].
//!
//! [`Stats`] carries the monotone counters the middleware pipeline reads:
//! steps, token totals, accrued cost, and tool-call outcome counts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codemind::config::ModelPricing;
use crate::codemind::message::{estimate_message_tokens, Message, Role, Usage};

/// The ordered message log for one session.
///
/// Owned exclusively by the [`SessionSupervisor`](crate::session::SessionSupervisor);
/// the agent loop mutates it only between awaits while a turn is executing,
/// and middlewares receive read-only snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    /// Create a conversation containing only the given system message.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    /// Rebuild from persisted messages.
    ///
    /// The first message must be the system message; anything else indicates
    /// a corrupted session file and is rejected.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self, String> {
        match messages.first() {
            Some(first) if first.role == Role::System => Ok(Self { messages }),
            Some(first) => Err(format!(
                "conversation must start with a system message, found {:?}",
                first.role
            )),
            None => Err("conversation must not be empty".to_string()),
        }
    }

    /// Append one message to the log.
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Replace every message after the system message.
    ///
    /// Used by compaction (`tail = [assistant(summary)]`) and by `clear`
    /// (`tail = []`). The system message itself is untouched.
    pub fn replace_tail(&mut self, tail: Vec<Message>) {
        self.messages.truncate(1);
        self.messages.extend(tail);
    }

    /// Swap the system message in place, preserving the rest of the log.
    ///
    /// Used by `reload` when the configuration snapshot changes.
    pub fn set_system_message(&mut self, system_prompt: impl Into<String>) {
        self.messages[0] = Message::system(system_prompt);
    }

    /// Iterate over the messages in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Read-only view of the full log.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages, system message included.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when only the system message is present.
    pub fn is_empty(&self) -> bool {
        self.messages.len() <= 1
    }

    /// The most recently appended message.
    pub fn last(&self) -> &Message {
        self.messages.last().expect("conversation is never empty")
    }

    /// Mutable access to the most recent message.
    pub fn last_mut(&mut self) -> &mut Message {
        self.messages.last_mut().expect("conversation is never empty")
    }

    /// Mutable access to the most recent user message, if any.
    ///
    /// The agent loop uses this to apply middleware-injected text before a
    /// completion call.
    pub fn last_user_mut(&mut self) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .rev()
            .find(|m| m.role == Role::User)
    }

    /// Estimated token footprint of the whole log.
    ///
    /// Monotonic in message count and content length; drives the
    /// context-warning and auto-compaction middlewares.
    pub fn estimated_tokens(&self) -> u64 {
        self.messages.iter().map(estimate_message_tokens).sum()
    }
}

/// Cumulative counters for one session.
///
/// Every field is non-decreasing for the lifetime of the session; compaction
/// and mode switches never reset them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    /// Completed user turns.
    pub turns: u64,
    /// LLM completion calls (a turn contains at least one step).
    pub steps: u64,
    /// Prompt tokens across all steps.
    pub session_prompt_tokens: u64,
    /// Completion tokens across all steps.
    pub session_completion_tokens: u64,
    /// Accrued cost in the pricing currency (USD for the built-in tables).
    pub session_cost: f64,
    /// Tool calls that completed successfully.
    pub tool_calls_succeeded: u64,
    /// Tool calls that returned an error (validation or execution).
    pub tool_calls_failed: u64,
    /// Tool calls skipped by policy or by the user.
    pub tool_calls_skipped: u64,
    /// Wall-clock duration of the most recent turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_turn_duration: Option<Duration>,
}

impl Stats {
    /// Record one completion step's usage and its cost under `pricing`.
    pub fn record_step(&mut self, usage: Usage, pricing: &ModelPricing) {
        self.steps += 1;
        self.session_prompt_tokens += usage.prompt_tokens;
        self.session_completion_tokens += usage.completion_tokens;
        self.session_cost += usage.prompt_tokens as f64 * pricing.input_per_mtok / 1e6
            + usage.completion_tokens as f64 * pricing.output_per_mtok / 1e6;
    }

    /// Record the outcome of one dispatched tool call.
    pub fn record_tool_outcome(&mut self, succeeded: bool, skipped: bool) {
        if skipped {
            self.tool_calls_skipped += 1;
        } else if succeeded {
            self.tool_calls_succeeded += 1;
        } else {
            self.tool_calls_failed += 1;
        }
    }

    /// Close out a turn.
    pub fn record_turn(&mut self, duration: Duration) {
        self.turns += 1;
        self.last_turn_duration = Some(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codemind::message::ToolCall;

    fn pricing() -> ModelPricing {
        ModelPricing {
            input_per_mtok: 2.0,
            output_per_mtok: 10.0,
        }
    }

    #[test]
    fn starts_with_system_message() {
        let conv = Conversation::new("you are a coding assistant");
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.messages()[0].role, Role::System);
    }

    #[test]
    fn replace_tail_keeps_system_message() {
        let mut conv = Conversation::new("sys");
        conv.append(Message::user("hello"));
        conv.append(Message::assistant("hi"));
        conv.replace_tail(vec![Message::assistant("summary of the above")]);

        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages()[0].role, Role::System);
        assert_eq!(conv.messages()[1].content_str(), "summary of the above");
    }

    #[test]
    fn from_messages_rejects_missing_system() {
        let err = Conversation::from_messages(vec![Message::user("hi")]).unwrap_err();
        assert!(err.contains("system"));
        assert!(Conversation::from_messages(vec![]).is_err());
    }

    #[test]
    fn estimated_tokens_grows_with_appends() {
        let mut conv = Conversation::new("sys");
        let before = conv.estimated_tokens();
        conv.append(Message::user("a fairly long user message about the build"));
        assert!(conv.estimated_tokens() > before);

        let with_text = conv.estimated_tokens();
        conv.append(Message::assistant_with_tool_calls(
            None,
            vec![ToolCall {
                id: "t1".into(),
                name: "grep".into(),
                arguments: r#"{"pattern":"fn main"}"#.into(),
            }],
        ));
        assert!(conv.estimated_tokens() > with_text);
    }

    #[test]
    fn stats_accumulate_monotonically() {
        let mut stats = Stats::default();
        stats.record_step(
            Usage {
                prompt_tokens: 1_000_000,
                completion_tokens: 500_000,
            },
            &pricing(),
        );
        assert_eq!(stats.steps, 1);
        assert_eq!(stats.session_prompt_tokens, 1_000_000);
        // 1M input at $2/M + 0.5M output at $10/M
        assert!((stats.session_cost - 7.0).abs() < 1e-9);

        let cost_after_first = stats.session_cost;
        stats.record_step(
            Usage {
                prompt_tokens: 10,
                completion_tokens: 3,
            },
            &pricing(),
        );
        assert!(stats.session_cost > cost_after_first);
        assert_eq!(stats.steps, 2);
    }

    #[test]
    fn tool_outcomes_bucket_correctly() {
        let mut stats = Stats::default();
        stats.record_tool_outcome(true, false);
        stats.record_tool_outcome(false, false);
        stats.record_tool_outcome(false, true);
        assert_eq!(stats.tool_calls_succeeded, 1);
        assert_eq!(stats.tool_calls_failed, 1);
        assert_eq!(stats.tool_calls_skipped, 1);
    }
}
