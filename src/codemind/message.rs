//! Neutral chat data model shared by every component of the runtime.
//!
//! All provider wire formats are translated into these types at the adapter
//! boundary (see [`crate::adapters`]); everything upstream of the adapters,
//! from the conversation store to the agent loop and session persistence,
//! only ever sees [`Message`], [`ToolCall`], and [`Usage`].
//!
//! # Message invariants
//!
//! - `tool_call_id` is set if and only if `role == Role::Tool`.
//! - `tool_calls` is non-empty only on assistant messages.
//! - Every tool message references a call id announced by an earlier
//!   assistant message.
//! - Multi-part provider content is normalized to a single string before a
//!   message is stored.
//!
//! The first two are enforced by the constructors below; the third is upheld
//! by the agent loop, which appends exactly one tool message per announced
//! call before requesting the next completion.
//!
//! # Example
//!
//! ```rust
//! use codemind::message::{Message, Role, ToolCall};
//!
//! let call = ToolCall {
//!     id: "call_1".to_string(),
//!     name: "grep".to_string(),
//!     arguments: r#"{"pattern":"TODO"}"#.to_string(),
//! };
//! let assistant = Message::assistant_with_tool_calls(None, vec![call]);
//! let result = Message::tool("call_1", "grep", "src/a.rs:14: TODO");
//!
//! assert_eq!(assistant.role, Role::Assistant);
//! assert_eq!(result.tool_call_id.as_deref(), Some("call_1"));
//! ```

use serde::{Deserialize, Serialize};

/// The author of a [`Message`].
///
/// Serialized lowercase to match the chat-completions wire convention
/// (`"system"`, `"user"`, `"assistant"`, `"tool"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Primes or constrains assistant behaviour. Always at index 0 of a
    /// conversation and never removed except by `clear`.
    System,
    /// A human request (or an injected observation addressed to the model).
    User,
    /// A model response; the only role that may carry `tool_calls`.
    Assistant,
    /// The result of executing one tool call, correlated via `tool_call_id`.
    Tool,
}

/// One tool invocation requested by the model inside an assistant message.
///
/// `arguments` is kept as the raw JSON text exactly as the provider streamed
/// it: providers emit arguments in string fragments, and the accumulated
/// string is only decoded at execution time by the tool host, so a malformed
/// payload surfaces as a validation outcome rather than a parse panic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned id, unique within the turn (e.g. `"call_abc123"`).
    pub id: String,
    /// Tool name matching a definition exported to the model.
    pub name: String,
    /// Raw JSON arguments text.
    pub arguments: String,
}

/// A single entry in a conversation.
///
/// Cheap to clone and (de)serializable so conversations can be snapshotted
/// for middlewares and persisted verbatim in session files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Author role.
    pub role: Role,
    /// Normalized text content. `None` on assistant messages that carry only
    /// tool calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reasoning side-channel content, when the provider exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Tool invocations requested by the assistant. Empty for other roles.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For `Role::Tool`: the id of the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For `Role::Tool`: the name of the tool that produced the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl Message {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    /// Build a plain assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    /// Build an assistant message that requests tool calls.
    pub fn assistant_with_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            reasoning: None,
            tool_calls,
            tool_call_id: None,
            tool_name: None,
        }
    }

    /// Build the tool-result message answering one [`ToolCall`].
    pub fn tool(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            tool_name: Some(tool_name.into()),
        }
    }

    /// Append text to the message content, creating it if absent.
    ///
    /// Used by middleware injection (the combined inject text is applied
    /// atomically to the last user message) and by stream accumulation.
    pub fn append_content(&mut self, text: &str) {
        match &mut self.content {
            Some(existing) => existing.push_str(text),
            None => self.content = Some(text.to_string()),
        }
    }

    /// The content as a `&str`, empty when absent.
    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Token accounting for one completion call, as reported by the provider.
///
/// Missing fields in a provider response default to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Input tokens billed for the request.
    pub prompt_tokens: u64,
    /// Output tokens generated by the model.
    pub completion_tokens: u64,
}

impl Usage {
    /// Sum of prompt and completion tokens.
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Accumulate another usage report into this one.
    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Estimate the token footprint of a string.
///
/// One token per four bytes, minimum one. Deliberately byte-based so the
/// estimate is monotonic in content length; used for context warnings and
/// compaction thresholds, never for billing.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.len() as u64) / 4).max(1)
}

/// Estimate the token footprint of a message, including a small constant for
/// the role/framing overhead and any tool-call payloads.
pub fn estimate_message_tokens(message: &Message) -> u64 {
    let mut tokens = 4; // role + framing overhead
    if let Some(content) = &message.content {
        tokens += estimate_tokens(content);
    }
    if let Some(reasoning) = &message.reasoning {
        tokens += estimate_tokens(reasoning);
    }
    for call in &message.tool_calls {
        tokens += estimate_tokens(&call.name) + estimate_tokens(&call.arguments);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_uphold_role_invariants() {
        let sys = Message::system("be brief");
        assert_eq!(sys.role, Role::System);
        assert!(sys.tool_calls.is_empty());
        assert!(sys.tool_call_id.is_none());

        let tool = Message::tool("t1", "grep", "no matches");
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("t1"));
        assert_eq!(tool.tool_name.as_deref(), Some("grep"));
    }

    #[test]
    fn serde_round_trip_preserves_equality() {
        let original = Message::assistant_with_tool_calls(
            Some("checking".to_string()),
            vec![ToolCall {
                id: "t1".to_string(),
                name: "grep".to_string(),
                arguments: r#"{"pattern":"TODO"}"#.to_string(),
            }],
        );
        let json = serde_json::to_string(&original).unwrap();
        let restored: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn serde_round_trip_tool_message() {
        let original = Message::tool("call_9", "read_file", "fn main() {}");
        let json = serde_json::to_string(&original).unwrap();
        let restored: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn roles_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
    }

    #[test]
    fn token_estimate_is_monotonic() {
        let mut last = 0;
        for len in [0usize, 1, 4, 16, 256, 4096] {
            let estimate = estimate_tokens(&"x".repeat(len));
            assert!(estimate >= last);
            last = estimate;
        }
    }

    #[test]
    fn message_estimate_counts_tool_calls() {
        let plain = Message::assistant("hi");
        let with_call = Message::assistant_with_tool_calls(
            Some("hi".to_string()),
            vec![ToolCall {
                id: "t1".to_string(),
                name: "bash".to_string(),
                arguments: r#"{"command":"ls -la /tmp"}"#.to_string(),
            }],
        );
        assert!(estimate_message_tokens(&with_call) > estimate_message_tokens(&plain));
    }
}
