//! DeepSeek adapter: chat-completions wire shape plus reasoning content.
//!
//! DeepSeek's reasoner models speak the OpenAI-compatible dialect but add a
//! `reasoning_content` side channel on both full messages and stream deltas.
//! This adapter reuses the baseline serialization and additionally routes
//! that channel into [`Message::reasoning`] / [`StreamDelta::reasoning`] so
//! the agent loop can emit reasoning events separately from assistant text.
//!
//! Reasoning text is never echoed back to the provider: `message_to_wire`
//! drops it, matching the vendor's requirement that prior reasoning be
//! omitted from subsequent requests.

use serde_json::Value;

use crate::codemind::adapters::openai::{
    parse_chat_chunk, parse_chat_response, prepare_chat_completions,
};
use crate::codemind::adapters::{
    CompletionRequest, PreparedRequest, ProviderAdapter, StreamDelta,
};
use crate::codemind::error::TransportError;
use crate::codemind::message::{Message, Usage};

/// Adapter for DeepSeek's OpenAI-compatible endpoint with reasoning support.
pub struct DeepSeekAdapter;

impl ProviderAdapter for DeepSeekAdapter {
    fn name(&self) -> &str {
        "deepseek"
    }

    fn prepare(&self, request: &CompletionRequest, api_key: &str) -> PreparedRequest {
        prepare_chat_completions(request, api_key)
    }

    fn parse(&self, response: &Value) -> Result<(Message, Usage), TransportError> {
        parse_chat_response(response, true)
    }

    fn parse_chunk(&self, event: &Value) -> Result<StreamDelta, TransportError> {
        parse_chat_chunk(event, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn captures_reasoning_from_full_response() {
        let response = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "42",
                    "reasoning_content": "6 times 7 is 42"
                }
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2}
        });
        let (message, usage) = DeepSeekAdapter.parse(&response).unwrap();
        assert_eq!(message.content_str(), "42");
        assert_eq!(message.reasoning.as_deref(), Some("6 times 7 is 42"));
        assert_eq!(usage.prompt_tokens, 5);
    }

    #[test]
    fn captures_reasoning_deltas() {
        let event = json!({
            "choices": [{"delta": {"reasoning_content": "let me think"}}]
        });
        let delta = DeepSeekAdapter.parse_chunk(&event).unwrap();
        assert_eq!(delta.reasoning.as_deref(), Some("let me think"));
        assert!(delta.content.is_none());
    }

    #[test]
    fn reasoning_is_not_serialized_back() {
        let mut message = Message::assistant("42");
        message.reasoning = Some("6 times 7 is 42".to_string());
        let prepared = DeepSeekAdapter.prepare(
            &CompletionRequest {
                model: "deepseek-reasoner".to_string(),
                messages: vec![message],
                temperature: 1.0,
                max_tokens: None,
                tools: vec![],
                tool_choice: Default::default(),
                streaming: false,
            },
            "sk-test",
        );
        let wire_message = &prepared.body["messages"][0];
        assert!(wire_message.get("reasoning_content").is_none());
        assert_eq!(wire_message["content"], "42");
    }
}
