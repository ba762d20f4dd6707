//! The OpenAI-compatible chat-completions adapter.
//!
//! This is the baseline dialect: `POST {base}/chat/completions` with
//! `{model, messages, tools, temperature, max_tokens, tool_choice, stream}`,
//! responses shaped as `choices[0].message`, streamed events shaped as
//! `choices[0].delta`, and a terminal `usage` object. Tool-call arguments
//! stream as string fragments keyed by `index` within the choice.
//!
//! The serialization helpers are shared with the
//! [`deepseek`](crate::adapters::deepseek) adapter, which speaks the same
//! wire shape plus a reasoning side channel.

use serde_json::{json, Value};

use crate::codemind::adapters::{
    CompletionRequest, PreparedRequest, ProviderAdapter, StreamDelta, ToolCallFragment, ToolChoice,
};
use crate::codemind::error::TransportError;
use crate::codemind::message::{Message, Role, ToolCall, Usage};

/// Baseline OpenAI-compatible adapter.
pub struct OpenAiAdapter;

impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn prepare(&self, request: &CompletionRequest, api_key: &str) -> PreparedRequest {
        prepare_chat_completions(request, api_key)
    }

    fn parse(&self, response: &Value) -> Result<(Message, Usage), TransportError> {
        parse_chat_response(response, false)
    }

    fn parse_chunk(&self, event: &Value) -> Result<StreamDelta, TransportError> {
        parse_chat_chunk(event, false)
    }
}

/// Serialize one neutral [`Message`] to the chat-completions wire shape.
pub(crate) fn message_to_wire(message: &Message) -> Value {
    match message.role {
        Role::System => json!({"role": "system", "content": message.content_str()}),
        Role::User => json!({"role": "user", "content": message.content_str()}),
        Role::Assistant => {
            if message.tool_calls.is_empty() {
                json!({"role": "assistant", "content": message.content_str()})
            } else {
                let tool_calls: Vec<Value> = message
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {"name": tc.name, "arguments": tc.arguments}
                        })
                    })
                    .collect();
                json!({
                    "role": "assistant",
                    "content": message.content.clone(),
                    "tool_calls": tool_calls
                })
            }
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
            "content": message.content_str()
        }),
    }
}

/// Build the request body, endpoint, and auth header.
pub(crate) fn prepare_chat_completions(
    request: &CompletionRequest,
    api_key: &str,
) -> PreparedRequest {
    let messages: Vec<Value> = request.messages.iter().map(message_to_wire).collect();

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "temperature": request.temperature,
        "stream": request.streaming,
    });

    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
        body["tool_choice"] = match request.tool_choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::None => json!("none"),
            ToolChoice::Required => json!("required"),
        };
    }
    if request.streaming {
        body["stream_options"] = json!({"include_usage": true});
    }

    PreparedRequest {
        endpoint_path: "/chat/completions".to_string(),
        headers: vec![("Authorization".to_string(), format!("Bearer {api_key}"))],
        body,
    }
}

/// Normalize wire content to a single string.
///
/// Providers may send plain text or an array of typed parts; multi-part
/// content is flattened by concatenating the parts' `text` fields before a
/// message is stored.
fn content_to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(|part| part["text"].as_str())
                .collect(),
        ),
        _ => None,
    }
}

/// Pull a usage report out of a response, defaulting missing fields to zero.
pub(crate) fn parse_usage(value: &Value) -> Usage {
    let usage = &value["usage"];
    Usage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
    }
}

fn parse_tool_calls(value: &Value) -> Vec<ToolCall> {
    value
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|tc| {
                    let id = tc["id"].as_str()?.to_string();
                    let function = &tc["function"];
                    let name = function["name"].as_str()?.to_string();
                    let arguments = function["arguments"].as_str().unwrap_or("{}").to_string();
                    Some(ToolCall { id, name, arguments })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse a full chat-completions response into `(Message, Usage)`.
///
/// `capture_reasoning` pulls `reasoning_content` into [`Message::reasoning`]
/// for vendors with a reasoning side channel; the baseline adapter ignores
/// the field along with everything else it does not know.
pub(crate) fn parse_chat_response(
    response: &Value,
    capture_reasoning: bool,
) -> Result<(Message, Usage), TransportError> {
    let message = response["choices"]
        .get(0)
        .map(|choice| &choice["message"])
        .ok_or_else(|| {
            TransportError::Parse(serde::de::Error::custom("response has no choices"))
        })?;

    let content = content_to_text(&message["content"]);
    let reasoning = if capture_reasoning {
        message["reasoning_content"].as_str().map(|s| s.to_string())
    } else {
        None
    };
    let tool_calls = parse_tool_calls(&message["tool_calls"]);

    let mut assistant = Message::assistant_with_tool_calls(content, tool_calls);
    assistant.reasoning = reasoning;
    Ok((assistant, parse_usage(response)))
}

/// Parse one streamed chat-completions event into a [`StreamDelta`].
pub(crate) fn parse_chat_chunk(
    event: &Value,
    capture_reasoning: bool,
) -> Result<StreamDelta, TransportError> {
    let mut delta = StreamDelta::default();

    if event.get("usage").map(|u| !u.is_null()).unwrap_or(false) {
        delta.usage = Some(parse_usage(event));
    }

    let Some(choice) = event["choices"].get(0) else {
        // Usage-only terminal chunk.
        return Ok(delta);
    };

    let wire_delta = &choice["delta"];
    delta.content = content_to_text(&wire_delta["content"]);
    if capture_reasoning {
        delta.reasoning = wire_delta["reasoning_content"].as_str().map(|s| s.to_string());
    }
    delta.finish_reason = choice["finish_reason"].as_str().map(|s| s.to_string());

    if let Some(fragments) = wire_delta["tool_calls"].as_array() {
        for fragment in fragments {
            delta.tool_calls.push(ToolCallFragment {
                index: fragment["index"].as_u64().unwrap_or(0) as usize,
                id: fragment["id"].as_str().map(|s| s.to_string()),
                name: fragment["function"]["name"].as_str().map(|s| s.to_string()),
                arguments: fragment["function"]["arguments"]
                    .as_str()
                    .map(|s| s.to_string()),
            });
        }
    }

    Ok(delta)
}
