//! Uniform completion contract over transport + adapter + credentials.
//!
//! [`LlmClient`] is the seam the agent loop (and every test) talks to: a
//! streaming/non-streaming completion call plus local token counting.
//! [`LlmBackend`] is the production implementation binding an
//! [`HttpTransport`], a [`ProviderAdapter`], and an API key to a base URL.
//!
//! [`StreamAccumulator`] folds the stream of neutral deltas into one
//! assistant [`Message`] and the final [`Usage`]: content and reasoning
//! concatenate, and tool-call arguments accumulate per call as providers
//! stream them in JSON fragments.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;

use crate::codemind::adapters::{
    CompletionRequest, ProviderAdapter, StreamDelta, ToolCallFragment, ToolSchema,
};
use crate::codemind::error::{AgentError, TransportError};
use crate::codemind::message::{
    estimate_message_tokens, estimate_tokens, Message, ToolCall, Usage,
};
use crate::codemind::transport::HttpTransport;

/// A finite, non-restartable stream of completion deltas.
///
/// The final delta carries the authoritative [`Usage`]; consumers fold the
/// sequence with a [`StreamAccumulator`].
pub type CompletionStream =
    Pin<Box<dyn Stream<Item = Result<StreamDelta, TransportError>> + Send>>;

/// The completion contract every consumer of an LLM sees.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Full request/response completion.
    async fn complete(&self, request: &CompletionRequest) -> Result<(Message, Usage), AgentError>;

    /// Streaming completion.
    async fn complete_stream(&self, request: &CompletionRequest)
        -> Result<CompletionStream, AgentError>;

    /// Estimate the token footprint of a prospective request.
    ///
    /// Local, deterministic, and monotonic in message length. Drives the
    /// context-warning and auto-compaction middlewares.
    fn count_tokens(&self, messages: &[Message], tools: &[ToolSchema]) -> u64 {
        let message_tokens: u64 = messages.iter().map(estimate_message_tokens).sum();
        let tool_tokens: u64 = tools
            .iter()
            .map(|t| {
                estimate_tokens(&t.name)
                    + estimate_tokens(&t.description)
                    + estimate_tokens(&t.parameters.to_string())
            })
            .sum();
        message_tokens + tool_tokens
    }

    /// The provider name used in error context.
    fn provider_name(&self) -> &str;
}

/// Production [`LlmClient`]: adapter + transport + credentials.
pub struct LlmBackend {
    transport: HttpTransport,
    adapter: Arc<dyn ProviderAdapter>,
    base_url: String,
    api_key: String,
}

impl LlmBackend {
    /// Bind an adapter to a provider endpoint.
    ///
    /// `affinity_token` should be stable per session (the session id works)
    /// so the provider can route the session's requests consistently.
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        affinity_token: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport: HttpTransport::new(affinity_token, request_timeout),
            adapter,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl LlmClient for LlmBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<(Message, Usage), AgentError> {
        let mut request = request.clone();
        request.streaming = false;
        let prepared = self.adapter.prepare(&request, &self.api_key);
        let url = self.endpoint(&prepared.endpoint_path);

        let response = self
            .transport
            .post_json(&url, &prepared.headers, &prepared.body)
            .await
            .map_err(|e| AgentError::from_transport(self.adapter.name(), &request.model, e))?;

        self.adapter
            .parse(&response)
            .map_err(|e| AgentError::from_transport(self.adapter.name(), &request.model, e))
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, AgentError> {
        let mut request = request.clone();
        request.streaming = true;
        let prepared = self.adapter.prepare(&request, &self.api_key);
        let url = self.endpoint(&prepared.endpoint_path);

        let events = self
            .transport
            .post_stream(&url, &prepared.headers, &prepared.body)
            .await
            .map_err(|e| AgentError::from_transport(self.adapter.name(), &request.model, e))?;

        let adapter = Arc::clone(&self.adapter);
        let stream = async_stream::stream! {
            futures_util::pin_mut!(events);
            while let Some(event) = futures_util::StreamExt::next(&mut events).await {
                match event {
                    Ok(json) => yield adapter.parse_chunk(&json),
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn provider_name(&self) -> &str {
        self.adapter.name()
    }
}

/// In-progress tool call being assembled from stream fragments.
#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds [`StreamDelta`]s into one assistant [`Message`] plus final [`Usage`].
///
/// Content and reasoning accumulate by concatenation. Tool calls accumulate
/// per call: a fragment carrying a new id opens a call (in declared order),
/// and subsequent fragments for the same call concatenate their `arguments`
/// text, since providers stream the JSON-encoded arguments in pieces.
///
/// # Example
///
/// ```rust
/// use codemind::adapters::{StreamDelta, ToolCallFragment};
/// use codemind::backend::StreamAccumulator;
///
/// let mut acc = StreamAccumulator::new();
/// acc.push(StreamDelta {
///     tool_calls: vec![ToolCallFragment {
///         index: 0,
///         id: Some("t1".into()),
///         name: Some("grep".into()),
///         arguments: Some("{\"pat".into()),
///     }],
///     ..Default::default()
/// });
/// acc.push(StreamDelta {
///     tool_calls: vec![ToolCallFragment {
///         index: 0,
///         arguments: Some("tern\":\"TODO\"}".into()),
///         ..Default::default()
///     }],
///     ..Default::default()
/// });
///
/// let (message, _) = acc.finish();
/// assert_eq!(message.tool_calls[0].arguments, "{\"pattern\":\"TODO\"}");
/// ```
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    reasoning: String,
    calls: Vec<PartialToolCall>,
    index_to_slot: HashMap<usize, usize>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    chunks_seen: usize,
}

impl StreamAccumulator {
    /// An empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one delta in.
    pub fn push(&mut self, delta: StreamDelta) {
        self.chunks_seen += 1;
        if let Some(content) = &delta.content {
            self.content.push_str(content);
        }
        if let Some(reasoning) = &delta.reasoning {
            self.reasoning.push_str(reasoning);
        }
        for fragment in delta.tool_calls {
            self.merge_fragment(fragment);
        }
        if let Some(usage) = delta.usage {
            self.usage = Some(usage);
        }
        if delta.finish_reason.is_some() {
            self.finish_reason = delta.finish_reason;
        }
    }

    fn merge_fragment(&mut self, fragment: ToolCallFragment) {
        let slot = match self.index_to_slot.get(&fragment.index) {
            Some(&slot) => slot,
            None => {
                self.calls.push(PartialToolCall::default());
                let slot = self.calls.len() - 1;
                self.index_to_slot.insert(fragment.index, slot);
                slot
            }
        };
        let call = &mut self.calls[slot];
        if let Some(id) = fragment.id {
            call.id = id;
        }
        if let Some(name) = fragment.name {
            call.name = name;
        }
        if let Some(arguments) = fragment.arguments {
            call.arguments.push_str(&arguments);
        }
    }

    /// How many deltas have been folded so far. Used by the agent loop to
    /// batch event emission.
    pub fn chunks_seen(&self) -> usize {
        self.chunks_seen
    }

    /// Assistant text accumulated so far.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Reasoning text accumulated so far.
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Finalize into the assistant message and the reported usage
    /// (zero when the stream never carried one).
    pub fn finish(self) -> (Message, Usage) {
        let tool_calls: Vec<ToolCall> = self
            .calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.name,
                arguments: call.arguments,
            })
            .collect();

        let content = if self.content.is_empty() && !tool_calls.is_empty() {
            None
        } else {
            Some(self.content)
        };

        let mut message = Message::assistant_with_tool_calls(content, tool_calls);
        if !self.reasoning.is_empty() {
            message.reasoning = Some(self.reasoning);
        }
        (message, self.usage.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content_delta(text: &str) -> StreamDelta {
        StreamDelta {
            content: Some(text.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn concatenates_content_and_reasoning() {
        let mut acc = StreamAccumulator::new();
        acc.push(StreamDelta {
            reasoning: Some("think".into()),
            ..Default::default()
        });
        acc.push(StreamDelta {
            reasoning: Some("ing".into()),
            ..Default::default()
        });
        acc.push(content_delta("hel"));
        acc.push(content_delta("lo"));

        let (message, _) = acc.finish();
        assert_eq!(message.content_str(), "hello");
        assert_eq!(message.reasoning.as_deref(), Some("thinking"));
    }

    #[test]
    fn arguments_fragments_concatenate_per_call() {
        let mut acc = StreamAccumulator::new();
        acc.push(StreamDelta {
            tool_calls: vec![ToolCallFragment {
                index: 0,
                id: Some("t1".into()),
                name: Some("grep".into()),
                arguments: Some("{\"pattern\":".into()),
            }],
            ..Default::default()
        });
        acc.push(StreamDelta {
            tool_calls: vec![ToolCallFragment {
                index: 0,
                arguments: Some("\"TODO\"}".into()),
                ..Default::default()
            }],
            ..Default::default()
        });

        let (message, _) = acc.finish();
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].id, "t1");
        assert_eq!(message.tool_calls[0].arguments, "{\"pattern\":\"TODO\"}");
        // Tool-call-only messages carry no content.
        assert!(message.content.is_none());
    }

    #[test]
    fn interleaved_calls_keep_declared_order() {
        let mut acc = StreamAccumulator::new();
        acc.push(StreamDelta {
            tool_calls: vec![ToolCallFragment {
                index: 0,
                id: Some("a".into()),
                name: Some("grep".into()),
                arguments: Some("{}".into()),
            }],
            ..Default::default()
        });
        acc.push(StreamDelta {
            tool_calls: vec![ToolCallFragment {
                index: 1,
                id: Some("b".into()),
                name: Some("read_file".into()),
                arguments: Some("{\"path\":".into()),
            }],
            ..Default::default()
        });
        acc.push(StreamDelta {
            tool_calls: vec![ToolCallFragment {
                index: 1,
                arguments: Some("\"src/lib.rs\"}".into()),
                ..Default::default()
            }],
            ..Default::default()
        });

        let (message, _) = acc.finish();
        assert_eq!(message.tool_calls.len(), 2);
        assert_eq!(message.tool_calls[0].id, "a");
        assert_eq!(message.tool_calls[1].id, "b");
        assert_eq!(message.tool_calls[1].arguments, "{\"path\":\"src/lib.rs\"}");
    }

    #[test]
    fn final_usage_wins() {
        let mut acc = StreamAccumulator::new();
        acc.push(content_delta("hi"));
        acc.push(StreamDelta {
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 3,
            }),
            ..Default::default()
        });
        let (_, usage) = acc.finish();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[test]
    fn missing_usage_defaults_to_zero() {
        let mut acc = StreamAccumulator::new();
        acc.push(content_delta("hi"));
        let (_, usage) = acc.finish();
        assert_eq!(usage, Usage::default());
    }

    struct EstimatorOnly;

    #[async_trait]
    impl LlmClient for EstimatorOnly {
        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<(Message, Usage), AgentError> {
            unimplemented!()
        }
        async fn complete_stream(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionStream, AgentError> {
            unimplemented!()
        }
        fn provider_name(&self) -> &str {
            "test"
        }
    }

    #[test]
    fn count_tokens_is_monotonic_in_history_length() {
        let client = EstimatorOnly;
        let mut messages = vec![Message::system("sys")];
        let mut last = client.count_tokens(&messages, &[]);
        for i in 0..5 {
            messages.push(Message::user(format!("message number {i} with some text")));
            let estimate = client.count_tokens(&messages, &[]);
            assert!(estimate > last);
            last = estimate;
        }
    }
}
