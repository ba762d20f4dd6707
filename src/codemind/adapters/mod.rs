//! Provider adapter registry.
//!
//! Adapters are the sole place where provider wire-format variance lives.
//! Each [`ProviderAdapter`] translates the neutral request model into a
//! provider-specific endpoint path, header set, and JSON body, and parses
//! responses (full and streamed) back into neutral [`Message`]s and
//! [`Usage`] reports. Everything upstream of the adapters (backend, agent
//! loop, middlewares) sees only the neutral model.
//!
//! Two adapters ship with the runtime:
//!
//! - [`openai::OpenAiAdapter`]: the OpenAI-compatible chat-completions
//!   dialect (the baseline most hosted and local servers speak);
//! - [`deepseek::DeepSeekAdapter`]: the same wire shape plus the
//!   `reasoning_content` side channel on messages and stream deltas.
//!
//! # Example
//!
//! ```rust
//! use codemind::adapters::AdapterRegistry;
//!
//! let registry = AdapterRegistry::with_defaults();
//! assert!(registry.get("openai").is_some());
//! assert!(registry.get("deepseek").is_some());
//! assert!(registry.get("imaginary").is_none());
//! ```

pub mod deepseek;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codemind::error::TransportError;
use crate::codemind::message::{Message, Usage};

/// A tool definition as exported to the model alongside a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name as the model will reference it.
    pub name: String,
    /// Description surfaced to the model to aid selection.
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: serde_json::Value,
}

/// How the model is permitted to use the exported tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// Model decides freely.
    #[default]
    Auto,
    /// Tool calls are disabled for this request.
    None,
    /// The model must call at least one tool.
    Required,
}

/// The neutral completion request handed to an adapter.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: ToolChoice,
    pub streaming: bool,
}

/// The provider-specific request an adapter produced.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    /// Path appended to the provider base URL (e.g. `/chat/completions`).
    pub endpoint_path: String,
    /// Extra headers (authorization and friends).
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub body: serde_json::Value,
}

/// One fragment of a streamed tool call.
///
/// Providers key fragments by `index` within the choice; the `id` and
/// `name` arrive once on the first fragment, then `arguments` text trickles
/// in across subsequent fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One parsed streaming event in neutral form.
#[derive(Debug, Clone, Default)]
pub struct StreamDelta {
    /// Incremental assistant text.
    pub content: Option<String>,
    /// Incremental reasoning-channel text.
    pub reasoning: Option<String>,
    /// Tool-call fragments carried by this event.
    pub tool_calls: Vec<ToolCallFragment>,
    /// Usage report; present on the terminal event only.
    pub usage: Option<Usage>,
    /// Provider finish reason, when the event carries one.
    pub finish_reason: Option<String>,
}

/// Translator between the neutral model and one provider's JSON dialect.
///
/// Implementations must ignore unknown response fields and default missing
/// usage numbers to zero.
pub trait ProviderAdapter: Send + Sync {
    /// Registry name (e.g. `"openai"`).
    fn name(&self) -> &str;

    /// Build the provider-specific request.
    fn prepare(&self, request: &CompletionRequest, api_key: &str) -> PreparedRequest;

    /// Parse a full (non-streaming) response body.
    fn parse(&self, response: &serde_json::Value) -> Result<(Message, Usage), TransportError>;

    /// Parse one streaming event.
    fn parse_chunk(&self, event: &serde_json::Value) -> Result<StreamDelta, TransportError>;
}

/// Named adapter lookup.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// A registry pre-populated with the built-in adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(openai::OpenAiAdapter));
        registry.register(Arc::new(deepseek::DeepSeekAdapter));
        registry
    }

    /// Register an adapter under its own name, replacing any previous entry.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Look up an adapter by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(name).cloned()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
