//! Runtime configuration types.
//!
//! Configuration is hand-constructed by the embedding application; there is
//! no file parsing in this crate. The agent loop consumes a frozen
//! [`RuntimeConfig`] snapshot per turn: mode switches and reloads install a
//! new snapshot at the next turn boundary, never mid-turn, so middlewares
//! and tool handlers always observe a consistent view.
//!
//! # Example
//!
//! ```rust
//! use codemind::config::{Mode, PermissionLevel, RuntimeConfig, ToolConfig};
//!
//! let mut config = RuntimeConfig::new("gpt-4.1", "openai", "https://api.openai.com/v1");
//! config.tool_configs.insert(
//!     "bash".to_string(),
//!     ToolConfig {
//!         permission: PermissionLevel::Ask,
//!         allowlist: vec!["git status".to_string(), "cargo *".to_string()],
//!         denylist: vec!["rm *".to_string()],
//!         ..ToolConfig::default()
//!     },
//! );
//! config.mode = Mode::read_only();
//! ```

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-million-token pricing used for cost accrual.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per 1M prompt tokens.
    pub input_per_mtok: f64,
    /// Price per 1M completion tokens.
    pub output_per_mtok: f64,
}

/// Baseline permission level for a tool, before allow/deny patterns apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    /// Execute without asking.
    Always,
    /// Ask the approval callback per call.
    #[default]
    Ask,
    /// Never execute; calls are skipped.
    Never,
}

/// Per-tool policy and execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Baseline permission level.
    pub permission: PermissionLevel,
    /// Patterns that force-approve a call (exact, `*` glob, or `re:` regex).
    pub allowlist: Vec<String>,
    /// Patterns that force-skip a call. Checked before the allowlist.
    pub denylist: Vec<String>,
    /// Working directory handed to the tool handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
    /// The argument field patterns match against (e.g. `"command"` for the
    /// shell tool). When unset, patterns match the tool name alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_subject: Option<String>,
    /// Per-call execution timeout.
    #[serde(default = "default_tool_timeout")]
    pub timeout: Duration,
}

fn default_tool_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            permission: PermissionLevel::default(),
            allowlist: Vec::new(),
            denylist: Vec::new(),
            workdir: None,
            pattern_subject: None,
            timeout: default_tool_timeout(),
        }
    }
}

/// A named overlay constraining the enabled tool set and approval behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mode {
    /// Display name (e.g. `"default"`, `"read-only"`, `"auto"`).
    pub name: String,
    /// Declares that `Ask`-level calls should be answered yes without a
    /// human in the loop. The permission engine still consults the approval
    /// callback for every `Ask` call; hosts honor this flag by installing an
    /// always-yes handler (see
    /// [`ApproveAll`](crate::permission::ApproveAll)).
    pub auto_approve: bool,
    /// Tools enabled under this mode. `None` enables every registered tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_tools: Option<HashSet<String>>,
    /// Marks modes that must not mutate the workspace; the mode-enforcement
    /// middleware reminds the model periodically while this is set.
    pub read_only: bool,
}

impl Mode {
    /// The permissive default mode: every tool enabled, approvals asked.
    pub fn default_mode() -> Self {
        Self {
            name: "default".to_string(),
            auto_approve: false,
            enabled_tools: None,
            read_only: false,
        }
    }

    /// A read-only mode restricted to the given tools.
    pub fn read_only() -> Self {
        Self {
            name: "read-only".to_string(),
            auto_approve: false,
            enabled_tools: None,
            read_only: true,
        }
    }

    /// True when `tool` is enabled under this mode.
    pub fn tool_enabled(&self, tool: &str) -> bool {
        match &self.enabled_tools {
            Some(set) => set.contains(tool),
            None => true,
        }
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::default_mode()
    }
}

/// A named, frozen overlay of model selection and prompt identity.
///
/// Profiles are value types: switching profiles builds a new
/// [`RuntimeConfig`] snapshot rather than mutating a live one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Profile name (e.g. `"main"`, `"planner"`).
    pub name: String,
    /// Model identifier sent to the provider.
    pub model: String,
    /// System prompt installed at conversation start and on reload.
    pub system_prompt: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Per-tool configuration overrides layered over the runtime defaults.
    #[serde(default)]
    pub tool_configs: HashMap<String, ToolConfig>,
}

impl AgentProfile {
    /// A minimal profile for the given model.
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            system_prompt: "You are a coding assistant.".to_string(),
            temperature: 1.0,
            tool_configs: HashMap::new(),
        }
    }
}

/// The frozen configuration snapshot one turn executes against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Model identifier.
    pub model: String,
    /// Adapter name in the [`AdapterRegistry`](crate::adapters::AdapterRegistry).
    pub provider: String,
    /// Provider base URL (no trailing slash required).
    pub base_url: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token cap, when bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Whether completions stream.
    pub streaming: bool,
    /// Pricing for cost accrual.
    pub pricing: ModelPricing,
    /// Model context window, in tokens.
    pub context_window: u64,
    /// Estimated-token threshold at which auto-compaction triggers.
    pub compact_threshold: u64,
    /// Token budget for the compaction summary request.
    pub compact_summary_tokens: u32,
    /// Fraction of the context window at which the context warning fires.
    pub context_warn_ratio: f64,
    /// Total per-request transport timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Startup (enumeration) timeout for remote tool servers.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: Duration,
    /// Per-tool policy, keyed by tool name.
    #[serde(default)]
    pub tool_configs: HashMap<String, ToolConfig>,
    /// Active mode overlay.
    pub mode: Mode,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(720)
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(10)
}

impl RuntimeConfig {
    /// A snapshot with the documented defaults for the given model/provider.
    pub fn new(
        model: impl Into<String>,
        provider: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            provider: provider.into(),
            base_url: base_url.into(),
            temperature: 1.0,
            max_tokens: None,
            streaming: true,
            pricing: ModelPricing::default(),
            context_window: 128_000,
            compact_threshold: 100_000,
            compact_summary_tokens: 2_000,
            context_warn_ratio: 0.8,
            request_timeout: default_request_timeout(),
            startup_timeout: default_startup_timeout(),
            tool_configs: HashMap::new(),
            mode: Mode::default_mode(),
        }
    }

    /// The effective [`ToolConfig`] for a tool, falling back to defaults.
    pub fn tool_config(&self, tool: &str) -> ToolConfig {
        self.tool_configs.get(tool).cloned().unwrap_or_default()
    }

    /// Apply a profile overlay, producing a new snapshot.
    pub fn with_profile(mut self, profile: &AgentProfile) -> Self {
        self.model = profile.model.clone();
        self.temperature = profile.temperature;
        for (name, tool_config) in &profile.tool_configs {
            self.tool_configs.insert(name.clone(), tool_config.clone());
        }
        self
    }
}
