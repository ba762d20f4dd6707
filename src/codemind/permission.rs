//! Permission policy evaluation for tool calls.
//!
//! Every tool call passes through [`PermissionEngine::evaluate`] before the
//! handler runs. The decision procedure, in order:
//!
//! 1. Tool not enabled under the active mode → skip (`"tool disabled"`).
//! 2. Denylist match → skip (`"denied by policy"`).
//! 3. Allowlist match → proceed (treated as `Always`).
//! 4. Permission level: `Always` → proceed; `Never` → skip (`"never"`);
//!    `Ask` → the approval callback decides, every time.
//!
//! The callback is never bypassed for `Ask`-level calls. A mode that
//! auto-approves does so by installing an always-yes handler (see
//! [`ApproveAll`]), keeping the decision procedure itself uniform.
//!
//! Patterns match against a tool-defined subject string: the value of the
//! configured argument field (e.g. the `command` field for a shell tool) or,
//! when none is configured, the tool name alone. Matching is
//! case-insensitive and anchored: a pattern must cover the whole subject.
//!
//! # Pattern grammar
//!
//! | Form | Meaning |
//! |---|---|
//! | `git status` | exact match |
//! | `cargo *` | glob; `*` matches any run of characters |
//! | `re:git (status\|log).*` | full regex (anchored) |
//!
//! # Example
//!
//! ```rust
//! use codemind::permission::PolicyPattern;
//!
//! let glob = PolicyPattern::parse("cargo *").unwrap();
//! assert!(glob.matches("cargo build --release"));
//! assert!(glob.matches("CARGO TEST"));
//! assert!(!glob.matches("rustup update"));
//!
//! let exact = PolicyPattern::parse("git status").unwrap();
//! assert!(!exact.matches("git status --short"));
//! ```

use async_trait::async_trait;
use regex::Regex;

use crate::codemind::config::{Mode, ToolConfig};

/// A compiled allow/deny pattern.
#[derive(Debug, Clone)]
pub enum PolicyPattern {
    /// Case-insensitive exact match.
    Exact(String),
    /// `*`-glob, compiled to an anchored regex.
    Glob(Regex),
    /// User-supplied regex (`re:` prefix), anchored.
    Regex(Regex),
}

impl PolicyPattern {
    /// Parse one pattern string.
    ///
    /// `re:`-prefixed patterns are compiled as regexes; patterns containing
    /// `*` become globs; everything else is an exact match. Compilation
    /// errors surface as `Err` so misconfigured policies fail loudly at
    /// registration rather than silently never matching.
    pub fn parse(pattern: &str) -> Result<Self, String> {
        if let Some(raw) = pattern.strip_prefix("re:") {
            let anchored = format!("(?i)^(?:{raw})$");
            return Regex::new(&anchored)
                .map(PolicyPattern::Regex)
                .map_err(|e| format!("invalid regex pattern {pattern:?}: {e}"));
        }
        if pattern.contains('*') {
            let mut regex = String::from("(?i)^");
            for part in pattern.split('*') {
                regex.push_str(&regex::escape(part));
                regex.push_str(".*");
            }
            // One ".*" too many: trim the trailing wildcard added after the
            // final literal segment.
            regex.truncate(regex.len() - 2);
            regex.push('$');
            return Regex::new(&regex)
                .map(PolicyPattern::Glob)
                .map_err(|e| format!("invalid glob pattern {pattern:?}: {e}"));
        }
        Ok(PolicyPattern::Exact(pattern.to_string()))
    }

    /// Whether the pattern covers the whole subject (case-insensitive).
    pub fn matches(&self, subject: &str) -> bool {
        match self {
            PolicyPattern::Exact(text) => text.eq_ignore_ascii_case(subject),
            PolicyPattern::Glob(regex) | PolicyPattern::Regex(regex) => regex.is_match(subject),
        }
    }
}

/// The approval callback's answer.
#[derive(Debug, Clone)]
pub enum Approval {
    /// Execute the call.
    Yes,
    /// Skip the call, optionally with a message shown to the model.
    No { message: Option<String> },
}

/// Host-provided callback consulted for `Ask`-level tools.
///
/// Implementations may prompt a human, consult an editor integration, or
/// answer synchronously from recorded decisions. The callback is awaited on
/// the turn's task, so a pending prompt naturally pauses the agent loop.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Decide whether the named call may execute.
    ///
    /// `arguments` is the parsed JSON payload the handler would receive.
    async fn approve(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
        tool_call_id: &str,
    ) -> Approval;
}

/// An approval handler that answers `Yes` to everything. The default for
/// embedding contexts that install policy purely via allow/deny lists.
pub struct ApproveAll;

#[async_trait]
impl ApprovalHandler for ApproveAll {
    async fn approve(&self, _: &str, _: &serde_json::Value, _: &str) -> Approval {
        Approval::Yes
    }
}

/// Outcome of policy evaluation for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Execute the handler.
    Proceed,
    /// Do not execute; synthesize a skipped tool result with this reason.
    Skip { reason: String },
}

/// Evaluates the decision procedure for each tool call.
///
/// Stateless: the mode, per-tool config, and approval handler are supplied
/// per evaluation so the engine always sees the turn's frozen snapshot.
pub struct PermissionEngine;

impl PermissionEngine {
    /// Extract the subject string patterns match against.
    ///
    /// The configured `pattern_subject` field of the parsed arguments when
    /// present and a string; the tool name otherwise.
    pub fn match_subject<'a>(
        tool_name: &'a str,
        config: &ToolConfig,
        arguments: &'a serde_json::Value,
    ) -> &'a str {
        config
            .pattern_subject
            .as_deref()
            .and_then(|field| arguments.get(field))
            .and_then(|value| value.as_str())
            .unwrap_or(tool_name)
    }

    /// Run the decision procedure for one call.
    pub async fn evaluate(
        mode: &Mode,
        tool_name: &str,
        config: &ToolConfig,
        arguments: &serde_json::Value,
        tool_call_id: &str,
        approval: &dyn ApprovalHandler,
    ) -> PermissionDecision {
        use crate::codemind::config::PermissionLevel;

        if !mode.tool_enabled(tool_name) {
            return PermissionDecision::Skip {
                reason: "tool disabled".to_string(),
            };
        }

        let subject = Self::match_subject(tool_name, config, arguments);

        for pattern in &config.denylist {
            match PolicyPattern::parse(pattern) {
                Ok(compiled) if compiled.matches(subject) => {
                    log::debug!("tool call {tool_name} denied by pattern {pattern:?}");
                    return PermissionDecision::Skip {
                        reason: "denied by policy".to_string(),
                    };
                }
                Ok(_) => {}
                Err(err) => log::warn!("skipping unparseable denylist entry: {err}"),
            }
        }

        for pattern in &config.allowlist {
            match PolicyPattern::parse(pattern) {
                Ok(compiled) if compiled.matches(subject) => {
                    return PermissionDecision::Proceed;
                }
                Ok(_) => {}
                Err(err) => log::warn!("skipping unparseable allowlist entry: {err}"),
            }
        }

        match config.permission {
            PermissionLevel::Always => PermissionDecision::Proceed,
            PermissionLevel::Never => PermissionDecision::Skip {
                reason: "never".to_string(),
            },
            PermissionLevel::Ask => {
                match approval.approve(tool_name, arguments, tool_call_id).await {
                    Approval::Yes => PermissionDecision::Proceed,
                    Approval::No { message } => PermissionDecision::Skip {
                        reason: message.unwrap_or_else(|| "rejected by user".to_string()),
                    },
                }
            }
        }
    }
}
