//! Typed event stream for external observers.
//!
//! The agent loop narrates each turn through [`AgentEvent`]s delivered to a
//! registered [`EventHandler`]. The TUI, editor adapters, and the session
//! persistence layer all consume this one surface; the runtime itself never
//! renders anything.
//!
//! Within a turn events are totally ordered: zero or more
//! `Reasoning`/`Assistant` events, then per tool call (in declared order) a
//! `ToolCall` followed by its `ToolResult`, then possibly further rounds of
//! the same shape. Compaction brackets its work with `CompactStart` and
//! `CompactEnd`.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use codemind::event::{AgentEvent, EventHandler};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_event(&self, event: &AgentEvent) {
//!         if let AgentEvent::Assistant { content, .. } = event {
//!             print!("{content}");
//!         }
//!     }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;

/// How one tool call concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    /// The handler ran and returned a result.
    Success,
    /// Validation or execution failed; the error text was fed to the model.
    Error(String),
    /// The call never ran: disabled, denied, rejected, or cancelled.
    Skipped { reason: String },
}

/// Events emitted by the agent loop during a turn.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A batch of assistant text.
    ///
    /// During streaming, batches are flushed roughly every few chunks and at
    /// stream end; `stopped_by_middleware` is set on the terminal event of a
    /// turn a middleware stopped, with the human-readable reason attached.
    Assistant {
        content: String,
        stopped_by_middleware: bool,
        stop_reason: Option<String>,
    },

    /// A batch of reasoning-channel text (providers with a reasoning side
    /// channel only).
    Reasoning { content: String },

    /// The model requested a tool invocation. Always followed by a matching
    /// [`AgentEvent::ToolResult`] before the next assistant event.
    ToolCall {
        tool_name: String,
        arguments: String,
        tool_call_id: String,
    },

    /// A tool invocation concluded.
    ToolResult {
        tool_name: String,
        tool_call_id: String,
        outcome: ToolOutcome,
        duration: Duration,
    },

    /// Context compaction is starting.
    CompactStart {
        current_tokens: u64,
        threshold: u64,
    },

    /// Context compaction finished and the conversation was replaced.
    CompactEnd {
        old_tokens: u64,
        new_tokens: u64,
        summary_length: usize,
    },

    /// A recoverable anomaly worth surfacing: compaction failure,
    /// cancellation, a tool-server restart.
    Diagnostic { message: String },
}

/// Observer callback for [`AgentEvent`]s.
///
/// The default implementation is a no-op, so observers only override what
/// they care about. Handlers are shared as `Arc<dyn EventHandler>` across
/// the session and must synchronize any internal state themselves.
///
/// Handlers are awaited inline by the agent loop: a slow handler applies
/// backpressure to the stream rather than letting chunks pile up.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for every event, in turn order.
    async fn on_event(&self, _event: &AgentEvent) {}
}

/// A handler that drops every event. Useful as a default and in tests.
pub struct NullEventHandler;

#[async_trait]
impl EventHandler for NullEventHandler {}
