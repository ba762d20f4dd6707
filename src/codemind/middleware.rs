//! Ordered interceptor chain around each model step.
//!
//! Middlewares are consulted before and after every completion call inside a
//! turn. Each hook sees a read-only [`TurnContext`] and answers with a
//! [`Decision`]:
//!
//! - `Continue`: fall through to the next middleware;
//! - `Stop(reason)`: abort the turn; the agent loop surfaces the reason on
//!   a terminal assistant event marked `stopped_by_middleware`;
//! - `Compact`: trigger context compaction before the next completion;
//! - `Inject(text)`: append text to the last user message (before-turn
//!   only).
//!
//! Hooks run in registration order. The first `Stop` or `Compact`
//! short-circuits the remainder of the chain; `Inject` texts accumulate and
//! the combined text is applied atomically once the whole chain has been
//! consulted. `reset` is broadcast whenever the conversation is cleared
//! (`Stop`) or compacted (`Compact`); middlewares may preserve cumulative
//! counters across compaction.
//!
//! # Built-ins
//!
//! | Middleware | Trigger | Decision |
//! |---|---|---|
//! | [`TurnLimit`] | steps ≥ max | `Stop` |
//! | [`PriceLimit`] | session cost ≥ max | `Stop` |
//! | [`AutoCompact`] | estimated tokens ≥ threshold | `Compact` |
//! | [`ContextWarning`] | estimated tokens ≥ warn% of window | `Inject` once |
//! | [`ModeEnforcement`] | read-only mode active, every N steps | `Inject` |

use async_trait::async_trait;

use crate::codemind::config::RuntimeConfig;
use crate::codemind::conversation::Stats;
use crate::codemind::message::Message;

/// Why middlewares are being reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// The conversation was cleared (or the session ended).
    Stop,
    /// The conversation was compacted; cumulative counters may survive.
    Compact,
}

/// One middleware hook's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Fall through.
    Continue,
    /// Abort the turn with a human-readable reason.
    Stop(String),
    /// Trigger context compaction.
    Compact,
    /// Append text to the last user message (before-turn only).
    Inject(String),
}

/// Read-only view of the turn handed to each hook.
pub struct TurnContext<'a> {
    /// Snapshot of the conversation so far.
    pub messages: &'a [Message],
    /// Session statistics.
    pub stats: &'a Stats,
    /// The frozen configuration this turn executes against.
    pub config: &'a RuntimeConfig,
    /// Estimated context size of the prospective request, in tokens.
    pub estimated_tokens: u64,
}

/// An interceptor in the pipeline.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Consulted before each completion call.
    async fn before_turn(&mut self, _ctx: &TurnContext<'_>) -> Decision {
        Decision::Continue
    }

    /// Consulted after tool results from a completion have been appended.
    async fn after_turn(&mut self, _ctx: &TurnContext<'_>) -> Decision {
        Decision::Continue
    }

    /// Reset internal state.
    fn reset(&mut self, reason: ResetReason);
}

/// Signal a whole pipeline pass resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineSignal {
    Continue,
    Stop(String),
    Compact,
}

/// Result of a before-turn pass: the controlling signal plus any
/// accumulated injection text.
pub struct BeforePass {
    pub signal: PipelineSignal,
    /// Concatenated `Inject` texts, in registration order.
    pub injected: Option<String>,
}

/// The ordered middleware chain.
pub struct MiddlewarePipeline {
    middlewares: Vec<Box<dyn Middleware>>,
}

impl MiddlewarePipeline {
    /// An empty pipeline.
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    /// Append a middleware; hooks run in registration order.
    pub fn push(&mut self, middleware: Box<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Run every `before_turn` hook.
    pub async fn run_before(&mut self, ctx: &TurnContext<'_>) -> BeforePass {
        let mut injected = String::new();
        for middleware in &mut self.middlewares {
            match middleware.before_turn(ctx).await {
                Decision::Continue => {}
                Decision::Inject(text) => {
                    if !injected.is_empty() {
                        injected.push('\n');
                    }
                    injected.push_str(&text);
                }
                Decision::Stop(reason) => {
                    log::debug!("middleware {} stopped the turn: {reason}", middleware.name());
                    return BeforePass {
                        signal: PipelineSignal::Stop(reason),
                        injected: none_if_empty(injected),
                    };
                }
                Decision::Compact => {
                    log::debug!("middleware {} requested compaction", middleware.name());
                    return BeforePass {
                        signal: PipelineSignal::Compact,
                        injected: none_if_empty(injected),
                    };
                }
            }
        }
        BeforePass {
            signal: PipelineSignal::Continue,
            injected: none_if_empty(injected),
        }
    }

    /// Run every `after_turn` hook. `Inject` is invalid here and ignored
    /// with a warning.
    pub async fn run_after(&mut self, ctx: &TurnContext<'_>) -> PipelineSignal {
        for middleware in &mut self.middlewares {
            match middleware.after_turn(ctx).await {
                Decision::Continue => {}
                Decision::Inject(_) => {
                    log::warn!(
                        "middleware {} returned Inject from after_turn; ignored",
                        middleware.name()
                    );
                }
                Decision::Stop(reason) => {
                    log::debug!("middleware {} stopped the turn: {reason}", middleware.name());
                    return PipelineSignal::Stop(reason);
                }
                Decision::Compact => return PipelineSignal::Compact,
            }
        }
        PipelineSignal::Continue
    }

    /// Broadcast a reset to every middleware.
    pub fn reset_all(&mut self, reason: ResetReason) {
        for middleware in &mut self.middlewares {
            middleware.reset(reason);
        }
    }
}

impl Default for MiddlewarePipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn none_if_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

/// Stops the turn once the session has spent its step budget.
pub struct TurnLimit {
    max_steps: u64,
    steps: u64,
}

impl TurnLimit {
    /// Allow at most `max_steps` completion calls per session.
    pub fn new(max_steps: u64) -> Self {
        Self { max_steps, steps: 0 }
    }

    fn stop_reason(&self) -> String {
        format!("Turn limit of {} reached", self.max_steps)
    }
}

#[async_trait]
impl Middleware for TurnLimit {
    fn name(&self) -> &str {
        "turn-limit"
    }

    async fn before_turn(&mut self, _ctx: &TurnContext<'_>) -> Decision {
        if self.steps >= self.max_steps {
            return Decision::Stop(self.stop_reason());
        }
        self.steps += 1;
        Decision::Continue
    }

    async fn after_turn(&mut self, _ctx: &TurnContext<'_>) -> Decision {
        if self.steps >= self.max_steps {
            return Decision::Stop(self.stop_reason());
        }
        Decision::Continue
    }

    fn reset(&mut self, reason: ResetReason) {
        // The budget is per conversation; compaction keeps the session going.
        if reason == ResetReason::Stop {
            self.steps = 0;
        }
    }
}

/// Stops the turn once the session's accrued cost reaches a ceiling.
pub struct PriceLimit {
    max_cost: f64,
}

impl PriceLimit {
    /// Allow at most `max_cost` (in the pricing currency) per session.
    pub fn new(max_cost: f64) -> Self {
        Self { max_cost }
    }

    fn check(&self, stats: &Stats) -> Decision {
        if stats.session_cost >= self.max_cost {
            Decision::Stop(format!(
                "Price limit of ${:.2} reached (spent ${:.4})",
                self.max_cost, stats.session_cost
            ))
        } else {
            Decision::Continue
        }
    }
}

#[async_trait]
impl Middleware for PriceLimit {
    fn name(&self) -> &str {
        "price-limit"
    }

    async fn before_turn(&mut self, ctx: &TurnContext<'_>) -> Decision {
        self.check(ctx.stats)
    }

    async fn after_turn(&mut self, ctx: &TurnContext<'_>) -> Decision {
        self.check(ctx.stats)
    }

    fn reset(&mut self, _reason: ResetReason) {}
}

/// Requests compaction when the estimated context crosses a threshold.
pub struct AutoCompact {
    threshold: u64,
}

impl AutoCompact {
    /// Compact once the estimated context reaches `threshold` tokens.
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl Middleware for AutoCompact {
    fn name(&self) -> &str {
        "auto-compact"
    }

    async fn before_turn(&mut self, ctx: &TurnContext<'_>) -> Decision {
        if ctx.estimated_tokens >= self.threshold {
            return Decision::Compact;
        }
        Decision::Continue
    }

    fn reset(&mut self, _reason: ResetReason) {}
}

/// Injects a one-time warning as the context approaches the model window.
pub struct ContextWarning {
    warn_ratio: f64,
    warned: bool,
}

impl ContextWarning {
    /// Warn when estimated tokens reach `warn_ratio` of the context window.
    pub fn new(warn_ratio: f64) -> Self {
        Self {
            warn_ratio,
            warned: false,
        }
    }
}

#[async_trait]
impl Middleware for ContextWarning {
    fn name(&self) -> &str {
        "context-warning"
    }

    async fn before_turn(&mut self, ctx: &TurnContext<'_>) -> Decision {
        if self.warned {
            return Decision::Continue;
        }
        let limit = (ctx.config.context_window as f64 * self.warn_ratio) as u64;
        if ctx.estimated_tokens >= limit {
            self.warned = true;
            return Decision::Inject(format!(
                "Note: the conversation is using roughly {} of {} context tokens; \
                 keep responses focused or request a compaction.",
                ctx.estimated_tokens, ctx.config.context_window
            ));
        }
        Decision::Continue
    }

    fn reset(&mut self, _reason: ResetReason) {
        self.warned = false;
    }
}

/// Periodically reminds the model that a read-only mode is active.
pub struct ModeEnforcement {
    every_n_steps: u64,
    steps_in_mode: u64,
}

impl ModeEnforcement {
    /// Remind on the first step and every `every_n_steps` thereafter.
    pub fn new(every_n_steps: u64) -> Self {
        Self {
            every_n_steps: every_n_steps.max(1),
            steps_in_mode: 0,
        }
    }
}

#[async_trait]
impl Middleware for ModeEnforcement {
    fn name(&self) -> &str {
        "mode-enforcement"
    }

    async fn before_turn(&mut self, ctx: &TurnContext<'_>) -> Decision {
        if !ctx.config.mode.read_only {
            self.steps_in_mode = 0;
            return Decision::Continue;
        }
        self.steps_in_mode += 1;
        if (self.steps_in_mode - 1) % self.every_n_steps == 0 {
            return Decision::Inject(format!(
                "Reminder: {} mode is active. Do not modify files or run \
                 commands with side effects.",
                ctx.config.mode.name
            ));
        }
        Decision::Continue
    }

    fn reset(&mut self, _reason: ResetReason) {
        self.steps_in_mode = 0;
    }
}
