//! The agent loop: one user turn from input to quiescence.
//!
//! [`AgentLoop::act`] drives the full cycle for a single user message:
//!
//! 1. Append the user message.
//! 2. Repeat: run the before-turn middlewares (applying any injected text to
//!    the last user message, honoring stop/compact), request a completion
//!    (streaming when configured), append the assistant message, dispatch
//!    its tool calls in declared order through the permission engine and
//!    tool host, append one tool message per call, run the after-turn
//!    middlewares. Keep going while the tail of the conversation is a
//!    tool result.
//!
//! The loop upholds the runtime's structural invariants: every announced
//! tool call is paired with exactly one following tool message before the
//! next completion is requested, the conversation never ends on a tool
//! message after a normal return, and events are emitted in declared order.
//!
//! # Cancellation
//!
//! `act` takes a [`CancellationToken`]. On cancellation the in-flight
//! completion or tool call is abandoned, any partial assistant message is
//! finalized and appended, and every announced-but-unexecuted tool call
//! receives a synthetic "cancelled" result, in declared order, so the
//! pairing invariant survives. A diagnostic event is emitted and the turn
//! returns with `incomplete = true`.
//!
//! # Compaction
//!
//! A `Compact` signal (from the auto-compact middleware or an explicit
//! request) summarizes the conversation through the same backend with
//! streaming disabled and tools cleared, persists the old conversation
//! under the old session id, replaces the log with
//! `[system, assistant(summary)]`, mints a new session id, and resets the
//! middlewares. If the summary call fails the original conversation is
//! retained, a diagnostic is emitted, and the turn continues.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::codemind::adapters::{CompletionRequest, ToolChoice, ToolSchema};
use crate::codemind::backend::{LlmClient, StreamAccumulator};
use crate::codemind::config::RuntimeConfig;
use crate::codemind::conversation::{Conversation, Stats};
use crate::codemind::error::{AgentError, ToolError};
use crate::codemind::event::{AgentEvent, EventHandler, ToolOutcome};
use crate::codemind::message::{Message, Role, ToolCall, Usage};
use crate::codemind::middleware::{
    MiddlewarePipeline, PipelineSignal, ResetReason, TurnContext,
};
use crate::codemind::permission::{ApprovalHandler, PermissionDecision, PermissionEngine};
use crate::codemind::tool_host::ToolHost;

/// Streamed assistant/reasoning batches are flushed after this many chunks
/// (and at stream end) to amortize observer cost.
const EVENT_BATCH_CHUNKS: usize = 5;

/// Persistence hook invoked when a conversation is snapshotted to disk
/// (compaction rotates the session id right after).
#[async_trait]
pub trait SessionPersister: Send + Sync {
    /// Persist `messages` and `stats` under `session_id`.
    async fn persist(&self, session_id: &str, messages: &[Message], stats: &Stats);
}

/// A persister that drops everything. Useful in tests and ephemeral runs.
pub struct NullPersister;

#[async_trait]
impl SessionPersister for NullPersister {
    async fn persist(&self, _session_id: &str, _messages: &[Message], _stats: &Stats) {}
}

/// The mutable session state a turn borrows.
///
/// The session supervisor owns all four exclusively; the loop holds this
/// borrow only while `act` runs and mutates it only between awaits.
pub struct TurnState<'a> {
    pub conversation: &'a mut Conversation,
    pub stats: &'a mut Stats,
    pub session_id: &'a mut String,
    pub pipeline: &'a mut MiddlewarePipeline,
}

/// How a turn ended.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    /// A middleware stopped the turn.
    pub stopped_by_middleware: bool,
    /// The stop reason, when stopped.
    pub stop_reason: Option<String>,
    /// The turn ended early: stream truncation or cancellation.
    pub incomplete: bool,
    /// Number of compactions performed during the turn.
    pub compactions: u32,
}

/// Result of one completion call, streaming or not.
struct StepResult {
    message: Message,
    usage: Usage,
    truncated: bool,
    cancelled: bool,
    /// Whether assistant/reasoning events were already emitted while
    /// streaming (non-streaming steps emit after the fact).
    events_emitted: bool,
}

/// Orchestrates turns against one backend, tool host, and observer.
pub struct AgentLoop {
    client: Arc<dyn LlmClient>,
    approval: Arc<dyn ApprovalHandler>,
    events: Arc<dyn EventHandler>,
    persister: Arc<dyn SessionPersister>,
}

impl AgentLoop {
    /// Wire up the loop's collaborators.
    pub fn new(
        client: Arc<dyn LlmClient>,
        approval: Arc<dyn ApprovalHandler>,
        events: Arc<dyn EventHandler>,
        persister: Arc<dyn SessionPersister>,
    ) -> Self {
        Self {
            client,
            approval,
            events,
            persister,
        }
    }

    async fn emit(&self, event: AgentEvent) {
        self.events.on_event(&event).await;
    }

    /// Execute one user turn. See the module docs for the full algorithm.
    pub async fn act(
        &self,
        user_message: &str,
        state: &mut TurnState<'_>,
        config: &RuntimeConfig,
        tool_host: &ToolHost,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let turn_started = Instant::now();
        let mut outcome = TurnOutcome::default();

        state.conversation.append(Message::user(user_message));

        loop {
            let schemas = tool_host.schemas(&config.mode);

            // Before-turn middlewares.
            let estimated = self
                .client
                .count_tokens(state.conversation.messages(), &schemas);
            let pass = {
                let ctx = TurnContext {
                    messages: state.conversation.messages(),
                    stats: state.stats,
                    config,
                    estimated_tokens: estimated,
                };
                state.pipeline.run_before(&ctx).await
            };
            match pass.signal {
                PipelineSignal::Stop(reason) => {
                    self.finish_stopped(&mut outcome, reason).await;
                    break;
                }
                PipelineSignal::Compact => {
                    if self.compact(state, config, estimated).await {
                        outcome.compactions += 1;
                    }
                    continue;
                }
                PipelineSignal::Continue => {
                    if let Some(text) = pass.injected {
                        apply_injection(state.conversation, &text);
                    }
                }
            }

            // The completion step.
            let request = CompletionRequest {
                model: config.model.clone(),
                messages: state.conversation.messages().to_vec(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                tools: schemas,
                tool_choice: ToolChoice::Auto,
                streaming: config.streaming,
            };
            let step = if config.streaming {
                self.streamed_step(&request, &cancel).await?
            } else {
                self.blocking_step(&request, &cancel).await?
            };

            state.stats.record_step(step.usage, &config.pricing);
            let assistant = step.message.clone();
            state.conversation.append(step.message);

            if !step.events_emitted {
                if let Some(reasoning) = &assistant.reasoning {
                    self.emit(AgentEvent::Reasoning {
                        content: reasoning.clone(),
                    })
                    .await;
                }
                self.emit(AgentEvent::Assistant {
                    content: assistant.content_str().to_string(),
                    stopped_by_middleware: false,
                    stop_reason: None,
                })
                .await;
            }

            if step.cancelled || step.truncated {
                let reason = if step.cancelled {
                    "cancelled"
                } else {
                    "stream interrupted"
                };
                self.append_synthetic_results(state, &assistant.tool_calls, 0, reason)
                    .await;
                self.emit(AgentEvent::Diagnostic {
                    message: format!("turn incomplete: {reason}"),
                })
                .await;
                outcome.incomplete = true;
                break;
            }

            if assistant.tool_calls.is_empty() {
                break;
            }

            // Dispatch every announced call, in declared order.
            let all_dispatched = self
                .dispatch_tool_calls(&assistant.tool_calls, state, config, tool_host, &cancel)
                .await;
            if !all_dispatched {
                self.emit(AgentEvent::Diagnostic {
                    message: "turn incomplete: cancelled".to_string(),
                })
                .await;
                outcome.incomplete = true;
                break;
            }

            // After-turn middlewares.
            let estimated = self.client.count_tokens(state.conversation.messages(), &[]);
            let signal = {
                let ctx = TurnContext {
                    messages: state.conversation.messages(),
                    stats: state.stats,
                    config,
                    estimated_tokens: estimated,
                };
                state.pipeline.run_after(&ctx).await
            };
            match signal {
                PipelineSignal::Stop(reason) => {
                    self.finish_stopped(&mut outcome, reason).await;
                    break;
                }
                PipelineSignal::Compact => {
                    if self.compact(state, config, estimated).await {
                        outcome.compactions += 1;
                    }
                }
                PipelineSignal::Continue => {}
            }

            // Keep looping only while the tail is a tool result awaiting the
            // model's next move.
            if state.conversation.last().role != Role::Tool {
                break;
            }
        }

        state.stats.record_turn(turn_started.elapsed());
        Ok(outcome)
    }

    async fn finish_stopped(&self, outcome: &mut TurnOutcome, reason: String) {
        self.emit(AgentEvent::Assistant {
            content: String::new(),
            stopped_by_middleware: true,
            stop_reason: Some(reason.clone()),
        })
        .await;
        outcome.stopped_by_middleware = true;
        outcome.stop_reason = Some(reason);
    }

    /// Non-streaming completion, racing cancellation.
    async fn blocking_step(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<StepResult, AgentError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(StepResult {
                message: Message::assistant(""),
                usage: Usage::default(),
                truncated: false,
                cancelled: true,
                events_emitted: true, // nothing to emit
            }),
            completed = self.client.complete(request) => {
                let (message, usage) = completed?;
                Ok(StepResult {
                    message,
                    usage,
                    truncated: false,
                    cancelled: false,
                    events_emitted: false,
                })
            }
        }
    }

    /// Streaming completion with batched event emission.
    async fn streamed_step(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<StepResult, AgentError> {
        let mut stream = self.client.complete_stream(request).await?;

        let mut accumulator = StreamAccumulator::new();
        let mut pending_content = String::new();
        let mut pending_reasoning = String::new();
        let mut chunks_since_flush = 0usize;
        let mut truncated = false;
        let mut cancelled = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(delta)) => {
                        if let Some(content) = &delta.content {
                            pending_content.push_str(content);
                        }
                        if let Some(reasoning) = &delta.reasoning {
                            pending_reasoning.push_str(reasoning);
                        }
                        accumulator.push(delta);
                        chunks_since_flush += 1;
                        if chunks_since_flush >= EVENT_BATCH_CHUNKS {
                            self.flush_batches(&mut pending_reasoning, &mut pending_content)
                                .await;
                            chunks_since_flush = 0;
                        }
                    }
                    Some(Err(err)) => {
                        log::warn!("completion stream failed mid-response: {err}");
                        truncated = true;
                        break;
                    }
                    None => break,
                }
            }
        }

        self.flush_batches(&mut pending_reasoning, &mut pending_content)
            .await;
        let (message, usage) = accumulator.finish();
        Ok(StepResult {
            message,
            usage,
            truncated,
            cancelled,
            events_emitted: true,
        })
    }

    async fn flush_batches(&self, reasoning: &mut String, content: &mut String) {
        if !reasoning.is_empty() {
            self.emit(AgentEvent::Reasoning {
                content: std::mem::take(reasoning),
            })
            .await;
        }
        if !content.is_empty() {
            self.emit(AgentEvent::Assistant {
                content: std::mem::take(content),
                stopped_by_middleware: false,
                stop_reason: None,
            })
            .await;
        }
    }

    /// Execute the announced calls sequentially. Returns `false` when
    /// cancellation cut the sequence short (synthetic results were appended
    /// for everything that did not run).
    async fn dispatch_tool_calls(
        &self,
        calls: &[ToolCall],
        state: &mut TurnState<'_>,
        config: &RuntimeConfig,
        tool_host: &ToolHost,
        cancel: &CancellationToken,
    ) -> bool {
        for (index, call) in calls.iter().enumerate() {
            if cancel.is_cancelled() {
                self.append_synthetic_results(state, calls, index, "cancelled")
                    .await;
                return false;
            }

            self.emit(AgentEvent::ToolCall {
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                tool_call_id: call.id.clone(),
            })
            .await;

            let (outcome, text, duration) = self
                .resolve_tool_call(call, config, tool_host, cancel)
                .await;

            let was_cancelled = cancel.is_cancelled()
                && matches!(&outcome, ToolOutcome::Skipped { reason } if reason == "cancelled");
            if was_cancelled {
                // Record this call as cancelled, then everything after it.
                state
                    .conversation
                    .append(Message::tool(call.id.as_str(), call.name.as_str(), text.as_str()));
                state.stats.record_tool_outcome(false, true);
                self.emit(AgentEvent::ToolResult {
                    tool_name: call.name.clone(),
                    tool_call_id: call.id.clone(),
                    outcome,
                    duration,
                })
                .await;
                self.append_synthetic_results(state, calls, index + 1, "cancelled")
                    .await;
                return false;
            }

            state
                .conversation
                .append(Message::tool(call.id.as_str(), call.name.as_str(), text.as_str()));
            state.stats.record_tool_outcome(
                matches!(outcome, ToolOutcome::Success),
                matches!(outcome, ToolOutcome::Skipped { .. }),
            );
            self.emit(AgentEvent::ToolResult {
                tool_name: call.name.clone(),
                tool_call_id: call.id.clone(),
                outcome,
                duration,
            })
            .await;
        }
        true
    }

    /// Validate, authorize, and execute one call, classifying the outcome.
    async fn resolve_tool_call(
        &self,
        call: &ToolCall,
        config: &RuntimeConfig,
        tool_host: &ToolHost,
        cancel: &CancellationToken,
    ) -> (ToolOutcome, String, Duration) {
        let arguments = match tool_host.validate_arguments(call) {
            Ok(arguments) => arguments,
            Err(err) => {
                let text = err.to_string();
                return (ToolOutcome::Error(text.clone()), text, Duration::ZERO);
            }
        };

        let tool_config = config.tool_config(&call.name);
        let decision = PermissionEngine::evaluate(
            &config.mode,
            &call.name,
            &tool_config,
            &arguments,
            &call.id,
            self.approval.as_ref(),
        )
        .await;
        if let PermissionDecision::Skip { reason } = decision {
            let text = format!("Tool call skipped: {reason}");
            return (ToolOutcome::Skipped { reason }, text, Duration::ZERO);
        }

        let execution = tool_host
            .execute(call, arguments, &tool_config, cancel.clone())
            .await;
        match execution.result {
            Ok(text) => (ToolOutcome::Success, text, execution.duration),
            Err(ToolError::Cancelled) => (
                ToolOutcome::Skipped {
                    reason: "cancelled".to_string(),
                },
                "Tool call skipped: cancelled".to_string(),
                execution.duration,
            ),
            Err(err) => {
                let text = err.to_string();
                (ToolOutcome::Error(text.clone()), text, execution.duration)
            }
        }
    }

    /// Pair every call from `start` onward with a synthetic skipped result.
    async fn append_synthetic_results(
        &self,
        state: &mut TurnState<'_>,
        calls: &[ToolCall],
        start: usize,
        reason: &str,
    ) {
        for call in &calls[start..] {
            state.conversation.append(Message::tool(
                call.id.as_str(),
                call.name.as_str(),
                format!("Tool call skipped: {reason}"),
            ));
            state.stats.record_tool_outcome(false, true);
            self.emit(AgentEvent::ToolCall {
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                tool_call_id: call.id.clone(),
            })
            .await;
            self.emit(AgentEvent::ToolResult {
                tool_name: call.name.clone(),
                tool_call_id: call.id.clone(),
                outcome: ToolOutcome::Skipped {
                    reason: reason.to_string(),
                },
                duration: Duration::ZERO,
            })
            .await;
        }
    }

    /// Summarize and replace the conversation. Returns `true` on success.
    ///
    /// Failure keeps the original conversation and emits a diagnostic; the
    /// turn continues either way.
    pub async fn compact(
        &self,
        state: &mut TurnState<'_>,
        config: &RuntimeConfig,
        trigger_threshold: u64,
    ) -> bool {
        let old_tokens = self
            .client
            .count_tokens(state.conversation.messages(), &[]);
        self.emit(AgentEvent::CompactStart {
            current_tokens: old_tokens,
            threshold: trigger_threshold,
        })
        .await;

        // Summarize m1..mn (excluding the system message) on the same
        // backend, streaming off, tools cleared.
        let mut messages = vec![Message::system(
            "You condense coding-assistant conversations. Preserve decisions, \
             open tasks, file paths, and constraints. Write plain prose.",
        )];
        messages.extend(state.conversation.iter().skip(1).cloned());
        messages.push(Message::user(
            "Summarize the conversation so far so that work can continue \
             seamlessly from the summary alone.",
        ));

        let request = CompletionRequest {
            model: config.model.clone(),
            messages,
            temperature: config.temperature,
            max_tokens: Some(config.compact_summary_tokens),
            tools: Vec::new(),
            tool_choice: ToolChoice::None,
            streaming: false,
        };

        let (summary_message, usage) = match self.client.complete(&request).await {
            Ok(result) => result,
            Err(err) => {
                log::warn!("compaction summary failed: {err}");
                self.emit(AgentEvent::Diagnostic {
                    message: format!("compaction failed, conversation retained: {err}"),
                })
                .await;
                return false;
            }
        };
        state.stats.record_step(usage, &config.pricing);

        let summary = summary_message.content_str().to_string();

        // Persist the pre-compaction conversation under the old id, then
        // rotate.
        self.persister
            .persist(state.session_id, state.conversation.messages(), state.stats)
            .await;
        state
            .conversation
            .replace_tail(vec![Message::assistant(summary.clone())]);
        *state.session_id = uuid::Uuid::new_v4().to_string();
        state.pipeline.reset_all(ResetReason::Compact);

        let new_tokens = self
            .client
            .count_tokens(state.conversation.messages(), &[]);
        self.emit(AgentEvent::CompactEnd {
            old_tokens,
            new_tokens,
            summary_length: summary.len(),
        })
        .await;
        log::debug!("compacted conversation: {old_tokens} -> {new_tokens} estimated tokens");
        true
    }
}

/// Append middleware-injected text to the most recent user message.
///
/// Later rounds of the inner loop may have tool messages at the tail, so
/// the injection walks back to the last `user` entry.
fn apply_injection(conversation: &mut Conversation, text: &str) {
    match conversation.last_user_mut() {
        Some(message) => message.append_content(&format!("\n\n{text}")),
        None => log::debug!("inject requested but no user message present; dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injection_lands_on_last_user_message() {
        let mut conversation = Conversation::new("sys");
        conversation.append(Message::user("original question"));
        conversation.append(Message::assistant_with_tool_calls(
            None,
            vec![ToolCall {
                id: "t1".into(),
                name: "grep".into(),
                arguments: "{}".into(),
            }],
        ));
        conversation.append(Message::tool("t1", "grep", "result"));

        apply_injection(&mut conversation, "context warning");

        let user = conversation
            .iter()
            .find(|m| m.role == Role::User)
            .unwrap();
        assert!(user.content_str().starts_with("original question"));
        assert!(user.content_str().ends_with("context warning"));
        // Tail untouched.
        assert_eq!(conversation.last().role, Role::Tool);
    }

    #[test]
    fn injection_on_tail_user_message() {
        let mut conversation = Conversation::new("sys");
        conversation.append(Message::user("hello"));
        apply_injection(&mut conversation, "note");
        assert_eq!(conversation.last().content_str(), "hello\n\nnote");
    }

    #[test]
    fn injection_without_user_message_is_dropped() {
        let mut conversation = Conversation::new("sys");
        apply_injection(&mut conversation, "note");
        assert_eq!(conversation.len(), 1);
    }
}
