//! Session ownership, mode switching, and persistence.
//!
//! The [`SessionSupervisor`] is the sole owner of the [`Conversation`] and
//! [`Stats`]; the agent loop borrows them only for the duration of one
//! [`act`](SessionSupervisor::act) call, so `act` calls on the same session
//! serialize naturally through `&mut self`. Mode switches and configuration
//! reloads are applied at turn boundaries, never mid-turn.
//!
//! Sessions persist as one JSON file per session id:
//!
//! ```json
//! {
//!   "metadata": {"session_id": "...", "start_time": "...", "end_time": "...", "environment": "..."},
//!   "messages": [...],
//!   "stats": {...},
//!   "config_snapshot": {...}
//! }
//! ```
//!
//! A session gets a fresh id on [`clear`](SessionSupervisor::clear) and on
//! compaction; the outgoing conversation is written under the old id first.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::codemind::agent::{AgentLoop, NullPersister, SessionPersister, TurnOutcome, TurnState};
use crate::codemind::backend::LlmClient;
use crate::codemind::config::{AgentProfile, Mode, RuntimeConfig};
use crate::codemind::conversation::{Conversation, Stats};
use crate::codemind::error::AgentError;
use crate::codemind::event::{EventHandler, NullEventHandler};
use crate::codemind::message::Message;
use crate::codemind::middleware::{MiddlewarePipeline, ResetReason};
use crate::codemind::permission::{ApprovalHandler, ApproveAll};
use crate::codemind::tool_host::ToolHost;

/// Mint a fresh session identifier.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Everything a persisted session file carries.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionFile {
    pub metadata: SessionMetadata,
    pub messages: Vec<Message>,
    pub stats: Stats,
    pub config_snapshot: RuntimeConfig,
}

/// Identity and timing of a persisted session.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Host environment tag (OS family).
    pub environment: String,
}

/// Writes session files under a directory, one per session id.
///
/// Shared between the supervisor (clear/reload persistence) and the agent
/// loop (pre-compaction persistence), so it carries the mutable bits of the
/// file that the loop does not know about: start time and the live config
/// snapshot.
pub struct FileSessionStore {
    dir: PathBuf,
    environment: String,
    start_time: std::sync::Mutex<DateTime<Utc>>,
    config: std::sync::Mutex<RuntimeConfig>,
}

impl FileSessionStore {
    /// Store sessions under `dir` (created on first write).
    pub fn new(dir: impl Into<PathBuf>, config: RuntimeConfig) -> Self {
        Self {
            dir: dir.into(),
            environment: std::env::consts::OS.to_string(),
            start_time: std::sync::Mutex::new(Utc::now()),
            config: std::sync::Mutex::new(config),
        }
    }

    /// Record that a new session began now (after clear or compaction).
    pub fn mark_session_start(&self) {
        *self.start_time.lock().expect("store lock") = Utc::now();
    }

    /// Replace the config snapshot written into future session files.
    pub fn set_config(&self, config: RuntimeConfig) {
        *self.config.lock().expect("store lock") = config;
    }

    /// Path of the file for `session_id`.
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    fn write(&self, session_id: &str, messages: &[Message], stats: &Stats) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let file = SessionFile {
            metadata: SessionMetadata {
                session_id: session_id.to_string(),
                start_time: *self.start_time.lock().expect("store lock"),
                end_time: Some(Utc::now()),
                environment: self.environment.clone(),
            },
            messages: messages.to_vec(),
            stats: stats.clone(),
            config_snapshot: self.config.lock().expect("store lock").clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        std::fs::write(self.path_for(session_id), json)
    }

    /// Read a persisted session back.
    pub fn load(&self, session_id: &str) -> std::io::Result<SessionFile> {
        let text = std::fs::read_to_string(self.path_for(session_id))?;
        serde_json::from_str(&text).map_err(|e| std::io::Error::other(e.to_string()))
    }
}

#[async_trait]
impl SessionPersister for FileSessionStore {
    async fn persist(&self, session_id: &str, messages: &[Message], stats: &Stats) {
        if let Err(e) = self.write(session_id, messages, stats) {
            log::error!("failed to persist session {session_id}: {e}");
        }
    }
}

/// Owns one conversation and everything needed to advance it.
pub struct SessionSupervisor {
    client: Arc<dyn LlmClient>,
    profile: AgentProfile,
    config: RuntimeConfig,
    conversation: Conversation,
    stats: Stats,
    session_id: String,
    pipeline: MiddlewarePipeline,
    tool_host: ToolHost,
    approval: Arc<dyn ApprovalHandler>,
    events: Arc<dyn EventHandler>,
    store: Option<Arc<FileSessionStore>>,
    /// Mode installed by `switch_mode`, applied at the next turn boundary.
    pending_mode: Option<Mode>,
}

impl SessionSupervisor {
    /// Create a session for the given backend, profile, and config.
    pub fn new(client: Arc<dyn LlmClient>, profile: AgentProfile, config: RuntimeConfig) -> Self {
        let config = config.with_profile(&profile);
        Self {
            client,
            conversation: Conversation::new(profile.system_prompt.as_str()),
            profile,
            config,
            stats: Stats::default(),
            session_id: new_session_id(),
            pipeline: MiddlewarePipeline::new(),
            tool_host: ToolHost::new(),
            approval: Arc::new(ApproveAll),
            events: Arc::new(NullEventHandler),
            store: None,
            pending_mode: None,
        }
    }

    /// Install the tool host (builder pattern).
    pub fn with_tool_host(mut self, tool_host: ToolHost) -> Self {
        self.tool_host = tool_host;
        self
    }

    /// Install the middleware pipeline (builder pattern).
    pub fn with_pipeline(mut self, pipeline: MiddlewarePipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Install the approval callback (builder pattern).
    pub fn with_approval_handler(mut self, approval: Arc<dyn ApprovalHandler>) -> Self {
        self.approval = approval;
        self
    }

    /// Install the event observer (builder pattern).
    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    /// Persist sessions under `dir` (builder pattern).
    pub fn with_sessions_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.store = Some(Arc::new(FileSessionStore::new(
            dir.as_ref().to_path_buf(),
            self.config.clone(),
        )));
        self
    }

    /// The current session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Read-only view of the conversation.
    pub fn messages(&self) -> &[Message] {
        self.conversation.messages()
    }

    /// Read-only view of the session counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// The frozen config the next turn will run against.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Mutable access to the tool host, for registration at startup.
    pub fn tool_host_mut(&mut self) -> &mut ToolHost {
        &mut self.tool_host
    }

    fn persister(&self) -> Arc<dyn SessionPersister> {
        match &self.store {
            Some(store) => store.clone(),
            None => Arc::new(NullPersister),
        }
    }

    fn agent(&self) -> AgentLoop {
        AgentLoop::new(
            self.client.clone(),
            self.approval.clone(),
            self.events.clone(),
            self.persister(),
        )
    }

    /// Apply changes queued for the next turn boundary.
    fn apply_pending(&mut self) {
        if let Some(mode) = self.pending_mode.take() {
            log::debug!("switching mode to {:?}", mode.name);
            self.config.mode = mode;
            if let Some(store) = &self.store {
                store.set_config(self.config.clone());
            }
        }
    }

    /// Run one user turn. Events flow to the registered handler.
    pub async fn act(&mut self, user_text: &str) -> Result<TurnOutcome, AgentError> {
        self.act_cancellable(user_text, CancellationToken::new())
            .await
    }

    /// Run one user turn with an external cancellation signal.
    pub async fn act_cancellable(
        &mut self,
        user_text: &str,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        self.apply_pending();
        let agent = self.agent();
        let outcome = {
            let mut state = TurnState {
                conversation: &mut self.conversation,
                stats: &mut self.stats,
                session_id: &mut self.session_id,
                pipeline: &mut self.pipeline,
            };
            agent
                .act(user_text, &mut state, &self.config, &self.tool_host, cancel)
                .await?
        };
        if outcome.compactions > 0 {
            if let Some(store) = &self.store {
                store.mark_session_start();
            }
        }
        Ok(outcome)
    }

    /// Install a mode overlay at the next turn boundary.
    pub fn switch_mode(&mut self, mode: Mode) {
        self.pending_mode = Some(mode);
    }

    /// Compact the conversation now, outside any turn.
    ///
    /// Returns `true` when the summary succeeded and the session id rotated;
    /// on failure the conversation is retained and a diagnostic event is
    /// emitted.
    pub async fn compact(&mut self) -> bool {
        let agent = self.agent();
        let estimated = self.conversation.estimated_tokens();
        let mut state = TurnState {
            conversation: &mut self.conversation,
            stats: &mut self.stats,
            session_id: &mut self.session_id,
            pipeline: &mut self.pipeline,
        };
        let compacted = agent.compact(&mut state, &self.config, estimated).await;
        if compacted {
            if let Some(store) = &self.store {
                store.mark_session_start();
            }
        }
        compacted
    }

    /// Persist the current session, install a new config snapshot, rebuild
    /// the system message, and keep the session id and history.
    pub async fn reload(&mut self, config: RuntimeConfig) {
        self.persist_current().await;
        self.config = config.with_profile(&self.profile);
        self.conversation
            .set_system_message(self.profile.system_prompt.as_str());
        if let Some(store) = &self.store {
            store.set_config(self.config.clone());
        }
    }

    /// Persist the current session, reset to `[system]`, mint a new session
    /// id, reset the stats, and broadcast `reset(Stop)` to the middlewares.
    pub async fn clear(&mut self) {
        self.persist_current().await;
        self.conversation = Conversation::new(self.profile.system_prompt.as_str());
        self.stats = Stats::default();
        self.session_id = new_session_id();
        self.pipeline.reset_all(ResetReason::Stop);
        if let Some(store) = &self.store {
            store.mark_session_start();
        }
    }

    async fn persist_current(&self) {
        self.persister()
            .persist(&self.session_id, self.conversation.messages(), &self.stats)
            .await;
    }

    /// Release external resources (tool-server children).
    pub async fn dispose(&mut self) {
        self.tool_host.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codemind::adapters::CompletionRequest;
    use crate::codemind::backend::CompletionStream;
    use crate::codemind::message::Usage;

    /// A client that must never be called.
    struct UnusedClient;

    #[async_trait]
    impl LlmClient for UnusedClient {
        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<(Message, Usage), AgentError> {
            panic!("client should not be called");
        }
        async fn complete_stream(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionStream, AgentError> {
            panic!("client should not be called");
        }
        fn provider_name(&self) -> &str {
            "unused"
        }
    }

    fn supervisor(dir: &Path) -> SessionSupervisor {
        SessionSupervisor::new(
            Arc::new(UnusedClient),
            AgentProfile::new("main", "gpt-4.1"),
            RuntimeConfig::new("gpt-4.1", "openai", "https://api.openai.com/v1"),
        )
        .with_sessions_dir(dir)
    }

    #[tokio::test]
    async fn clear_rotates_id_and_persists_old_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = supervisor(dir.path());
        let old_id = supervisor.session_id().to_string();

        supervisor.conversation.append(Message::user("hello"));
        supervisor.conversation.append(Message::assistant("hi"));
        supervisor.clear().await;

        assert_ne!(supervisor.session_id(), old_id);
        assert_eq!(supervisor.messages().len(), 1);

        let store = supervisor.store.as_ref().unwrap();
        let persisted = store.load(&old_id).unwrap();
        assert_eq!(persisted.metadata.session_id, old_id);
        assert_eq!(persisted.messages.len(), 3);
        assert!(persisted.metadata.end_time.is_some());
    }

    #[tokio::test]
    async fn reload_keeps_id_and_non_system_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = supervisor(dir.path());
        let id = supervisor.session_id().to_string();
        supervisor.conversation.append(Message::user("hello"));

        let mut new_config =
            RuntimeConfig::new("gpt-4.1-mini", "openai", "https://api.openai.com/v1");
        new_config.temperature = 0.2;
        supervisor.reload(new_config).await;

        assert_eq!(supervisor.session_id(), id);
        assert_eq!(supervisor.messages().len(), 2);
        assert_eq!(supervisor.messages()[1].content_str(), "hello");
        // Profile overlay still applies on top of the reloaded snapshot.
        assert_eq!(supervisor.config().model, "gpt-4.1");
    }

    #[tokio::test]
    async fn switch_mode_applies_at_next_turn_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = supervisor(dir.path());
        assert_eq!(supervisor.config().mode.name, "default");

        supervisor.switch_mode(Mode::read_only());
        assert_eq!(supervisor.config().mode.name, "default");

        supervisor.apply_pending();
        assert_eq!(supervisor.config().mode.name, "read-only");
    }

    #[test]
    fn session_file_round_trips() {
        let file = SessionFile {
            metadata: SessionMetadata {
                session_id: new_session_id(),
                start_time: Utc::now(),
                end_time: None,
                environment: "linux".to_string(),
            },
            messages: vec![Message::system("sys"), Message::user("hello")],
            stats: Stats::default(),
            config_snapshot: RuntimeConfig::new("m", "openai", "https://x"),
        };
        let json = serde_json::to_string(&file).unwrap();
        let restored: SessionFile = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.messages, file.messages);
        assert_eq!(restored.metadata.session_id, file.metadata.session_id);
    }
}
