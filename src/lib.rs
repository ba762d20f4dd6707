// src/lib.rs

// Import the top-level `codemind` module.
pub mod codemind;

// Re-exporting key items so applications can reach the common surface
// without navigating the whole module hierarchy.
pub use codemind::adapters;
pub use codemind::agent;
pub use codemind::backend;
pub use codemind::config;
pub use codemind::conversation;
pub use codemind::error;
pub use codemind::event;
pub use codemind::message;
pub use codemind::middleware;
pub use codemind::permission;
pub use codemind::session;
pub use codemind::tool_host;
pub use codemind::tool_servers;
pub use codemind::transport;

pub use codemind::agent::AgentLoop;
pub use codemind::backend::{LlmBackend, LlmClient};
pub use codemind::message::{Message, Role, ToolCall, Usage};
pub use codemind::session::SessionSupervisor;
