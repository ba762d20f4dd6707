//! Tool registration, argument validation, and execution.
//!
//! The [`ToolHost`] owns every tool the model can call for the lifetime of a
//! session: compiled-in local handlers registered at startup, and proxies
//! for tools discovered on remote tool servers (see
//! [`crate::tool_servers`]). Proxied tools get composite names
//! `{alias}_{tool}` so the model addresses them like any local tool.
//!
//! Execution of one [`ToolCall`] is a fixed pipeline: decode the raw
//! arguments as JSON, validate against the tool's JSON Schema, invoke the
//! handler under the per-call timeout with a cancellation token, and render
//! the result to a string for the `role=tool` message. Every failure along
//! that pipeline is a *recoverable* outcome. The error text is fed back to
//! the model, which routinely self-corrects malformed calls.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use codemind::error::ToolError;
//! use codemind::tool_host::{ToolContext, ToolDefinition, ToolHandler, ToolHost};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ToolHandler for Echo {
//!     async fn execute(
//!         &self,
//!         arguments: serde_json::Value,
//!         _ctx: &ToolContext,
//!     ) -> Result<serde_json::Value, ToolError> {
//!         Ok(arguments["text"].clone())
//!     }
//! }
//!
//! let mut host = ToolHost::new();
//! host.register_local(ToolDefinition {
//!     name: "echo".to_string(),
//!     description: "Echoes its input".to_string(),
//!     schema: serde_json::json!({
//!         "type": "object",
//!         "properties": {"text": {"type": "string"}},
//!         "required": ["text"]
//!     }),
//!     handler: Arc::new(Echo),
//! }).unwrap();
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::codemind::adapters::ToolSchema;
use crate::codemind::config::{Mode, ToolConfig};
use crate::codemind::error::{AgentError, ToolError};
use crate::codemind::message::ToolCall;
use crate::codemind::tool_servers::ToolServer;

lazy_static! {
    static ref LOCAL_NAME: Regex = Regex::new(r"^[a-z][a-z0-9_]*$").expect("static regex");
    static ref SERVER_ALIAS: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex");
}

/// Rendered tool outputs beyond this size are cut with a marker.
const MAX_RESULT_BYTES: usize = 16 * 1024;

/// Marker appended to truncated tool output.
const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Per-call context handed to tool handlers.
pub struct ToolContext {
    /// Working directory from the tool's configuration.
    pub workdir: Option<PathBuf>,
    /// Cooperative cancellation; long-running handlers must honor it.
    pub cancel: CancellationToken,
}

/// A single tool's implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool with schema-validated arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError>;
}

/// A local tool ready for registration.
pub struct ToolDefinition {
    /// Unique name matching `[a-z][a-z0-9_]*`.
    pub name: String,
    /// Description surfaced to the model.
    pub description: String,
    /// JSON Schema for the arguments object.
    pub schema: serde_json::Value,
    /// The implementation.
    pub handler: Arc<dyn ToolHandler>,
}

/// Where a registered tool's invocations go.
enum ToolRoute {
    Local(Arc<dyn ToolHandler>),
    Proxied {
        server: Arc<dyn ToolServer>,
        remote_name: String,
    },
}

struct RegisteredTool {
    description: String,
    schema: serde_json::Value,
    validator: jsonschema::Validator,
    route: ToolRoute,
}

/// The outcome of dispatching one tool call.
pub struct ToolExecution {
    /// Rendered result text, or the recoverable error.
    pub result: Result<String, ToolError>,
    /// Wall-clock execution time (zero for validation failures).
    pub duration: Duration,
}

/// Registry and executor for every tool exposed to the model.
///
/// Owned by the session; tool instances live as long as the host and may
/// keep their own scoped state. Remote server children are terminated when
/// [`ToolHost::dispose`] runs.
pub struct ToolHost {
    tools: HashMap<String, RegisteredTool>,
    servers: Vec<(String, Arc<dyn ToolServer>)>,
}

impl ToolHost {
    /// An empty host.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            servers: Vec::new(),
        }
    }

    /// Register a compiled-in tool.
    ///
    /// Fails on an invalid name, a duplicate name, or an uncompilable
    /// schema. All of these are configuration mistakes, reported at startup.
    pub fn register_local(&mut self, definition: ToolDefinition) -> Result<(), AgentError> {
        if !LOCAL_NAME.is_match(&definition.name) {
            return Err(AgentError::Registration(format!(
                "invalid local tool name {:?} (expected [a-z][a-z0-9_]*)",
                definition.name
            )));
        }
        self.insert_tool(
            definition.name,
            definition.description,
            definition.schema,
            ToolRoute::Local(definition.handler),
        )
    }

    /// Connect a remote tool server and register every tool it advertises.
    ///
    /// Enumeration is bounded by `startup_timeout`. Each remote tool is
    /// registered under the composite name `{alias}_{tool}` and proxies its
    /// invocations through the server handle.
    pub async fn add_server(
        &mut self,
        alias: &str,
        server: Arc<dyn ToolServer>,
        startup_timeout: Duration,
    ) -> Result<usize, AgentError> {
        if !SERVER_ALIAS.is_match(alias) {
            return Err(AgentError::Registration(format!(
                "invalid tool server alias {alias:?} (expected [A-Za-z0-9_-]+)"
            )));
        }

        let specs = tokio::time::timeout(startup_timeout, server.list_tools())
            .await
            .map_err(|_| {
                AgentError::Registration(format!(
                    "tool server {alias:?} did not enumerate within {startup_timeout:?}"
                ))
            })?
            .map_err(|e| {
                AgentError::Registration(format!("tool server {alias:?} enumeration failed: {e}"))
            })?;

        let count = specs.len();
        for spec in specs {
            let composite = format!("{alias}_{}", spec.name);
            self.insert_tool(
                composite,
                spec.description,
                spec.input_schema,
                ToolRoute::Proxied {
                    server: Arc::clone(&server),
                    remote_name: spec.name,
                },
            )?;
        }
        log::debug!("tool server {alias:?} registered {count} tools");
        self.servers.push((alias.to_string(), server));
        Ok(count)
    }

    fn insert_tool(
        &mut self,
        name: String,
        description: String,
        schema: serde_json::Value,
        route: ToolRoute,
    ) -> Result<(), AgentError> {
        if self.tools.contains_key(&name) {
            return Err(AgentError::Registration(format!(
                "duplicate tool name {name:?}"
            )));
        }
        let validator = jsonschema::validator_for(&schema).map_err(|e| {
            AgentError::Registration(format!("tool {name:?} has an invalid schema: {e}"))
        })?;
        self.tools.insert(
            name,
            RegisteredTool {
                description,
                schema,
                validator,
                route,
            },
        );
        Ok(())
    }

    /// True when the host knows `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Export the schemas of the tools enabled under `mode`, sorted by name
    /// so the exported array is stable across turns.
    pub fn schemas(&self, mode: &Mode) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .iter()
            .filter(|(name, _)| mode.tool_enabled(name))
            .map(|(name, tool)| ToolSchema {
                name: name.clone(),
                description: tool.description.clone(),
                parameters: tool.schema.clone(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Decode and validate a call's arguments without executing it.
    ///
    /// The permission engine needs the parsed arguments before execution is
    /// authorized, so this step is exposed separately from [`execute`](Self::execute).
    pub fn validate_arguments(&self, call: &ToolCall) -> Result<serde_json::Value, ToolError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;

        let arguments: serde_json::Value = serde_json::from_str(&call.arguments)
            .map_err(|e| ToolError::InvalidArguments(format!("invalid JSON arguments: {e}")))?;

        if let Err(violation) = tool.validator.validate(&arguments) {
            return Err(ToolError::SchemaViolation(violation.to_string()));
        }
        Ok(arguments)
    }

    /// Execute a validated call.
    ///
    /// Runs the handler (or the remote proxy) under `config.timeout`,
    /// honoring `cancel`. Proxied transport failures are retried once before
    /// surfacing as an error result.
    pub async fn execute(
        &self,
        call: &ToolCall,
        arguments: serde_json::Value,
        config: &ToolConfig,
        cancel: CancellationToken,
    ) -> ToolExecution {
        let started = Instant::now();
        let Some(tool) = self.tools.get(&call.name) else {
            return ToolExecution {
                result: Err(ToolError::UnknownTool(call.name.clone())),
                duration: started.elapsed(),
            };
        };

        let ctx = ToolContext {
            workdir: config.workdir.clone(),
            cancel: cancel.clone(),
        };

        let invocation = Self::route_call(&tool.route, &arguments, &ctx);
        // A handler that finished before cancellation was observed keeps its
        // result; cancellation only interrupts pending work.
        let result = tokio::select! {
            biased;
            timed = tokio::time::timeout(config.timeout, invocation) => match timed {
                Ok(result) => result,
                Err(_) => Err(ToolError::Timeout(config.timeout)),
            },
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
        };

        ToolExecution {
            result: result.map(|value| render_result(&value)),
            duration: started.elapsed(),
        }
    }

    async fn route_call(
        route: &ToolRoute,
        arguments: &serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        match route {
            ToolRoute::Local(handler) => handler.execute(arguments.clone(), ctx).await,
            ToolRoute::Proxied {
                server,
                remote_name,
            } => {
                match server.call_tool(remote_name, arguments).await {
                    Err(ToolError::Server(first)) if !server.retries_internally() => {
                        log::warn!(
                            "proxied tool {remote_name:?} failed ({first}), retrying once"
                        );
                        server.call_tool(remote_name, arguments).await
                    }
                    other => other,
                }
            }
        }
    }

    /// Shut down every remote tool server. Safe to call more than once.
    pub async fn dispose(&mut self) {
        for (alias, server) in self.servers.drain(..) {
            log::debug!("shutting down tool server {alias:?}");
            server.shutdown().await;
        }
    }
}

impl Default for ToolHost {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a handler's JSON result to the text stored in the tool message.
///
/// Bare strings are used as-is; structured values are pretty-printed.
/// Output beyond [`MAX_RESULT_BYTES`] is cut at a character boundary and
/// marked.
fn render_result(value: &serde_json::Value) -> String {
    let mut text = match value {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    if text.len() > MAX_RESULT_BYTES {
        let mut cut = MAX_RESULT_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str(TRUNCATION_MARKER);
    }
    text
}
