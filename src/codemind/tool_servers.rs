//! Remote tool-server proxies: HTTP and subprocess (stdio) transports.
//!
//! A [`ToolServer`] is an external source of tools the host enumerates once
//! at registration (`tools/list`) and then invokes per call (`tools/call`).
//! Both transports speak the same JSON-RPC envelope:
//!
//! ```text
//! → {"id": 1, "method": "tools/list", "params": {}}
//! ← {"id": 1, "result": [{"name": "...", "description": "...", "input_schema": {...}}]}
//! → {"id": 2, "method": "tools/call", "params": {"name": "...", "arguments": {...}}}
//! ← {"id": 2, "result": ...}   or   {"id": 2, "error": {"code": -32000, "message": "..."}}
//! ```
//!
//! [`HttpToolServer`] POSTs one envelope per request. [`StdioToolServer`]
//! owns a child process and exchanges newline-delimited envelopes over its
//! stdin/stdout, multiplexing concurrent requests by id; child stderr lines
//! are forwarded to the log. A child that dies is respawned lazily; the
//! *host* grants one restart per tool call, and disposal escalates from
//! closing stdin to killing the process after a grace period.
//!
//! Error mapping: transport-level failures (connection refused, child
//! exited, bad status) become [`ToolError::Server`], the retryable kind,
//! while a JSON-RPC `error` envelope is an application failure and becomes
//! [`ToolError::Execution`].

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};

use crate::codemind::error::ToolError;
use crate::codemind::transport::shared_http_client;

/// One tool advertised by a remote server.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    json!({"type": "object"})
}

/// A source of remotely hosted tools.
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Enumerate the server's tools.
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, ToolError>;

    /// Invoke one tool by its remote (un-prefixed) name.
    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value, ToolError>;

    /// Release the server's resources. Must be safe on every path.
    async fn shutdown(&self);

    /// Transport label for logs (`"http"`, `"stdio"`).
    fn transport_name(&self) -> &str;

    /// True when `call_tool` already retries transport failures itself, so
    /// the host must not layer its own retry on top (the subprocess
    /// transport restarts its child at most once per call).
    fn retries_internally(&self) -> bool {
        false
    }
}

fn parse_tool_list(result: Value) -> Result<Vec<RemoteToolSpec>, ToolError> {
    serde_json::from_value(result)
        .map_err(|e| ToolError::Server(format!("malformed tools/list result: {e}")))
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// Tool server reached over HTTP: one POSTed envelope per request.
pub struct HttpToolServer {
    endpoint: String,
    client: reqwest::Client,
    call_timeout: Duration,
}

impl HttpToolServer {
    /// Point at a server's invocation endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: shared_http_client().clone(),
            call_timeout: Duration::from_secs(60),
        }
    }

    /// Override the per-invocation timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        let body = json!({"method": method, "params": params});
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.call_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::Server(format!("{method} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ToolError::Server(format!(
                "{method} returned HTTP {status}: {text}"
            )));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| ToolError::Server(format!("{method} response unreadable: {e}")))?;

        if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            let message = error["message"].as_str().unwrap_or("unknown error");
            return Err(ToolError::Execution(message.to_string()));
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ToolServer for HttpToolServer {
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, ToolError> {
        let result = self.request("tools/list", json!({})).await?;
        parse_tool_list(result)
    }

    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value, ToolError> {
        self.request("tools/call", json!({"name": name, "arguments": arguments}))
            .await
    }

    async fn shutdown(&self) {}

    fn transport_name(&self) -> &str {
        "http"
    }
}

// ---------------------------------------------------------------------------
// JSON-RPC peer (shared by the stdio transport and its tests)
// ---------------------------------------------------------------------------

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, ToolError>>>>>;

/// One line-delimited JSON-RPC connection: a writer guarded for concurrent
/// senders and a reader task routing responses to waiters by id.
struct JsonRpcPeer {
    writer: Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl JsonRpcPeer {
    /// Start the peer over an arbitrary byte pipe pair.
    fn start(
        reader: impl AsyncRead + Unpin + Send + 'static,
        writer: impl AsyncWrite + Unpin + Send + 'static,
    ) -> Arc<Self> {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let peer = Arc::new(Self {
            writer: Mutex::new(Box::new(writer)),
            pending: Arc::clone(&pending),
            next_id: AtomicU64::new(1),
            closed: Arc::clone(&closed),
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(envelope) => {
                                Self::route_response(&pending, envelope).await;
                            }
                            Err(e) => {
                                log::warn!("tool server sent unparseable line: {e}");
                            }
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            closed.store(true, Ordering::SeqCst);
            // Fail everything still waiting; the connection is gone.
            let mut pending = pending.lock().await;
            for (_, waiter) in pending.drain() {
                let _ = waiter.send(Err(ToolError::Server(
                    "tool server connection closed".to_string(),
                )));
            }
        });

        peer
    }

    async fn route_response(pending: &PendingMap, envelope: Value) {
        let Some(id) = envelope["id"].as_u64() else {
            log::warn!("tool server response without id: {envelope}");
            return;
        };
        let Some(waiter) = pending.lock().await.remove(&id) else {
            // The caller cancelled and abandoned this id.
            log::debug!("dropping response for abandoned request {id}");
            return;
        };
        let outcome = if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            let message = error["message"].as_str().unwrap_or("unknown error");
            Err(ToolError::Execution(message.to_string()))
        } else {
            Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = waiter.send(outcome);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send one request and await its response.
    ///
    /// Dropping the returned future abandons the request id: the connection
    /// and any concurrent requests continue undisturbed.
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        if self.is_closed() {
            return Err(ToolError::Server(
                "tool server connection closed".to_string(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let line = format!(
            "{}\n",
            json!({"id": id, "method": method, "params": params})
        );
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.pending.lock().await.remove(&id);
                return Err(ToolError::Server(format!("write to tool server failed: {e}")));
            }
            if let Err(e) = writer.flush().await {
                self.pending.lock().await.remove(&id);
                return Err(ToolError::Server(format!("flush to tool server failed: {e}")));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ToolError::Server(
                "tool server connection closed".to_string(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ToolError::Timeout(timeout))
            }
        }
    }

    /// Close the write side, signalling EOF to the other end.
    async fn close_writer(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

// ---------------------------------------------------------------------------
// Subprocess (stdio) transport
// ---------------------------------------------------------------------------

struct StdioConnection {
    peer: Arc<JsonRpcPeer>,
    child: Child,
}

/// Tool server run as a child process, spoken to over stdin/stdout.
///
/// The child is spawned lazily on first use and survives across calls;
/// cancellation of a single call merely abandons its request id. A dead
/// child is respawned on the next call, at most once per call.
pub struct StdioToolServer {
    command: String,
    args: Vec<String>,
    call_timeout: Duration,
    shutdown_grace: Duration,
    connection: Mutex<Option<StdioConnection>>,
}

impl StdioToolServer {
    /// Configure a subprocess server. Nothing is spawned until the first
    /// request.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            call_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(2),
            connection: Mutex::new(None),
        }
    }

    /// Override the per-invocation timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    fn spawn_child(&self) -> Result<StdioConnection, ToolError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ToolError::Server(format!("failed to spawn {:?}: {e}", self.command))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Server("child stdout unavailable".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::Server("child stdin unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let command = self.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::warn!("[{command}] {line}");
                }
            });
        }

        log::debug!("spawned tool server {:?} (pid {:?})", self.command, child.id());
        Ok(StdioConnection {
            peer: JsonRpcPeer::start(stdout, stdin),
            child,
        })
    }

    /// Get a live connection, spawning the child if none exists or the
    /// previous one died.
    async fn connect(&self) -> Result<Arc<JsonRpcPeer>, ToolError> {
        let mut guard = self.connection.lock().await;
        match guard.as_ref() {
            Some(connection) if !connection.peer.is_closed() => {
                Ok(Arc::clone(&connection.peer))
            }
            _ => {
                let connection = self.spawn_child()?;
                let peer = Arc::clone(&connection.peer);
                *guard = Some(connection);
                Ok(peer)
            }
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        let peer = self.connect().await?;
        peer.request(method, params, self.call_timeout).await
    }
}

#[async_trait]
impl ToolServer for StdioToolServer {
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, ToolError> {
        let result = self.request("tools/list", json!({})).await?;
        parse_tool_list(result)
    }

    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value, ToolError> {
        let params = json!({"name": name, "arguments": arguments});

        match self.request("tools/call", params.clone()).await {
            Err(ToolError::Server(first)) => {
                // One restart per call: respawn and retry the same request.
                log::warn!(
                    "tool server {:?} died mid-call ({first}), restarting once",
                    self.command
                );
                self.connection.lock().await.take();
                self.request("tools/call", params).await
            }
            other => other,
        }
    }

    async fn shutdown(&self) {
        let Some(mut connection) = self.connection.lock().await.take() else {
            return;
        };
        // Graceful first: closing stdin asks the child to exit on its own.
        connection.peer.close_writer().await;
        match tokio::time::timeout(self.shutdown_grace, connection.child.wait()).await {
            Ok(Ok(status)) => {
                log::debug!("tool server {:?} exited: {status}", self.command);
            }
            _ => {
                log::warn!(
                    "tool server {:?} ignored stdin close, killing",
                    self.command
                );
                let _ = connection.child.kill().await;
            }
        }
    }

    fn transport_name(&self) -> &str {
        "stdio"
    }

    fn retries_internally(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spin up a peer over an in-memory pipe with a scripted responder.
    /// The responder may emit zero or more response lines per request.
    fn scripted_peer<F>(responder: F) -> Arc<JsonRpcPeer>
    where
        F: Fn(Value) -> Vec<Value> + Send + 'static,
    {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, mut server_write) = tokio::io::split(server_io);

        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                for response in responder(request) {
                    let out = format!("{response}\n");
                    if server_write.write_all(out.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        });

        JsonRpcPeer::start(client_read, client_write)
    }

    #[tokio::test]
    async fn request_round_trips() {
        let peer = scripted_peer(|request| {
            assert_eq!(request["method"], "tools/call");
            vec![json!({"id": request["id"], "result": "done"})]
        });
        let result = peer
            .request("tools/call", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, "done");
    }

    #[tokio::test]
    async fn concurrent_requests_multiplex_by_id() {
        // Hold the first request and answer both in reverse order once the
        // second arrives: each waiter must still get its own payload.
        let peer = scripted_peer({
            let held = std::sync::Mutex::new(Vec::<Value>::new());
            move |request| {
                let mut held = held.lock().unwrap();
                held.push(request);
                if held.len() == 2 {
                    let first = held.remove(0);
                    let second = held.remove(0);
                    vec![
                        json!({"id": second["id"], "result": "for-second"}),
                        json!({"id": first["id"], "result": "for-first"}),
                    ]
                } else {
                    Vec::new()
                }
            }
        });

        let (first, second) = tokio::join!(
            peer.request("tools/call", json!({"n": 1}), Duration::from_secs(5)),
            peer.request("tools/call", json!({"n": 2}), Duration::from_secs(5)),
        );
        assert_eq!(first.unwrap(), "for-first");
        assert_eq!(second.unwrap(), "for-second");
    }

    #[tokio::test]
    async fn error_envelope_becomes_execution_error() {
        let peer = scripted_peer(|request| {
            vec![json!({
                "id": request["id"],
                "error": {"code": -32000, "message": "no such tool"}
            })]
        });
        let err = peer
            .request("tools/call", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ToolError::Execution(message) => assert_eq!(message, "no such tool"),
            other => panic!("expected Execution, got {other}"),
        }
    }

    #[tokio::test]
    async fn eof_fails_pending_requests() {
        // Responder that never answers and hangs up immediately.
        let (client_io, server_io) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        drop(server_io);
        let peer = JsonRpcPeer::start(client_read, client_write);

        let err = peer
            .request("tools/list", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Server(_)));
        assert!(peer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_abandons_the_request_id() {
        let peer = scripted_peer(|_| Vec::new()); // never answers
        let err = peer
            .request("tools/call", json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
        assert!(peer.pending.lock().await.is_empty());
        assert!(!peer.is_closed());
    }

    // -- real subprocess coverage ------------------------------------------

    /// A shell one-liner that answers tools/list (id 1) and tools/call (id 2).
    const WELL_BEHAVED_SERVER: &str = r#"
        read line
        printf '%s\n' '{"id":1,"result":[{"name":"ping","description":"pong","input_schema":{"type":"object"}}]}'
        read line
        printf '%s\n' '{"id":2,"result":"pong"}'
        read line
    "#;

    #[tokio::test]
    async fn stdio_server_lists_and_calls() {
        let server = StdioToolServer::new("sh", vec!["-c".into(), WELL_BEHAVED_SERVER.into()])
            .with_call_timeout(Duration::from_secs(5));

        let tools = server.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ping");

        let result = server.call_tool("ping", &json!({})).await.unwrap();
        assert_eq!(result, "pong");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn stdio_server_restarts_once_after_crash() {
        let marker = tempfile::NamedTempFile::new().unwrap();
        let marker_path = marker.path().to_str().unwrap().to_string();
        std::fs::remove_file(marker.path()).ok();

        // First spawn: consume one request and die without answering.
        // Second spawn (marker present): answer the call.
        let script = format!(
            r#"
            if [ -f "{marker_path}" ]; then
                read line
                printf '%s\n' '{{"id":1,"result":"recovered"}}'
                read line
            else
                : > "{marker_path}"
                read line
                exit 1
            fi
            "#
        );

        let server = StdioToolServer::new("sh", vec!["-c".into(), script])
            .with_call_timeout(Duration::from_secs(5));

        let result = server.call_tool("ping", &json!({})).await.unwrap();
        assert_eq!(result, "recovered");

        server.shutdown().await;
        std::fs::remove_file(&marker_path).ok();
    }

    #[tokio::test]
    async fn stdio_shutdown_kills_a_stubborn_child() {
        // Ignores EOF on stdin and sleeps forever.
        let script = "while true; do sleep 1; done";
        let mut server = StdioToolServer::new("sh", vec!["-c".into(), script.into()]);
        server.shutdown_grace = Duration::from_millis(200);

        // Force a spawn without needing a response.
        let _ = server
            .connect()
            .await
            .expect("child should spawn");
        server.shutdown().await;
        assert!(server.connection.lock().await.is_none());
    }
}
