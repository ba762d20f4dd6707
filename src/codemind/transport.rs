//! HTTP(S) request/response and server-sent-event streaming to LLM providers.
//!
//! The transport knows nothing about any provider's JSON dialect; it moves
//! opaque JSON bodies and SSE events. Wire-format variance lives entirely in
//! [`crate::adapters`].
//!
//! # Retry policy
//!
//! Network failures and 5xx responses are retried up to three times with
//! exponential backoff starting at 500 ms. 4xx responses and body-parse
//! failures are fatal and carry the endpoint in the error. A streaming
//! request may only be retried while establishing the connection; once the
//! first event has been surfaced, a mid-stream failure is terminal
//! ([`TransportError::StreamTruncated`]) and the caller finalizes whatever
//! partial message it has accumulated.
//!
//! # Session affinity
//!
//! Every request carries an `x-session-affinity` header with a stable
//! per-session token so providers can route a session's requests to the same
//! cache shard.

use std::pin::Pin;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::Stream;
use futures_util::StreamExt;
use lazy_static::lazy_static;

use crate::codemind::error::TransportError;

lazy_static! {
    /// Process-wide connection pool behind every HTTP surface of the
    /// runtime: provider completions and HTTP tool servers alike.
    ///
    /// Deadlines live with the callers, not here: [`HttpTransport`] applies
    /// its total request timeout per call and the tool servers apply their
    /// per-invocation timeouts, so the client carries only connection-level
    /// settings. Connect attempts are bounded at 10 s, the same order as
    /// the tool-server startup budget, which keeps a dead host from eating
    /// a whole retry backoff window. A session talks to one provider plus
    /// a handful of tool servers, so a small idle pool per host suffices;
    /// idle connections are kept alive across the multi-second gaps between
    /// completion calls in a turn and recycled after two minutes.
    static ref HTTP_CLIENT: reqwest::Client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Some(Duration::from_secs(120)))
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .build()
        .expect("HTTP client construction");
}

/// The pooled [`reqwest::Client`] shared by every transport and HTTP tool
/// server in the process.
pub fn shared_http_client() -> &'static reqwest::Client {
    &HTTP_CLIENT
}

/// A finite stream of parsed SSE event payloads.
pub type SseEventStream =
    Pin<Box<dyn Stream<Item = Result<serde_json::Value, TransportError>> + Send>>;

/// The sentinel event terminating an SSE completion stream.
const DONE_SENTINEL: &str = "[DONE]";

/// Interpret one SSE `data:` payload.
///
/// Returns `None` for the `[DONE]` sentinel, `Some(Ok(json))` for a parsed
/// event, and `Some(Err(..))` for malformed payloads.
pub fn parse_sse_data(data: &str) -> Option<Result<serde_json::Value, TransportError>> {
    if data.trim() == DONE_SENTINEL {
        return None;
    }
    Some(serde_json::from_str(data).map_err(TransportError::Parse))
}

/// HTTP transport bound to one session.
pub struct HttpTransport {
    client: reqwest::Client,
    /// Total per-request timeout (streaming requests included).
    timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
    /// Stable session-affinity token sent on every request.
    affinity_token: String,
}

impl HttpTransport {
    /// Create a transport using the shared pooled client.
    pub fn new(affinity_token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: shared_http_client().clone(),
            timeout,
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            affinity_token: affinity_token.into(),
        }
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Backoff before retry number `attempt` (1-based): 500 ms, 1 s, 2 s, …
    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    fn build_request(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &serde_json::Value,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .header("x-session-affinity", &self.affinity_token)
            .json(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        request
    }

    /// Classify a response, consuming the body on failure.
    async fn check_status(
        url: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            endpoint: url.to_string(),
            body,
        })
    }

    /// Issue the request once, without retrying.
    async fn send_once(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, TransportError> {
        let response = self
            .build_request(url, headers, body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout {
                        endpoint: url.to_string(),
                        timeout: self.timeout,
                    }
                } else {
                    TransportError::Network(e)
                }
            })?;
        Self::check_status(url, response).await
    }

    /// Issue the request with the retry policy applied.
    async fn send_with_retries(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, TransportError> {
        let mut attempt = 0;
        loop {
            match self.send_once(url, headers, body).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff_delay(attempt);
                    log::warn!(
                        "transport: attempt {attempt}/{max} to {url} failed ({err}), retrying in {delay:?}",
                        max = self.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if log::log_enabled!(log::Level::Error) {
                        log::error!("transport: request to {url} failed: {err}");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Non-streaming request: send the body, parse the full JSON response.
    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let response = self.send_with_retries(url, headers, body).await?;
        let text = response.text().await.map_err(TransportError::Network)?;
        serde_json::from_str(&text).map_err(TransportError::Parse)
    }

    /// Streaming request: send the body, yield each SSE event as parsed
    /// JSON, and terminate on the `[DONE]` sentinel.
    ///
    /// Connection establishment is retried like any other request; failures
    /// after the stream has started yielding are surfaced as
    /// [`TransportError::StreamTruncated`] and never retried here.
    pub async fn post_stream(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &serde_json::Value,
    ) -> Result<SseEventStream, TransportError> {
        let response = self.send_with_retries(url, headers, body).await?;
        let events = response.bytes_stream().eventsource();

        let stream = async_stream::stream! {
            futures_util::pin_mut!(events);
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => match parse_sse_data(&event.data) {
                        Some(Ok(json)) => yield Ok(json),
                        Some(Err(err)) => {
                            yield Err(err);
                            return;
                        }
                        None => return, // [DONE]
                    },
                    Err(err) => {
                        yield Err(TransportError::StreamTruncated(err.to_string()));
                        return;
                    }
                }
            }
            // Stream ended without the sentinel; the adapter decides whether
            // the accumulated message is complete.
        };
        Ok(Box::pin(stream))
    }
}
