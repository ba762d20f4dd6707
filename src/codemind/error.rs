//! Error taxonomy for the runtime.
//!
//! The split mirrors the recovery policy: [`ToolError`]s are recoverable
//! (they become error-bearing tool results the model can read and correct),
//! while [`TransportError`]s and provider rejections are fatal for the turn
//! (after the retry budget) but always leave the conversation consistent.

use std::time::Duration;

use thiserror::Error;

/// Failures at the HTTP/SSE boundary to an LLM provider.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection-level failure (DNS, TLS, reset). Retried with backoff.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-success HTTP status. 5xx is retried, 4xx is fatal.
    #[error("HTTP {status} from {endpoint}: {body}")]
    Status {
        status: u16,
        endpoint: String,
        body: String,
    },

    /// The total request timeout elapsed.
    #[error("request to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    /// The response body (or an SSE event) was not valid JSON.
    #[error("failed to parse provider response: {0}")]
    Parse(#[from] serde_json::Error),

    /// The SSE stream ended before the terminal sentinel, after events had
    /// already been surfaced to the caller. Not retried.
    #[error("stream truncated mid-response: {0}")]
    StreamTruncated(String),
}

impl TransportError {
    /// Whether the retry policy may re-issue the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Status { status, .. } => *status >= 500,
            TransportError::Timeout { .. } => false,
            TransportError::Parse(_) => false,
            TransportError::StreamTruncated(_) => false,
        }
    }
}

/// Failures while resolving or executing one tool call.
///
/// Every variant except host-internal misuse is rendered into a tool-result
/// message and surfaced to the model; none of them aborts the turn.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The model named a tool that is not registered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// `arguments` was not valid JSON.
    #[error("invalid JSON arguments: {0}")]
    InvalidArguments(String),

    /// Arguments parsed but failed the tool's JSON Schema.
    #[error("arguments do not match schema: {0}")]
    SchemaViolation(String),

    /// The handler itself reported a failure.
    #[error("{0}")]
    Execution(String),

    /// The per-call timeout elapsed.
    #[error("tool timed out after {0:?}")]
    Timeout(Duration),

    /// A remote tool server failed to answer (after the one permitted
    /// restart/retry for subprocess servers).
    #[error("tool server error: {0}")]
    Server(String),

    /// The call was cancelled cooperatively.
    #[error("cancelled")]
    Cancelled,
}

/// Fatal conditions that end the current turn.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Transport retry budget exhausted, or a mid-stream truncation.
    #[error("transport failure talking to {provider} ({model}): {source}")]
    Transport {
        provider: String,
        model: String,
        #[source]
        source: TransportError,
    },

    /// The provider rejected the request (4xx: auth, quota, malformed).
    #[error("provider {provider} rejected request to {endpoint} for {model}: HTTP {status}: {body}")]
    Provider {
        provider: String,
        endpoint: String,
        model: String,
        status: u16,
        body: String,
    },

    /// A registration-time configuration problem (duplicate tool name,
    /// invalid alias, unreachable tool server).
    #[error("tool registration error: {0}")]
    Registration(String),

    /// A host-internal invariant was violated. Never caused by model or
    /// tool misbehaviour.
    #[error("internal invariant violation: {0}")]
    InvariantViolation(String),
}

impl AgentError {
    /// Classify a [`TransportError`] against provider context, mapping 4xx
    /// statuses to [`AgentError::Provider`].
    pub fn from_transport(provider: &str, model: &str, err: TransportError) -> Self {
        match err {
            TransportError::Status {
                status,
                endpoint,
                body,
            } if (400..500).contains(&status) => AgentError::Provider {
                provider: provider.to_string(),
                endpoint,
                model: model.to_string(),
                status,
                body,
            },
            other => AgentError::Transport {
                provider: provider.to_string(),
                model: model.to_string(),
                source: other,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        let server_err = TransportError::Status {
            status: 503,
            endpoint: "/chat/completions".into(),
            body: "overloaded".into(),
        };
        assert!(server_err.is_retryable());

        let client_err = TransportError::Status {
            status: 401,
            endpoint: "/chat/completions".into(),
            body: "bad key".into(),
        };
        assert!(!client_err.is_retryable());

        let truncated = TransportError::StreamTruncated("connection reset".into());
        assert!(!truncated.is_retryable());
    }

    #[test]
    fn four_xx_becomes_provider_error() {
        let err = AgentError::from_transport(
            "openai",
            "gpt-4.1",
            TransportError::Status {
                status: 429,
                endpoint: "/chat/completions".into(),
                body: "quota".into(),
            },
        );
        match err {
            AgentError::Provider { status, provider, .. } => {
                assert_eq!(status, 429);
                assert_eq!(provider, "openai");
            }
            other => panic!("expected Provider error, got {other}"),
        }
    }

    #[test]
    fn five_xx_stays_transport() {
        let err = AgentError::from_transport(
            "openai",
            "gpt-4.1",
            TransportError::Status {
                status: 500,
                endpoint: "/chat/completions".into(),
                body: "oops".into(),
            },
        );
        assert!(matches!(err, AgentError::Transport { .. }));
    }
}
