//! HTTP client for the streaming turn endpoint.

mod turn;

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::ClientConfig;
use drover_protocol::{EventStream, SseDecoder};

pub use crate::session::TerminalOutput;
pub use turn::{NoToolExecutor, ToolExecutor, TurnOutcome, TurnStatus, run_turn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Request or connection timed out.
    Timeout,
    /// Connection could not be established.
    Connect,
    /// Non-success HTTP status.
    HttpStatus,
    /// Failure while reading the response body.
    Body,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Timeout => write!(f, "timeout"),
            TransportErrorKind::Connect => write!(f, "connect"),
            TransportErrorKind::HttpStatus => write!(f, "http_status"),
            TransportErrorKind::Body => write!(f, "body"),
        }
    }
}

/// Network-level failure delivering the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn http_status(status: u16, body: &str) -> Self {
        let detail = if body.trim().is_empty() {
            String::new()
        } else {
            format!(": {}", body.trim())
        };
        Self::new(
            TransportErrorKind::HttpStatus,
            format!("server returned HTTP {status}{detail}"),
        )
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::new(TransportErrorKind::Timeout, format!("request timed out: {e}"))
    } else if e.is_connect() {
        TransportError::new(TransportErrorKind::Connect, format!("connection failed: {e}"))
    } else {
        TransportError::new(TransportErrorKind::Body, format!("request failed: {e}"))
    }
}

/// One conversational input item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputItem {
    pub role: String,
    pub content: String,
}

impl InputItem {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Terminal output for one prior-turn tool call, echoed to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutputItem {
    pub call_id: String,
    #[serde(flatten)]
    pub output: TerminalOutput,
}

/// Outbound request for one turn.
///
/// The server rejects a request that omits an expected tool output, so
/// `tool_outputs` must carry exactly one terminal output for every call
/// initiated in the prior turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub stream: bool,
    /// Prior turn's continuation token, preserving server-held context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
    pub input: Vec<InputItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_outputs: Vec<ToolOutputItem>,
}

impl TurnRequest {
    pub fn new(input: Vec<InputItem>) -> Self {
        Self {
            model: None,
            stream: true,
            continuation: None,
            input,
            tool_outputs: Vec::new(),
        }
    }

    /// Builds the follow-up request for a finished turn: carries the
    /// stored continuation token and every terminal output.
    pub fn next(outcome: &TurnOutcome, input: Vec<InputItem>) -> Self {
        Self {
            model: None,
            stream: true,
            continuation: outcome.continuation.clone(),
            input,
            tool_outputs: outcome.outputs.clone(),
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_continuation(mut self, continuation: impl Into<String>) -> Self {
        self.continuation = Some(continuation.into());
        self
    }
}

/// Sends turn requests and returns decoded event streams.
pub struct SessionClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl SessionClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Opens one turn's stream. The transport is opened per turn and
    /// closed by the server on completion or error.
    pub async fn send_turn(&self, request: &TurnRequest) -> Result<EventStream, TransportError> {
        let request_id = Uuid::new_v4().to_string();
        debug!(request_id = %request_id, url = %self.config.turn_url(), "sending turn request");

        // A request without an explicit model falls back to the
        // configured one.
        let mut body = request.clone();
        if body.model.is_none() {
            body.model = self.config.model.clone();
        }

        let response = self
            .http
            .post(self.config.turn_url())
            .bearer_auth(&self.config.api_key)
            .header("x-request-id", request_id)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::http_status(status.as_u16(), &body));
        }

        Ok(Box::pin(SseDecoder::new(response.bytes_stream())))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_serialization_omits_empty_fields() {
        let request = TurnRequest::new(vec![InputItem::user("hello")]);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "stream": true,
                "input": [{"role": "user", "content": "hello"}],
            })
        );
    }

    #[test]
    fn tool_outputs_flatten_their_status() {
        let item = ToolOutputItem {
            call_id: "call_7".to_string(),
            output: TerminalOutput::Denied {
                reason: "user declined".to_string(),
            },
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(
            value,
            json!({
                "call_id": "call_7",
                "status": "denied",
                "reason": "user declined",
            })
        );
    }

    #[test]
    fn http_status_error_includes_body_detail() {
        let err = TransportError::http_status(429, "slow down");
        assert_eq!(err.kind(), TransportErrorKind::HttpStatus);
        assert!(err.message().contains("429"));
        assert!(err.message().contains("slow down"));
    }
}
