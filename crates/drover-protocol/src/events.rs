//! Typed streaming events.
//!
//! One exhaustively matched tagged enum covers every frame kind the
//! server emits. Adding a wire kind means adding a variant, and the
//! compiler then points at every match that must handle it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token accounting for a turn. Counters are authoritative snapshots,
/// not increments: the latest update wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }
}

/// A decoded wire frame.
///
/// Every frame belongs to an output item (`item`, ordinal position in
/// the turn's output) and carries a per-item sequence number (`seq`)
/// that must never regress within a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamingEvent {
    /// Incremental assistant text for an output item.
    #[serde(rename = "text.delta")]
    TextDelta { item: usize, seq: u64, text: String },

    /// The server declared a tool invocation.
    #[serde(rename = "tool_call.started")]
    ToolCallStarted {
        item: usize,
        seq: u64,
        call_id: String,
        tool: String,
    },

    /// Partial tool-call arguments (streamed JSON text).
    #[serde(rename = "tool_call.delta")]
    ToolCallDelta {
        item: usize,
        seq: u64,
        call_id: String,
        arguments_delta: String,
    },

    /// Tool-call arguments are complete; the call is ready to execute.
    /// `arguments` carries the full parsed value when the server sends
    /// one; otherwise the accumulated deltas are authoritative.
    #[serde(rename = "tool_call.completed")]
    ToolCallCompleted {
        item: usize,
        seq: u64,
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<Value>,
    },

    /// Incremental model reasoning. Advisory only, never final content.
    #[serde(rename = "reasoning.delta")]
    ReasoningDelta { item: usize, seq: u64, text: String },

    /// A condensed reasoning summary. Advisory only.
    #[serde(rename = "reasoning.summary")]
    ReasoningSummary { item: usize, seq: u64, text: String },

    /// Authoritative token-usage snapshot.
    #[serde(rename = "usage.update")]
    UsageUpdate {
        item: usize,
        seq: u64,
        usage: TokenUsage,
    },

    /// The turn finished; `continuation` chains the next request.
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        item: usize,
        seq: u64,
        continuation: String,
    },

    /// Wire-level structured error. The stream terminates after this.
    #[serde(rename = "error")]
    Error { code: String, message: String },

    /// A frame with a tag this client does not recognize. Preserved so
    /// no frame is ever dropped sight-unseen.
    #[serde(rename = "unknown")]
    Unknown { kind: String },
}

impl StreamingEvent {
    /// True for the two events that legally end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamingEvent::TurnCompleted { .. } | StreamingEvent::Error { .. }
        )
    }

    /// The (item, seq) pair, for ordering checks. `Error` and `Unknown`
    /// frames sit outside the per-item ordering domain.
    pub fn ordering_key(&self) -> Option<(usize, u64)> {
        match self {
            StreamingEvent::TextDelta { item, seq, .. }
            | StreamingEvent::ToolCallStarted { item, seq, .. }
            | StreamingEvent::ToolCallDelta { item, seq, .. }
            | StreamingEvent::ToolCallCompleted { item, seq, .. }
            | StreamingEvent::ReasoningDelta { item, seq, .. }
            | StreamingEvent::ReasoningSummary { item, seq, .. }
            | StreamingEvent::UsageUpdate { item, seq, .. }
            | StreamingEvent::TurnCompleted { item, seq, .. } => Some((*item, *seq)),
            StreamingEvent::Error { .. } | StreamingEvent::Unknown { .. } => None,
        }
    }
}
