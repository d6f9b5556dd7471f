//! Derived session events for subscribers (UI, persistence).
//!
//! Events are serializable so a future JSON output mode can reuse them.
//! They are fanned out as `Arc`s over a bounded channel; delta-grade
//! events are sent best-effort so a slow subscriber cannot stall the
//! turn loop.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::approval::ApprovalRequest;
use crate::session::TerminalOutput;
use drover_protocol::TokenUsage;

/// Notifications derived from applying streaming events to the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The turn's stream opened.
    TurnStarted,

    /// Assistant text for an output item grew.
    TextUpdated { item: usize, delta: String },

    /// The reasoning buffer for an item grew. Advisory: never final
    /// user-visible content.
    ReasoningUpdated { item: usize },

    /// A human-readable status line was appended to the activity log.
    Activity { line: String },

    /// A tool call's arguments are complete and no consent is needed.
    ToolCallReady {
        call_id: String,
        tool: String,
        arguments: Value,
    },

    /// A tool call needs user consent before it may execute.
    ApprovalRequired { request: ApprovalRequest },

    /// A tool call received its terminal output.
    ToolCallFinished {
        call_id: String,
        output: TerminalOutput,
    },

    /// Authoritative token-usage snapshot.
    UsageUpdated { usage: TokenUsage },

    /// The turn completed; `continuation` chains the next request.
    TurnCompleted { continuation: String },

    /// The turn failed terminally.
    TurnFailed { code: String, message: String },

    /// The caller cancelled the turn.
    Cancelled,
}

/// Bounded sender of derived events.
pub type SessionEventTx = mpsc::Sender<Arc<SessionEvent>>;

/// Bounded receiver of derived events.
pub type SessionEventRx = mpsc::Receiver<Arc<SessionEvent>>;

/// Default channel capacity, sized to absorb delta bursts without
/// blocking the dispatcher.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

pub fn create_event_channel() -> (SessionEventTx, SessionEventRx) {
    mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}
