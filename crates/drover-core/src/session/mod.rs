//! Authoritative in-memory record of the current turn.
//!
//! `SessionState` is owned exclusively by the [`Dispatcher`]; no other
//! component mutates it. Buffers keyed by output-item index live in an
//! arena: indices are allocated in arrival order and never reused
//! within a turn, so one buffer serves one item for the turn's life.

mod dispatch;

use std::collections::HashMap;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::ApprovalRequest;
use crate::automation::AutomationSession;
use drover_protocol::TokenUsage;

pub use dispatch::{DispatchResult, Dispatcher};

/// Bound on retained activity lines; oldest are evicted first.
pub const DEFAULT_ACTIVITY_CAPACITY: usize = 256;

/// Terminal output for one tool call, reported to the server on the
/// next request. Every initiated call must end in exactly one of these
/// before the conversation can advance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminalOutput {
    Success {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
        /// Reference to a captured image, when the action produced one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capture: Option<String>,
    },
    Denied {
        reason: String,
    },
    Cancelled,
    Failure {
        code: String,
        message: String,
    },
}

/// Append-only string buffers with stable item indices.
#[derive(Debug, Default)]
pub struct ItemArena {
    slots: Vec<String>,
}

impl ItemArena {
    pub fn append(&mut self, item: usize, text: &str) {
        if item >= self.slots.len() {
            self.slots.resize_with(item + 1, String::new);
        }
        self.slots[item].push_str(text);
    }

    pub fn get(&self, item: usize) -> Option<&str> {
        self.slots.get(item).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Ordered concatenation of every slot.
    pub fn concatenated(&self) -> String {
        self.slots.concat()
    }
}

/// Bounded, ordered log of human-readable status lines.
#[derive(Debug)]
pub struct ActivityLog {
    lines: VecDeque<String>,
    capacity: usize,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVITY_CAPACITY)
    }
}

/// Bookkeeping for one server-declared tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub tool: String,
    pub item: usize,
    /// Streamed argument JSON, accumulated from deltas.
    pub arguments_partial: String,
    /// Final arguments, set at `tool_call.completed`.
    pub arguments: Option<Value>,
    /// The call's terminal output, once it has one.
    pub output: Option<TerminalOutput>,
    pub is_automation: bool,
}

/// Whether the turn is still streaming or has reached its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Streaming,
    Completed,
    Failed,
}

/// The current turn's state.
pub struct SessionState {
    continuation: Option<String>,
    text: ItemArena,
    reasoning: ItemArena,
    activity: ActivityLog,
    usage: TokenUsage,
    calls: Vec<ToolCall>,
    call_index: HashMap<String, usize>,
    pending_approvals: HashMap<String, ApprovalRequest>,
    /// One session per active computer-use call, keyed by call id, so
    /// interleaved automation calls do not share throttle or phase
    /// state.
    automation: HashMap<String, AutomationSession>,
    phase: TurnPhase,
}

impl SessionState {
    /// Starts a turn, carrying the prior turn's continuation token when
    /// there is one.
    pub fn new(continuation: Option<String>) -> Self {
        Self {
            continuation,
            text: ItemArena::default(),
            reasoning: ItemArena::default(),
            activity: ActivityLog::default(),
            usage: TokenUsage::default(),
            calls: Vec::new(),
            call_index: HashMap::new(),
            pending_approvals: HashMap::new(),
            automation: HashMap::new(),
            phase: TurnPhase::Streaming,
        }
    }

    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn text(&self) -> &ItemArena {
        &self.text
    }

    pub fn reasoning(&self) -> &ItemArena {
        &self.reasoning
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn calls(&self) -> &[ToolCall] {
        &self.calls
    }

    pub fn call(&self, call_id: &str) -> Option<&ToolCall> {
        self.call_index.get(call_id).map(|&i| &self.calls[i])
    }

    pub fn pending_approvals(&self) -> &HashMap<String, ApprovalRequest> {
        &self.pending_approvals
    }

    pub fn automation_mut(&mut self, call_id: &str) -> Option<&mut AutomationSession> {
        self.automation.get_mut(call_id)
    }

    /// Removes the call's session; the call has reached its terminal
    /// outcome.
    pub fn take_automation(&mut self, call_id: &str) -> Option<AutomationSession> {
        self.automation.remove(call_id)
    }

    /// Marks every live automation session failed. Used when the turn
    /// is abandoned or fails as a whole.
    pub fn fail_automation_sessions(&mut self) {
        for session in self.automation.values_mut() {
            session.fail();
        }
    }

    /// Final assistant text for the turn: ordered concatenation of the
    /// text arena. Reasoning buffers are deliberately excluded.
    pub fn final_text(&self) -> String {
        self.text.concatenated()
    }

    /// Records the terminal output for a call and clears its pending
    /// approval, if any. The first output wins; a call already finished
    /// keeps its original output.
    pub fn record_output(&mut self, call_id: &str, output: TerminalOutput) -> bool {
        self.pending_approvals.remove(call_id);
        let Some(&index) = self.call_index.get(call_id) else {
            return false;
        };
        let call = &mut self.calls[index];
        if call.output.is_some() {
            return false;
        }
        call.output = Some(output);
        true
    }

    /// Synthesizes a cancellation output for every call that has none,
    /// so an abandoned turn can still satisfy the server's
    /// one-terminal-output-per-call contract on a later request.
    pub fn cancel_dangling_calls(&mut self) -> Vec<String> {
        self.pending_approvals.clear();
        let mut cancelled = Vec::new();
        for call in &mut self.calls {
            if call.output.is_none() {
                call.output = Some(TerminalOutput::Cancelled);
                cancelled.push(call.call_id.clone());
            }
        }
        cancelled
    }

    /// Calls whose terminal output has not been produced yet.
    pub fn dangling_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.calls.iter().filter(|c| c.output.is_none())
    }
}
