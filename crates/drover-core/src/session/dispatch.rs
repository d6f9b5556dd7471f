//! Orders and applies decoded events to the session state.
//!
//! Events are applied strictly in arrival order; the dispatcher never
//! reorders or batches in a way that could change observable buffer
//! contents.

use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{SessionState, TerminalOutput, ToolCall, TurnPhase};
use crate::approval::{ApprovalRequest, RiskClass};
use crate::automation::{AutomationSession, ComputerAction};
use crate::events::SessionEvent;
use drover_protocol::{ProtocolError, ProtocolErrorKind, StreamingEvent};

/// Derived notifications produced by applying one event.
#[derive(Debug, Default)]
pub struct DispatchResult {
    pub notices: Vec<SessionEvent>,
}

/// Sole owner and mutator of [`SessionState`].
pub struct Dispatcher {
    state: SessionState,
    automation_tool: String,
}

impl Dispatcher {
    pub fn new(continuation: Option<String>, automation_tool: impl Into<String>) -> Self {
        Self {
            state: SessionState::new(continuation),
            automation_tool: automation_tool.into(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// See [`SessionState::record_output`].
    pub fn record_output(&mut self, call_id: &str, output: TerminalOutput) -> bool {
        self.state.record_output(call_id, output)
    }

    /// See [`SessionState::cancel_dangling_calls`].
    pub fn cancel_dangling_calls(&mut self) -> Vec<String> {
        self.state.cancel_dangling_calls()
    }

    pub fn automation_session_mut(&mut self, call_id: &str) -> Option<&mut AutomationSession> {
        self.state.automation_mut(call_id)
    }

    /// See [`SessionState::take_automation`].
    pub fn take_automation(&mut self, call_id: &str) -> Option<AutomationSession> {
        self.state.take_automation(call_id)
    }

    /// See [`SessionState::fail_automation_sessions`].
    pub fn fail_automation_sessions(&mut self) {
        self.state.fail_automation_sessions();
    }

    /// Applies one decoded event, in arrival order.
    pub fn apply(&mut self, event: StreamingEvent) -> Result<DispatchResult, ProtocolError> {
        if self.state.phase != TurnPhase::Streaming {
            // A completed session is terminal. A repeated terminal
            // event is the sentinel for duplicate delivery; anything
            // else after the end is an ordering violation.
            return Err(match event {
                StreamingEvent::TurnCompleted { .. } | StreamingEvent::Error { .. } => {
                    ProtocolError::duplicate_terminal(
                        "terminal event received for an already-ended turn",
                    )
                }
                _ => ProtocolError::new(
                    ProtocolErrorKind::OutOfOrder,
                    "event received after the turn ended",
                ),
            });
        }

        let mut result = DispatchResult::default();
        match event {
            StreamingEvent::TextDelta { item, text, .. } => {
                self.state.text.append(item, &text);
                result.notices.push(SessionEvent::TextUpdated { item, delta: text });
            }
            StreamingEvent::ToolCallStarted {
                item,
                call_id,
                tool,
                ..
            } => {
                let line = format!("Calling {tool}…");
                self.state.activity.push(line.clone());
                result.notices.push(SessionEvent::Activity { line });

                let is_automation = tool == self.automation_tool;
                if is_automation {
                    self.state
                        .automation
                        .insert(call_id.clone(), AutomationSession::new());
                }
                let index = self.state.calls.len();
                self.state.calls.push(ToolCall {
                    call_id: call_id.clone(),
                    tool,
                    item,
                    arguments_partial: String::new(),
                    arguments: None,
                    output: None,
                    is_automation,
                });
                self.state.call_index.insert(call_id, index);
            }
            StreamingEvent::ToolCallDelta {
                call_id,
                arguments_delta,
                ..
            } => {
                // No activity line per delta: that would flood the log.
                match self.state.call_index.get(&call_id) {
                    Some(&index) => {
                        self.state.calls[index]
                            .arguments_partial
                            .push_str(&arguments_delta);
                    }
                    None => warn!(call_id = %call_id, "argument delta for unknown call"),
                }
            }
            StreamingEvent::ToolCallCompleted {
                call_id, arguments, ..
            } => {
                let Some(&index) = self.state.call_index.get(&call_id) else {
                    warn!(call_id = %call_id, "completion for unknown call");
                    return Ok(result);
                };
                let call = &mut self.state.calls[index];
                let args = finalize_arguments(arguments, &call.arguments_partial);
                call.arguments = Some(args.clone());
                let tool = call.tool.clone();
                let is_automation = call.is_automation;

                match consent_for(is_automation, &args) {
                    Some(risk) => {
                        let request = ApprovalRequest {
                            call_id: call_id.clone(),
                            description: describe_call(&tool, &args),
                            risk,
                        };
                        self.state
                            .pending_approvals
                            .insert(call_id, request.clone());
                        result.notices.push(SessionEvent::ApprovalRequired { request });
                    }
                    None => {
                        result.notices.push(SessionEvent::ToolCallReady {
                            call_id,
                            tool,
                            arguments: args,
                        });
                    }
                }
            }
            StreamingEvent::ReasoningDelta { item, text, .. }
            | StreamingEvent::ReasoningSummary { item, text, .. } => {
                // Advisory only; never merged into final user-visible text.
                self.state.reasoning.append(item, &text);
                result.notices.push(SessionEvent::ReasoningUpdated { item });
            }
            StreamingEvent::UsageUpdate { usage, .. } => {
                // Authoritative snapshot, not an increment.
                self.state.usage = usage;
                result.notices.push(SessionEvent::UsageUpdated { usage });
            }
            StreamingEvent::TurnCompleted { continuation, .. } => {
                self.state.continuation = Some(continuation.clone());
                self.state.phase = TurnPhase::Completed;
                result
                    .notices
                    .push(SessionEvent::TurnCompleted { continuation });
            }
            StreamingEvent::Error { code, message } => {
                // The turn failed; the continuation token keeps its
                // prior value so the conversation is not corrupted.
                self.state.phase = TurnPhase::Failed;
                result
                    .notices
                    .push(SessionEvent::TurnFailed { code, message });
            }
            StreamingEvent::Unknown { kind } => {
                debug!(kind = %kind, "ignoring unknown event kind");
            }
        }
        Ok(result)
    }
}

/// Prefers server-finalized arguments, then the accumulated deltas.
fn finalize_arguments(finalized: Option<Value>, partial: &str) -> Value {
    if let Some(value) = finalized {
        return value;
    }
    let trimmed = partial.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(partial.to_string()))
}

/// Consent classification for a completed call. `None` means the call
/// may execute without approval.
fn consent_for(is_automation: bool, args: &Value) -> Option<RiskClass> {
    if !is_automation {
        return None;
    }
    match serde_json::from_value::<ComputerAction>(args.clone()) {
        Ok(action) if action.risk() == RiskClass::Elevated => Some(RiskClass::Elevated),
        // Unparseable actions fail at the executor with a terminal
        // output; gating them here would just stall the call.
        Ok(_) | Err(_) => None,
    }
}

fn describe_call(tool: &str, args: &Value) -> String {
    match serde_json::from_value::<ComputerAction>(args.clone()) {
        Ok(action) => action.to_string(),
        Err(_) => format!("run {tool}"),
    }
}
