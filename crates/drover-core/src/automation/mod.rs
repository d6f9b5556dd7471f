//! Browser automation ("computer use"): action vocabulary, per-session
//! state machine, throttled controller, and blank-page watchdog.

mod controller;
mod surface;
mod watchdog;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::approval::RiskClass;

pub use controller::{AutomationController, BLANK_RECOVERY_BOUND, MIN_ACTION_GAP};
pub use surface::{RenderState, RenderSurface, SurfaceInput};
pub use watchdog::{BlankWatchdog, WatchdogVerdict};

/// The bounded action vocabulary the model may issue.
///
/// Parsed from the automation tool call's arguments, e.g.
/// `{"action": "navigate", "url": "https://example.test"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ComputerAction {
    Navigate { url: String },
    Click { x: f64, y: f64 },
    Type { text: String },
    Scroll { dx: f64, dy: f64 },
    Wait { ms: u64 },
    Screenshot,
}

impl ComputerAction {
    /// Consent classification. Anything that changes what the page is
    /// or does needs approval; pure observation does not.
    pub fn risk(&self) -> RiskClass {
        match self {
            ComputerAction::Wait { .. } | ComputerAction::Screenshot => RiskClass::Low,
            ComputerAction::Navigate { .. }
            | ComputerAction::Click { .. }
            | ComputerAction::Type { .. }
            | ComputerAction::Scroll { .. } => RiskClass::Elevated,
        }
    }
}

impl fmt::Display for ComputerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputerAction::Navigate { url } => write!(f, "navigate to {url}"),
            ComputerAction::Click { x, y } => write!(f, "click at ({x}, {y})"),
            ComputerAction::Type { text } => write!(f, "type {} characters", text.chars().count()),
            ComputerAction::Scroll { dx, dy } => write!(f, "scroll by ({dx}, {dy})"),
            ComputerAction::Wait { ms } => write!(f, "wait {ms} ms"),
            ComputerAction::Screenshot => write!(f, "take a screenshot"),
        }
    }
}

/// Result of one executed action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionResult {
    /// Encoded image bytes, present for `screenshot`.
    pub capture: Option<Vec<u8>>,
}

/// Where one action currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    AwaitingApproval,
    Executing,
    Settling,
    CaptureReady,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Failed)
    }

    /// Legal forward edges of the action lifecycle. `Failed` is
    /// reachable from any non-terminal phase; `Completed` loops back to
    /// a fresh cycle via `Idle`.
    fn can_advance(self, next: Phase) -> bool {
        match (self, next) {
            (Phase::Idle, Phase::AwaitingApproval | Phase::Executing)
            | (Phase::AwaitingApproval, Phase::Executing)
            | (Phase::Executing, Phase::Settling | Phase::CaptureReady | Phase::Completed)
            | (Phase::Settling, Phase::CaptureReady)
            | (Phase::CaptureReady, Phase::Completed)
            | (Phase::Completed, Phase::Idle) => true,
            (from, Phase::Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::AwaitingApproval => "awaiting_approval",
            Phase::Executing => "executing",
            Phase::Settling => "settling",
            Phase::CaptureReady => "capture_ready",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomationErrorKind {
    /// The render surface reported a hard error.
    Surface,
    /// Blank-page recovery budget exceeded.
    BlankPage,
    /// An operation was attempted in a phase that does not allow it.
    IllegalPhase,
    /// The session was abandoned (turn cancelled) mid-flight.
    Abandoned,
}

impl fmt::Display for AutomationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutomationErrorKind::Surface => write!(f, "surface"),
            AutomationErrorKind::BlankPage => write!(f, "blank_page"),
            AutomationErrorKind::IllegalPhase => write!(f, "illegal_phase"),
            AutomationErrorKind::Abandoned => write!(f, "abandoned"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationError {
    kind: AutomationErrorKind,
    message: String,
}

impl AutomationError {
    pub fn new(kind: AutomationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn surface(message: impl Into<String>) -> Self {
        Self::new(AutomationErrorKind::Surface, message)
    }

    pub fn blank_page(message: impl Into<String>) -> Self {
        Self::new(AutomationErrorKind::BlankPage, message)
    }

    pub fn illegal_phase(from: Phase, to: Phase) -> Self {
        Self::new(
            AutomationErrorKind::IllegalPhase,
            format!("illegal phase transition {from} -> {to}"),
        )
    }

    pub fn abandoned() -> Self {
        Self::new(AutomationErrorKind::Abandoned, "automation session abandoned")
    }

    pub fn kind(&self) -> AutomationErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for AutomationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for AutomationError {}

/// Execution context for one active computer-use tool call.
///
/// Created when the automation tool call starts, dropped when that call
/// completes, fails terminally, or the turn ends.
#[derive(Debug)]
pub struct AutomationSession {
    phase: Phase,
    /// Start instant of the most recent action, for throttling.
    last_action_started: Option<Instant>,
    /// Blank renders observed since the last stable one. Recovery is
    /// budgeted: the second consecutive blank is fatal.
    consecutive_blank_count: u32,
    /// Most recent navigation target, for forced reloads.
    last_url: Option<String>,
}

impl AutomationSession {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            last_action_started: None,
            consecutive_blank_count: 0,
            last_url: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn last_url(&self) -> Option<&str> {
        self.last_url.as_deref()
    }

    pub fn last_action_started(&self) -> Option<Instant> {
        self.last_action_started
    }

    /// Moves to `next`, failing on an edge the lifecycle does not have.
    pub fn advance(&mut self, next: Phase) -> Result<(), AutomationError> {
        if !self.phase.can_advance(next) {
            return Err(AutomationError::illegal_phase(self.phase, next));
        }
        self.phase = next;
        Ok(())
    }

    /// Unconditionally marks the session failed. Used for executor
    /// errors and abandonment, where the failure must stick regardless
    /// of the current phase.
    pub fn fail(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = Phase::Failed;
        }
    }

    pub(crate) fn mark_action_started(&mut self, at: Instant) {
        self.last_action_started = Some(at);
    }

    pub(crate) fn set_last_url(&mut self, url: &str) {
        self.last_url = Some(url.to_string());
    }

    pub(crate) fn note_blank(&mut self) -> u32 {
        self.consecutive_blank_count += 1;
        self.consecutive_blank_count
    }

    pub(crate) fn note_stable(&mut self) {
        self.consecutive_blank_count = 0;
    }
}

impl Default for AutomationSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_risk_actions_skip_consent() {
        assert_eq!(ComputerAction::Screenshot.risk(), RiskClass::Low);
        assert_eq!(ComputerAction::Wait { ms: 100 }.risk(), RiskClass::Low);
        assert_eq!(
            ComputerAction::Navigate {
                url: "https://example.test".to_string()
            }
            .risk(),
            RiskClass::Elevated
        );
    }

    #[test]
    fn full_cycle_transitions_are_legal() {
        let mut session = AutomationSession::new();
        for next in [
            Phase::AwaitingApproval,
            Phase::Executing,
            Phase::Settling,
            Phase::CaptureReady,
            Phase::Completed,
        ] {
            session.advance(next).unwrap();
        }
        // A new action starts a fresh cycle within the same session.
        session.advance(Phase::Idle).unwrap();
        session.advance(Phase::Executing).unwrap();
    }

    #[test]
    fn skipping_to_capture_from_idle_is_illegal() {
        let mut session = AutomationSession::new();
        let err = session.advance(Phase::CaptureReady).unwrap_err();
        assert_eq!(err.kind(), AutomationErrorKind::IllegalPhase);
    }

    #[test]
    fn failed_is_terminal_from_any_non_terminal_phase() {
        let mut session = AutomationSession::new();
        session.advance(Phase::Executing).unwrap();
        session.advance(Phase::Failed).unwrap();
        assert!(session.phase().is_terminal());
        assert!(session.advance(Phase::Idle).is_err());
    }

    #[test]
    fn action_arguments_parse_from_tool_call_json() {
        let action: ComputerAction = serde_json::from_str(
            r#"{"action":"navigate","url":"https://example.test"}"#,
        )
        .unwrap();
        assert_eq!(
            action,
            ComputerAction::Navigate {
                url: "https://example.test".to_string()
            }
        );

        let action: ComputerAction = serde_json::from_str(r#"{"action":"screenshot"}"#).unwrap();
        assert_eq!(action, ComputerAction::Screenshot);
    }
}
