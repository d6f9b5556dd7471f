//! drover-core: the stateful half of the client.
//!
//! Owns the per-turn session state and its dispatcher, the approval
//! gate that sits between model-issued actions and their execution, the
//! throttled automation controller driving a sandboxed render surface,
//! and the HTTP turn loop that ties them to the wire.
//!
//! Layering: `drover-protocol` decodes bytes into events; this crate
//! consumes those events one at a time (single logical stream, no
//! concurrent mutation of session state) and produces exactly one
//! terminal output per initiated tool call.

pub mod approval;
pub mod automation;
pub mod client;
pub mod config;
pub mod events;
pub mod logging;
pub mod observe;
pub mod session;

pub use approval::{ApprovalError, ApprovalGate, ApprovalRequest, Decision, RiskClass};
pub use automation::{
    ActionResult, AutomationController, AutomationError, AutomationErrorKind, AutomationSession,
    ComputerAction, Phase, RenderState, RenderSurface,
};
pub use client::{
    InputItem, NoToolExecutor, SessionClient, TerminalOutput, ToolExecutor, ToolOutputItem,
    TransportError, TransportErrorKind, TurnOutcome, TurnRequest, TurnStatus, run_turn,
};
pub use config::ClientConfig;
pub use events::{SessionEvent, SessionEventRx, SessionEventTx, create_event_channel};
pub use observe::{SessionObserver, TurnRecord};
pub use session::{Dispatcher, DispatchResult, SessionState};
