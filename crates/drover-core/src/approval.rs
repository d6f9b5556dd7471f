//! Consent checkpoint between a requested action and its execution.
//!
//! Each [`ApprovalRequest`] is resolved exactly once by an external UI
//! collaborator. The gate hands the caller a oneshot receiver at
//! registration time; resolving an unknown or already-resolved call id
//! is an error, and a dropped gate wakes every waiter with an
//! abandonment signal rather than leaving it pending.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

/// How much consent an action needs before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    /// Executes without asking (e.g. `wait`, `screenshot`).
    Low,
    /// Requires explicit user consent before release.
    Elevated,
}

/// Outcome of presenting a request to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Denied,
}

/// A pending consent request for one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub call_id: String,
    pub description: String,
    pub risk: RiskClass,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalError {
    call_id: String,
}

impl ApprovalError {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }
}

impl fmt::Display for ApprovalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no pending approval for call {} (unknown or already resolved)",
            self.call_id
        )
    }
}

impl std::error::Error for ApprovalError {}

/// Tracks pending approvals as oneshot senders keyed by call id.
///
/// The mutex is held only for map access, never across an await point,
/// so the gate can be shared between the turn loop and the UI
/// collaborator that resolves requests.
#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, oneshot::Sender<Decision>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request and returns the receiver the caller awaits.
    ///
    /// A receiver error means the request was abandoned (turn cancelled
    /// or gate dropped), not denied.
    pub fn register(&self, request: &ApprovalRequest) -> oneshot::Receiver<Decision> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        pending.insert(request.call_id.clone(), tx);
        debug!(call_id = %request.call_id, risk = ?request.risk, "approval requested");
        rx
    }

    /// Resolves a pending request. Consumes it: a second resolution for
    /// the same call id fails.
    pub fn resolve(&self, call_id: &str, decision: Decision) -> Result<(), ApprovalError> {
        let sender = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.remove(call_id)
        };
        let Some(sender) = sender else {
            return Err(ApprovalError {
                call_id: call_id.to_string(),
            });
        };
        debug!(call_id = %call_id, ?decision, "approval resolved");
        // The receiver may have been dropped by a cancelled turn; that
        // is not an error for the resolver.
        let _ = sender.send(decision);
        Ok(())
    }

    /// Drops every pending sender, waking waiters with abandonment.
    pub fn abandon_all(&self) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !pending.is_empty() {
            debug!(count = pending.len(), "abandoning pending approvals");
        }
        pending.clear();
    }

    pub fn is_pending(&self, call_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(call_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(call_id: &str) -> ApprovalRequest {
        ApprovalRequest {
            call_id: call_id.to_string(),
            description: "navigate to https://example.test".to_string(),
            risk: RiskClass::Elevated,
        }
    }

    #[tokio::test]
    async fn resolves_once_and_only_once() {
        let gate = ApprovalGate::new();
        let rx = gate.register(&request("call_1"));

        gate.resolve("call_1", Decision::Approved).unwrap();
        assert_eq!(rx.await.unwrap(), Decision::Approved);

        let err = gate.resolve("call_1", Decision::Denied).unwrap_err();
        assert_eq!(err.call_id(), "call_1");
    }

    #[tokio::test]
    async fn resolving_unknown_call_is_an_error() {
        let gate = ApprovalGate::new();
        assert!(gate.resolve("nope", Decision::Approved).is_err());
    }

    #[tokio::test]
    async fn abandonment_wakes_waiters_with_error() {
        let gate = ApprovalGate::new();
        let rx = gate.register(&request("call_2"));
        gate.abandon_all();
        assert!(rx.await.is_err());
        assert!(!gate.is_pending("call_2"));
    }

    #[tokio::test]
    async fn denial_is_a_valid_terminal_outcome() {
        let gate = ApprovalGate::new();
        let rx = gate.register(&request("call_3"));
        gate.resolve("call_3", Decision::Denied).unwrap();
        assert_eq!(rx.await.unwrap(), Decision::Denied);
    }
}
