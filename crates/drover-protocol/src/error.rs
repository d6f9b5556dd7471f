//! Protocol error taxonomy.

use std::fmt;

/// Result alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Categories of wire-protocol violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// A frame could not be decoded at all (corrupt JSON, bad framing).
    Decode,
    /// The underlying byte stream failed mid-delivery (dropped
    /// connection, read error). Distinct from `Decode`: the bytes that
    /// did arrive were well-formed.
    Transport,
    /// A per-item sequence number regressed.
    OutOfOrder,
    /// A second terminal event arrived for an already-completed turn.
    DuplicateTerminal,
    /// The stream closed without a terminal event.
    IncompleteTurn,
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolErrorKind::Decode => write!(f, "decode"),
            ProtocolErrorKind::Transport => write!(f, "transport"),
            ProtocolErrorKind::OutOfOrder => write!(f, "out_of_order"),
            ProtocolErrorKind::DuplicateTerminal => write!(f, "duplicate_terminal"),
            ProtocolErrorKind::IncompleteTurn => write!(f, "incomplete_turn"),
        }
    }
}

/// A wire-protocol violation with a renderable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    kind: ProtocolErrorKind,
    message: String,
}

impl ProtocolError {
    pub fn new(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::Decode, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::Transport, message)
    }

    pub fn out_of_order(item: usize, last: u64, got: u64) -> Self {
        Self::new(
            ProtocolErrorKind::OutOfOrder,
            format!("item {item}: sequence number regressed from {last} to {got}"),
        )
    }

    pub fn duplicate_terminal(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::DuplicateTerminal, message)
    }

    pub fn incomplete_turn() -> Self {
        Self::new(
            ProtocolErrorKind::IncompleteTurn,
            "stream closed before a turn.completed or error event",
        )
    }

    pub fn kind(&self) -> ProtocolErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for ProtocolError {}
