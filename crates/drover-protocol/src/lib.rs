//! Wire protocol for drover: typed streaming events and the SSE decoder
//! that produces them from a raw byte stream.
//!
//! This crate is a leaf: it knows nothing about HTTP, sessions, or
//! automation. It turns bytes into an ordered sequence of
//! [`StreamingEvent`] values and enforces the wire-level invariants
//! (frame framing, per-item sequence ordering, exactly one terminal
//! event per stream).

mod decoder;
mod error;
mod events;

pub use decoder::{EventStream, SseDecoder};
pub use error::{ProtocolError, ProtocolErrorKind, ProtocolResult};
pub use events::{StreamingEvent, TokenUsage};
