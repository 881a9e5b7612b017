//! Wire protocol for the Atelier agent-server event stream.
//!
//! The agent server pushes state changes as line-delimited JSON envelopes
//! over a persistent connection. This crate owns the envelope shape, the
//! typed payloads, and the pure classifier that narrows an untyped envelope
//! into the closed [`events::StreamEvent`] set. No state, no I/O.

pub mod classify;
pub mod events;

pub use classify::classify;
pub use events::{
    EventEnvelope, FileChange, FileEventKind, MessageInfo, MessagePart, MessageRole, MessageTime,
    PermissionRequest, QuestionRequest, RevertInfo, SessionErrorInfo, SessionInfo, SessionStatus,
    StreamEvent,
};
