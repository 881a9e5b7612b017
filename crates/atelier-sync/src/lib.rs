//! Stream connection and reconciliation core for the Atelier client.
//!
//! A local UI process drives a long-running agent session hosted by a
//! separate server process. This crate keeps a live, consistent mirror of
//! that session's state: it owns the persistent event-stream connection
//! (reconnecting with bounded backoff), folds classified events into the
//! [`store::SyncStore`] with deterministic, idempotent update rules, and
//! persists the small durable subset that survives restarts.
//!
//! The rendering layer, the agent server itself, and the request/response
//! control surface are external collaborators; their side effects arrive
//! here through the same event path as everything else.

pub mod collections;
pub mod persist;
pub mod store;
pub mod stream;
pub mod subscription;

pub use persist::{DurableFile, DurableState, LayoutPosition};
pub use store::{Message, SyncStore};
pub use stream::{BackoffPolicy, ConnectionPhase, ConnectionState, StreamConfig, SyncClient};
pub use subscription::Subscription;
