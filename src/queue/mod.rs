//! Queue engine.
//!
//! - [`engine`] - [`QueueEngine`], the create/push/pop/confirm/close contract
//! - [`request`] - request bodies and [`Message`]
//! - [`keys`] - storage key layout and name validation
//! - [`inflight`] - deadline queue for unacknowledged ids
//!
//! Topics, lines and the recycle scheduler are internal.

pub mod engine;
pub mod inflight;
pub mod keys;
mod line;
mod recycle;
pub mod request;
mod topic;

pub use engine::{EngineOptions, QueueEngine, TopicStats};
pub use inflight::DeadlineQueue;
pub use line::LineStats;
pub use request::{ConfirmRequest, CreateRequest, LineStart, Message};
