//! Error types and front-end mapping.
//!
//! Every engine operation returns [`QueueError`]. Errors fall into the
//! categories of [`ErrorKind`]; client errors are surfaced verbatim, storage
//! failures are reported as [`QueueError::Io`] and logged by the engine.

use std::time::Duration;
use thiserror::Error;

/// Queue engine error conditions.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Malformed request (bad name, bad pop key).
    #[error("invalid request: {message}")]
    Validation { message: String },

    /// Payload exceeds the configured size limit.
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Topic does not exist.
    #[error("topic {topic} not found")]
    TopicNotFound { topic: String },

    /// Line does not exist on the topic.
    #[error("line {topic}/{line} not found")]
    LineNotFound { topic: String, line: String },

    /// Message id is not unacknowledged on the line.
    #[error("message {id} is not in flight on {topic}/{line}")]
    MessageNotFound { topic: String, line: String, id: u64 },

    /// Nothing to pop right now.
    #[error("no message available on {topic}/{line}")]
    Empty { topic: String, line: String },

    /// Topic already exists.
    #[error("topic {topic} already exists")]
    TopicExists { topic: String },

    /// Line already exists on the topic.
    #[error("line {topic}/{line} already exists")]
    LineExists { topic: String, line: String },

    /// Recycle duration is not positive.
    #[error("invalid recycle duration {recycle:?}: must be greater than zero")]
    InvalidRecycle { recycle: Duration },

    /// Storage backend failure.
    #[error("storage failure: {message}")]
    Io { message: String },

    /// Engine has been closed.
    #[error("queue engine is closed")]
    Closed,
}

/// Error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    InvalidArgument,
    Io,
    Closed,
}

impl QueueError {
    /// Create a Validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Wrap a storage error, keeping its context chain.
    pub fn io(error: &anyhow::Error) -> Self {
        Self::Io {
            message: format!("{:#}", error),
        }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::PayloadTooLarge { .. } => ErrorKind::Validation,
            Self::TopicNotFound { .. }
            | Self::LineNotFound { .. }
            | Self::MessageNotFound { .. }
            | Self::Empty { .. } => ErrorKind::NotFound,
            Self::TopicExists { .. } | Self::LineExists { .. } => ErrorKind::Conflict,
            Self::InvalidRecycle { .. } => ErrorKind::InvalidArgument,
            Self::Io { .. } => ErrorKind::Io,
            Self::Closed => ErrorKind::Closed,
        }
    }

    /// Check if this error is caused by the request rather than the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation
                | ErrorKind::NotFound
                | ErrorKind::Conflict
                | ErrorKind::InvalidArgument
        )
    }

    /// Check if this is an empty pop result.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty { .. })
    }
}

/// Result type using QueueError.
pub type QueueResult<T> = Result<T, QueueError>;

/// HTTP status mapping for front ends.
pub struct HttpErrorMapping;

impl HttpErrorMapping {
    /// Status code a front end should answer with.
    pub fn status_code(error: &QueueError) -> u16 {
        match error.kind() {
            ErrorKind::Validation | ErrorKind::InvalidArgument => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Io => 500,
            ErrorKind::Closed => 503,
        }
    }
}
