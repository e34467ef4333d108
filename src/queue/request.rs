//! Request and response types for the engine contract.
//!
//! Field names follow the JSON bodies front ends accept:
//!
//! ```json
//! {"TopicName": "foo", "LineName": "x", "Recycle": 10000000000}
//! {"TopicName": "foo", "LineName": "x", "MessageID": 1}
//! ```
//!
//! `Recycle` is a signed count of nanoseconds.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Where a new line starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineStart {
    /// First message of the topic.
    #[default]
    Earliest,
    /// Only messages pushed after the line is created.
    Latest,
}

/// Create a topic, or a line on an existing topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRequest {
    pub topic_name: String,

    /// Empty or absent creates a bare topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_name: Option<String>,

    #[serde(default, with = "nanos")]
    pub recycle: Duration,

    #[serde(default)]
    pub start: LineStart,
}

impl CreateRequest {
    /// Request for a bare topic.
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic_name: topic.into(),
            line_name: None,
            recycle: Duration::ZERO,
            start: LineStart::Earliest,
        }
    }

    /// Request for a line on `topic`.
    pub fn line(topic: impl Into<String>, line: impl Into<String>, recycle: Duration) -> Self {
        Self {
            topic_name: topic.into(),
            line_name: Some(line.into()),
            recycle,
            start: LineStart::Earliest,
        }
    }

    /// Set where the line starts reading.
    pub fn starting_at(mut self, start: LineStart) -> Self {
        self.start = start;
        self
    }

    /// The line name, treating an empty string as absent.
    pub fn line_name(&self) -> Option<&str> {
        self.line_name.as_deref().filter(|name| !name.is_empty())
    }
}

/// Acknowledge a popped message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfirmRequest {
    pub topic_name: String,
    pub line_name: String,
    #[serde(rename = "MessageID")]
    pub message_id: u64,
}

impl ConfirmRequest {
    pub fn new(topic: impl Into<String>, line: impl Into<String>, message_id: u64) -> Self {
        Self {
            topic_name: topic.into(),
            line_name: line.into(),
            message_id,
        }
    }
}

/// A popped message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub payload: Bytes,
}

/// Signed nanosecond encoding. Non-positive values decode to zero, which
/// the engine rejects as an invalid recycle.
mod nanos {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = i64::try_from(value.as_nanos()).unwrap_or(i64::MAX);
        serializer.serialize_i64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = i64::deserialize(deserializer)?;
        Ok(u64::try_from(nanos)
            .map(Duration::from_nanos)
            .unwrap_or(Duration::ZERO))
    }
}
