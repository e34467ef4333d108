//! Storage key layout and persisted records.
//!
//! | Key | Value |
//! |---|---|
//! | `t/{topic}` | [`TopicRecord`] |
//! | `m/{topic}/{id}` | payload bytes |
//! | `l/{topic}/{line}` | [`LineRecord`] |
//! | `f/{topic}/{line}/{id}` | [`InflightRecord`] |
//!
//! Ids are encoded as big-endian `u64` so byte order matches numeric order.
//! Names never contain `/`, which keeps every prefix unambiguous.

use crate::core::error::{QueueError, QueueResult};
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Longest accepted topic or line name in bytes.
pub const MAX_NAME_LEN: usize = 128;

pub(crate) const TOPIC_PREFIX: &[u8] = b"t/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TopicRecord {
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LineRecord {
    pub recycle_ms: u64,
    /// Highest topic id handed out from the unread range.
    pub head: u64,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InflightRecord {
    pub deadline_ms: u64,
}

pub(crate) fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    bincode::serialize(record).context("failed to encode record")
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).context("failed to decode record")
}

fn join(tag: &str, parts: &[&str]) -> Vec<u8> {
    let mut key = tag.as_bytes().to_vec();
    for part in parts {
        key.push(b'/');
        key.extend_from_slice(part.as_bytes());
    }
    key
}

pub(crate) fn topic_key(topic: &str) -> Vec<u8> {
    join("t", &[topic])
}

pub(crate) fn message_prefix(topic: &str) -> Vec<u8> {
    let mut key = join("m", &[topic]);
    key.push(b'/');
    key
}

pub(crate) fn message_key(topic: &str, id: u64) -> Vec<u8> {
    let mut key = message_prefix(topic);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub(crate) fn line_prefix(topic: &str) -> Vec<u8> {
    let mut key = join("l", &[topic]);
    key.push(b'/');
    key
}

pub(crate) fn line_key(topic: &str, line: &str) -> Vec<u8> {
    join("l", &[topic, line])
}

pub(crate) fn inflight_prefix(topic: &str, line: &str) -> Vec<u8> {
    let mut key = join("f", &[topic, line]);
    key.push(b'/');
    key
}

pub(crate) fn inflight_key(topic: &str, line: &str, id: u64) -> Vec<u8> {
    let mut key = inflight_prefix(topic, line);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Id suffix of a key under `prefix`.
pub(crate) fn id_suffix(key: &[u8], prefix: &[u8]) -> Option<u64> {
    let suffix = key.strip_prefix(prefix)?;
    let bytes: [u8; 8] = suffix.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Name suffix of a key under `prefix`.
pub(crate) fn name_suffix(key: &[u8], prefix: &[u8]) -> Result<String> {
    let suffix = key
        .strip_prefix(prefix)
        .context("key outside of expected prefix")?;
    String::from_utf8(suffix.to_vec()).context("stored name is not UTF-8")
}

/// Check a topic or line name.
pub fn validate_name(kind: &str, name: &str) -> QueueResult<()> {
    if name.is_empty() {
        return Err(QueueError::validation(format!("{} name is empty", kind)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(QueueError::validation(format!(
            "{} name is longer than {} bytes",
            kind, MAX_NAME_LEN
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| *c == '/' || c.is_whitespace() || c.is_control())
    {
        return Err(QueueError::validation(format!(
            "{} name {:?} contains forbidden character {:?}",
            kind, name, bad
        )));
    }
    Ok(())
}

/// Split a `"topic/line"` pop key.
pub fn split_pop_key(key: &str) -> QueueResult<(&str, &str)> {
    let (topic, line) = key
        .split_once('/')
        .ok_or_else(|| QueueError::validation(format!("pop key {:?} is not topic/line", key)))?;
    validate_name("topic", topic)?;
    validate_name("line", line)?;
    Ok((topic, line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_keys_sort_numerically() {
        let a = message_key("foo", 9);
        let b = message_key("foo", 10);
        let c = message_key("foo", 256);
        assert!(a < b && b < c);
        assert_eq!(id_suffix(&c, &message_prefix("foo")), Some(256));
        assert!(!message_key("foobar", 1).starts_with(&message_prefix("foo")));
    }

    #[test]
    fn key_shapes() {
        assert_eq!(topic_key("foo"), b"t/foo".to_vec());
        assert_eq!(line_key("foo", "x"), b"l/foo/x".to_vec());
        assert!(inflight_key("foo", "x", 1).starts_with(b"f/foo/x/"));
        assert_eq!(
            name_suffix(&line_key("foo", "x"), &line_prefix("foo")).ok(),
            Some("x".to_string())
        );
    }

    #[test]
    fn names_are_checked() {
        assert!(validate_name("topic", "orders-2024").is_ok());
        assert!(validate_name("topic", "").is_err());
        assert!(validate_name("topic", "a/b").is_err());
        assert!(validate_name("line", "a b").is_err());
        assert!(validate_name("line", &"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn pop_keys_split_once() {
        assert_eq!(split_pop_key("foo/x").ok(), Some(("foo", "x")));
        assert!(split_pop_key("foo").is_err());
        assert!(split_pop_key("foo/").is_err());
        assert!(split_pop_key("foo/x/y").is_err());
    }
}
