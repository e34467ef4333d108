//! Line manager: per-line cursor, in-flight set and retry pool.
//!
//! Pop, confirm and reclaim all run under the line's mutex, so within one
//! line they are totally ordered while different lines proceed in parallel.

use super::inflight::DeadlineQueue;
use super::keys::{self, InflightRecord, LineRecord};
use super::request::Message;
use super::topic::Topic;
use crate::core::error::{QueueError, QueueResult};
use crate::core::time::Tick;
use crate::storage::{KvStore, WriteBatch};
use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;

/// Point-in-time counters for a line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineStats {
    pub topic: String,
    pub line: String,
    pub recycle_ms: u64,
    /// Highest id handed out from the unread range.
    pub head: u64,
    /// Highest id on the topic.
    pub tail: u64,
    /// Ids not yet read by this line.
    pub backlog: u64,
    pub inflight: usize,
    /// Reclaimed ids waiting for redelivery.
    pub retry: usize,
    pub created_at_ms: u64,
}

#[derive(Debug, Default)]
struct LineState {
    head: u64,
    inflight: DeadlineQueue,
    retry: BTreeSet<u64>,
}

pub(crate) struct Line {
    topic: String,
    name: String,
    recycle_ms: u64,
    created_at_ms: u64,
    state: Mutex<LineState>,
}

impl Line {
    pub(crate) fn create(
        store: &dyn KvStore,
        topic: &str,
        name: &str,
        recycle_ms: u64,
        head: u64,
        now_ms: u64,
    ) -> Result<Self> {
        let record = LineRecord {
            recycle_ms,
            head,
            created_at_ms: now_ms,
        };
        store.put(&keys::line_key(topic, name), &keys::encode(&record)?)?;
        Ok(Self::from_record(topic, name, record, head))
    }

    /// Rebuild a line, clamping its cursor to the recovered topic tail.
    pub(crate) fn restore(
        store: &dyn KvStore,
        topic: &str,
        name: &str,
        record: LineRecord,
        tail: u64,
    ) -> Result<Self> {
        let line = Self::from_record(topic, name, record, record.head.min(tail));
        let prefix = keys::inflight_prefix(topic, name);
        {
            let mut state = line.state.lock();
            for (key, value) in store.scan_prefix(&prefix)? {
                let Some(id) = keys::id_suffix(&key, &prefix) else {
                    tracing::warn!(topic, line = name, "skipping malformed in-flight key");
                    continue;
                };
                let record: InflightRecord = keys::decode(&value)?;
                state.inflight.insert(id, record.deadline_ms);
            }
            if record.head > tail {
                tracing::warn!(
                    topic,
                    line = name,
                    head = record.head,
                    tail,
                    "line cursor ahead of topic tail; clamped"
                );
            }
        }
        Ok(line)
    }

    fn from_record(topic: &str, name: &str, record: LineRecord, head: u64) -> Self {
        Self {
            topic: topic.to_string(),
            name: name.to_string(),
            recycle_ms: record.recycle_ms,
            created_at_ms: record.created_at_ms,
            state: Mutex::new(LineState {
                head,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn record(&self, head: u64) -> LineRecord {
        LineRecord {
            recycle_ms: self.recycle_ms,
            head,
            created_at_ms: self.created_at_ms,
        }
    }

    /// Hand out the next available id: retries first, then fresh backlog.
    pub(crate) fn pop(&self, store: &dyn KvStore, topic: &Topic, now: Tick) -> QueueResult<Message> {
        let mut state = self.state.lock();

        let (id, from_retry) = match state.retry.first() {
            Some(&id) => (id, true),
            None if state.head < topic.tail() => (state.head + 1, false),
            None => {
                return Err(QueueError::Empty {
                    topic: self.topic.clone(),
                    line: self.name.clone(),
                })
            }
        };

        let payload = topic.read(store, id)?;
        let deadline = now.add_ms(self.recycle_ms);

        let mut batch = WriteBatch::new();
        let inflight = InflightRecord {
            deadline_ms: deadline.ms,
        };
        batch.put(
            keys::inflight_key(&self.topic, &self.name, id),
            keys::encode(&inflight).map_err(|err| QueueError::io(&err))?,
        );
        if !from_retry {
            batch.put(
                keys::line_key(&self.topic, &self.name),
                keys::encode(&self.record(id)).map_err(|err| QueueError::io(&err))?,
            );
        }
        store.write(batch).map_err(|err| QueueError::io(&err))?;

        if from_retry {
            state.retry.remove(&id);
        } else {
            state.head = id;
        }
        state.inflight.insert(id, deadline.ms);

        Ok(Message { id, payload })
    }

    /// Acknowledge `id`. Accepts ids in flight or waiting in the retry pool.
    pub(crate) fn confirm(&self, store: &dyn KvStore, id: u64) -> QueueResult<()> {
        let mut state = self.state.lock();
        if !state.inflight.contains(id) && !state.retry.contains(&id) {
            return Err(QueueError::MessageNotFound {
                topic: self.topic.clone(),
                line: self.name.clone(),
                id,
            });
        }

        store
            .delete(&keys::inflight_key(&self.topic, &self.name, id))
            .map_err(|err| QueueError::io(&err))?;

        state.inflight.remove(id);
        state.retry.remove(&id);
        Ok(())
    }

    /// Move expired in-flight ids to the retry pool. Returns how many moved.
    pub(crate) fn reclaim(&self, now: Tick) -> usize {
        let mut state = self.state.lock();
        let expired = state.inflight.collect_expired(now.ms);
        let count = expired.len();
        state.retry.extend(expired);
        count
    }

    pub(crate) fn stats(&self, tail: u64) -> LineStats {
        let state = self.state.lock();
        LineStats {
            topic: self.topic.clone(),
            line: self.name.clone(),
            recycle_ms: self.recycle_ms,
            head: state.head,
            tail,
            backlog: tail.saturating_sub(state.head),
            inflight: state.inflight.len(),
            retry: state.retry.len(),
            created_at_ms: self.created_at_ms,
        }
    }

    /// Ids currently in flight, ascending.
    pub(crate) fn inflight_ids(&self) -> Vec<u64> {
        self.state.lock().inflight.ids()
    }
}
