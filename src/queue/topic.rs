//! Topic store: append-only message log with a monotonic id counter.

use super::keys::{self, LineRecord, TopicRecord};
use super::line::Line;
use crate::core::error::{QueueError, QueueResult};
use crate::storage::KvStore;
use anyhow::Result;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) struct Topic {
    name: String,
    created_at_ms: u64,
    /// Highest allocated id. Held for the whole allocate-and-append step.
    append: Mutex<u64>,
    /// Highest id whose payload is durable and readable.
    tail: AtomicU64,
    lines: RwLock<BTreeMap<String, Arc<Line>>>,
}

impl Topic {
    /// Persist a new topic.
    pub(crate) fn create(store: &dyn KvStore, name: &str, now_ms: u64) -> Result<Self> {
        let record = TopicRecord {
            created_at_ms: now_ms,
        };
        store.put(&keys::topic_key(name), &keys::encode(&record)?)?;
        Ok(Self::with_tail(name, record, 0))
    }

    /// Rebuild a topic and its lines from storage.
    pub(crate) fn restore(store: &dyn KvStore, name: &str, record: TopicRecord) -> Result<Self> {
        let prefix = keys::message_prefix(name);
        let tail = store
            .last_with_prefix(&prefix)?
            .and_then(|(key, _)| keys::id_suffix(&key, &prefix))
            .unwrap_or(0);
        let topic = Self::with_tail(name, record, tail);

        let line_prefix = keys::line_prefix(name);
        let mut lines = topic.lines.write();
        for (key, value) in store.scan_prefix(&line_prefix)? {
            let line_name = keys::name_suffix(&key, &line_prefix)?;
            let record: LineRecord = keys::decode(&value)?;
            let line = Line::restore(store, name, &line_name, record, tail)?;
            lines.insert(line_name, Arc::new(line));
        }
        drop(lines);

        Ok(topic)
    }

    fn with_tail(name: &str, record: TopicRecord, tail: u64) -> Self {
        Self {
            name: name.to_string(),
            created_at_ms: record.created_at_ms,
            append: Mutex::new(tail),
            tail: AtomicU64::new(tail),
            lines: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// Highest readable id.
    pub(crate) fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Append `payload`, returning its id. A failed write consumes no id.
    pub(crate) fn push(&self, store: &dyn KvStore, payload: &[u8]) -> Result<u64> {
        let mut last = self.append.lock();
        let id = *last + 1;
        store.put(&keys::message_key(&self.name, id), payload)?;
        *last = id;
        self.tail.store(id, Ordering::Release);
        Ok(id)
    }

    pub(crate) fn read(&self, store: &dyn KvStore, id: u64) -> QueueResult<Bytes> {
        match store.get(&keys::message_key(&self.name, id)) {
            Ok(Some(payload)) => Ok(Bytes::from(payload)),
            Ok(None) => Err(QueueError::Io {
                message: format!("payload of message {} on topic {} is missing", id, self.name),
            }),
            Err(err) => Err(QueueError::io(&err)),
        }
    }

    pub(crate) fn line(&self, name: &str) -> Option<Arc<Line>> {
        self.lines.read().get(name).cloned()
    }

    pub(crate) fn lines(&self) -> Vec<Arc<Line>> {
        self.lines.read().values().cloned().collect()
    }

    /// Register a new line, persisting it first.
    pub(crate) fn add_line(
        &self,
        store: &dyn KvStore,
        name: &str,
        recycle_ms: u64,
        head: u64,
        now_ms: u64,
    ) -> QueueResult<()> {
        let mut lines = self.lines.write();
        if lines.contains_key(name) {
            return Err(QueueError::LineExists {
                topic: self.name.clone(),
                line: name.to_string(),
            });
        }
        let line = Line::create(store, &self.name, name, recycle_ms, head, now_ms)
            .map_err(|err| QueueError::io(&err))?;
        lines.insert(name.to_string(), Arc::new(line));
        Ok(())
    }
}
