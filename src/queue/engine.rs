//! Queue engine: the composition root front ends talk to.
//!
//! A [`QueueEngine`] owns the topic map, the storage backend, the recycle
//! scheduler and, optionally, a cluster coordinator handle. It is an ordinary
//! value; several engines can live in one process.
//!
//! Data operations are synchronous and take an engine gate in shared mode.
//! [`QueueEngine::close`] takes the gate exclusively, so calls racing with
//! close either complete against an open store or fail with
//! [`QueueError::Closed`].

use super::keys::{self, validate_name, TopicRecord};
use super::line::{Line, LineStats};
use super::recycle::RecycleScheduler;
use super::request::{ConfirmRequest, CreateRequest, LineStart, Message};
use super::topic::Topic;
use crate::cluster::CoordinatorHandle;
use crate::core::config::{QueueConfig, StorageBackend};
use crate::core::error::{QueueError, QueueResult};
use crate::core::time::{duration_to_ms, Clock, SystemClock};
use crate::storage::KvStore;
use anyhow::Result;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Largest accepted payload.
    pub max_payload_bytes: usize,
    /// Recycle scheduler period.
    pub recycle_tick: Duration,
}

impl EngineOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_payload_bytes: config.max_payload_bytes,
            recycle_tick: config.recycle_tick(),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Point-in-time view of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicStats {
    pub name: String,
    /// Highest assigned id.
    pub tail: u64,
    pub created_at_ms: u64,
    pub lines: Vec<LineStats>,
}

pub(crate) struct EngineInner {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    options: EngineOptions,
    topics: RwLock<BTreeMap<String, Arc<Topic>>>,
    /// `true` once closed.
    closed: RwLock<bool>,
    coordinator: Mutex<Option<CoordinatorHandle>>,
}

/// Log storage failures once, at the engine boundary.
fn logged(op: &'static str, err: QueueError) -> QueueError {
    if let QueueError::Io { message } = &err {
        tracing::error!(op, error = %message, "storage failure");
    }
    err
}

impl EngineInner {
    fn enter(&self) -> QueueResult<RwLockReadGuard<'_, bool>> {
        let gate = self.closed.read();
        if *gate {
            return Err(QueueError::Closed);
        }
        Ok(gate)
    }

    fn topic(&self, name: &str) -> QueueResult<Arc<Topic>> {
        self.topics
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::TopicNotFound {
                topic: name.to_string(),
            })
    }

    fn line(&self, topic: &str, line: &str) -> QueueResult<(Arc<Topic>, Arc<Line>)> {
        let topic_ref = self.topic(topic)?;
        let line_ref = topic_ref
            .line(line)
            .ok_or_else(|| QueueError::LineNotFound {
                topic: topic.to_string(),
                line: line.to_string(),
            })?;
        Ok((topic_ref, line_ref))
    }

    fn create_topic(&self, name: &str) -> QueueResult<()> {
        let mut topics = self.topics.write();
        if topics.contains_key(name) {
            return Err(QueueError::TopicExists {
                topic: name.to_string(),
            });
        }
        let topic = Topic::create(self.store.as_ref(), name, self.clock.now().ms)
            .map_err(|err| QueueError::io(&err))?;
        topics.insert(name.to_string(), Arc::new(topic));
        drop(topics);

        if let Some(coordinator) = self.coordinator.lock().as_ref() {
            coordinator.announce(name);
        }
        tracing::info!(topic = name, "created topic");
        Ok(())
    }

    fn create_line(&self, req: &CreateRequest, line: &str) -> QueueResult<()> {
        let topic = self.topic(&req.topic_name)?;
        let head = match req.start {
            LineStart::Earliest => 0,
            LineStart::Latest => topic.tail(),
        };
        let recycle_ms = duration_to_ms(req.recycle);
        topic.add_line(
            self.store.as_ref(),
            line,
            recycle_ms,
            head,
            self.clock.now().ms,
        )?;
        tracing::info!(
            topic = %req.topic_name,
            line,
            recycle_ms,
            start = ?req.start,
            "created line"
        );
        Ok(())
    }

    /// One reclaim pass over every line.
    pub(crate) fn reclaim_expired(&self) -> QueueResult<usize> {
        let _gate = self.enter()?;
        let now = self.clock.now();
        let topics: Vec<Arc<Topic>> = self.topics.read().values().cloned().collect();
        Ok(topics
            .iter()
            .flat_map(|topic| topic.lines())
            .map(|line| line.reclaim(now))
            .sum())
    }

    /// Flush buffered writes and let the backend compact.
    pub(crate) fn maintain(&self) -> QueueResult<()> {
        let _gate = self.enter()?;
        self.store.sync().map_err(|err| QueueError::io(&err))
    }
}

/// The queue engine.
pub struct QueueEngine {
    inner: Arc<EngineInner>,
    recycler: Mutex<Option<RecycleScheduler>>,
}

impl std::fmt::Debug for QueueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEngine")
            .field("backend", &self.inner.store.backend())
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl QueueEngine {
    /// Open an engine over `store`, restoring any persisted topics and lines.
    pub fn open(store: Arc<dyn KvStore>, options: EngineOptions) -> Result<Self> {
        Self::open_with_clock(store, options, Arc::new(SystemClock))
    }

    /// Like [`open`](Self::open) with an explicit time source.
    pub fn open_with_clock(
        store: Arc<dyn KvStore>,
        options: EngineOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut topics = BTreeMap::new();
        let mut lines = 0usize;
        let mut inflight = 0usize;
        for (key, value) in store.scan_prefix(keys::TOPIC_PREFIX)? {
            let name = keys::name_suffix(&key, keys::TOPIC_PREFIX)?;
            let record: TopicRecord = keys::decode(&value)?;
            let topic = Topic::restore(store.as_ref(), &name, record)?;
            for line in topic.lines() {
                lines += 1;
                inflight += line.stats(topic.tail()).inflight;
            }
            topics.insert(name, Arc::new(topic));
        }

        tracing::info!(
            backend = %store.backend(),
            topics = topics.len(),
            lines,
            inflight,
            "queue engine opened"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                clock,
                options,
                topics: RwLock::new(topics),
                closed: RwLock::new(false),
                coordinator: Mutex::new(None),
            }),
            recycler: Mutex::new(None),
        })
    }

    /// Spawn the recycle scheduler on the current tokio runtime. Calling it
    /// again is a no-op.
    pub fn start_recycler(&self) -> QueueResult<()> {
        let _gate = self.inner.enter()?;
        let mut recycler = self.recycler.lock();
        if recycler.is_none() {
            *recycler = Some(RecycleScheduler::spawn(
                Arc::clone(&self.inner),
                self.inner.options.recycle_tick,
            ));
        }
        Ok(())
    }

    /// Hand the engine a coordinator. Existing topics are announced at once,
    /// new ones as they are created. The coordinator is shut down by
    /// [`close`](Self::close).
    pub fn attach_coordinator(&self, handle: CoordinatorHandle) -> QueueResult<()> {
        let _gate = self.inner.enter()?;
        for name in self.inner.topics.read().keys() {
            handle.announce(name);
        }
        *self.inner.coordinator.lock() = Some(handle);
        Ok(())
    }

    /// Create a topic, or a line when the request names one.
    pub fn create(&self, req: &CreateRequest) -> QueueResult<()> {
        let _gate = self.inner.enter()?;
        validate_name("topic", &req.topic_name)?;
        let created = match req.line_name() {
            None => self.inner.create_topic(&req.topic_name),
            Some(line) => {
                validate_name("line", line)?;
                if req.recycle.is_zero() {
                    return Err(QueueError::InvalidRecycle {
                        recycle: req.recycle,
                    });
                }
                self.inner.create_line(req, line)
            }
        };
        created.map_err(|err| logged("create", err))
    }

    /// Append a message to `topic`, returning its id.
    pub fn push(&self, topic: &str, payload: &[u8]) -> QueueResult<u64> {
        let _gate = self.inner.enter()?;
        let limit = self.inner.options.max_payload_bytes;
        if payload.len() > limit {
            return Err(QueueError::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }
        let topic = self.inner.topic(topic)?;
        let id = topic
            .push(self.inner.store.as_ref(), payload)
            .map_err(|err| logged("push", QueueError::io(&err)))?;
        tracing::trace!(topic = topic.name(), id, bytes = payload.len(), "pushed");
        Ok(id)
    }

    /// Pop the next message for a `"topic/line"` key. Never blocks.
    pub fn pop(&self, key: &str) -> QueueResult<Message> {
        let _gate = self.inner.enter()?;
        let (topic_name, line_name) = keys::split_pop_key(key)?;
        let (topic, line) = self.inner.line(topic_name, line_name)?;
        let message = line
            .pop(self.inner.store.as_ref(), &topic, self.inner.clock.now())
            .map_err(|err| logged("pop", err))?;
        tracing::trace!(topic = topic_name, line = line_name, id = message.id, "popped");
        Ok(message)
    }

    /// Acknowledge a popped message.
    pub fn confirm(&self, req: &ConfirmRequest) -> QueueResult<()> {
        let _gate = self.inner.enter()?;
        let (_, line) = self.inner.line(&req.topic_name, &req.line_name)?;
        line.confirm(self.inner.store.as_ref(), req.message_id)
            .map_err(|err| logged("confirm", err))?;
        tracing::trace!(
            topic = %req.topic_name,
            line = line.name(),
            id = req.message_id,
            "confirmed"
        );
        Ok(())
    }

    /// Run one reclaim pass now, returning how many ids were recycled.
    pub fn recycle_now(&self) -> QueueResult<usize> {
        self.inner.reclaim_expired()
    }

    /// Topic names in order.
    pub fn topics(&self) -> QueueResult<Vec<String>> {
        let _gate = self.inner.enter()?;
        Ok(self.inner.topics.read().keys().cloned().collect())
    }

    pub fn topic_stats(&self, topic: &str) -> QueueResult<TopicStats> {
        let _gate = self.inner.enter()?;
        let topic = self.inner.topic(topic)?;
        let tail = topic.tail();
        Ok(TopicStats {
            name: topic.name().to_string(),
            tail,
            created_at_ms: topic.created_at_ms(),
            lines: topic.lines().iter().map(|line| line.stats(tail)).collect(),
        })
    }

    pub fn line_stats(&self, topic: &str, line: &str) -> QueueResult<LineStats> {
        let _gate = self.inner.enter()?;
        let (topic, line) = self.inner.line(topic, line)?;
        Ok(line.stats(topic.tail()))
    }

    /// Ids in flight on a line, ascending.
    pub fn inflight(&self, topic: &str, line: &str) -> QueueResult<Vec<u64>> {
        let _gate = self.inner.enter()?;
        let (_, line) = self.inner.line(topic, line)?;
        Ok(line.inflight_ids())
    }

    pub fn backend(&self) -> StorageBackend {
        self.inner.store.backend()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.read()
    }

    /// Stop the scheduler, deregister from the cluster, then flush and close
    /// storage. Later calls return immediately.
    pub async fn close(&self) -> QueueResult<()> {
        {
            let mut closed = self.inner.closed.write();
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        let recycler = self.recycler.lock().take();
        if let Some(recycler) = recycler {
            recycler.stop().await;
        }

        let coordinator = self.inner.coordinator.lock().take();
        if let Some(coordinator) = coordinator {
            coordinator.shutdown().await;
        }

        self.inner
            .store
            .close()
            .map_err(|err| logged("close", QueueError::io(&err)))?;
        tracing::info!("queue engine closed");
        Ok(())
    }
}
