//! Common test utilities.
//!
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use linemq::core::config::{StorageBackend, StorageConfig};
use linemq::core::time::ManualClock;
use linemq::queue::{CreateRequest, EngineOptions, QueueEngine};
use linemq::storage::{self, KvStore, LogStore, LogStoreOptions, MemoryStore, WriteBatch};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

/// Start time for manual clocks.
pub const T0: u64 = 1_700_000_000_000;

/// Write `content` to a temporary config file.
pub fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("failed to write config");
    file
}

/// Both storage backends, for tests that must behave the same on each.
pub fn stores(dir: &TempDir) -> Vec<Arc<dyn KvStore>> {
    let durable = storage::open(&StorageConfig::durable(
        dir.path().join("wal").to_string_lossy().to_string(),
    ))
    .expect("failed to open durable store");
    let memory: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    vec![memory, durable]
}

/// Durable store in `dir` with group fsync and no compaction.
pub fn log_store(dir: &Path) -> Arc<LogStore> {
    let options = LogStoreOptions {
        strict: false,
        compaction: linemq::storage::CompactionPolicy::disabled(),
        ..Default::default()
    };
    Arc::new(LogStore::open(dir.to_path_buf(), options).expect("failed to open log store"))
}

/// Engine on `store` driven by a manual clock.
pub fn engine_on(store: Arc<dyn KvStore>) -> (QueueEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = QueueEngine::open_with_clock(store, EngineOptions::default(), clock.clone())
        .expect("failed to open engine");
    (engine, clock)
}

/// In-memory engine driven by a manual clock.
pub fn memory_engine() -> (QueueEngine, Arc<ManualClock>) {
    engine_on(Arc::new(MemoryStore::new()))
}

/// Create `topic` and a line on it.
pub fn topic_with_line(engine: &QueueEngine, topic: &str, line: &str, recycle: Duration) {
    engine
        .create(&CreateRequest::topic(topic))
        .expect("failed to create topic");
    engine
        .create(&CreateRequest::line(topic, line, recycle))
        .expect("failed to create line");
}

/// Memory store whose writes can be made to fail on demand. Reads always
/// succeed.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    failing: AtomicBool,
    sync_calls: AtomicUsize,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every put, delete, write and sync fail until cleared.
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// How many times `sync` has been called, failed or not.
    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("injected write failure");
        }
        Ok(())
    }
}

impl KvStore for FaultyStore {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.check()?;
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.check()?;
        self.inner.delete(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan_prefix(prefix)
    }

    fn last_with_prefix(&self, prefix: &[u8]) -> anyhow::Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.inner.last_with_prefix(prefix)
    }

    fn write(&self, batch: WriteBatch) -> anyhow::Result<()> {
        self.check()?;
        self.inner.write(batch)
    }

    fn sync(&self) -> anyhow::Result<()> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.sync()
    }

    fn close(&self) -> anyhow::Result<()> {
        self.inner.close()
    }

    fn backend(&self) -> StorageBackend {
        self.inner.backend()
    }
}

/// Engine over a [`FaultyStore`], driven by a manual clock.
pub fn faulty_engine(
    options: EngineOptions,
) -> (QueueEngine, Arc<FaultyStore>, Arc<ManualClock>) {
    let store = Arc::new(FaultyStore::new());
    let clock = Arc::new(ManualClock::new(T0));
    let engine = QueueEngine::open_with_clock(store.clone(), options, clock.clone())
        .expect("failed to open engine");
    (engine, store, clock)
}
