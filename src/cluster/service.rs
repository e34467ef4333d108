//! Coordination service contract and an in-process implementation.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Narrow key-value view of an external coordination service.
///
/// Keys are `/`-separated paths. Implementations must be safe to call from
/// many tasks at once.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Create or overwrite `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Every key starting with `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Short name for logs.
    fn describe(&self) -> String;
}

/// Coordination service held in memory.
///
/// Clones share the same namespace, so several engines in one process can
/// discover each other. [`set_available`](Self::set_available) simulates an
/// outage.
#[derive(Debug, Clone)]
pub struct MemoryCoordination {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self {
            entries: Arc::default(),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail (`false`) or succeed again (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check(&self) -> Result<()> {
        if !self.available.load(Ordering::Acquire) {
            anyhow::bail!("coordination service unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationService for MemoryCoordination {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check()?;
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.check()?;
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.entries.write().remove(key);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
