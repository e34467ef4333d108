//! Storage layer.
//!
//! The queue engine only talks to the ordered key-value contract of
//! [`KvStore`]. Two backends implement it:
//!
//! - [`wal::LogStore`] - segmented write-ahead log replayed into an ordered
//!   index; survives crashes
//! - [`memory::MemoryStore`] - volatile map for tests and ephemeral nodes
//!
//! The backend is picked once, from [`StorageBackend`], by [`open`]. Keys are
//! compared bytewise, so range scans return records in key order and engine
//! state can be rebuilt with prefix scans on restart.

pub mod compaction;
pub mod memory;
pub mod wal;

use crate::core::config::{StorageBackend, StorageConfig};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub use compaction::CompactionPolicy;
pub use memory::MemoryStore;
pub use wal::{LogStore, LogStoreOptions, WalOp, WalRecord};

/// A single mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    /// Insert or overwrite a key.
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Remove a key.
    Delete { key: Vec<u8> },
}

/// A group of mutations applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a put.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Queue a delete.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Queued operations.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Consume the batch.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Ordered key-value store.
pub trait KvStore: Send + Sync {
    /// Read a key. `None` means the key does not exist.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite a key.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// All records whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// The record with the greatest key starting with `prefix`.
    fn last_with_prefix(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;

    /// Apply every operation of `batch` or none of them.
    fn write(&self, batch: WriteBatch) -> Result<()>;

    /// Flush buffered writes and run housekeeping.
    fn sync(&self) -> Result<()>;

    /// Flush and release the backend. Later calls fail.
    fn close(&self) -> Result<()>;

    /// Which backend this is.
    fn backend(&self) -> StorageBackend;
}

/// Open the backend selected by `config`.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn KvStore>> {
    match config.backend {
        StorageBackend::Memory => {
            tracing::info!("opening volatile in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Durable => {
            let options = LogStoreOptions::from_config(config);
            let store = LogStore::open(PathBuf::from(&config.dir), options)?;
            Ok(Arc::new(store))
        }
    }
}

/// Smallest key greater than every key starting with `prefix`, or `None` when
/// no such key exists (the prefix is all `0xff`).
pub(crate) fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_successor_increments_last_byte() {
        assert_eq!(prefix_successor(b"m/foo/"), Some(b"m/foo0".to_vec()));
        assert_eq!(prefix_successor(&[0x01, 0xff]), Some(vec![0x02]));
        assert_eq!(prefix_successor(&[0xff, 0xff]), None);
        assert_eq!(prefix_successor(b""), None);
    }

    #[test]
    fn write_batch_keeps_order() {
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec()).delete(b"b".to_vec());
        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.ops()[1],
            BatchOp::Delete {
                key: b"b".to_vec()
            }
        );
    }
}
