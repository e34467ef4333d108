//! Durable backend: segmented write-ahead log plus an ordered in-memory index.
//!
//! # Layout
//!
//! The store directory holds `segment_{id:016}.wal` files. Each segment is a
//! sequence of length-prefixed records:
//!
//! ```text
//! +----------------+----------------------------+
//! | len: u32 (LE)  | bincode(WalRecord)         |
//! +----------------+----------------------------+
//! ```
//!
//! A [`WriteBatch`] is written as one record, so it is either replayed whole
//! or not at all.
//!
//! # Recovery
//!
//! On open, segments are replayed in id order into the index. A record cut
//! short by a crash ends its segment: the file is truncated back to the last
//! complete record and replay moves on. Writes after recovery always go to a
//! fresh segment.
//!
//! # Durability
//!
//! In strict mode every append is followed by `fdatasync`. In group-fsync mode
//! appends are only flushed to the OS and [`KvStore::sync`] fsyncs the active
//! segment; the queue engine calls it once per recycle tick.

use super::compaction::{CompactionPolicy, LogStats};
use super::memory::prefix_bounds;
use super::{BatchOp, KvStore, WriteBatch};
use crate::core::config::{StorageBackend, StorageConfig};
use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Default maximum segment size (64 MB).
const DEFAULT_SEGMENT_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Bytes of framing charged per live key when estimating compacted size.
const RECORD_OVERHEAD: u64 = 24;

const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_EXT: &str = "wal";

/// Logged mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Batch(Vec<BatchOp>),
}

/// A single log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Monotonic sequence number across all segments.
    pub seq: u64,
    pub op: WalOp,
}

impl WalRecord {
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("failed to serialize WAL record")
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("failed to deserialize WAL record")
    }
}

/// Tuning for [`LogStore`].
#[derive(Debug, Clone)]
pub struct LogStoreOptions {
    /// fsync after every append.
    pub strict: bool,
    /// Size at which the active segment is rotated.
    pub segment_max_bytes: u64,
    pub compaction: CompactionPolicy,
}

impl Default for LogStoreOptions {
    fn default() -> Self {
        Self {
            strict: true,
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            compaction: CompactionPolicy::default(),
        }
    }
}

impl LogStoreOptions {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            strict: config.is_strict(),
            segment_max_bytes: config.segment_max_bytes,
            compaction: CompactionPolicy::from_config(config),
        }
    }
}

#[derive(Debug, Clone)]
struct SegmentInfo {
    id: u64,
    path: PathBuf,
    size_bytes: u64,
}

struct ActiveSegment {
    info: SegmentInfo,
    writer: BufWriter<File>,
}

impl ActiveSegment {
    fn create(dir: &Path, id: u64) -> Result<Self> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to create segment {}", path.display()))?;
        tracing::debug!(segment = id, "opened WAL segment");
        Ok(Self {
            info: SegmentInfo {
                id,
                path,
                size_bytes: 0,
            },
            writer: BufWriter::new(file),
        })
    }

    fn append(&mut self, frame: &[u8]) -> Result<()> {
        self.writer
            .write_all(frame)
            .context("failed to write WAL record")?;
        self.writer.flush().context("failed to flush segment")?;
        self.info.size_bytes += frame.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush segment")?;
        self.writer
            .get_ref()
            .sync_data()
            .context("failed to fsync segment")
    }

    /// Seal the segment after a failed write: buffered bytes are discarded
    /// and the file is cut back to `valid_len`, so no partial or unacknowledged
    /// record is left for replay.
    fn abandon(self, valid_len: u64) -> SegmentInfo {
        let Self { info, writer } = self;
        let (file, _unwritten) = writer.into_parts();
        if let Err(err) = file.set_len(valid_len).and_then(|()| file.sync_all()) {
            tracing::error!(
                segment = info.id,
                valid_bytes = valid_len,
                error = %err,
                "failed to truncate segment after failed write"
            );
        }
        SegmentInfo {
            size_bytes: valid_len,
            ..info
        }
    }
}

/// Writer-side state. Guarded by one mutex; the index lock is always taken
/// after it.
struct LogWriter {
    active: Option<ActiveSegment>,
    /// Sealed segments in id order.
    sealed: Vec<SegmentInfo>,
    next_segment_id: u64,
    next_seq: u64,
    log_bytes: u64,
    live_bytes: u64,
}

/// Write-ahead-log backed [`KvStore`].
///
/// Lock order: `compaction`, then `writer`, then `index`.
pub struct LogStore {
    dir: PathBuf,
    options: LogStoreOptions,
    index: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    writer: Mutex<LogWriter>,
    /// Held for the whole of a compaction; one runs at a time.
    compaction: Mutex<()>,
    closed: AtomicBool,
}

/// Work captured under the writer lock for one compaction.
struct CompactionPlan {
    segment_id: u64,
    first_seq: u64,
    snapshot: Vec<(Vec<u8>, Vec<u8>)>,
    replaced: Vec<SegmentInfo>,
    before: LogStats,
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore")
            .field("dir", &self.dir)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}{:016}.{}", SEGMENT_PREFIX, id, SEGMENT_EXT))
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    if path.extension()? != SEGMENT_EXT {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(SEGMENT_PREFIX)?
        .parse()
        .ok()
}

fn entry_size(key: &[u8], value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64 + RECORD_OVERHEAD
}

fn frame(record: &WalRecord) -> Result<Vec<u8>> {
    let body = record.encode()?;
    let len = u32::try_from(body.len()).context("WAL record exceeds 4 GiB")?;
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Apply `op` to `index`, keeping `live_bytes` in step.
fn apply(index: &mut BTreeMap<Vec<u8>, Vec<u8>>, live_bytes: &mut u64, op: WalOp) {
    match op {
        WalOp::Put { key, value } => {
            let added = entry_size(&key, &value);
            if let Some(old) = index.insert(key.clone(), value) {
                *live_bytes = live_bytes.saturating_sub(entry_size(&key, &old));
            }
            *live_bytes += added;
        }
        WalOp::Delete { key } => {
            if let Some(old) = index.remove(&key) {
                *live_bytes = live_bytes.saturating_sub(entry_size(&key, &old));
            }
        }
        WalOp::Batch(ops) => {
            for op in ops {
                let op = match op {
                    BatchOp::Put { key, value } => WalOp::Put { key, value },
                    BatchOp::Delete { key } => WalOp::Delete { key },
                };
                apply(index, live_bytes, op);
            }
        }
    }
}

/// Outcome of replaying one segment.
struct Replayed {
    records: Vec<WalRecord>,
    /// Offset just past the last complete record.
    valid_len: u64,
    file_len: u64,
}

fn replay_segment(path: &Path) -> Result<Replayed> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read segment {}", path.display()))?;
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset + 4 <= bytes.len() {
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&bytes[offset..offset + 4]);
        let len = u32::from_le_bytes(len_buf) as usize;
        let start = offset + 4;
        let Some(end) = start.checked_add(len).filter(|end| *end <= bytes.len()) else {
            break;
        };
        match WalRecord::decode(&bytes[start..end]) {
            Ok(record) => records.push(record),
            Err(err) => {
                tracing::warn!(
                    segment = %path.display(),
                    offset,
                    error = %err,
                    "undecodable WAL record; treating as end of segment"
                );
                break;
            }
        }
        offset = end;
    }

    Ok(Replayed {
        records,
        valid_len: offset as u64,
        file_len: bytes.len() as u64,
    })
}

impl LogStore {
    /// Open or create a store in `dir`, replaying existing segments.
    pub fn open(dir: PathBuf, options: LogStoreOptions) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create storage directory {}", dir.display()))?;

        let mut segments: Vec<(u64, PathBuf)> = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                parse_segment_id(&path).map(|id| (id, path))
            })
            .collect();
        segments.sort_by_key(|(id, _)| *id);

        let mut index = BTreeMap::new();
        let mut live_bytes = 0u64;
        let mut log_bytes = 0u64;
        let mut next_seq = 1u64;
        let mut sealed = Vec::with_capacity(segments.len());
        let mut replayed_records = 0usize;

        for (id, path) in &segments {
            let replayed = replay_segment(path)?;
            if replayed.valid_len < replayed.file_len {
                tracing::warn!(
                    segment = %path.display(),
                    valid_bytes = replayed.valid_len,
                    file_bytes = replayed.file_len,
                    "truncating torn WAL tail"
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                file.set_len(replayed.valid_len)
                    .context("failed to truncate torn segment")?;
                file.sync_all().context("failed to fsync truncated segment")?;
            }
            replayed_records += replayed.records.len();
            for record in replayed.records {
                next_seq = next_seq.max(record.seq + 1);
                apply(&mut index, &mut live_bytes, record.op);
            }
            log_bytes += replayed.valid_len;
            sealed.push(SegmentInfo {
                id: *id,
                path: path.clone(),
                size_bytes: replayed.valid_len,
            });
        }

        let next_segment_id = segments.last().map(|(id, _)| id + 1).unwrap_or(1);

        tracing::info!(
            storage_dir = %dir.display(),
            segments = segments.len(),
            records = replayed_records,
            keys = index.len(),
            strict = options.strict,
            "opened durable store"
        );

        Ok(Self {
            dir,
            options,
            index: RwLock::new(index),
            writer: Mutex::new(LogWriter {
                active: None,
                sealed,
                next_segment_id,
                next_seq,
                log_bytes,
                live_bytes,
            }),
            compaction: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Directory holding the segments.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Size accounting for the log.
    pub fn stats(&self) -> LogStats {
        let writer = self.writer.lock();
        self.stats_locked(&writer)
    }

    fn stats_locked(&self, writer: &LogWriter) -> LogStats {
        LogStats {
            segments: writer.sealed.len() + usize::from(writer.active.is_some()),
            log_bytes: writer.log_bytes,
            live_bytes: writer.live_bytes,
            keys: self.index.read().len(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("durable store at {} is closed", self.dir.display());
        }
        Ok(())
    }

    /// Make sure the writer has a segment with room left, rotating if needed.
    fn active_segment<'a>(&self, writer: &'a mut LogWriter) -> Result<&'a mut ActiveSegment> {
        let rotate = match &writer.active {
            None => true,
            Some(active) => active.info.size_bytes >= self.options.segment_max_bytes,
        };
        if rotate {
            if let Some(mut old) = writer.active.take() {
                if let Err(err) = old.sync() {
                    tracing::warn!(segment = old.info.id, error = %err, "failed to fsync sealed segment");
                }
                writer.sealed.push(old.info);
            }
            let id = writer.next_segment_id;
            writer.next_segment_id += 1;
            writer.active = Some(ActiveSegment::create(&self.dir, id)?);
        }
        writer
            .active
            .as_mut()
            .context("no active WAL segment")
    }

    fn append(&self, op: WalOp) -> Result<()> {
        self.ensure_open()?;
        let mut writer = self.writer.lock();
        let record = WalRecord {
            seq: writer.next_seq,
            op,
        };
        let framed = frame(&record)?;
        let strict = self.options.strict;

        let written = {
            let active = self.active_segment(&mut writer)?;
            let start = active.info.size_bytes;
            match active.append(&framed) {
                Ok(()) if strict => active.sync(),
                other => other,
            }
            .map_err(|err| (start, err))
        };
        if let Err((start, err)) = written {
            // The next append opens a fresh segment.
            if let Some(active) = writer.active.take() {
                let sealed = active.abandon(start);
                writer.sealed.push(sealed);
            }
            return Err(err);
        }

        writer.next_seq += 1;
        writer.log_bytes += framed.len() as u64;
        let mut live_bytes = writer.live_bytes;
        apply(&mut self.index.write(), &mut live_bytes, record.op);
        writer.live_bytes = live_bytes;
        Ok(())
    }

    /// Compact now regardless of policy. Waits for a running compaction.
    pub fn compact(&self) -> Result<()> {
        self.ensure_open()?;
        let _compacting = self.compaction.lock();
        self.compact_exclusive()
    }

    /// Rewrite the live index into a new segment and delete the segments it
    /// replaces. The writer lock is only held to take the snapshot and to
    /// swap segments; appends continue into a fresh segment meanwhile.
    /// Caller holds `compaction`.
    fn compact_exclusive(&self) -> Result<()> {
        let CompactionPlan {
            segment_id,
            first_seq,
            snapshot,
            replaced,
            before,
        } = self.plan_compaction()?;

        let mut compacted = ActiveSegment::create(&self.dir, segment_id)?;
        let written = snapshot
            .into_iter()
            .zip(first_seq..)
            .try_for_each(|((key, value), seq)| {
                let record = WalRecord {
                    seq,
                    op: WalOp::Put { key, value },
                };
                compacted.append(&frame(&record)?)
            })
            .and_then(|()| compacted.sync());
        if let Err(err) = written {
            let path = compacted.info.path.clone();
            drop(compacted);
            if let Err(remove_err) = std::fs::remove_file(&path) {
                tracing::warn!(
                    segment = segment_id,
                    error = %remove_err,
                    "failed to remove partial compacted segment"
                );
            }
            return Err(err);
        }

        let mut writer = self.writer.lock();
        let mut removed_bytes = 0u64;
        for old in &replaced {
            if let Err(err) = std::fs::remove_file(&old.path) {
                tracing::warn!(segment = old.id, error = %err, "failed to remove compacted segment");
            }
            removed_bytes += old.size_bytes;
        }
        writer
            .sealed
            .retain(|info| !replaced.iter().any(|old| old.id == info.id));
        writer.log_bytes =
            writer.log_bytes.saturating_sub(removed_bytes) + compacted.info.size_bytes;
        // Every segment still sealed was opened after the snapshot.
        writer.sealed.insert(0, compacted.info);

        tracing::info!(
            before_bytes = before.log_bytes,
            after_bytes = writer.log_bytes,
            keys = before.keys,
            replaced = replaced.len(),
            "compacted WAL"
        );
        Ok(())
    }

    /// Seal the active segment and snapshot the index. Everything in the
    /// snapshot is covered by the sealed segments at this point, and the new
    /// segment id and sequence range sort before any later append.
    fn plan_compaction(&self) -> Result<CompactionPlan> {
        let mut writer = self.writer.lock();
        let before = self.stats_locked(&writer);

        if let Some(active) = writer.active.as_mut() {
            active.sync()?;
        }
        if let Some(active) = writer.active.take() {
            writer.sealed.push(active.info);
        }

        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = self
            .index
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let segment_id = writer.next_segment_id;
        writer.next_segment_id += 1;
        let first_seq = writer.next_seq;
        writer.next_seq += snapshot.len() as u64;

        Ok(CompactionPlan {
            segment_id,
            first_seq,
            snapshot,
            replaced: writer.sealed.clone(),
            before,
        })
    }
}

impl KvStore for LogStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.index.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.append(WalOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.append(WalOp::Delete { key: key.to_vec() })
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_open()?;
        let index = self.index.read();
        Ok(index
            .range(prefix_bounds(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn last_with_prefix(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.ensure_open()?;
        let index = self.index.read();
        Ok(index
            .range(prefix_bounds(prefix))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return self.ensure_open();
        }
        self.append(WalOp::Batch(batch.into_ops()))
    }

    fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        let should_compact = {
            let mut writer = self.writer.lock();
            if let Some(active) = writer.active.as_mut() {
                active.sync()?;
            }
            self.options
                .compaction
                .should_compact(&self.stats_locked(&writer))
        };
        if should_compact {
            // A compaction already in progress covers this one.
            if let Some(_compacting) = self.compaction.try_lock() {
                self.compact_exclusive()?;
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut active) = writer.active.take() {
            active.sync()?;
            writer.sealed.push(active.info);
        }
        tracing::info!(storage_dir = %self.dir.display(), "closed durable store");
        Ok(())
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Durable
    }
}
