//! Log compaction policy.
//!
//! Every overwrite or delete leaves a dead record behind in the write-ahead
//! log. Compaction rewrites the live index into a fresh segment and drops the
//! older ones once enough of the log is garbage.
//!
//! A compacted segment holds the full live state as plain puts. Replaying the
//! old segments and then the compacted one yields the same index, so a crash
//! half-way through compaction loses nothing.

use crate::core::config::StorageConfig;
use serde::{Deserialize, Serialize};

/// Size accounting for a log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStats {
    /// Segment files on disk.
    pub segments: usize,
    /// Bytes written across all segments.
    pub log_bytes: u64,
    /// Bytes a freshly compacted log would need.
    pub live_bytes: u64,
    /// Keys in the index.
    pub keys: usize,
}

impl LogStats {
    /// Bytes held by superseded records.
    pub fn garbage_bytes(&self) -> u64 {
        self.log_bytes.saturating_sub(self.live_bytes)
    }

    /// Fraction of the log held by superseded records.
    pub fn garbage_ratio(&self) -> f64 {
        if self.log_bytes == 0 {
            return 0.0;
        }
        self.garbage_bytes() as f64 / self.log_bytes as f64
    }
}

/// When to compact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionPolicy {
    /// Log size below which compaction never runs.
    pub min_log_bytes: u64,

    /// Garbage fraction that triggers compaction.
    pub garbage_ratio: f64,

    /// Whether compaction is enabled.
    pub enabled: bool,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            min_log_bytes: 16 * 1024 * 1024,
            garbage_ratio: 0.5,
            enabled: true,
        }
    }
}

impl CompactionPolicy {
    /// Build the policy from storage configuration.
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            min_log_bytes: config.compaction_min_bytes,
            garbage_ratio: config.compaction_garbage_ratio,
            enabled: true,
        }
    }

    /// Policy that never compacts.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Decide whether a log with `stats` should be compacted now.
    pub fn should_compact(&self, stats: &LogStats) -> bool {
        if !self.enabled || stats.log_bytes < self.min_log_bytes {
            return false;
        }
        stats.garbage_ratio() >= self.garbage_ratio
    }

    /// Disable compaction.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Enable compaction.
    pub fn enable(&mut self) {
        self.enabled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(log_bytes: u64, live_bytes: u64) -> LogStats {
        LogStats {
            segments: 2,
            log_bytes,
            live_bytes,
            keys: 10,
        }
    }

    #[test]
    fn small_logs_are_left_alone() {
        let policy = CompactionPolicy {
            min_log_bytes: 1_000,
            garbage_ratio: 0.5,
            enabled: true,
        };
        assert!(!policy.should_compact(&stats(999, 0)));
        assert!(policy.should_compact(&stats(1_000, 100)));
    }

    #[test]
    fn ratio_threshold_applies() {
        let policy = CompactionPolicy {
            min_log_bytes: 0,
            garbage_ratio: 0.5,
            enabled: true,
        };
        assert!(!policy.should_compact(&stats(1_000, 600)));
        assert!(policy.should_compact(&stats(1_000, 500)));
        assert!(!CompactionPolicy::disabled().should_compact(&stats(1_000, 0)));
    }
}
