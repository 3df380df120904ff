// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage lifecycle management.
//!
//! Committed queue rows are kept as tombstones and dead letters are kept for
//! inspection; both are dropped once they fall outside the retention window.
//! Cache entries that expired before the cutoff go with them.
//!
//! # Example
//!
//! ```
//! use failover_sync::compaction::CompactionConfig;
//! use std::time::Duration;
//!
//! let config = CompactionConfig {
//!     retention: Duration::from_secs(24 * 3600),
//!     ..Default::default()
//! };
//! assert_eq!(config.cutoff(100_000_000), 100_000_000 - 86_400_000);
//! ```

use std::time::Duration;

use tracing::{debug, info};

use crate::storage::traits::{DurableStore, StorageError};

/// Compaction configuration.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// How long finished operations and dead letters are retained
    pub retention: Duration,

    /// Minimum interval between compaction runs
    pub interval: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 3600),
            interval: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl CompactionConfig {
    /// Rows finished before this timestamp (epoch millis) are removed.
    #[must_use]
    pub fn cutoff(&self, now: i64) -> i64 {
        now.saturating_sub(self.retention.as_millis() as i64)
    }
}

/// Result of a compaction run.
#[derive(Debug, Clone, Default)]
pub struct CompactionResult {
    /// Committed queue rows removed
    pub tombstones_removed: usize,
    /// Dead letters past retention
    pub dead_letters_removed: usize,
    /// Long-expired cache entries
    pub cache_entries_removed: usize,
    /// Duration of compaction run
    pub duration: Duration,
}

impl CompactionResult {
    /// Check if any work was done.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.tombstones_removed + self.dead_letters_removed + self.cache_entries_removed
    }
}

/// Run one compaction pass against `store` at `now`.
pub async fn run_compaction(
    store: &dyn DurableStore,
    config: &CompactionConfig,
    now: i64,
) -> Result<CompactionResult, StorageError> {
    let cutoff = config.cutoff(now);
    let result = store.compact(cutoff).await?;

    if result.is_empty() {
        debug!(cutoff, "Compaction found nothing to remove");
    } else {
        info!(
            tombstones = result.tombstones_removed,
            dead_letters = result.dead_letters_removed,
            cache_entries = result.cache_entries_removed,
            duration_ms = result.duration.as_millis() as u64,
            "Compaction complete"
        );
    }
    crate::metrics::record_compaction(&result);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::SyncOperation;
    use crate::storage::InMemoryStore;
    use serde_json::json;

    #[test]
    fn test_compaction_config_default() {
        let config = CompactionConfig::default();
        assert_eq!(config.retention, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_compaction_result_is_empty() {
        let empty = CompactionResult::default();
        assert!(empty.is_empty());

        let with_work = CompactionResult {
            dead_letters_removed: 2,
            ..Default::default()
        };
        assert!(!with_work.is_empty());
        assert_eq!(with_work.total(), 2);
    }

    #[tokio::test]
    async fn test_run_compaction_keeps_recent_tombstones() {
        let store = InMemoryStore::new();
        let config = CompactionConfig {
            retention: Duration::from_millis(1_000),
            ..Default::default()
        };
        let old = SyncOperation::create("p", "1", json!({}));
        let recent = SyncOperation::create("p", "2", json!({}));
        store.append_operation(&old).await.unwrap();
        store.append_operation(&recent).await.unwrap();
        store.finish_operation(old.id, 1_000).await.unwrap();
        store.finish_operation(recent.id, 9_500).await.unwrap();

        let result = run_compaction(&store, &config, 10_000).await.unwrap();
        assert_eq!(result.tombstones_removed, 1);
        assert_eq!(store.queue_log_len(), 1);
    }
}
