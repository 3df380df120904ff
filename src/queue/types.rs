// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use uuid::Uuid;

use crate::conflict::ConflictRecord;
use crate::layer::LayerError;
use crate::operation::{Record, SyncOperation};
use crate::resilience::retry::RetryConfig;
use crate::storage::DeadLetter;

/// Configuration for queue replay.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Distinct resource-keys replayed in parallel
    pub concurrency: usize,
    /// Backoff between attempts of one operation
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 6,
            retry: RetryConfig::replay(),
        }
    }
}

/// Server acknowledgement of a replayed or routed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAck {
    /// Layer that accepted the write
    pub layer: String,
    pub version: u64,
}

/// Remote-only access used while draining: no cache fallback, no queueing.
#[async_trait]
pub trait RemoteTarget: Send + Sync {
    async fn read_remote(&self, resource: &str, key: &str) -> Result<Option<Record>, LayerError>;
    async fn write_remote(&self, operation: &SyncOperation) -> Result<RemoteAck, LayerError>;
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Operations that reached the server (including forced conflict writes)
    pub succeeded: Vec<Uuid>,
    /// Operations moved to the dead-letter list
    pub failed: Vec<DeadLetter>,
    /// Conflicts met, resolved or awaiting a manual decision
    pub conflicts: Vec<ConflictRecord>,
    /// Operations left pending because no remote layer could be tried
    pub deferred: Vec<Uuid>,
    /// The pass stopped early because it was cancelled
    pub cancelled: bool,
}

impl DrainReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty() && self.conflicts.is_empty()
    }

    pub(crate) fn absorb(&mut self, other: DrainReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
        self.conflicts.extend(other.conflicts);
        self.deferred.extend(other.deferred);
        self.cancelled |= other.cancelled;
    }
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    /// Pending operations suspended behind a manual decision
    pub awaiting_resolution: usize,
    pub dead_lettered: usize,
    /// Since this process started
    pub enqueued_total: u64,
    pub committed_total: u64,
    pub draining: bool,
}
