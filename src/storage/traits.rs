// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::compaction::CompactionResult;
use crate::conflict::ConflictRecord;
use crate::operation::{Record, SyncOperation};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{id}': expected hash {expected}, got {actual}")]
    Corruption {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Last known value of a record, as fetched from a remote layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub resource: String,
    pub key: String,
    pub value: Value,
    pub version: u64,
    /// Fetch timestamp (epoch millis)
    pub fetched_at: i64,
    /// Freshness deadline (epoch millis); expired entries still serve stale reads
    pub expires_at: i64,
    pub origin_layer: String,
}

impl CacheEntry {
    pub fn from_record(
        resource: impl Into<String>,
        key: impl Into<String>,
        record: &Record,
        origin_layer: impl Into<String>,
        ttl: Duration,
        now: i64,
    ) -> Self {
        Self {
            resource: resource.into(),
            key: key.into(),
            value: record.value.clone(),
            version: record.version,
            fetched_at: now,
            expires_at: now.saturating_add(ttl.as_millis() as i64),
            origin_layer: origin_layer.into(),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    #[must_use]
    pub fn to_record(&self) -> Record {
        Record {
            value: self.value.clone(),
            version: self.version,
            updated_at: self.fetched_at,
        }
    }
}

/// A permanently failed operation, retained for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub operation: SyncOperation,
    pub reason: String,
    /// Epoch millis
    pub dead_lettered_at: i64,
}

/// Owner of all shared mutable state: the read cache, the offline queue log,
/// dead letters and unresolved conflicts.
///
/// Every method is a short atomic append/update/remove; implementations never
/// hold a lock across calls.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_cache(&self, resource: &str, key: &str) -> Result<Option<CacheEntry>, StorageError>;
    async fn put_cache(&self, entry: &CacheEntry) -> Result<(), StorageError>;
    async fn remove_cache(&self, resource: &str, key: &str) -> Result<(), StorageError>;

    /// Append to the queue log. Returns the FIFO sequence number.
    async fn append_operation(&self, operation: &SyncOperation) -> Result<u64, StorageError>;
    /// Persist status/retry changes of a queued operation.
    async fn update_operation(&self, operation: &SyncOperation) -> Result<(), StorageError>;
    async fn get_operation(&self, id: Uuid) -> Result<Option<SyncOperation>, StorageError>;
    /// Non-terminal operations in FIFO order.
    async fn pending_operations(&self) -> Result<Vec<SyncOperation>, StorageError>;
    /// Mark an operation committed, leaving a tombstone for compaction.
    /// Returns false if the operation was not queued.
    async fn finish_operation(&self, id: Uuid, finished_at: i64) -> Result<bool, StorageError>;

    /// Atomically move an operation from the queue to the dead-letter list.
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), StorageError>;
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError>;
    async fn take_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetter>, StorageError>;

    async fn put_conflict(&self, record: &ConflictRecord) -> Result<(), StorageError>;
    async fn conflicts(&self) -> Result<Vec<ConflictRecord>, StorageError>;
    async fn take_conflict(&self, operation_id: Uuid) -> Result<Option<ConflictRecord>, StorageError>;

    /// Remove commit tombstones and dead letters finished before `cutoff`,
    /// and cache entries that expired before it.
    async fn compact(&self, cutoff: i64) -> Result<CompactionResult, StorageError>;
}
