// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use super::traits::{CacheEntry, DeadLetter, DurableStore, StorageError};
use crate::compaction::CompactionResult;
use crate::conflict::ConflictRecord;
use crate::operation::{OperationStatus, SyncOperation};

#[derive(Default)]
struct QueueLog {
    next_seq: u64,
    entries: BTreeMap<u64, QueueEntry>,
    by_id: HashMap<Uuid, u64>,
}

struct QueueEntry {
    operation: SyncOperation,
    finished_at: Option<i64>,
}

/// Volatile [`DurableStore`] for tests and ephemeral sessions.
pub struct InMemoryStore {
    cache: DashMap<(String, String), CacheEntry>,
    queue: RwLock<QueueLog>,
    dead_letters: DashMap<Uuid, DeadLetter>,
    conflicts: DashMap<Uuid, ConflictRecord>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
            queue: RwLock::new(QueueLog::default()),
            dead_letters: DashMap::new(),
            conflicts: DashMap::new(),
        }
    }

    /// Number of cached records
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Number of queue log rows, tombstones included
    #[must_use]
    pub fn queue_log_len(&self) -> usize {
        self.queue.read().entries.len()
    }

    /// Clear the cache (queue and dead letters are untouched)
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn cache_key(resource: &str, key: &str) -> (String, String) {
    (resource.to_string(), key.to_string())
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn get_cache(&self, resource: &str, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self.cache.get(&cache_key(resource, key)).map(|r| r.value().clone()))
    }

    async fn put_cache(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        self.cache.insert(cache_key(&entry.resource, &entry.key), entry.clone());
        Ok(())
    }

    async fn remove_cache(&self, resource: &str, key: &str) -> Result<(), StorageError> {
        self.cache.remove(&cache_key(resource, key));
        Ok(())
    }

    async fn append_operation(&self, operation: &SyncOperation) -> Result<u64, StorageError> {
        let mut log = self.queue.write();
        if log.by_id.contains_key(&operation.id) {
            return Err(StorageError::Backend(format!("operation {} already queued", operation.id)));
        }
        log.next_seq += 1;
        let seq = log.next_seq;
        log.by_id.insert(operation.id, seq);
        log.entries.insert(seq, QueueEntry { operation: operation.clone(), finished_at: None });
        Ok(seq)
    }

    async fn update_operation(&self, operation: &SyncOperation) -> Result<(), StorageError> {
        let mut log = self.queue.write();
        let seq = log
            .by_id
            .get(&operation.id)
            .copied()
            .ok_or_else(|| StorageError::Backend(format!("operation {} not queued", operation.id)))?;
        if let Some(entry) = log.entries.get_mut(&seq) {
            entry.operation = operation.clone();
        }
        Ok(())
    }

    async fn get_operation(&self, id: Uuid) -> Result<Option<SyncOperation>, StorageError> {
        let log = self.queue.read();
        Ok(log
            .by_id
            .get(&id)
            .and_then(|seq| log.entries.get(seq))
            .map(|entry| entry.operation.clone()))
    }

    async fn pending_operations(&self) -> Result<Vec<SyncOperation>, StorageError> {
        let log = self.queue.read();
        Ok(log
            .entries
            .values()
            .filter(|entry| !entry.operation.status.is_terminal())
            .map(|entry| entry.operation.clone())
            .collect())
    }

    async fn finish_operation(&self, id: Uuid, finished_at: i64) -> Result<bool, StorageError> {
        let mut log = self.queue.write();
        let Some(seq) = log.by_id.get(&id).copied() else {
            return Ok(false);
        };
        match log.entries.get_mut(&seq) {
            Some(entry) if !entry.operation.status.is_terminal() => {
                entry.operation.status = OperationStatus::Committed;
                entry.finished_at = Some(finished_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), StorageError> {
        {
            let mut log = self.queue.write();
            if let Some(seq) = log.by_id.get(&letter.operation.id).copied() {
                if let Some(entry) = log.entries.get_mut(&seq) {
                    entry.operation.status = OperationStatus::DeadLettered;
                    entry.finished_at = Some(letter.dead_lettered_at);
                }
            }
            // Insert while holding the queue lock so readers never see the op in neither place.
            let mut stored = letter.clone();
            stored.operation.status = OperationStatus::DeadLettered;
            self.dead_letters.insert(letter.operation.id, stored);
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError> {
        let mut letters: Vec<DeadLetter> = self.dead_letters.iter().map(|r| r.value().clone()).collect();
        letters.sort_by_key(|l| (l.dead_lettered_at, l.operation.created_at));
        Ok(letters)
    }

    async fn take_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetter>, StorageError> {
        let Some((_, letter)) = self.dead_letters.remove(&id) else {
            return Ok(None);
        };
        // The tombstone would block a re-append under the same id.
        let mut log = self.queue.write();
        if let Some(seq) = log.by_id.get(&id).copied() {
            if log.entries.get(&seq).is_some_and(|e| e.operation.status == OperationStatus::DeadLettered) {
                log.entries.remove(&seq);
                log.by_id.remove(&id);
            }
        }
        Ok(Some(letter))
    }

    async fn put_conflict(&self, record: &ConflictRecord) -> Result<(), StorageError> {
        self.conflicts.insert(record.operation.id, record.clone());
        Ok(())
    }

    async fn conflicts(&self) -> Result<Vec<ConflictRecord>, StorageError> {
        let mut records: Vec<ConflictRecord> = self.conflicts.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.detected_at);
        Ok(records)
    }

    async fn take_conflict(&self, operation_id: Uuid) -> Result<Option<ConflictRecord>, StorageError> {
        Ok(self.conflicts.remove(&operation_id).map(|(_, record)| record))
    }

    async fn compact(&self, cutoff: i64) -> Result<CompactionResult, StorageError> {
        let start = Instant::now();
        let mut result = CompactionResult::default();

        {
            let mut log = self.queue.write();
            let expired: Vec<(u64, Uuid)> = log
                .entries
                .iter()
                .filter(|(_, e)| e.finished_at.is_some_and(|t| t < cutoff))
                .map(|(seq, e)| (*seq, e.operation.id))
                .collect();
            for (seq, id) in expired {
                log.entries.remove(&seq);
                log.by_id.remove(&id);
                result.tombstones_removed += 1;
            }
        }

        let before = self.dead_letters.len();
        self.dead_letters.retain(|_, letter| letter.dead_lettered_at >= cutoff);
        result.dead_letters_removed = before - self.dead_letters.len();

        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.expires_at >= cutoff);
        result.cache_entries_removed = before - self.cache.len();

        result.duration = start.elapsed();
        Ok(result)
    }
}
