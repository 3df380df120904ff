// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL-backed durable store.
//!
//! Four tables, all keyed for short single-statement access:
//!
//! ```sql
//! CREATE TABLE sync_queue (
//!   seq INTEGER PRIMARY KEY AUTOINCREMENT,  -- FIFO order
//!   id TEXT NOT NULL UNIQUE,
//!   queue_key TEXT NOT NULL,                -- "resource/key"
//!   status TEXT NOT NULL,
//!   payload_hash TEXT NOT NULL,             -- verified on load
//!   body TEXT NOT NULL,                     -- serialized SyncOperation
//!   finished_at INTEGER                     -- set on commit / dead-letter
//! );
//! CREATE TABLE sync_dead_letters (id TEXT PRIMARY KEY, body TEXT, reason TEXT, dead_lettered_at INTEGER);
//! CREATE TABLE sync_cache (resource TEXT, cache_key TEXT, body TEXT, expires_at INTEGER, PRIMARY KEY (resource, cache_key));
//! CREATE TABLE sync_conflicts (operation_id TEXT PRIMARY KEY, body TEXT, detected_at INTEGER);
//! ```
//!
//! Finished queue rows stay behind as tombstones until compaction, so a crash
//! between "remote acknowledged" and "row removed" can never resurrect an
//! operation.
//!
//! A queue row whose payload no longer matches its stored hash is moved to the
//! dead letters with reason `corruption` when the queue is loaded; the rest of
//! the queue keeps replaying.
//!
//! ## sqlx Any Driver Quirks
//!
//! TEXT columns may come back as bytes depending on the backend, so every
//! text read goes through [`text_column`].

use std::sync::Once;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{error, warn};
use uuid::Uuid;

use super::traits::{CacheEntry, DeadLetter, DurableStore, StorageError};
use crate::compaction::CompactionResult;
use crate::conflict::ConflictRecord;
use crate::operation::{now_millis, OperationStatus, SyncOperation};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sync_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        queue_key TEXT NOT NULL,
        status TEXT NOT NULL,
        payload_hash TEXT NOT NULL,
        body TEXT NOT NULL,
        finished_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue (status)",
    r#"
    CREATE TABLE IF NOT EXISTS sync_dead_letters (
        id TEXT PRIMARY KEY,
        body TEXT NOT NULL,
        reason TEXT NOT NULL,
        dead_lettered_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_cache (
        resource TEXT NOT NULL,
        cache_key TEXT NOT NULL,
        body TEXT NOT NULL,
        expires_at INTEGER NOT NULL,
        PRIMARY KEY (resource, cache_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_conflicts (
        operation_id TEXT PRIMARY KEY,
        body TEXT NOT NULL,
        detected_at INTEGER NOT NULL
    )
    "#,
];

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Read a TEXT column as String (SQLite) or bytes (other drivers).
fn text_column(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    row.try_get::<String, _>(column)
        .ok()
        .or_else(|| {
            row.try_get::<Vec<u8>, _>(column)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
        .ok_or_else(|| StorageError::Backend(format!("column '{}' is not text", column)))
}

/// Decode a queue row, verifying the stored payload hash.
fn decode_operation(row: &AnyRow) -> Result<SyncOperation, StorageError> {
    let body = text_column(row, "body")?;
    let expected = text_column(row, "payload_hash")?;
    let operation: SyncOperation = serde_json::from_str(&body)?;
    let actual = operation.payload_hash();
    if actual != expected {
        crate::metrics::record_corruption(&operation.id.to_string());
        return Err(StorageError::Corruption {
            id: operation.id.to_string(),
            expected,
            actual,
        });
    }
    Ok(operation)
}

/// Outcome of loading one pending queue row.
enum Loaded {
    Valid(SyncOperation),
    Tampered { operation: SyncOperation, expected: String, actual: String },
    Unreadable { id: String, error: StorageError },
}

fn load_row(row: &AnyRow) -> Loaded {
    let id = text_column(row, "id").unwrap_or_default();
    let parsed = text_column(row, "body").and_then(|body| {
        let operation: SyncOperation = serde_json::from_str(&body)?;
        Ok((operation, text_column(row, "payload_hash")?))
    });
    match parsed {
        Ok((operation, expected)) => {
            let actual = operation.payload_hash();
            if actual == expected {
                Loaded::Valid(operation)
            } else {
                Loaded::Tampered { operation, expected, actual }
            }
        }
        Err(error) => Loaded::Unreadable { id, error },
    }
}

pub struct SqlStore {
    pool: AnyPool,
}

impl SqlStore {
    /// Open (creating if needed) a SQLite store with startup-mode retry.
    ///
    /// The pool holds a single connection: the queue log has one writer, and
    /// `:memory:` databases are per-connection.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        if !connection_string.starts_with("sqlite:") {
            return Err(StorageError::Backend(format!(
                "unsupported store url '{}': expected sqlite:",
                connection_string
            )));
        }

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Duration::from_secs(10))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        Ok(store)
    }

    /// Enable WAL mode so a crash mid-write never tears the queue log.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(*statement).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    /// Move a tampered row to the dead letters so it stops blocking the queue.
    async fn quarantine(&self, operation: SyncOperation, expected: &str, actual: &str) -> Result<(), StorageError> {
        crate::metrics::record_corruption(&operation.id.to_string());
        error!(
            id = %operation.id,
            resource = %operation.resource,
            key = %operation.key,
            expected,
            actual,
            "Queued operation failed its integrity check, dead-lettering"
        );
        let mut operation = operation;
        operation.status = OperationStatus::DeadLettered;
        let letter = DeadLetter {
            operation,
            reason: format!("corruption: payload hash mismatch (expected {}, found {})", expected, actual),
            dead_lettered_at: now_millis(),
        };
        self.dead_letter(&letter).await
    }

    /// Retire a row whose body cannot be decoded at all.
    async fn retire_unreadable(&self, id: &str, cause: &StorageError) -> Result<(), StorageError> {
        crate::metrics::record_corruption(id);
        error!(id, error = %cause, "Queued operation cannot be decoded, retiring row");
        sqlx::query("UPDATE sync_queue SET status = ?, finished_at = ? WHERE id = ?")
            .bind(OperationStatus::DeadLettered.as_str())
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    /// Count of queue rows including tombstones.
    pub async fn queue_log_len(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM sync_queue")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let count: i64 = row.try_get("cnt").map_err(backend)?;
        Ok(count as u64)
    }
}

#[async_trait]
impl DurableStore for SqlStore {
    async fn get_cache(&self, resource: &str, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let row = retry("sql_get_cache", &RetryConfig::query(), || async {
            sqlx::query("SELECT body FROM sync_cache WHERE resource = ? AND cache_key = ?")
                .bind(resource)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(&text_column(&row, "body")?)?)),
            None => Ok(None),
        }
    }

    async fn put_cache(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        let body = serde_json::to_string(entry)?;
        retry("sql_put_cache", &RetryConfig::query(), || async {
            sqlx::query(
                "INSERT INTO sync_cache (resource, cache_key, body, expires_at) VALUES (?, ?, ?, ?)
                 ON CONFLICT(resource, cache_key) DO UPDATE SET
                    body = excluded.body,
                    expires_at = excluded.expires_at",
            )
            .bind(&entry.resource)
            .bind(&entry.key)
            .bind(&body)
            .bind(entry.expires_at)
            .execute(&self.pool)
            .await
            .map_err(backend)
        })
        .await?;
        Ok(())
    }

    async fn remove_cache(&self, resource: &str, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sync_cache WHERE resource = ? AND cache_key = ?")
            .bind(resource)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn append_operation(&self, operation: &SyncOperation) -> Result<u64, StorageError> {
        let body = serde_json::to_string(operation)?;
        // Appends are not retried: a retried insert after a lost ack would fail on the unique id anyway.
        // The Any driver reports no last insert id, so the sequence comes back via RETURNING.
        let row = sqlx::query(
            "INSERT INTO sync_queue (id, queue_key, status, payload_hash, body) VALUES (?, ?, ?, ?, ?)
             RETURNING seq",
        )
        .bind(operation.id.to_string())
        .bind(operation.queue_key())
        .bind(operation.status.as_str())
        .bind(operation.payload_hash())
        .bind(&body)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        let seq: i64 = row.try_get("seq").map_err(backend)?;
        Ok(seq as u64)
    }

    async fn update_operation(&self, operation: &SyncOperation) -> Result<(), StorageError> {
        let body = serde_json::to_string(operation)?;
        let result = retry("sql_update_operation", &RetryConfig::query(), || async {
            sqlx::query("UPDATE sync_queue SET status = ?, payload_hash = ?, body = ? WHERE id = ?")
                .bind(operation.status.as_str())
                .bind(operation.payload_hash())
                .bind(&body)
                .bind(operation.id.to_string())
                .execute(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Backend(format!("operation {} not queued", operation.id)));
        }
        Ok(())
    }

    async fn get_operation(&self, id: Uuid) -> Result<Option<SyncOperation>, StorageError> {
        let row = sqlx::query("SELECT payload_hash, body FROM sync_queue WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(decode_operation).transpose()
    }

    async fn pending_operations(&self) -> Result<Vec<SyncOperation>, StorageError> {
        let rows = retry("sql_pending_operations", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT id, payload_hash, body FROM sync_queue
                 WHERE status NOT IN ('committed', 'dead_lettered')
                 ORDER BY seq ASC",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(backend)
        })
        .await?;

        let mut operations = Vec::with_capacity(rows.len());
        for row in &rows {
            match load_row(row) {
                Loaded::Valid(operation) => operations.push(operation),
                Loaded::Tampered { operation, expected, actual } => {
                    self.quarantine(operation, &expected, &actual).await?;
                }
                Loaded::Unreadable { id, error } if !id.is_empty() => {
                    self.retire_unreadable(&id, &error).await?;
                }
                Loaded::Unreadable { error, .. } => {
                    warn!(error = %error, "Skipping queue row without a readable id");
                }
            }
        }
        Ok(operations)
    }

    async fn finish_operation(&self, id: Uuid, finished_at: i64) -> Result<bool, StorageError> {
        let Some(mut operation) = self.get_operation(id).await? else {
            return Ok(false);
        };
        if operation.status.is_terminal() {
            return Ok(false);
        }
        operation.status = OperationStatus::Committed;
        let body = serde_json::to_string(&operation)?;

        let result = sqlx::query(
            "UPDATE sync_queue SET status = ?, body = ?, finished_at = ?
             WHERE id = ? AND status NOT IN ('committed', 'dead_lettered')",
        )
        .bind(OperationStatus::Committed.as_str())
        .bind(&body)
        .bind(finished_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected() > 0)
    }

    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), StorageError> {
        let mut stored = letter.clone();
        stored.operation.status = OperationStatus::DeadLettered;
        let body = serde_json::to_string(&stored)?;
        let op_body = serde_json::to_string(&stored.operation)?;
        let id = letter.operation.id.to_string();

        let mut tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query(
            "INSERT INTO sync_dead_letters (id, body, reason, dead_lettered_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                body = excluded.body,
                reason = excluded.reason,
                dead_lettered_at = excluded.dead_lettered_at",
        )
        .bind(&id)
        .bind(&body)
        .bind(&letter.reason)
        .bind(letter.dead_lettered_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        sqlx::query("UPDATE sync_queue SET status = ?, body = ?, finished_at = ? WHERE id = ?")
            .bind(OperationStatus::DeadLettered.as_str())
            .bind(&op_body)
            .bind(letter.dead_lettered_at)
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError> {
        let rows = sqlx::query("SELECT body FROM sync_dead_letters ORDER BY dead_lettered_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.iter()
            .map(|row| Ok(serde_json::from_str(&text_column(row, "body")?)?))
            .collect()
    }

    async fn take_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetter>, StorageError> {
        let row = sqlx::query("SELECT body FROM sync_dead_letters WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let letter: DeadLetter = serde_json::from_str(&text_column(&row, "body")?)?;

        let mut tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query("DELETE FROM sync_dead_letters WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        // The tombstone would block a re-append under the same id.
        sqlx::query("DELETE FROM sync_queue WHERE id = ? AND status = 'dead_lettered'")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;

        Ok(Some(letter))
    }

    async fn put_conflict(&self, record: &ConflictRecord) -> Result<(), StorageError> {
        let body = serde_json::to_string(record)?;
        sqlx::query(
            "INSERT INTO sync_conflicts (operation_id, body, detected_at) VALUES (?, ?, ?)
             ON CONFLICT(operation_id) DO UPDATE SET body = excluded.body",
        )
        .bind(record.operation.id.to_string())
        .bind(&body)
        .bind(record.detected_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn conflicts(&self) -> Result<Vec<ConflictRecord>, StorageError> {
        let rows = sqlx::query("SELECT body FROM sync_conflicts ORDER BY detected_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.iter()
            .map(|row| Ok(serde_json::from_str(&text_column(row, "body")?)?))
            .collect()
    }

    async fn take_conflict(&self, operation_id: Uuid) -> Result<Option<ConflictRecord>, StorageError> {
        let row = sqlx::query("SELECT body FROM sync_conflicts WHERE operation_id = ?")
            .bind(operation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let record: ConflictRecord = serde_json::from_str(&text_column(&row, "body")?)?;

        sqlx::query("DELETE FROM sync_conflicts WHERE operation_id = ?")
            .bind(operation_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(Some(record))
    }

    async fn compact(&self, cutoff: i64) -> Result<CompactionResult, StorageError> {
        let start = Instant::now();

        let tombstones = sqlx::query("DELETE FROM sync_queue WHERE finished_at IS NOT NULL AND finished_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        let dead_letters = sqlx::query("DELETE FROM sync_dead_letters WHERE dead_lettered_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        let cache = sqlx::query("DELETE FROM sync_cache WHERE expires_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(CompactionResult {
            tombstones_removed: tombstones.rows_affected() as usize,
            dead_letters_removed: dead_letters.rows_affected() as usize,
            cache_entries_removed: cache.rows_affected() as usize,
            duration: start.elapsed(),
        })
    }
}
