// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable offline queue with ordered replay.
//!
//! Writes that could not reach any remote layer are appended to the queue
//! log in the [`DurableStore`]. A drain replays them:
//!
//! - **FIFO per resource-key**: an operation never runs before every earlier
//!   operation on the same key is terminal or suspended
//! - **Parallel across keys**: distinct keys replay concurrently, bounded by
//!   a semaphore
//! - **Conflict-aware**: each replay reads the server first and lets the
//!   [`ConflictResolver`] decide
//! - **Retry state machine**: transient failures back off with jitter and
//!   retry; permanent failures and exhausted retries are dead-lettered
//! - **Deferred while offline**: when the router skips every layer nothing
//!   was attempted, so the operation stays pending without spending a retry
//! - **Coalesced**: a drain started while another runs returns an empty report
//!
//! ```text
//! enqueue ──► Pending ──► InFlight ──► Committed
//!               ▲            │
//!               └─ backoff ◄─┤ transient
//!                            └──► DeadLettered
//! ```

pub mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::conflict::{ConflictRecord, ConflictResolver, ManualDecision, Resolution, ResolvedAction};
use crate::error::{SyncError, SyncResult};
use crate::layer::LayerError;
use crate::operation::{now_millis, OperationStatus, Record, RecordVersion, SyncOperation};
use crate::storage::{DeadLetter, DurableStore};

pub use types::{DrainReport, QueueConfig, QueueStats, RemoteAck, RemoteTarget};

/// How one replay of one operation ended.
///
/// `settled` is the server state the operation left behind, handed to the
/// next operation on the same key as its base.
enum Replay {
    Committed { settled: Option<RecordVersion> },
    /// Conflict settled; `committed` is false when the local write was dropped
    Resolved { record: ConflictRecord, committed: bool, settled: Option<RecordVersion> },
    Suspended(ConflictRecord),
    DeadLettered(DeadLetter),
    /// No layer could be tried; still pending, no retry spent
    Deferred,
    Interrupted,
}

/// What a single remote attempt produced.
enum Attempt {
    Committed { settled: Option<RecordVersion> },
    Resolved { record: ConflictRecord, committed: bool, settled: Option<RecordVersion> },
    Suspended(ConflictRecord),
}

pub struct OfflineQueue {
    store: Arc<dyn DurableStore>,
    resolver: Arc<ConflictResolver>,
    config: QueueConfig,
    /// Single writer for appends
    writer: Mutex<()>,
    draining: AtomicBool,
    enqueued_total: AtomicU64,
    committed_total: AtomicU64,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn DurableStore>, resolver: Arc<ConflictResolver>, config: QueueConfig) -> Self {
        Self {
            store,
            resolver,
            config,
            writer: Mutex::new(()),
            draining: AtomicBool::new(false),
            enqueued_total: AtomicU64::new(0),
            committed_total: AtomicU64::new(0),
        }
    }

    /// Append an operation to the durable log.
    pub async fn enqueue(&self, mut operation: SyncOperation) -> SyncResult<Uuid> {
        operation.status = OperationStatus::Pending;
        let seq = {
            let _writer = self.writer.lock().await;
            self.store.append_operation(&operation).await?
        };
        self.enqueued_total.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_enqueue(&operation.resource);
        info!(
            id = %operation.id,
            seq,
            kind = %operation.kind,
            resource = %operation.resource,
            key = %operation.key,
            "Operation queued for replay"
        );
        Ok(operation.id)
    }

    /// Return operations interrupted by a crash to `Pending`.
    pub async fn recover(&self) -> SyncResult<usize> {
        let mut recovered = 0;
        for mut op in self.store.pending_operations().await? {
            if matches!(op.status, OperationStatus::InFlight | OperationStatus::Failed) {
                op.reschedule();
                self.store.update_operation(&op).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "Recovered interrupted operations");
        }
        Ok(recovered)
    }

    /// Non-terminal operations in FIFO order.
    pub async fn pending(&self) -> SyncResult<Vec<SyncOperation>> {
        Ok(self.store.pending_operations().await?)
    }

    /// Pending operations for one record, in FIFO order.
    pub async fn pending_for(&self, resource: &str, key: &str) -> SyncResult<Vec<SyncOperation>> {
        let mut pending = self.store.pending_operations().await?;
        pending.retain(|op| op.resource == resource && op.key == key);
        Ok(pending)
    }

    pub async fn has_pending_for(&self, resource: &str, key: &str) -> SyncResult<bool> {
        Ok(!self.pending_for(resource, key).await?.is_empty())
    }

    pub async fn dead_letters(&self) -> SyncResult<Vec<DeadLetter>> {
        Ok(self.store.dead_letters().await?)
    }

    pub async fn conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        Ok(self.store.conflicts().await?)
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub async fn stats(&self) -> SyncResult<QueueStats> {
        let pending = self.store.pending_operations().await?;
        let dead_lettered = self.store.dead_letters().await?.len();
        crate::metrics::set_queue_depth(pending.len());
        Ok(QueueStats {
            pending: pending.len(),
            awaiting_resolution: pending.iter().filter(|op| op.awaiting_resolution).count(),
            dead_lettered,
            enqueued_total: self.enqueued_total.load(Ordering::Relaxed),
            committed_total: self.committed_total.load(Ordering::Relaxed),
            draining: self.is_draining(),
        })
    }

    /// Give a dead-lettered operation a fresh set of retries at the tail of the queue.
    pub async fn requeue_dead_letter(&self, id: Uuid) -> SyncResult<Uuid> {
        let letter = self
            .store
            .take_dead_letter(id)
            .await?
            .ok_or(SyncError::UnknownOperation(id))?;
        let mut op = letter.operation.clone();
        op.retries = 0;
        op.awaiting_resolution = false;
        op.last_error = None;
        info!(id = %id, reason = %letter.reason, "Requeueing dead-lettered operation");
        match self.enqueue(op).await {
            Ok(id) => Ok(id),
            Err(e) => {
                // Put the letter back so the operation is not lost
                self.store.dead_letter(&letter).await?;
                Err(e)
            }
        }
    }

    /// Release an operation suspended behind a manual conflict.
    ///
    /// Accepting the server drops the operation; any other decision rewrites
    /// it so the next drain sends it against the server's current version.
    ///
    /// The conflict record is only removed once the operation has been
    /// updated, so a failure part way leaves it listed for another attempt.
    pub async fn resolve_manual(&self, id: Uuid, decision: ManualDecision) -> SyncResult<ConflictRecord> {
        let record = self
            .store
            .conflicts()
            .await?
            .into_iter()
            .find(|c| c.operation.id == id)
            .ok_or(SyncError::UnknownOperation(id))?;
        let Some(mut op) = self.store.get_operation(id).await? else {
            warn!(id = %id, "Conflict refers to an operation no longer in the queue");
            return Err(SyncError::UnknownOperation(id));
        };
        let (record, action) = self.resolver.decide(record, decision);

        match action {
            ResolvedAction::Discard => {
                self.store.finish_operation(id, now_millis()).await?;
                info!(id = %id, "Manual resolution kept server state");
            }
            ResolvedAction::Apply(forced) => {
                op.kind = forced.kind;
                op.payload = forced.payload;
                op.base = forced.base;
                op.awaiting_resolution = false;
                op.reschedule();
                self.store.update_operation(&op).await?;
                info!(id = %id, "Manual resolution released operation for replay");
            }
        }
        self.store.take_conflict(id).await?;
        Ok(record)
    }

    /// Replay everything pending against `remote`.
    pub async fn drain(&self, remote: &dyn RemoteTarget, cancel: &CancellationToken) -> SyncResult<DrainReport> {
        if self.draining.swap(true, Ordering::AcqRel) {
            // Already draining
            debug!("Drain already in progress, skipping");
            return Ok(DrainReport::default());
        }

        let _guard = DrainGuard(&self.draining);

        let pending = self.store.pending_operations().await?;
        if pending.is_empty() {
            return Ok(DrainReport::default());
        }

        let start = Instant::now();
        let chains = chains_by_key(pending);
        info!(operations = chains.iter().map(Vec::len).sum::<usize>(), keys = chains.len(), "Starting queue drain");

        let semaphore = Semaphore::new(self.config.concurrency.max(1));
        let results = join_all(
            chains
                .into_iter()
                .map(|chain| self.drain_chain(chain, remote, &semaphore, cancel)),
        )
        .await;

        let mut report = DrainReport::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(chain_report) => report.absorb(chain_report),
                Err(e) => {
                    error!(error = %e, "Drain chain aborted");
                    first_error.get_or_insert(e);
                }
            }
        }
        crate::metrics::record_drain(&report, start.elapsed());
        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            conflicts = report.conflicts.len(),
            deferred = report.deferred.len(),
            cancelled = report.cancelled,
            duration_ms = start.elapsed().as_millis() as u64,
            "Queue drain complete"
        );
        Ok(report)
    }

    async fn drain_chain(
        &self,
        chain: Vec<SyncOperation>,
        remote: &dyn RemoteTarget,
        semaphore: &Semaphore,
        cancel: &CancellationToken,
    ) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        let _permit = tokio::select! {
            permit = semaphore.acquire() => permit.map_err(|_| SyncError::Cancelled)?,
            _ = cancel.cancelled() => {
                report.cancelled = true;
                return Ok(report);
            }
        };

        let mut settled: Option<RecordVersion> = None;
        for mut op in chain {
            if op.awaiting_resolution {
                // Later operations on this key wait behind the suspended one
                debug!(id = %op.id, "Chain blocked on manual resolution");
                break;
            }
            if let Some(base) = settled.take() {
                // The server now holds what the previous operation on this key wrote
                op.base = Some(base);
            }
            let id = op.id;
            match self.replay(op, remote, cancel).await? {
                Replay::Committed { settled: next } => {
                    report.succeeded.push(id);
                    settled = next;
                }
                Replay::Resolved { record, committed, settled: next } => {
                    if committed {
                        report.succeeded.push(id);
                    }
                    report.conflicts.push(record);
                    settled = next;
                }
                Replay::Suspended(record) => {
                    report.conflicts.push(record);
                    break;
                }
                Replay::DeadLettered(letter) => report.failed.push(letter),
                Replay::Deferred => {
                    report.deferred.push(id);
                    break;
                }
                Replay::Interrupted => {
                    report.cancelled = true;
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn replay(
        &self,
        mut op: SyncOperation,
        remote: &dyn RemoteTarget,
        cancel: &CancellationToken,
    ) -> SyncResult<Replay> {
        loop {
            if cancel.is_cancelled() {
                return self.interrupt(op).await;
            }

            op.status = OperationStatus::InFlight;
            self.store.update_operation(&op).await?;

            let attempt = tokio::select! {
                result = self.attempt(&op, remote) => Some(result),
                _ = cancel.cancelled() => None,
            };
            let Some(attempt) = attempt else {
                return self.interrupt(op).await;
            };

            match attempt {
                Ok(Attempt::Committed { settled }) => {
                    self.commit(&op).await?;
                    return Ok(Replay::Committed { settled });
                }
                Ok(Attempt::Resolved { record, committed, settled }) => {
                    self.commit(&op).await?;
                    return Ok(Replay::Resolved { record, committed, settled });
                }
                Ok(Attempt::Suspended(record)) => {
                    op.awaiting_resolution = true;
                    op.reschedule();
                    self.store.update_operation(&op).await?;
                    self.store.put_conflict(&record).await?;
                    return Ok(Replay::Suspended(record));
                }
                Err(LayerError::Offline) => {
                    op.reschedule();
                    self.store.update_operation(&op).await?;
                    debug!(id = %op.id, "No remote layer due for an attempt, operation left pending");
                    return Ok(Replay::Deferred);
                }
                // A 409 between our read and write: re-read and decide again
                Err(e) if e.is_transient() || e.is_conflict() => {
                    op.mark_failed(e.to_string());
                    if !self.config.retry.allows_another(op.retries as usize) {
                        let reason = format!("retries exhausted after {} attempts: {}", op.retries, e);
                        return self.dead_letter(op, reason).await;
                    }

                    let delay = self.config.retry.delay_for(op.retries);
                    warn!(
                        id = %op.id,
                        attempt = op.retries,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Replay failed, backing off"
                    );
                    crate::metrics::record_replay_retry(&op.resource, e.kind());
                    op.reschedule();
                    self.store.update_operation(&op).await?;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return self.interrupt(op).await,
                    }
                }
                Err(e) => return self.dead_letter(op, e.to_string()).await,
            }
        }
    }

    /// One conflict-checked write.
    async fn attempt(&self, op: &SyncOperation, remote: &dyn RemoteTarget) -> Result<Attempt, LayerError> {
        let server = remote.read_remote(&op.resource, &op.key).await?;
        match self.resolver.resolve(op, server.as_ref()) {
            Resolution::Clean => {
                let ack = remote.write_remote(op).await?;
                Ok(Attempt::Committed { settled: written(op, server.as_ref(), &ack) })
            }
            Resolution::AlreadyApplied => {
                debug!(id = %op.id, "Server already reflects operation");
                Ok(Attempt::Committed { settled: server.as_ref().map(RecordVersion::of) })
            }
            Resolution::Resolved { record, action: ResolvedAction::Discard } => {
                info!(id = %op.id, strategy = record.resolution.as_str(), "Conflict resolved in favour of server");
                Ok(Attempt::Resolved { record, committed: false, settled: None })
            }
            Resolution::Resolved { record, action: ResolvedAction::Apply(forced) } => {
                let ack = remote.write_remote(&forced).await?;
                info!(id = %op.id, strategy = record.resolution.as_str(), "Conflict resolved, write applied");
                let settled = written(&forced, server.as_ref(), &ack);
                Ok(Attempt::Resolved { record, committed: true, settled })
            }
            Resolution::Pending(record) => Ok(Attempt::Suspended(record)),
        }
    }

    async fn commit(&self, op: &SyncOperation) -> SyncResult<()> {
        self.store.finish_operation(op.id, now_millis()).await?;
        self.committed_total.fetch_add(1, Ordering::Relaxed);
        debug!(id = %op.id, "Operation committed");
        Ok(())
    }

    async fn dead_letter(&self, mut op: SyncOperation, reason: String) -> SyncResult<Replay> {
        op.status = OperationStatus::DeadLettered;
        let letter = DeadLetter { operation: op, reason, dead_lettered_at: now_millis() };
        self.store.dead_letter(&letter).await?;
        warn!(
            id = %letter.operation.id,
            resource = %letter.operation.resource,
            key = %letter.operation.key,
            reason = %letter.reason,
            "Operation dead-lettered"
        );
        crate::metrics::record_dead_letter(&letter.operation.resource);
        Ok(Replay::DeadLettered(letter))
    }

    async fn interrupt(&self, mut op: SyncOperation) -> SyncResult<Replay> {
        op.reschedule();
        self.store.update_operation(&op).await?;
        debug!(id = %op.id, "Replay interrupted, operation back to pending");
        Ok(Replay::Interrupted)
    }
}

/// RAII guard to clear the draining flag
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Server state after `op` was acknowledged on top of `server`.
fn written(op: &SyncOperation, server: Option<&Record>, ack: &RemoteAck) -> Option<RecordVersion> {
    op.apply_to(server.map(|r| &r.value)).map(|value| RecordVersion {
        version: ack.version,
        updated_at: now_millis(),
        snapshot: Some(value),
    })
}

/// Split FIFO operations into per-key chains, keys in first-seen order.
fn chains_by_key(operations: Vec<SyncOperation>) -> Vec<Vec<SyncOperation>> {
    let mut chains: Vec<Vec<SyncOperation>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for op in operations {
        let key = op.queue_key();
        match index.get(&key) {
            Some(&i) => chains[i].push(op),
            None => {
                index.insert(key, chains.len());
                chains.push(vec![op]);
            }
        }
    }
    chains
}
