// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data access API: read, write, drain, conflicts and schema.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conflict::{ConflictRecord, ConflictStrategy, ManualDecision};
use crate::error::{SyncError, SyncResult};
use crate::metrics::LatencyTimer;
use crate::operation::SyncOperation;
use crate::queue::{DrainReport, QueueStats};
use crate::router::RouterResponse;
use crate::schema::{DriftReport, LocalValidator, ValidationSchema};
use crate::storage::DeadLetter;

use super::types::{ReadResult, WriteOutcome};
use super::SyncEngine;

impl SyncEngine {
    /// Read a record, failing over across layers and falling back to the cache.
    ///
    /// Responses from remote layers are checked against the canonical schema;
    /// a mismatch is reported in [`ReadResult::drift`] but never fails the read.
    pub async fn read(&self, resource: &str, key: &str) -> SyncResult<ReadResult> {
        let _timer = LatencyTimer::new("read");
        let response = self.router.read(resource, key).await?;

        let drift = if response.stale {
            None
        } else {
            self.schemas.check_drift(resource, &response.origin, &response.record.value)
        };

        Ok(ReadResult {
            value: response.record.value,
            version: response.record.version,
            stale: response.stale,
            origin: response.origin,
            drift,
        })
    }

    /// Validate and route a write.
    ///
    /// Goes straight to the remote layers when any is healthy, otherwise to the
    /// offline queue. A write the server rejects as conflicting is queued so
    /// the resolver can deal with it on the next drain.
    ///
    /// Updates and deletes without a base are based on the last server state
    /// cached for the record, so a later replay can tell whether the server
    /// moved on in between.
    pub async fn write(&self, operation: SyncOperation) -> SyncResult<WriteOutcome> {
        let _timer = LatencyTimer::new("write");

        let report = self.schemas.validate_operation(&operation);
        if !report.valid {
            debug!(resource = %operation.resource, errors = report.errors.len(), "Rejecting invalid write");
            return Err(SyncError::Validation(report));
        }
        let operation = self.router.attach_cached_base(operation).await;

        let response = if self.router.any_remote_healthy() {
            match self.router.write(operation.clone()).await {
                Err(SyncError::ConflictDetected { operation: id, .. }) => {
                    info!(id = %id, "Server reported a conflict, queueing write for resolution");
                    let queued = self.router.enqueue(operation).await?;
                    self.request_drain();
                    queued
                }
                other => other?,
            }
        } else {
            debug!(id = %operation.id, "No healthy remote layer, queueing write");
            self.router.enqueue(operation).await?
        };

        match response {
            RouterResponse::Written { layer, version } => Ok(WriteOutcome::Committed { layer, version }),
            RouterResponse::Queued(id) => Ok(WriteOutcome::Queued { id }),
            RouterResponse::Read(_) => Err(SyncError::Config("router answered a write with a read".into())),
        }
    }

    /// Replay the offline queue now.
    pub async fn drain(&self) -> SyncResult<DrainReport> {
        self.queue.drain(self.router.as_ref(), &self.cancel).await
    }

    /// Ask the background loop to drain as soon as it can.
    pub fn request_drain(&self) {
        self.drain_requested.notify_one();
    }

    /// Apply a decision to a conflict awaiting manual resolution and schedule
    /// the key's queue for replay.
    pub async fn resolve_conflict(&self, operation: Uuid, decision: ManualDecision) -> SyncResult<ConflictRecord> {
        let record = self.queue.resolve_manual(operation, decision).await?;
        self.request_drain();
        Ok(record)
    }

    /// Conflicts awaiting a manual decision.
    pub async fn pending_conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        self.queue.conflicts().await
    }

    pub fn set_conflict_strategy(&self, resource: impl Into<String>, strategy: ConflictStrategy) {
        self.resolver.set_strategy(resource, strategy);
    }

    pub async fn queue_stats(&self) -> SyncResult<QueueStats> {
        self.queue.stats().await
    }

    pub async fn pending_operations(&self) -> SyncResult<Vec<SyncOperation>> {
        self.queue.pending().await
    }

    pub async fn dead_letters(&self) -> SyncResult<Vec<DeadLetter>> {
        self.queue.dead_letters().await
    }

    /// Give a dead-lettered write another full round of retries.
    pub async fn requeue_dead_letter(&self, id: Uuid) -> SyncResult<Uuid> {
        let id = self.queue.requeue_dead_letter(id).await?;
        self.request_drain();
        Ok(id)
    }

    /// Install a canonical schema and push it to every layer.
    ///
    /// Layers that refuse the schema are reported as drift; they stay in
    /// rotation and their responses keep being checked on read.
    pub async fn sync_schema(&self, schema: ValidationSchema) -> SyncResult<(Arc<LocalValidator>, Vec<DriftReport>)> {
        let offered = schema.version;
        let validator = self
            .schemas
            .sync_schema(schema)
            .map_err(|e| SyncError::Config(e.to_string()))?;
        if validator.version() != offered {
            return Ok((validator, Vec::new()));
        }

        let canonical = validator.schema();
        let refused = self.router.apply_schema(canonical).await;
        let drift = refused
            .into_iter()
            .map(|(layer, error)| {
                warn!(resource = %canonical.resource, layer = %layer, error = %error, "Layer refused canonical schema");
                crate::metrics::record_schema_drift(&canonical.resource, &layer);
                DriftReport {
                    resource: canonical.resource.clone(),
                    layer,
                    schema_version: canonical.version,
                    unknown_fields: Vec::new(),
                    violations: Vec::new(),
                    refused: Some(error.to_string()),
                }
            })
            .collect();
        Ok((validator, drift))
    }
}
