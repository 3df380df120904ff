// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for failover-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `failover_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `layer`: adapter name, or `local`
//! - `operation`: read, write, subscribe
//! - `outcome`: ok, or a `LayerError` kind label

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::batching::FlushReason;
use crate::compaction::CompactionResult;
use crate::conflict::ConflictStrategy;
use crate::queue::DrainReport;

// ═══════════════════════════════════════════════════════════════════════════
// ROUTING - Per-layer requests and availability
// ═══════════════════════════════════════════════════════════════════════════

/// Record one request against a remote layer
pub fn record_layer_request(layer: &str, operation: &str, outcome: &str, duration: Duration) {
    counter!(
        "failover_sync_layer_requests_total",
        "layer" => layer.to_string(),
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        "failover_sync_layer_request_seconds",
        "layer" => layer.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set layer health (1 = healthy, 0 = unhealthy)
pub fn set_layer_healthy(layer: &str, healthy: bool) {
    gauge!(
        "failover_sync_layer_healthy",
        "layer" => layer.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Set whether any remote layer is reachable
pub fn set_online(online: bool) {
    gauge!("failover_sync_online").set(if online { 1.0 } else { 0.0 });
}

/// A read served from cache because no remote layer answered
pub fn record_cache_hit(resource: &str) {
    counter!(
        "failover_sync_cache_hits_total",
        "resource" => resource.to_string()
    )
    .increment(1);
}

pub fn record_stale_read(resource: &str) {
    counter!(
        "failover_sync_stale_reads_total",
        "resource" => resource.to_string()
    )
    .increment(1);
}

/// Record engine-level operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "failover_sync_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// OFFLINE QUEUE
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_enqueue(resource: &str) {
    counter!(
        "failover_sync_queue_enqueued_total",
        "resource" => resource.to_string()
    )
    .increment(1);
}

/// Set current queue depth (non-terminal operations)
pub fn set_queue_depth(count: usize) {
    gauge!("failover_sync_queue_depth").set(count as f64);
}

/// Record a replay attempt that failed transiently and will be retried
pub fn record_replay_retry(resource: &str, error_kind: &str) {
    counter!(
        "failover_sync_replay_retries_total",
        "resource" => resource.to_string(),
        "error" => error_kind.to_string()
    )
    .increment(1);
}

pub fn record_dead_letter(resource: &str) {
    counter!(
        "failover_sync_dead_letters_total",
        "resource" => resource.to_string()
    )
    .increment(1);
}

/// Record the outcome of one drain pass
pub fn record_drain(report: &DrainReport, duration: Duration) {
    counter!("failover_sync_drain_passes_total").increment(1);
    counter!("failover_sync_drain_committed_total").increment(report.succeeded.len() as u64);
    counter!("failover_sync_drain_failed_total").increment(report.failed.len() as u64);
    counter!("failover_sync_drain_deferred_total").increment(report.deferred.len() as u64);
    if report.cancelled {
        counter!("failover_sync_drain_cancelled_total").increment(1);
    }
    histogram!("failover_sync_drain_seconds").record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFLICTS, SCHEMA, REALTIME
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_conflict(resource: &str, strategy: ConflictStrategy) {
    counter!(
        "failover_sync_conflicts_total",
        "resource" => resource.to_string(),
        "strategy" => strategy.as_str()
    )
    .increment(1);
}

/// A layer returned data the canonical schema does not accept
pub fn record_schema_drift(resource: &str, layer: &str) {
    counter!(
        "failover_sync_schema_drift_total",
        "resource" => resource.to_string(),
        "layer" => layer.to_string()
    )
    .increment(1);
}

/// Record a flushed change batch and how many events dedup absorbed
pub fn record_change_batch(count: usize, superseded: usize, reason: FlushReason) {
    counter!(
        "failover_sync_change_batches_total",
        "reason" => reason.as_str()
    )
    .increment(1);
    histogram!("failover_sync_change_batch_size").record(count as f64);
    counter!("failover_sync_change_events_superseded_total").increment(superseded as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// STORAGE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a stored operation whose payload hash no longer matches
pub fn record_corruption(id: &str) {
    counter!(
        "failover_sync_corruption_detected_total",
        "id" => id.to_string()
    )
    .increment(1);
}

pub fn record_compaction(result: &CompactionResult) {
    counter!("failover_sync_compaction_runs_total").increment(1);
    counter!("failover_sync_compaction_removed_total").increment(result.total() as u64);
    histogram!("failover_sync_compaction_seconds").record(result.duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record total startup time (queue recovery included)
pub fn record_startup_total(duration: Duration) {
    histogram!("failover_sync_startup_seconds").record(duration.as_secs_f64());
}

/// Count state machine transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "failover_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
