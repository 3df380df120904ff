// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Coalescing batcher for realtime change events.
//!
//! The [`ChangeBatcher`] buffers events and flushes them grouped by resource,
//! keeping only the latest event per resource+key. It flushes when the window
//! (measured from the first buffered event) expires or when the number of
//! distinct buffered keys exceeds the threshold, whichever comes first.
//!
//! # Example
//!
//! ```
//! use failover_sync::batching::{BatcherConfig, ChangeBatcher, ChangeEvent, FlushReason};
//! use serde_json::json;
//!
//! let mut batcher = ChangeBatcher::new(BatcherConfig::default());
//! assert!(batcher.is_empty());
//!
//! batcher.push(ChangeEvent::upsert("posts", "1", json!({"v": 1}), 1, "api"));
//! batcher.push(ChangeEvent::upsert("posts", "1", json!({"v": 2}), 2, "api"));
//! assert_eq!(batcher.len(), 1);
//!
//! let batches = batcher.take(FlushReason::Manual);
//! assert_eq!(batches[0].events[0].version, 2);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::operation::now_millis;

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Window elapsed
    Time,
    /// Distinct-key threshold exceeded
    Count,
    /// Manual flush requested
    Manual,
    /// Input closed
    Shutdown,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Count => "count",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

/// How a delivered event relates to local pending writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalState {
    /// No local writes pending for this key
    #[default]
    Clean,
    /// Value rewritten by automatic conflict resolution against a pending write
    Resolved,
    /// Server value delivered; a pending write awaits manual resolution
    ConflictPending,
}

/// One change pushed by a layer's live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub resource: String,
    pub key: String,
    /// `None` means the record was deleted
    pub value: Option<Value>,
    pub version: u64,
    /// Epoch millis
    pub timestamp: i64,
    pub origin_layer: String,
    #[serde(default)]
    pub local_state: LocalState,
}

impl ChangeEvent {
    pub fn upsert(
        resource: impl Into<String>,
        key: impl Into<String>,
        value: Value,
        version: u64,
        origin_layer: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            key: key.into(),
            value: Some(value),
            version,
            timestamp: now_millis(),
            origin_layer: origin_layer.into(),
            local_state: LocalState::Clean,
        }
    }

    pub fn deleted(
        resource: impl Into<String>,
        key: impl Into<String>,
        version: u64,
        origin_layer: impl Into<String>,
    ) -> Self {
        Self {
            value: None,
            ..Self::upsert(resource, key, Value::Null, version, origin_layer)
        }
    }

    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

/// Events for one resource, in first-seen key order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchedUpdate {
    pub resource: String,
    pub events: Vec<ChangeEvent>,
}

/// Configuration for change batching
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Flush this long after the first buffered event
    pub window: Duration,
    /// Flush once more than this many distinct resource+keys are buffered
    pub max_keys: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(100),
            max_keys: 500,
        }
    }
}

pub struct ChangeBatcher {
    config: BatcherConfig,
    events: Vec<ChangeEvent>,
    /// (resource, key) → position in `events`
    index: HashMap<(String, String), usize>,
    opened_at: Option<Instant>,
    /// Events absorbed by de-duplication since the last take
    superseded: usize,
}

impl ChangeBatcher {
    pub fn new(config: BatcherConfig) -> Self {
        Self {
            config,
            events: Vec::new(),
            index: HashMap::new(),
            opened_at: None,
            superseded: 0,
        }
    }

    /// Buffer an event, returns flush reason if the key threshold was exceeded
    pub fn push(&mut self, event: ChangeEvent) -> Option<FlushReason> {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }

        let slot = (event.resource.clone(), event.key.clone());
        match self.index.get(&slot) {
            Some(&pos) => {
                // Latest wins, but the key keeps its original position
                self.events[pos] = event;
                self.superseded += 1;
            }
            None => {
                self.index.insert(slot, self.events.len());
                self.events.push(event);
            }
        }

        if self.events.len() > self.config.max_keys {
            Some(FlushReason::Count)
        } else {
            None
        }
    }

    /// When the current window closes, if anything is buffered.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|t| t + self.config.window)
    }

    /// Check if the window has elapsed
    #[must_use]
    pub fn should_flush_time(&self) -> bool {
        self.deadline().is_some_and(|d| Instant::now() >= d)
    }

    /// Take everything buffered, grouped by resource in first-seen order.
    pub fn take(&mut self, reason: FlushReason) -> Vec<BatchedUpdate> {
        let count = self.events.len();
        let superseded = self.superseded;
        self.index.clear();
        self.opened_at = None;
        self.superseded = 0;

        let mut batches: Vec<BatchedUpdate> = Vec::new();
        let mut by_resource: HashMap<String, usize> = HashMap::new();
        for event in std::mem::take(&mut self.events) {
            match by_resource.get(&event.resource) {
                Some(&i) => batches[i].events.push(event),
                None => {
                    by_resource.insert(event.resource.clone(), batches.len());
                    batches.push(BatchedUpdate { resource: event.resource.clone(), events: vec![event] });
                }
            }
        }

        if count > 0 {
            debug!(count, superseded, reason = reason.as_str(), "Change batch taken for flush");
            crate::metrics::record_change_batch(count, superseded, reason);
        }
        batches
    }

    /// Distinct resource+keys buffered
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Drive a [`ChangeBatcher`] from `input`, sending flushed batches to `output`.
///
/// Exits once `input` closes (after a final `Shutdown` flush) or `output` is dropped.
pub fn spawn_batcher(
    config: BatcherConfig,
    mut input: mpsc::Receiver<ChangeEvent>,
    output: mpsc::Sender<BatchedUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut batcher = ChangeBatcher::new(config);
        loop {
            let flush = match batcher.deadline() {
                Some(deadline) => tokio::select! {
                    event = input.recv() => match event {
                        Some(event) => batcher.push(event),
                        None => Some(FlushReason::Shutdown),
                    },
                    _ = tokio::time::sleep_until(deadline) => Some(FlushReason::Time),
                },
                None => match input.recv().await {
                    Some(event) => batcher.push(event),
                    None => Some(FlushReason::Shutdown),
                },
            };

            let Some(reason) = flush else { continue };
            for batch in batcher.take(reason) {
                if output.send(batch).await.is_err() {
                    debug!("Batch receiver dropped, stopping batcher");
                    return;
                }
            }
            if reason == FlushReason::Shutdown {
                return;
            }
        }
    })
}
