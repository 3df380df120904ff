// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Realtime subscriptions.
//!
//! ```text
//! layer feed ──► batcher (window + dedup) ──► overlay pending writes ──► cache ──► Subscription
//! ```
//!
//! Events for keys with queued local writes are rewritten before delivery:
//! automatic strategies deliver the resolved value, a manual conflict
//! delivers the server value flagged [`LocalState::ConflictPending`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batching::{spawn_batcher, BatchedUpdate, ChangeEvent, LocalState};
use crate::conflict::{ConflictResolver, Resolution, ResolvedAction};
use crate::error::SyncResult;
use crate::operation::{now_millis, Record};
use crate::queue::OfflineQueue;
use crate::storage::{CacheEntry, DurableStore};

use super::SyncEngine;

const DELIVERY_BUFFER: usize = 64;

/// Live batched changes for one resource.
///
/// Dropping the handle unsubscribes; [`unsubscribe()`](Self::unsubscribe)
/// also waits for the pipeline to stop.
pub struct Subscription {
    resource: String,
    layer: String,
    updates: mpsc::Receiver<BatchedUpdate>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Layer whose change feed backs this subscription.
    #[must_use]
    pub fn layer(&self) -> &str {
        &self.layer
    }

    /// Next batch, or `None` once the feed has closed or the engine shut down.
    pub async fn recv(&mut self) -> Option<BatchedUpdate> {
        self.updates.recv().await
    }

    pub async fn unsubscribe(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(resource = %self.resource, "Unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("resource", &self.resource)
            .field("layer", &self.layer)
            .finish_non_exhaustive()
    }
}

struct Delivery {
    store: Arc<dyn DurableStore>,
    queue: Arc<OfflineQueue>,
    resolver: Arc<ConflictResolver>,
    cache_ttl: Duration,
}

impl Delivery {
    async fn deliver(&self, batch: BatchedUpdate) -> BatchedUpdate {
        let mut events = Vec::with_capacity(batch.events.len());
        for event in batch.events {
            let event = self.overlay(event).await;
            self.cache(&event).await;
            events.push(event);
        }
        BatchedUpdate { resource: batch.resource, events }
    }

    /// Rewrite `event` against the key's queued writes, oldest first.
    async fn overlay(&self, mut event: ChangeEvent) -> ChangeEvent {
        let pending = match self.queue.pending_for(&event.resource, &event.key).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(resource = %event.resource, key = %event.key, error = %e, "Could not check queued writes");
                return event;
            }
        };
        if pending.is_empty() {
            return event;
        }

        let server = event.value.clone().map(|value| Record {
            value,
            version: event.version,
            updated_at: event.timestamp,
        });
        let mut current = event.value.clone();
        let mut state = LocalState::Resolved;

        for op in &pending {
            let resolution = if op.awaiting_resolution {
                None
            } else {
                Some(self.resolver.resolve(op, server.as_ref()))
            };
            match resolution {
                Some(Resolution::Clean) => current = op.apply_to(current.as_ref()),
                Some(Resolution::AlreadyApplied) => {}
                Some(Resolution::Resolved { action: ResolvedAction::Apply(next), .. }) => {
                    current = next.apply_to(current.as_ref());
                }
                Some(Resolution::Resolved { action: ResolvedAction::Discard, .. }) => {}
                Some(Resolution::Pending(_)) | None => {
                    // Later writes wait behind the undecided one
                    state = LocalState::ConflictPending;
                    current = event.value.clone();
                    break;
                }
            }
        }

        debug!(
            resource = %event.resource,
            key = %event.key,
            pending = pending.len(),
            state = ?state,
            "Rewrote realtime event against queued writes"
        );
        event.value = current;
        event.local_state = state;
        event
    }

    async fn cache(&self, event: &ChangeEvent) {
        let result = match &event.value {
            Some(value) => {
                let record = Record { value: value.clone(), version: event.version, updated_at: event.timestamp };
                let entry = CacheEntry::from_record(
                    &event.resource,
                    &event.key,
                    &record,
                    &event.origin_layer,
                    self.cache_ttl,
                    now_millis(),
                );
                self.store.put_cache(&entry).await
            }
            None => self.store.remove_cache(&event.resource, &event.key).await,
        };
        if let Err(e) = result {
            warn!(resource = %event.resource, key = %event.key, error = %e, "Failed to cache realtime event");
        }
    }
}

impl SyncEngine {
    /// Subscribe to batched live changes for `resource`.
    ///
    /// The feed comes from the highest-priority healthy layer that offers one.
    pub async fn subscribe(&self, resource: &str) -> SyncResult<Subscription> {
        let (layer, feed) = self.router.subscription_source(resource).await?;

        let (batch_tx, mut batches) = mpsc::channel(DELIVERY_BUFFER);
        let batcher = spawn_batcher(self.config.batcher_config(), feed, batch_tx);

        let (tx, updates) = mpsc::channel(DELIVERY_BUFFER);
        let cancel = self.cancel.child_token();
        let delivery = Delivery {
            store: self.store.clone(),
            queue: self.queue.clone(),
            resolver: self.resolver.clone(),
            cache_ttl: self.config.router_config().cache_ttl,
        };

        let task_cancel = cancel.clone();
        let task_resource = resource.to_string();
        let task = tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    batch = batches.recv() => batch,
                };
                let Some(batch) = batch else { break };
                if tx.send(delivery.deliver(batch).await).await.is_err() {
                    break;
                }
            }
            batcher.abort();
            let _ = batcher.await;
            debug!(resource = %task_resource, "Subscription pipeline stopped");
        });

        info!(resource, layer = %layer, "Subscription opened");
        Ok(Subscription {
            resource: resource.to_string(),
            layer,
            updates,
            cancel,
            task: Some(task),
        })
    }
}
