// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management: start, shutdown, background loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compaction::{run_compaction, CompactionConfig};
use crate::error::{SyncError, SyncResult};
use crate::operation::now_millis;
use crate::queue::OfflineQueue;
use crate::router::ConnectionRouter;
use crate::storage::DurableStore;

use super::{EngineState, SyncEngine};

/// Everything the background loop needs, detached from the engine.
struct Maintenance {
    router: Arc<ConnectionRouter>,
    queue: Arc<OfflineQueue>,
    store: Arc<dyn DurableStore>,
    drain_requested: Arc<Notify>,
    cancel: CancellationToken,
    drain_interval: Duration,
    probe_interval: Duration,
    compaction: CompactionConfig,
}

impl Maintenance {
    /// Run until cancelled.
    ///
    /// Drains on every offline → online edge, on request, and on a safety
    /// interval. Probes unhealthy layers and compacts the store on their own
    /// intervals.
    async fn run(self) {
        let mut online = self.router.online_receiver();
        let mut was_online = *online.borrow_and_update();

        let mut drain_tick = tokio::time::interval(self.drain_interval);
        drain_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probe_tick = tokio::time::interval(self.probe_interval);
        probe_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut compaction_tick = tokio::time::interval(self.compaction.interval);
        compaction_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now_online = *online.borrow_and_update();
                    if now_online && !was_online {
                        info!("Connectivity restored, draining offline queue");
                        self.drain("reconnect").await;
                    }
                    was_online = now_online;
                }

                _ = self.drain_requested.notified() => {
                    self.drain("requested").await;
                }

                _ = drain_tick.tick() => {
                    // Offline drains only defer; the reconnect edge picks the queue up
                    if self.router.is_online() {
                        self.drain("interval").await;
                    } else {
                        debug!("Offline, skipping interval drain");
                    }
                }

                _ = probe_tick.tick() => {
                    let recovered = self.router.probe_unhealthy().await;
                    if recovered > 0 {
                        debug!(recovered, "Promotion probes recovered layers");
                    }
                }

                _ = compaction_tick.tick() => {
                    if let Err(e) = run_compaction(self.store.as_ref(), &self.compaction, now_millis()).await {
                        warn!(error = %e, "Compaction failed, will retry next interval");
                    }
                }
            }
        }
        debug!("Background loop stopped");
    }

    async fn drain(&self, trigger: &'static str) {
        match self.queue.drain(self.router.as_ref(), &self.cancel).await {
            Ok(report) if report.is_empty() => debug!(trigger, "Nothing to drain"),
            Ok(report) => debug!(
                trigger,
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                conflicts = report.conflicts.len(),
                deferred = report.deferred.len(),
                "Drain finished"
            ),
            Err(e) => error!(trigger, error = %e, "Drain failed"),
        }
    }
}

impl SyncEngine {
    /// Start background work.
    ///
    /// Startup flow:
    /// 1. Recover the persisted queue (in-flight operations back to pending)
    /// 2. Spawn the background loop, whose first tick drains anything recovered
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> SyncResult<()> {
        if self.state() != EngineState::Created {
            return Err(SyncError::Config(format!("cannot start engine in state {}", self.state())));
        }
        let startup_start = Instant::now();
        info!("Starting sync engine...");

        let recovered = self.queue.recover().await?;
        if recovered > 0 {
            info!(recovered, "Recovered queued operations from the durable store");
        }

        let maintenance = Maintenance {
            router: self.router.clone(),
            queue: self.queue.clone(),
            store: self.store.clone(),
            drain_requested: self.drain_requested.clone(),
            cancel: self.cancel.clone(),
            drain_interval: Duration::from_secs(self.config.drain_interval_secs.max(1)),
            probe_interval: Duration::from_secs(self.config.probe_interval_secs.max(1)),
            compaction: self.config.compaction_config(),
        };
        self.tasks.lock().push(tokio::spawn(maintenance.run()));

        self.set_state(EngineState::Running);
        crate::metrics::record_startup_total(startup_start.elapsed());
        info!(duration_ms = startup_start.elapsed().as_millis() as u64, "Sync engine running");
        Ok(())
    }

    /// Initiate graceful shutdown.
    ///
    /// Cancels the background loop, any drain in flight (its operations go
    /// back to pending) and every open subscription, then waits for the tasks.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return;
        }
        let shutdown_start = Instant::now();
        info!("Initiating sync engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.set_state(EngineState::Stopped);
        info!(duration_ms = shutdown_start.elapsed().as_millis() as u64, "Sync engine shutdown complete");
    }
}
