// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The [`SyncEngine`] is the facade that ties the components together:
//! - Connection router with priority failover and cache fallback
//! - Offline queue with per-key FIFO replay
//! - Conflict resolver applied during replay and to realtime events
//! - Schema synchronizer validating writes and checking reads for drift
//! - Realtime change batching for subscriptions
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use failover_sync::{SyncEngine, SyncConfig, EngineState};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let engine = SyncEngine::open(SyncConfig::default(), vec![]).await.expect("open");
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await.expect("start");
//! // engine.read("posts", "42").await ...
//! engine.shutdown().await;
//! # }
//! ```

mod api;
mod lifecycle;
mod subscribe;
mod types;

pub use subscribe::Subscription;
pub use types::{EngineState, HealthCheck, ReadResult, WriteOutcome};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::error::SyncResult;
use crate::layer::{Layer, LayerDescriptor};
use crate::queue::OfflineQueue;
use crate::router::ConnectionRouter;
use crate::schema::SchemaSynchronizer;
use crate::storage::{DurableStore, InMemoryStore, SqlStore};

/// Main sync engine coordinator.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`; every method takes `&self`. Share it with
/// `Arc` across tasks.
pub struct SyncEngine {
    pub(super) config: SyncConfig,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Cache, queue, dead letters and conflicts
    pub(super) store: Arc<dyn DurableStore>,

    pub(super) router: Arc<ConnectionRouter>,
    pub(super) queue: Arc<OfflineQueue>,
    pub(super) resolver: Arc<ConflictResolver>,
    pub(super) schemas: Arc<SchemaSynchronizer>,

    /// Wakes the background loop for an immediate drain
    pub(super) drain_requested: Arc<Notify>,

    /// Cancels the background loop, in-flight drains and subscriptions
    pub(super) cancel: CancellationToken,

    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Create an engine over an explicit durable store.
    ///
    /// The engine starts in `Created` state; reads and writes work right away,
    /// but draining and probing only happen in the background after
    /// [`start()`](Self::start).
    pub fn new(config: SyncConfig, store: Arc<dyn DurableStore>, layers: Vec<Layer>) -> SyncResult<Self> {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        let resolver = Arc::new(ConflictResolver::new(config.conflict_policy()));
        let queue = Arc::new(OfflineQueue::new(store.clone(), resolver.clone(), config.queue_config()));
        let router = Arc::new(ConnectionRouter::new(layers, store.clone(), queue.clone(), config.router_config())?);

        info!(layers = router.layers().len() - 1, "Sync engine created");

        Ok(Self {
            config,
            state: state_tx,
            state_rx,
            store,
            router,
            queue,
            resolver,
            schemas: Arc::new(SchemaSynchronizer::new()),
            drain_requested: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Create an engine, opening the store named by `config.store_url`
    /// (in memory when unset).
    pub async fn open(config: SyncConfig, layers: Vec<Layer>) -> SyncResult<Self> {
        let store: Arc<dyn DurableStore> = match config.store_url.as_deref() {
            Some(url) => {
                info!(url, "Opening durable store");
                Arc::new(SqlStore::new(url).await?)
            }
            None => {
                info!("No store URL configured, keeping cache and queue in memory");
                Arc::new(InMemoryStore::new())
            }
        };
        Self::new(config, store, layers)
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Snapshot of every layer, the local layer last.
    #[must_use]
    pub fn layers(&self) -> Vec<LayerDescriptor> {
        self.router.layers()
    }

    /// Whether any remote layer answered recently.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.router.is_online()
    }

    /// Watch remote availability.
    #[must_use]
    pub fn online_receiver(&self) -> watch::Receiver<bool> {
        self.router.online_receiver()
    }

    #[must_use]
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    #[must_use]
    pub fn schemas(&self) -> &SchemaSynchronizer {
        &self.schemas
    }

    /// Probe every remote layer and collect engine state.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let health = engine.health_check().await?;
    /// if health.healthy {
    ///     // ready
    /// }
    /// ```
    pub async fn health_check(&self) -> SyncResult<HealthCheck> {
        let layers = self.router.probe_all().await;
        let queue = self.queue.stats().await?;
        Ok(HealthCheck::from_parts(
            self.state(),
            self.router.is_online(),
            layers,
            &queue,
            self.schemas.versions(),
        ))
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &self.state())
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}
