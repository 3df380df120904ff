// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Priority failover across remote layers with cache and queue fallback.
//!
//! # Routing
//!
//! ```text
//! request ──► Primary ──✗──► Secondary ──✗──► Tertiary ──✗──► fallback
//!               │              │                │              ├─ read:  cached entry (stale)
//!               ✓              ✓ (+ promotion   ✓              └─ write: offline queue
//!                                 probe upward)
//! ```
//!
//! - Reads are served from a fresh cache entry (younger than `cache_ttl`)
//!   without touching any layer
//! - Unhealthy layers are skipped until their probe interval elapses
//! - Each attempt runs under the layer kind's timeout
//! - Transient failures count against layer health; rejections (4xx) are
//!   returned as-is and do not
//! - Remote availability is published on a watch channel; the coordinator
//!   drains the queue on every offline → online edge

pub mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::layer::{ChangeFeed, Layer, LayerAdapter, LayerDescriptor, LayerError, LayerHealth, LayerKind, WriteAck, LOCAL_LAYER};
use crate::operation::{now_millis, OperationKind, Record, RecordVersion, SyncOperation};
use crate::queue::{OfflineQueue, RemoteAck, RemoteTarget};
use crate::schema::ValidationSchema;
use crate::storage::{CacheEntry, DurableStore};

pub use types::{ReadResponse, Request, RouterConfig, RouterResponse};

struct RemoteLayer {
    descriptor: LayerDescriptor,
    adapter: Arc<dyn LayerAdapter>,
    health: LayerHealth,
    timeout: Duration,
    /// A promotion probe task is outstanding
    promoting: AtomicBool,
}

impl RemoteLayer {
    fn name(&self) -> &str {
        &self.descriptor.name
    }
}

enum Call<'a> {
    Read { resource: &'a str, key: &'a str },
    Write(&'a SyncOperation),
}

impl Call<'_> {
    fn label(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Write(_) => "write",
        }
    }
}

enum Reply {
    Read(Option<Record>),
    Write(WriteAck),
}

enum RouteFailure {
    /// A reachable layer refused the request
    Rejected { layer: String, error: LayerError },
    /// No remote layer answered
    Exhausted { last_error: Option<LayerError> },
}

pub struct ConnectionRouter {
    layers: Vec<Arc<RemoteLayer>>,
    store: Arc<dyn DurableStore>,
    queue: Arc<OfflineQueue>,
    config: RouterConfig,
    online: watch::Sender<bool>,
}

impl ConnectionRouter {
    /// Build a router over `layers`, tried in ascending priority.
    pub fn new(
        layers: Vec<Layer>,
        store: Arc<dyn DurableStore>,
        queue: Arc<OfflineQueue>,
        config: RouterConfig,
    ) -> SyncResult<Self> {
        let mut layers = layers;
        layers.sort_by_key(|l| l.descriptor.priority);

        for pair in layers.windows(2) {
            if pair[0].descriptor.priority == pair[1].descriptor.priority {
                return Err(SyncError::Config(format!(
                    "layers '{}' and '{}' share priority {}",
                    pair[0].descriptor.name, pair[1].descriptor.name, pair[0].descriptor.priority
                )));
            }
        }
        for (i, layer) in layers.iter().enumerate() {
            let name = &layer.descriptor.name;
            if layer.descriptor.kind == LayerKind::Local || name == LOCAL_LAYER {
                return Err(SyncError::Config(format!("'{}' is reserved for the durable store", name)));
            }
            if layers[..i].iter().any(|other| &other.descriptor.name == name) {
                return Err(SyncError::Config(format!("duplicate layer name '{}'", name)));
            }
        }

        let layers = layers
            .into_iter()
            .map(|layer| {
                Arc::new(RemoteLayer {
                    health: LayerHealth::new(layer.descriptor.name.clone(), config.failure_threshold),
                    timeout: config.timeout_for(layer.descriptor.kind),
                    descriptor: layer.descriptor,
                    adapter: layer.adapter,
                    promoting: AtomicBool::new(false),
                })
            })
            .collect();

        let (online, _) = watch::channel(true);
        Ok(Self { layers, store, queue, config, online })
    }

    pub async fn execute(&self, request: Request) -> SyncResult<RouterResponse> {
        match request {
            Request::Read { resource, key } => self.read(&resource, &key).await.map(RouterResponse::Read),
            Request::Write(operation) => self.write(operation).await,
        }
    }

    /// Read through the layers, falling back to the cache.
    pub async fn read(&self, resource: &str, key: &str) -> SyncResult<ReadResponse> {
        match self.store.get_cache(resource, key).await {
            Ok(Some(entry)) if entry.origin_layer != LOCAL_LAYER && !entry.is_expired(now_millis()) => {
                debug!(resource, key, cached_from = %entry.origin_layer, "Serving fresh read from cache");
                crate::metrics::record_cache_hit(resource);
                return Ok(ReadResponse { record: entry.to_record(), origin: entry.origin_layer, stale: false });
            }
            Ok(_) => {}
            Err(e) => warn!(resource, key, error = %e, "Cache lookup failed, reading through"),
        }

        match self.route(Call::Read { resource, key }).await {
            Ok((layer, Reply::Read(Some(record)))) => {
                self.cache_record(resource, key, &record, &layer).await;
                Ok(ReadResponse { record, origin: layer, stale: false })
            }
            Ok((_, Reply::Read(None))) => {
                if let Err(e) = self.store.remove_cache(resource, key).await {
                    warn!(resource, key, error = %e, "Failed to evict deleted record from cache");
                }
                Err(SyncError::NotFound { resource: resource.to_string(), key: key.to_string() })
            }
            Ok((_, Reply::Write(_))) => unreachable!("read call produced a write reply"),
            Err(RouteFailure::Rejected { layer, error }) => Err(SyncError::Rejected { layer, source: error }),
            Err(RouteFailure::Exhausted { .. }) => match self.store.get_cache(resource, key).await? {
                Some(entry) => {
                    debug!(resource, key, cached_from = %entry.origin_layer, "Serving stale read from cache");
                    crate::metrics::record_stale_read(resource);
                    Ok(ReadResponse { record: entry.to_record(), origin: LOCAL_LAYER.to_string(), stale: true })
                }
                None => Err(SyncError::AllLayersUnavailable { resource: resource.to_string(), key: key.to_string() }),
            },
        }
    }

    /// Route a write, queueing it if no remote layer takes it.
    pub async fn write(&self, operation: SyncOperation) -> SyncResult<RouterResponse> {
        // Never overtake writes already waiting for this key
        if self.queue.has_pending_for(&operation.resource, &operation.key).await? {
            debug!(id = %operation.id, "Earlier writes queued for key, queueing behind them");
            return self.enqueue(operation).await;
        }

        match self.route(Call::Write(&operation)).await {
            Ok((layer, Reply::Write(ack))) => {
                self.cache_write(&operation, &layer, Some(ack.version)).await;
                Ok(RouterResponse::Written { layer, version: ack.version })
            }
            Ok((_, Reply::Read(_))) => unreachable!("write call produced a read reply"),
            Err(RouteFailure::Rejected { error, .. }) if error.is_conflict() => Err(SyncError::ConflictDetected {
                operation: operation.id,
                resource: operation.resource,
                key: operation.key,
            }),
            Err(RouteFailure::Rejected { layer, error }) => Err(SyncError::PermanentWriteFailure {
                id: operation.id,
                reason: format!("{} rejected write: {}", layer, error),
            }),
            Err(RouteFailure::Exhausted { .. }) => self.enqueue(operation).await,
        }
    }

    /// Give a write without a base the last server state cached for its record.
    ///
    /// Entries written by queued operations are local guesses, not server
    /// state, and are ignored.
    pub async fn attach_cached_base(&self, mut operation: SyncOperation) -> SyncOperation {
        if operation.base.is_some() || operation.kind == OperationKind::Create {
            return operation;
        }
        match self.store.get_cache(&operation.resource, &operation.key).await {
            Ok(Some(entry)) if entry.origin_layer != LOCAL_LAYER => {
                operation.base = Some(RecordVersion {
                    version: entry.version,
                    updated_at: entry.fetched_at,
                    snapshot: Some(entry.value),
                });
            }
            Ok(_) => {}
            Err(e) => warn!(id = %operation.id, error = %e, "Cache lookup failed, write stays blind"),
        }
        operation
    }

    /// Hand a write to the offline queue, reflecting it in the cache.
    pub async fn enqueue(&self, operation: SyncOperation) -> SyncResult<RouterResponse> {
        self.cache_write(&operation, LOCAL_LAYER, None).await;
        match self.queue.enqueue(operation.clone()).await {
            Ok(id) => Ok(RouterResponse::Queued(id)),
            Err(e) => {
                error!(id = %operation.id, error = %e, "Failed to persist write to offline queue");
                Err(SyncError::AllLayersUnavailable { resource: operation.resource, key: operation.key })
            }
        }
    }

    async fn route(&self, call: Call<'_>) -> Result<(String, Reply), RouteFailure> {
        let mut last_error = None;

        for (idx, layer) in self.layers.iter().enumerate() {
            let now = now_millis();
            if !layer.health.should_attempt(self.config.probe_interval, now) {
                debug!(layer = layer.name(), "Skipping unhealthy layer");
                continue;
            }

            let start = Instant::now();
            let result = match tokio::time::timeout(layer.timeout, invoke(layer.adapter.as_ref(), &call)).await {
                Ok(result) => result,
                Err(_) => Err(LayerError::Timeout(layer.timeout)),
            };

            match result {
                Ok(reply) => {
                    crate::metrics::record_layer_request(layer.name(), call.label(), "ok", start.elapsed());
                    layer.health.record_success();
                    self.set_online(true);
                    if idx > 0 {
                        self.schedule_promotion(idx);
                    }
                    return Ok((layer.descriptor.name.clone(), reply));
                }
                Err(e) if e.is_transient() => {
                    crate::metrics::record_layer_request(layer.name(), call.label(), e.kind(), start.elapsed());
                    warn!(layer = layer.name(), op = call.label(), error = %e, "Layer request failed, failing over");
                    layer.health.record_failure(now_millis());
                    last_error = Some(e);
                }
                Err(e) => {
                    crate::metrics::record_layer_request(layer.name(), call.label(), e.kind(), start.elapsed());
                    // The layer answered; it is reachable even if it said no.
                    self.set_online(true);
                    return Err(RouteFailure::Rejected { layer: layer.descriptor.name.clone(), error: e });
                }
            }
        }

        self.set_online(false);
        Err(RouteFailure::Exhausted { last_error })
    }

    /// Probe unhealthy layers above `serving` in the background.
    fn schedule_promotion(&self, serving: usize) {
        let now = now_millis();
        let interval = self.config.probe_interval.as_millis() as i64;
        for layer in &self.layers[..serving] {
            if layer.health.is_healthy() {
                continue;
            }
            if layer.health.last_probe().is_some_and(|t| now.saturating_sub(t) < interval) {
                continue;
            }
            if layer.promoting.swap(true, Ordering::AcqRel) {
                continue;
            }

            let layer = Arc::clone(layer);
            tokio::spawn(async move {
                if layer.health.probe(layer.adapter.as_ref(), layer.timeout, now_millis()).await {
                    info!(layer = layer.name(), "Promotion probe succeeded, routing back upward");
                }
                layer.promoting.store(false, Ordering::Release);
            });
        }
    }

    fn set_online(&self, online: bool) {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!("Remote layers reachable again");
            } else {
                warn!("All remote layers unavailable, operating offline");
            }
            crate::metrics::set_online(online);
        }
    }

    async fn cache_record(&self, resource: &str, key: &str, record: &Record, layer: &str) {
        let entry = CacheEntry::from_record(resource, key, record, layer, self.config.cache_ttl, now_millis());
        if let Err(e) = self.store.put_cache(&entry).await {
            warn!(resource, key, error = %e, "Failed to update cache");
        }
    }

    /// Reflect a write in the cache; `version` is the server's when it was acknowledged.
    async fn cache_write(&self, operation: &SyncOperation, layer: &str, version: Option<u64>) {
        let (resource, key) = (operation.resource.as_str(), operation.key.as_str());
        let result = async {
            let cached = self.store.get_cache(resource, key).await?;
            if operation.kind == OperationKind::Update && cached.is_none() {
                // A patch alone is not a record
                return Ok(());
            }
            match operation.apply_to(cached.as_ref().map(|e| &e.value)) {
                Some(value) => {
                    let version = version.or(cached.as_ref().map(|e| e.version)).unwrap_or(0);
                    let record = Record { value, version, updated_at: now_millis() };
                    let entry = CacheEntry::from_record(resource, key, &record, layer, self.config.cache_ttl, now_millis());
                    self.store.put_cache(&entry).await
                }
                None => self.store.remove_cache(resource, key).await,
            }
        }
        .await;
        if let Err(e) = result {
            warn!(resource, key, error = %e, "Failed to reflect write in cache");
        }
    }

    /// Snapshot of every layer, the local layer last.
    #[must_use]
    pub fn layers(&self) -> Vec<LayerDescriptor> {
        let mut descriptors: Vec<LayerDescriptor> =
            self.layers.iter().map(|l| l.health.snapshot(&l.descriptor)).collect();
        descriptors.push(LayerDescriptor::local());
        descriptors
    }

    #[must_use]
    pub fn any_remote_healthy(&self) -> bool {
        self.layers.iter().any(|l| l.health.is_healthy())
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Watch remote availability.
    #[must_use]
    pub fn online_receiver(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Probe every remote layer now.
    pub async fn probe_all(&self) -> Vec<LayerDescriptor> {
        for layer in &self.layers {
            self.probe_layer(layer).await;
        }
        self.layers()
    }

    /// Probe layers that are due: unhealthy ones past their interval, or all
    /// of them while offline.
    pub async fn probe_unhealthy(&self) -> usize {
        let offline = !self.is_online();
        let mut recovered = 0;
        for layer in &self.layers {
            let due = (offline || !layer.health.is_healthy())
                && layer.health.should_attempt(self.config.probe_interval, now_millis());
            if due && self.probe_layer(layer).await {
                recovered += 1;
            }
        }
        recovered
    }

    async fn probe_layer(&self, layer: &RemoteLayer) -> bool {
        let ok = layer.health.probe(layer.adapter.as_ref(), layer.timeout, now_millis()).await;
        if ok {
            self.set_online(true);
        }
        ok
    }

    /// Highest-priority healthy layer offering a change feed for `resource`.
    ///
    /// When a layer offering a feed failed and none succeeded, its failure is
    /// returned as [`SyncError::LayerUnavailable`].
    pub async fn subscription_source(&self, resource: &str) -> SyncResult<(String, ChangeFeed)> {
        let mut failed: Option<(String, LayerError)> = None;
        for layer in &self.layers {
            if !layer.health.is_healthy() {
                continue;
            }
            let result = match tokio::time::timeout(layer.timeout, layer.adapter.subscribe(resource)).await {
                Ok(result) => result,
                Err(_) => Err(LayerError::Timeout(layer.timeout)),
            };
            match result {
                Ok(feed) => {
                    info!(layer = layer.name(), resource, "Subscribed to change feed");
                    return Ok((layer.descriptor.name.clone(), feed));
                }
                Err(LayerError::Unsupported(_)) => continue,
                Err(e) => {
                    warn!(layer = layer.name(), resource, error = %e, "Subscribe failed");
                    if e.is_transient() {
                        layer.health.record_failure(now_millis());
                    }
                    failed.get_or_insert((layer.descriptor.name.clone(), e));
                }
            }
        }
        match failed {
            Some((layer, error)) => Err(SyncError::LayerUnavailable { layer, reason: error.to_string() }),
            None => Err(SyncError::SubscriptionUnavailable(resource.to_string())),
        }
    }

    /// Push a schema to every layer. Returns the layers that refused it.
    pub async fn apply_schema(&self, schema: &ValidationSchema) -> Vec<(String, LayerError)> {
        let mut refused = Vec::new();
        for layer in &self.layers {
            let result = match tokio::time::timeout(layer.timeout, layer.adapter.apply_schema(schema)).await {
                Ok(result) => result,
                Err(_) => Err(LayerError::Timeout(layer.timeout)),
            };
            if let Err(e) = result {
                refused.push((layer.descriptor.name.clone(), e));
            }
        }
        refused
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }
}

async fn invoke(adapter: &dyn LayerAdapter, call: &Call<'_>) -> Result<Reply, LayerError> {
    match call {
        Call::Read { resource, key } => adapter.read(resource, key).await.map(Reply::Read),
        Call::Write(operation) => adapter.write(operation).await.map(Reply::Write),
    }
}

#[async_trait]
impl RemoteTarget for ConnectionRouter {
    async fn read_remote(&self, resource: &str, key: &str) -> Result<Option<Record>, LayerError> {
        match self.route(Call::Read { resource, key }).await {
            Ok((layer, Reply::Read(record))) => {
                match &record {
                    Some(record) => self.cache_record(resource, key, record, &layer).await,
                    None => {
                        if let Err(e) = self.store.remove_cache(resource, key).await {
                            warn!(resource, key, error = %e, "Failed to evict deleted record from cache");
                        }
                    }
                }
                Ok(record)
            }
            Ok((_, Reply::Write(_))) => Err(LayerError::Unsupported("read")),
            Err(RouteFailure::Rejected { error, .. }) => Err(error),
            // Nothing attempted when every layer was skipped
            Err(RouteFailure::Exhausted { last_error }) => Err(last_error.unwrap_or(LayerError::Offline)),
        }
    }

    async fn write_remote(&self, operation: &SyncOperation) -> Result<RemoteAck, LayerError> {
        match self.route(Call::Write(operation)).await {
            Ok((layer, Reply::Write(ack))) => {
                self.cache_write(operation, &layer, Some(ack.version)).await;
                Ok(RemoteAck { layer, version: ack.version })
            }
            Ok((_, Reply::Read(_))) => Err(LayerError::Unsupported("write")),
            Err(RouteFailure::Rejected { error, .. }) => Err(error),
            // Nothing attempted when every layer was skipped
            Err(RouteFailure::Exhausted { last_error }) => Err(last_error.unwrap_or(LayerError::Offline)),
        }
    }
}

impl std::fmt::Debug for ConnectionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRouter")
            .field("layers", &self.layers())
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictPolicy, ConflictResolver};
    use crate::queue::QueueConfig;
    use crate::storage::InMemoryStore;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// Layer that either serves a fixed record or fails every call.
    struct StubLayer {
        up: AtomicBool,
        error: Mutex<LayerError>,
        value: serde_json::Value,
        calls: AtomicU32,
    }

    impl StubLayer {
        fn up(value: serde_json::Value) -> Arc<Self> {
            Arc::new(Self {
                up: AtomicBool::new(true),
                error: Mutex::new(LayerError::Unavailable("down".into())),
                value,
                calls: AtomicU32::new(0),
            })
        }

        fn down() -> Arc<Self> {
            let layer = Self::up(json!(null));
            layer.up.store(false, Ordering::SeqCst);
            layer
        }

        fn check(&self) -> Result<(), LayerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(self.error.lock().clone())
            }
        }
    }

    #[async_trait]
    impl LayerAdapter for StubLayer {
        async fn read(&self, _: &str, _: &str) -> Result<Option<Record>, LayerError> {
            self.check()?;
            Ok(Some(Record::new(self.value.clone(), 1)))
        }
        async fn write(&self, _: &SyncOperation) -> Result<WriteAck, LayerError> {
            self.check()?;
            Ok(WriteAck { version: 2, updated_at: now_millis() })
        }
        async fn probe(&self) -> Result<(), LayerError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(LayerError::Unavailable("down".into()))
            }
        }
    }

    /// Layer whose change feed is temporarily down.
    struct FeedDown;

    #[async_trait]
    impl LayerAdapter for FeedDown {
        async fn read(&self, _: &str, _: &str) -> Result<Option<Record>, LayerError> {
            Ok(None)
        }
        async fn write(&self, _: &SyncOperation) -> Result<WriteAck, LayerError> {
            Ok(WriteAck { version: 1, updated_at: now_millis() })
        }
        async fn probe(&self) -> Result<(), LayerError> {
            Ok(())
        }
        async fn subscribe(&self, _: &str) -> Result<ChangeFeed, LayerError> {
            Err(LayerError::Unavailable("socket closed".into()))
        }
    }

    fn router_with(layers: Vec<Layer>, config: RouterConfig) -> SyncResult<(ConnectionRouter, Arc<InMemoryStore>)> {
        let store = Arc::new(InMemoryStore::new());
        let resolver = Arc::new(ConflictResolver::new(ConflictPolicy::default()));
        let queue = Arc::new(OfflineQueue::new(store.clone(), resolver, QueueConfig::default()));
        let router = ConnectionRouter::new(layers, store.clone(), queue, config)?;
        Ok((router, store))
    }

    /// Every read goes to the layers
    fn router(layers: Vec<Layer>) -> SyncResult<(ConnectionRouter, Arc<InMemoryStore>)> {
        router_with(layers, RouterConfig { cache_ttl: Duration::ZERO, ..RouterConfig::default() })
    }

    #[test]
    fn test_duplicate_priorities_rejected() {
        let a = Layer::new("rest", LayerKind::Primary, 0, StubLayer::up(json!(1)));
        let b = Layer::new("graphql", LayerKind::Secondary, 0, StubLayer::up(json!(2)));
        assert!(matches!(router(vec![a, b]), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_local_name_reserved() {
        let a = Layer::new(LOCAL_LAYER, LayerKind::Primary, 0, StubLayer::up(json!(1)));
        assert!(matches!(router(vec![a]), Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_fails_over_and_marks_unhealthy() {
        let primary = StubLayer::down();
        let secondary = StubLayer::up(json!({"title": "from secondary"}));
        let (router, _) = router(vec![
            Layer::new("secondary", LayerKind::Secondary, 1, secondary.clone()),
            Layer::new("primary", LayerKind::Primary, 0, primary.clone()),
        ])
        .unwrap();

        for _ in 0..3 {
            let response = router.read("posts", "42").await.unwrap();
            assert_eq!(response.origin, "secondary");
            assert!(!response.stale);
        }
        let layers = router.layers();
        assert_eq!(layers[0].name, "primary");
        assert!(!layers[0].healthy);
        assert_eq!(layers[0].consecutive_failures, 3);
        assert_eq!(layers[2].name, LOCAL_LAYER);

        // Skipped now, within its probe interval
        router.read("posts", "42").await.unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stale_read_when_everything_is_down() {
        let layer = StubLayer::up(json!({"v": 1}));
        let (router, _) = router(vec![Layer::new("rest", LayerKind::Primary, 0, layer.clone())]).unwrap();
        router.read("posts", "1").await.unwrap();

        layer.up.store(false, Ordering::SeqCst);
        let response = router.read("posts", "1").await.unwrap();
        assert!(response.stale);
        assert_eq!(response.origin, LOCAL_LAYER);
        assert_eq!(response.record.value, json!({"v": 1}));
        assert!(!router.is_online());

        let err = router.read("posts", "never-cached").await.unwrap_err();
        assert!(matches!(err, SyncError::AllLayersUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_fresh_cache_entry_answers_without_layers() {
        let layer = StubLayer::up(json!({"v": 1}));
        let config = RouterConfig { cache_ttl: Duration::from_secs(60), ..RouterConfig::default() };
        let (router, store) = router_with(vec![Layer::new("rest", LayerKind::Primary, 0, layer.clone())], config).unwrap();

        router.read("posts", "1").await.unwrap();
        let response = router.read("posts", "1").await.unwrap();
        assert_eq!(layer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.origin, "rest");
        assert!(!response.stale);
        assert_eq!(response.record.value, json!({"v": 1}));

        // An expired entry reads through again
        let old = Record::new(json!({"v": 0}), 1);
        store
            .put_cache(&CacheEntry::from_record("posts", "1", &old, "rest", Duration::ZERO, now_millis()))
            .await
            .unwrap();
        let response = router.read("posts", "1").await.unwrap();
        assert_eq!(layer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(response.record.value, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_queued_write_in_cache_is_not_served_fresh() {
        let layer = StubLayer::up(json!({"title": "server"}));
        let config = RouterConfig { cache_ttl: Duration::from_secs(60), ..RouterConfig::default() };
        let (router, _) = router_with(vec![Layer::new("rest", LayerKind::Primary, 0, layer.clone())], config).unwrap();

        router.enqueue(SyncOperation::create("posts", "1", json!({"title": "draft"}))).await.unwrap();
        let response = router.read("posts", "1").await.unwrap();
        assert_eq!(layer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.origin, "rest");
    }

    #[tokio::test]
    async fn test_attach_cached_base_uses_server_state_only() {
        let layer = StubLayer::up(json!({"name": "A0"}));
        let (router, _) = router(vec![Layer::new("rest", LayerKind::Primary, 0, layer)]).unwrap();

        // Nothing cached yet: stays blind
        let op = router.attach_cached_base(SyncOperation::update("users", "u1", json!({"name": "A"}))).await;
        assert!(op.base.is_none());

        router.read("users", "u1").await.unwrap();
        let op = router.attach_cached_base(SyncOperation::update("users", "u1", json!({"name": "A"}))).await;
        let base = op.base.unwrap();
        assert_eq!(base.version, 1);
        assert_eq!(base.snapshot, Some(json!({"name": "A0"})));

        // Creates never carry a base
        let op = router.attach_cached_base(SyncOperation::create("users", "u1", json!({}))).await;
        assert!(op.base.is_none());

        // A queued local edit is not server state
        router.enqueue(SyncOperation::create("users", "u2", json!({"name": "C"}))).await.unwrap();
        let op = router.attach_cached_base(SyncOperation::update("users", "u2", json!({"name": "D"}))).await;
        assert!(op.base.is_none());
    }

    #[tokio::test]
    async fn test_remote_target_reports_offline_when_nothing_attempted() {
        let layer = StubLayer::down();
        let (router, _) = router(vec![Layer::new("rest", LayerKind::Primary, 0, layer.clone())]).unwrap();

        // Attempted and failed: the layer's own error
        for _ in 0..3 {
            let err = router.read_remote("posts", "1").await.unwrap_err();
            assert!(matches!(err, LayerError::Unavailable(_)));
        }
        // Unhealthy and inside its probe interval: skipped
        let err = router.read_remote("posts", "1").await.unwrap_err();
        assert!(matches!(err, LayerError::Offline));
        let err = router.write_remote(&SyncOperation::create("posts", "1", json!({}))).await.unwrap_err();
        assert!(matches!(err, LayerError::Offline));
        assert_eq!(layer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_does_not_count_against_health() {
        let layer = StubLayer::down();
        *layer.error.lock() = LayerError::Status { code: 403, message: "forbidden".into() };
        let (router, _) = router(vec![Layer::new("rest", LayerKind::Primary, 0, layer)]).unwrap();

        for _ in 0..5 {
            let err = router.read("posts", "1").await.unwrap_err();
            assert!(matches!(err, SyncError::Rejected { .. }));
        }
        assert!(router.layers()[0].healthy);
        assert_eq!(router.layers()[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_write_queues_when_offline_and_updates_cache() {
        let (router, store) = router(vec![Layer::new("rest", LayerKind::Primary, 0, StubLayer::down())]).unwrap();
        let op = SyncOperation::create("posts", "1", json!({"title": "draft"}));

        let response = router.write(op.clone()).await.unwrap();
        assert_eq!(response, RouterResponse::Queued(op.id));
        assert_eq!(router.queue().pending().await.unwrap().len(), 1);

        let cached = store.get_cache("posts", "1").await.unwrap().unwrap();
        assert_eq!(cached.value, json!({"title": "draft"}));
        assert_eq!(cached.origin_layer, LOCAL_LAYER);
    }

    #[tokio::test]
    async fn test_write_permanent_rejection_and_conflict() {
        let layer = StubLayer::down();
        *layer.error.lock() = LayerError::Status { code: 422, message: "bad".into() };
        let (router, _) = router(vec![Layer::new("rest", LayerKind::Primary, 0, layer.clone())]).unwrap();

        let err = router.write(SyncOperation::create("p", "1", json!({}))).await.unwrap_err();
        assert!(matches!(err, SyncError::PermanentWriteFailure { .. }));

        *layer.error.lock() = LayerError::Status { code: 409, message: "stale".into() };
        let err = router.write(SyncOperation::create("p", "1", json!({}))).await.unwrap_err();
        assert!(matches!(err, SyncError::ConflictDetected { .. }));
    }

    #[tokio::test]
    async fn test_online_watch_flips() {
        let layer = StubLayer::up(json!(1));
        let (router, _) = router(vec![Layer::new("rest", LayerKind::Primary, 0, layer.clone())]).unwrap();
        let mut rx = router.online_receiver();

        layer.up.store(false, Ordering::SeqCst);
        let _ = router.read("p", "1").await;
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());

        layer.up.store(true, Ordering::SeqCst);
        assert_eq!(router.probe_unhealthy().await, 1);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_subscription_source_without_feeds() {
        let (router, _) = router(vec![Layer::new("rest", LayerKind::Primary, 0, StubLayer::up(json!(1)))]).unwrap();
        let err = router.subscription_source("posts").await.unwrap_err();
        assert!(matches!(err, SyncError::SubscriptionUnavailable(_)));
    }

    #[tokio::test]
    async fn test_failed_feed_reports_layer_unavailable() {
        let (router, _) = router(vec![
            Layer::new("rest", LayerKind::Primary, 0, StubLayer::up(json!(1))),
            Layer::new("realtime", LayerKind::Secondary, 1, Arc::new(FeedDown)),
        ])
        .unwrap();
        let err = router.subscription_source("posts").await.unwrap_err();
        assert!(err.is_retryable());
        match err {
            SyncError::LayerUnavailable { layer, reason } => {
                assert_eq!(layer, "realtime");
                assert!(reason.contains("socket closed"));
            }
            other => panic!("expected LayerUnavailable, got {:?}", other),
        }
        assert_eq!(router.layers()[1].consecutive_failures, 1);
    }
}
