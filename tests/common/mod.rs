// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scripted in-memory layers shared by the integration and chaos tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use failover_sync::{
    ChangeEvent, ChangeFeed, LayerAdapter, LayerError, OperationKind, Record, SyncConfig, SyncOperation,
    ValidationSchema, WriteAck,
};

/// A versioned document backend with switchable failure modes.
///
/// Writes carrying a base version that no longer matches are refused with
/// 409, and creates of existing records likewise, the way a REST API with
/// optimistic concurrency would.
pub struct MockLayer {
    pub name: String,
    records: Mutex<HashMap<(String, String), Record>>,
    down: AtomicBool,
    /// Errors returned by the next calls, before normal behaviour resumes
    script: Mutex<VecDeque<LayerError>>,
    /// Every call sleeps this long first
    delay: Mutex<Option<Duration>>,
    supports_feed: bool,
    feed: Mutex<Option<mpsc::Sender<ChangeEvent>>>,
    refuse_schema: bool,
    /// Records whose every read and write fails with 503
    poisoned: Mutex<HashSet<(String, String)>>,
    pub reads: AtomicU32,
    pub writes: AtomicU32,
    pub probes: AtomicU32,
    write_log: Mutex<Vec<SyncOperation>>,
}

impl MockLayer {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, false, false))
    }

    pub fn with_feed(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, true, false))
    }

    pub fn refusing_schema(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, false, true))
    }

    fn build(name: &str, supports_feed: bool, refuse_schema: bool) -> Self {
        Self {
            name: name.to_string(),
            records: Mutex::new(HashMap::new()),
            down: AtomicBool::new(false),
            script: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            supports_feed,
            feed: Mutex::new(None),
            refuse_schema,
            poisoned: Mutex::new(HashSet::new()),
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
            probes: AtomicU32::new(0),
            write_log: Mutex::new(Vec::new()),
        }
    }

    /// Store `value` as the next version of a record, bypassing the engine.
    pub fn seed(&self, resource: &str, key: &str, value: Value) -> Record {
        let mut records = self.records.lock();
        let k = (resource.to_string(), key.to_string());
        let version = records.get(&k).map_or(0, |r| r.version) + 1;
        let record = Record::new(value, version);
        records.insert(k, record.clone());
        record
    }

    pub fn record(&self, resource: &str, key: &str) -> Option<Record> {
        self.records.lock().get(&(resource.to_string(), key.to_string())).cloned()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// The next `n` calls fail with `error`.
    pub fn fail_next(&self, n: usize, error: LayerError) {
        let mut script = self.script.lock();
        for _ in 0..n {
            script.push_back(error.clone());
        }
    }

    pub fn poison(&self, resource: &str, key: &str) {
        self.poisoned.lock().insert((resource.to_string(), key.to_string()));
    }

    pub fn write_log(&self) -> Vec<SyncOperation> {
        self.write_log.lock().clone()
    }

    /// Push a change to subscribers. Returns false if nobody is subscribed.
    pub async fn emit(&self, event: ChangeEvent) -> bool {
        let sender = self.feed.lock().clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn close_feed(&self) {
        self.feed.lock().take();
    }

    fn check_poison(&self, resource: &str, key: &str) -> Result<(), LayerError> {
        if self.poisoned.lock().contains(&(resource.to_string(), key.to_string())) {
            return Err(status(503, "record unavailable"));
        }
        Ok(())
    }

    async fn enter(&self) -> Result<(), LayerError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.script.lock().pop_front() {
            return Err(error);
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(LayerError::Unavailable(format!("{} is down", self.name)));
        }
        Ok(())
    }
}

fn status(code: u16, message: &str) -> LayerError {
    LayerError::Status { code, message: message.to_string() }
}

#[async_trait]
impl LayerAdapter for MockLayer {
    async fn read(&self, resource: &str, key: &str) -> Result<Option<Record>, LayerError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        self.check_poison(resource, key)?;
        Ok(self.record(resource, key))
    }

    async fn write(&self, operation: &SyncOperation) -> Result<WriteAck, LayerError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        self.check_poison(&operation.resource, &operation.key)?;

        let mut records = self.records.lock();
        let k = (operation.resource.clone(), operation.key.clone());
        let current = records.get(&k).cloned();

        match (&operation.base, &current) {
            (Some(base), Some(current)) if base.version != current.version => {
                return Err(status(409, "version mismatch"));
            }
            _ => {}
        }
        if operation.kind == OperationKind::Create && current.is_some() {
            return Err(status(409, "already exists"));
        }

        let version = current.as_ref().map_or(0, |r| r.version) + 1;
        match operation.apply_to(current.as_ref().map(|r| &r.value)) {
            Some(value) => {
                records.insert(k, Record::new(value, version));
            }
            None => {
                records.remove(&k);
            }
        }
        drop(records);

        self.write_log.lock().push(operation.clone());
        Ok(WriteAck { version, updated_at: failover_sync::operation::now_millis() })
    }

    async fn probe(&self) -> Result<(), LayerError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Err(LayerError::Unavailable(format!("{} is down", self.name)))
        } else {
            Ok(())
        }
    }

    async fn subscribe(&self, _resource: &str) -> Result<ChangeFeed, LayerError> {
        if !self.supports_feed {
            return Err(LayerError::Unsupported("subscribe"));
        }
        self.enter().await?;
        let (tx, rx) = mpsc::channel(1024);
        *self.feed.lock() = Some(tx);
        Ok(rx)
    }

    async fn apply_schema(&self, _schema: &ValidationSchema) -> Result<(), LayerError> {
        if self.refuse_schema {
            Err(status(501, "schema push not supported"))
        } else {
            Ok(())
        }
    }
}

/// Fast retries so drains finish quickly in tests. Reads always go to the
/// layers so routing stays observable.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        cache_ttl_secs: 0,
        retry_base_ms: 1,
        retry_max_delay_ms: 5,
        retry_max_attempts: 3,
        drain_interval_secs: 3_600,
        ..SyncConfig::default()
    }
}

/// Opt-in log output: `RUST_LOG=failover_sync=debug cargo test -- --nocapture`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
