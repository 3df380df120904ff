// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic failover-sync usage example.
//!
//! Demonstrates:
//! 1. Two in-process backends (REST primary, GraphQL secondary) and a SQLite store
//! 2. Writing a few JSON records
//! 3. Failing over when the primary goes down
//! 4. Stale reads and queued writes during a full outage
//! 5. Draining the queue on recovery
//! 6. Displaying metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use failover_sync::{
    EngineState, Layer, LayerAdapter, LayerError, LayerKind, Record, SyncConfig, SyncEngine, SyncOperation, WriteAck,
    WriteOutcome,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use parking_lot::Mutex;
use serde_json::json;

const STORE_PATH: &str = "./failover_sync_demo.db";

/// An in-process stand-in for a remote API, with an outage switch.
struct DemoBackend {
    name: &'static str,
    records: Arc<Mutex<HashMap<(String, String), Record>>>,
    down: AtomicBool,
}

impl DemoBackend {
    /// Backends sharing `records` behave like two APIs over one database.
    fn new(name: &'static str, records: Arc<Mutex<HashMap<(String, String), Record>>>) -> Arc<Self> {
        Arc::new(Self { name, records, down: AtomicBool::new(false) })
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LayerError> {
        if self.down.load(Ordering::SeqCst) {
            Err(LayerError::Unavailable(format!("{} unreachable", self.name)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LayerAdapter for DemoBackend {
    async fn read(&self, resource: &str, key: &str) -> Result<Option<Record>, LayerError> {
        self.check()?;
        Ok(self.records.lock().get(&(resource.to_string(), key.to_string())).cloned())
    }

    async fn write(&self, operation: &SyncOperation) -> Result<WriteAck, LayerError> {
        self.check()?;
        let mut records = self.records.lock();
        let slot = (operation.resource.clone(), operation.key.clone());
        let current = records.get(&slot).cloned();
        if let (Some(base), Some(current)) = (&operation.base, &current) {
            if base.version != current.version {
                return Err(LayerError::Status { code: 409, message: "stale version".into() });
            }
        }
        let version = current.as_ref().map_or(0, |r| r.version) + 1;
        match operation.apply_to(current.as_ref().map(|r| &r.value)) {
            Some(value) => {
                records.insert(slot, Record::new(value, version));
            }
            None => {
                records.remove(&slot);
            }
        }
        Ok(WriteAck { version, updated_at: chrono::Utc::now().timestamp_millis() })
    }

    async fn probe(&self) -> Result<(), LayerError> {
        self.check()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures everything the engine emits)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt().with_target(false).compact().init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           failover-sync: Basic Usage Example                  ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring failover-sync...");

    let database = Arc::new(Mutex::new(HashMap::new()));
    let rest = DemoBackend::new("rest", database.clone());
    let graphql = DemoBackend::new("graphql", database);

    let config = SyncConfig {
        store_url: Some(format!("sqlite://{}?mode=rwc", STORE_PATH)),
        // Mark a layer unhealthy quickly for the demo
        failure_threshold: 1,
        probe_interval_secs: 1,
        retry_base_ms: 50,
        retry_max_delay_ms: 500,
        // Read through every time so the failover is visible
        cache_ttl_secs: 0,
        ..Default::default()
    };
    let layers = vec![
        Layer::new("rest", LayerKind::Primary, 0, rest.clone()),
        Layer::new("graphql", LayerKind::Secondary, 1, graphql.clone()),
    ];

    let engine = SyncEngine::open(config, layers).await?;
    println!("   State: {}", engine.state());

    println!("\n🚀 Starting engine...");
    engine.start().await?;
    assert_eq!(engine.state(), EngineState::Running);
    println!("   ✅ Engine running! State: {}", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write a few records
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing 3 records...");
    let entries = vec![
        ("alice", json!({"name": "Alice", "role": "admin"})),
        ("bob", json!({"name": "Bob", "role": "user"})),
        ("carol", json!({"name": "Carol", "role": "user"})),
    ];
    for (key, data) in &entries {
        let outcome = engine.write(SyncOperation::create("users", *key, data.clone())).await?;
        println!("   └─ users/{} → {:?}", key, outcome);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Primary outage: reads fail over
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n💥 Taking the REST primary down...");
    rest.set_down(true);
    let read = engine.read("users", "alice").await?;
    println!("   └─ users/alice served by '{}' → {}", read.origin, read.value);
    for layer in engine.layers() {
        println!("   │  └─ {} healthy={} failures={}", layer.name, layer.healthy, layer.consecutive_failures);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Full outage: stale reads, queued writes
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🌩️  Taking GraphQL down too...");
    graphql.set_down(true);
    let read = engine.read("users", "bob").await?;
    println!("   └─ users/bob from '{}' (stale: {}) → {}", read.origin, read.stale, read.value);

    let outcome = engine
        .write(SyncOperation::update("users", "bob", json!({"role": "moderator"})))
        .await?;
    if let WriteOutcome::Queued { id } = outcome {
        println!("   └─ Update queued offline as {}", id);
    }
    let stats = engine.queue_stats().await?;
    println!("   └─ Queue: {} pending, {} dead-lettered", stats.pending, stats.dead_lettered);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Recovery: the background loop probes, fails back and drains
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔌 Bringing both layers back...");
    rest.set_down(false);
    graphql.set_down(false);

    let mut online = engine.online_receiver();
    while !*online.borrow_and_update() {
        online.changed().await?;
    }
    for _ in 0..50 {
        if engine.queue_stats().await?.pending == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    println!("   ✅ Back online, queue pending: {}", engine.queue_stats().await?.pending);

    let read = engine.read("users", "bob").await?;
    println!("   └─ users/bob from '{}' → {}", read.origin, read.value);

    let health = engine.health_check().await?;
    println!("\n🩺 Health: healthy={} online={} draining={}", health.healthy, health.online, health.draining);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Dump raw metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", engine.state());

    println!("\n🧹 Cleaning up store file...");
    for suffix in ["", "-shm", "-wal"] {
        let path = format!("{}{}", STORE_PATH, suffix);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                println!("   └─ Warning: could not remove {}: {}", path, e);
            }
        }
    }

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics, grouped by kind and sorted by name
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let max = samples.iter().map(|v| v.into_inner()).fold(0.0, f64::max);
                histograms.push((name, label_str, count, sum, max));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, labels, count, sum, max) in &histograms {
            println!("   │  └─ {}{} count={} sum={:.4} max={:.4}", name, labels, count, sum, max);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
