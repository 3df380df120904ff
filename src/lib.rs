// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Failover Sync
//!
//! Resilient data access across redundant backend layers, with a durable
//! offline queue, conflict resolution and realtime change batching.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SyncEngine                          │
//! │  • read / write / subscribe                                │
//! │  • validates writes, checks reads for schema drift         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Connection Router                       │
//! │  • Primary → Secondary → Tertiary by priority              │
//! │  • per-layer timeouts, health, promotion probes            │
//! └─────────────────────────────────────────────────────────────┘
//!          │ all layers down                   │ realtime feed
//!          ▼                                   ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────┐
//! │  Local Durable Store         │  │  Change Batcher          │
//! │  • stale cache for reads     │  │  • 100ms window, dedup   │
//! │  • offline queue for writes  │  │  • flush past 500 keys   │
//! │  • dead letters, conflicts   │  └──────────────────────────┘
//! └──────────────────────────────┘
//!          │ back online
//!          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Queue drain: per-key FIFO, conflict resolution,      │
//! │        backoff with jitter, dead letters                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use failover_sync::{Layer, LayerKind, SyncConfig, SyncEngine, SyncOperation};
//! # use failover_sync::{LayerAdapter, LayerError, Record, WriteAck};
//! # struct RestClient;
//! # #[async_trait::async_trait]
//! # impl LayerAdapter for RestClient {
//! #     async fn read(&self, _: &str, _: &str) -> Result<Option<Record>, LayerError> { Ok(None) }
//! #     async fn write(&self, _: &SyncOperation) -> Result<WriteAck, LayerError> { Ok(WriteAck { version: 1, updated_at: 0 }) }
//! #     async fn probe(&self) -> Result<(), LayerError> { Ok(()) }
//! # }
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig {
//!         store_url: Some("sqlite://offline.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!     let layers = vec![Layer::new("rest", LayerKind::Primary, 0, Arc::new(RestClient))];
//!
//!     let engine = SyncEngine::open(config, layers).await.expect("Failed to open");
//!     engine.start().await.expect("Failed to start");
//!
//!     // Committed directly, or queued while every layer is down
//!     let outcome = engine
//!         .write(SyncOperation::create("posts", "42", json!({"title": "Hello"})))
//!         .await
//!         .expect("Failed to write");
//!     println!("{:?}", outcome);
//!
//!     // Layer failover, then the cache when everything is down
//!     let post = engine.read("posts", "42").await.expect("Failed to read");
//!     println!("{} (stale: {})", post.value, post.stale);
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`SyncEngine`] facade and its lifecycle
//! - [`router`]: Priority failover across layers
//! - [`layer`]: Layer descriptors, the adapter trait, health tracking
//! - [`queue`]: Offline queue and drain
//! - [`conflict`]: Conflict detection, strategies, three-way merge
//! - [`schema`]: Canonical schemas, local validation, drift
//! - [`batching`]: Realtime change batching
//! - [`storage`]: Durable store (SQLite, in-memory)
//! - [`compaction`]: Retention-based cleanup of the store
//! - [`resilience`]: Retry and backoff

pub mod batching;
pub mod compaction;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod layer;
pub mod metrics;
pub mod operation;
pub mod queue;
pub mod resilience;
pub mod router;
pub mod schema;
pub mod storage;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use batching::{BatchedUpdate, ChangeEvent, FlushReason, LocalState};
pub use config::SyncConfig;
pub use conflict::{ConflictRecord, ConflictResolver, ConflictStrategy, ManualDecision, TieBreak};
pub use coordinator::{EngineState, HealthCheck, ReadResult, Subscription, SyncEngine, WriteOutcome};
pub use error::{SyncError, SyncResult};
pub use layer::{ChangeFeed, Layer, LayerAdapter, LayerDescriptor, LayerError, LayerKind, WriteAck, LOCAL_LAYER};
pub use metrics::LatencyTimer;
pub use operation::{OperationKind, OperationStatus, Record, RecordVersion, SyncOperation};
pub use queue::{DrainReport, QueueStats};
pub use resilience::retry::RetryConfig;
pub use schema::{
    ConstraintKind, Constraints, DriftReport, FieldError, FieldSpec, FieldType, ValidationReport, ValidationSchema,
};
pub use storage::{DeadLetter, DurableStore, InMemoryStore, SqlStore, StorageError};
