// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the sync engine.
//!
//! # Example
//!
//! ```
//! use failover_sync::SyncConfig;
//! use std::time::Duration;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.failure_threshold, 3);
//! assert_eq!(config.drain_concurrency, 6);
//!
//! // Tuned config
//! let config = SyncConfig {
//!     store_url: Some("sqlite://offline.db?mode=rwc".into()),
//!     primary_timeout_ms: 2_000,
//!     batch_window_ms: 50,
//!     ..Default::default()
//! };
//! assert_eq!(config.batcher_config().window, Duration::from_millis(50));
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::batching::BatcherConfig;
use crate::compaction::CompactionConfig;
use crate::conflict::{ConflictPolicy, ConflictStrategy, TieBreak};
use crate::layer::LayerKind;
use crate::queue::QueueConfig;
use crate::resilience::retry::RetryConfig;
use crate::router::RouterConfig;

/// Configuration for the sync engine.
///
/// Every field has a default; a config deserialized from an empty JSON object
/// equals [`SyncConfig::default()`].
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Durable store location (e.g., "sqlite://offline.db?mode=rwc").
    /// `None` keeps the cache and queue in memory.
    #[serde(default)]
    pub store_url: Option<String>,

    /// Per-kind request timeouts
    #[serde(default = "default_primary_timeout_ms")]
    pub primary_timeout_ms: u64,
    #[serde(default = "default_secondary_timeout_ms")]
    pub secondary_timeout_ms: u64,
    #[serde(default = "default_tertiary_timeout_ms")]
    pub tertiary_timeout_ms: u64,

    /// Consecutive failures before a layer is marked unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How often an unhealthy layer may be retried or probed
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Reads younger than this are answered from the cache; 0 disables
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Safety-interval drain of the offline queue
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,

    /// Distinct resource-keys drained in parallel
    #[serde(default = "default_drain_concurrency")]
    pub drain_concurrency: usize,

    /// Replay backoff
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub retry_factor: f64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,

    /// Realtime batching
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    #[serde(default = "default_batch_max_keys")]
    pub batch_max_keys: usize,

    /// Dead letters, commit tombstones and expired cache entries older than
    /// this are removed by compaction
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,

    /// Conflict handling
    #[serde(default)]
    pub default_conflict_strategy: ConflictStrategy,
    #[serde(default)]
    pub conflict_strategies: HashMap<String, ConflictStrategy>,
    #[serde(default)]
    pub tie_break: TieBreak,
}

fn default_primary_timeout_ms() -> u64 { 5_000 }
fn default_secondary_timeout_ms() -> u64 { 10_000 }
fn default_tertiary_timeout_ms() -> u64 { 10_000 }
fn default_failure_threshold() -> u32 { 3 }
fn default_probe_interval_secs() -> u64 { 30 }
fn default_cache_ttl_secs() -> u64 { 300 }
fn default_drain_interval_secs() -> u64 { 30 }
fn default_drain_concurrency() -> usize { 6 }
fn default_retry_base_ms() -> u64 { 1_000 }
fn default_retry_factor() -> f64 { 2.0 }
fn default_retry_max_delay_ms() -> u64 { 30_000 }
fn default_retry_max_attempts() -> usize { 5 }
fn default_batch_window_ms() -> u64 { 100 }
fn default_batch_max_keys() -> usize { 500 }
fn default_retention_days() -> u32 { 7 }
fn default_compaction_interval_secs() -> u64 { 3_600 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store_url: None,
            primary_timeout_ms: default_primary_timeout_ms(),
            secondary_timeout_ms: default_secondary_timeout_ms(),
            tertiary_timeout_ms: default_tertiary_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            probe_interval_secs: default_probe_interval_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            drain_interval_secs: default_drain_interval_secs(),
            drain_concurrency: default_drain_concurrency(),
            retry_base_ms: default_retry_base_ms(),
            retry_factor: default_retry_factor(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            batch_window_ms: default_batch_window_ms(),
            batch_max_keys: default_batch_max_keys(),
            retention_days: default_retention_days(),
            compaction_interval_secs: default_compaction_interval_secs(),
            default_conflict_strategy: ConflictStrategy::default(),
            conflict_strategies: HashMap::new(),
            tie_break: TieBreak::default(),
        }
    }
}

impl SyncConfig {
    /// Request timeout for a layer of the given kind.
    #[must_use]
    pub fn layer_timeout(&self, kind: LayerKind) -> Duration {
        match kind {
            LayerKind::Primary => Duration::from_millis(self.primary_timeout_ms),
            LayerKind::Secondary => Duration::from_millis(self.secondary_timeout_ms),
            LayerKind::Tertiary | LayerKind::Local => Duration::from_millis(self.tertiary_timeout_ms),
        }
    }

    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            factor: self.retry_factor,
            max_retries: Some(self.retry_max_attempts),
            jitter: true,
        }
    }

    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            primary_timeout: self.layer_timeout(LayerKind::Primary),
            secondary_timeout: self.layer_timeout(LayerKind::Secondary),
            tertiary_timeout: self.layer_timeout(LayerKind::Tertiary),
            failure_threshold: self.failure_threshold,
            probe_interval: Duration::from_secs(self.probe_interval_secs),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
        }
    }

    #[must_use]
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            concurrency: self.drain_concurrency.max(1),
            retry: self.retry_config(),
        }
    }

    #[must_use]
    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            window: Duration::from_millis(self.batch_window_ms),
            max_keys: self.batch_max_keys.max(1),
        }
    }

    #[must_use]
    pub fn conflict_policy(&self) -> ConflictPolicy {
        ConflictPolicy {
            default: self.default_conflict_strategy,
            per_resource: self.conflict_strategies.clone(),
            tie_break: self.tie_break,
        }
    }

    /// Retention window for compaction.
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }

    #[must_use]
    pub fn compaction_config(&self) -> CompactionConfig {
        CompactionConfig {
            retention: self.retention(),
            interval: Duration::from_secs(self.compaction_interval_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.layer_timeout(LayerKind::Primary), Duration::from_secs(5));
        assert_eq!(config.layer_timeout(LayerKind::Secondary), Duration::from_secs(10));
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.drain_interval_secs, 30);
        assert_eq!(config.retention(), Duration::from_secs(7 * 24 * 3600));

        let retry = config.retry_config();
        assert_eq!(retry.initial_delay, Duration::from_secs(1));
        assert_eq!(retry.max_delay, Duration::from_secs(30));
        assert_eq!(retry.max_retries, Some(5));

        let batcher = config.batcher_config();
        assert_eq!(batcher.window, Duration::from_millis(100));
        assert_eq!(batcher.max_keys, 500);
    }

    #[test]
    fn test_deserialize_empty_object_uses_defaults() {
        let config: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.primary_timeout_ms, 5_000);
        assert_eq!(config.default_conflict_strategy, ConflictStrategy::ServerWins);
        assert!(config.store_url.is_none());
    }

    #[test]
    fn test_deserialize_conflict_strategies() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"conflict_strategies": {"profile": "merge", "posts": "manual"}, "tie_break": "client_wins"}"#,
        )
        .unwrap();
        let policy = config.conflict_policy();
        assert_eq!(policy.strategy_for("profile"), ConflictStrategy::Merge);
        assert_eq!(policy.strategy_for("posts"), ConflictStrategy::Manual);
        assert_eq!(policy.strategy_for("other"), ConflictStrategy::ServerWins);
        assert_eq!(policy.tie_break, TieBreak::ClientWins);
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let config = SyncConfig { drain_concurrency: 0, ..Default::default() };
        assert_eq!(config.queue_config().concurrency, 1);
    }
}
