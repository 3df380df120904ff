// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-layer health tracking.
//!
//! A layer is marked unhealthy after `failure_threshold` consecutive failures
//! and is then skipped until its probe interval elapses. One success resets
//! everything.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::adapter::{LayerAdapter, LayerError};
use super::LayerDescriptor;

const NEVER: i64 = i64::MIN;

pub struct LayerHealth {
    name: String,
    /// Last known health state
    healthy: AtomicBool,
    /// Consecutive failure count
    failures: AtomicU32,
    /// Last probe / retry-after-unhealthy attempt (epoch millis)
    last_probe: AtomicI64,
    failure_threshold: u32,
    /// Lock for health probes (prevent thundering herd)
    probing: Mutex<()>,
}

impl LayerHealth {
    pub fn new(name: impl Into<String>, failure_threshold: u32) -> Self {
        Self {
            name: name.into(),
            healthy: AtomicBool::new(true), // Assume healthy until proven otherwise
            failures: AtomicU32::new(0),
            last_probe: AtomicI64::new(NEVER),
            failure_threshold: failure_threshold.max(1),
            probing: Mutex::new(()),
        }
    }

    /// Record a successful call. Returns true if this recovered the layer.
    pub fn record_success(&self) -> bool {
        self.failures.store(0, Ordering::Release);
        let was_healthy = self.healthy.swap(true, Ordering::AcqRel);
        if !was_healthy {
            info!(layer = %self.name, "Layer recovered");
            crate::metrics::set_layer_healthy(&self.name, true);
        }
        !was_healthy
    }

    /// Record a failed call at `now`. Returns true if this tipped the layer unhealthy.
    pub fn record_failure(&self, now: i64) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        if failures >= self.failure_threshold && self.healthy.swap(false, Ordering::AcqRel) {
            self.last_probe.store(now, Ordering::Release);
            warn!(layer = %self.name, failures, "Layer marked unhealthy");
            crate::metrics::set_layer_healthy(&self.name, false);
            return true;
        }
        false
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_probe(&self) -> Option<i64> {
        match self.last_probe.load(Ordering::Acquire) {
            NEVER => None,
            t => Some(t),
        }
    }

    /// Whether a request may be sent to this layer at `now`.
    ///
    /// Healthy layers always qualify. An unhealthy layer qualifies once per
    /// probe interval; the caller that wins the slot stamps `last_probe` so
    /// concurrent requests keep skipping it.
    pub fn should_attempt(&self, probe_interval: Duration, now: i64) -> bool {
        if self.is_healthy() {
            return true;
        }
        let last = self.last_probe.load(Ordering::Acquire);
        let interval = probe_interval.as_millis() as i64;
        if last != NEVER && now.saturating_sub(last) < interval {
            return false;
        }
        self.last_probe
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Run the layer's health probe. Concurrent callers share one probe and
    /// get the current state.
    pub async fn probe(&self, adapter: &dyn LayerAdapter, timeout: Duration, now: i64) -> bool {
        let Ok(_guard) = self.probing.try_lock() else {
            return self.is_healthy();
        };
        self.last_probe.store(now, Ordering::Release);

        let result = match tokio::time::timeout(timeout, adapter.probe()).await {
            Ok(result) => result,
            Err(_) => Err(LayerError::Timeout(timeout)),
        };
        match result {
            Ok(()) => {
                self.record_success();
                debug!(layer = %self.name, "Probe succeeded");
                true
            }
            Err(e) => {
                debug!(layer = %self.name, error = %e, "Probe failed");
                // Probes only promote; a failed probe keeps the layer where it is.
                false
            }
        }
    }

    /// Merge live health into a static descriptor.
    #[must_use]
    pub fn snapshot(&self, base: &LayerDescriptor) -> LayerDescriptor {
        LayerDescriptor {
            healthy: self.is_healthy(),
            last_probe: self.last_probe(),
            consecutive_failures: self.failure_count(),
            ..base.clone()
        }
    }
}

impl std::fmt::Debug for LayerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerHealth")
            .field("name", &self.name)
            .field("healthy", &self.is_healthy())
            .field("failures", &self.failure_count())
            .finish()
    }
}
