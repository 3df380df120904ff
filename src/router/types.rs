// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use uuid::Uuid;

use crate::layer::LayerKind;
use crate::operation::{Record, SyncOperation};

/// Configuration for failover routing.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub primary_timeout: Duration,
    pub secondary_timeout: Duration,
    pub tertiary_timeout: Duration,
    /// Consecutive failures before a layer is skipped
    pub failure_threshold: u32,
    /// How often an unhealthy layer gets another chance
    pub probe_interval: Duration,
    /// Cache entries younger than this answer reads without asking a layer.
    /// Zero sends every read through the layers.
    pub cache_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            primary_timeout: Duration::from_secs(5),
            secondary_timeout: Duration::from_secs(10),
            tertiary_timeout: Duration::from_secs(10),
            failure_threshold: 3,
            probe_interval: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

impl RouterConfig {
    #[must_use]
    pub fn timeout_for(&self, kind: LayerKind) -> Duration {
        match kind {
            LayerKind::Primary => self.primary_timeout,
            LayerKind::Secondary => self.secondary_timeout,
            LayerKind::Tertiary | LayerKind::Local => self.tertiary_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Request {
    Read { resource: String, key: String },
    Write(SyncOperation),
}

impl Request {
    pub fn read(resource: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Read { resource: resource.into(), key: key.into() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadResponse {
    pub record: Record,
    /// Serving layer, or the local layer for cache fallbacks
    pub origin: String,
    /// Served from cache because no remote layer answered
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouterResponse {
    Read(ReadResponse),
    Written { layer: String, version: u64 },
    Queued(Uuid),
}
