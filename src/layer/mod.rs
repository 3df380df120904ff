// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend layers: descriptors, the adapter capability trait, and health tracking.
//!
//! Layers are tried in ascending priority order. The local layer (the durable
//! store) is always last and always healthy.

pub mod adapter;
pub mod health;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use adapter::{ChangeFeed, LayerAdapter, LayerError, WriteAck};
pub use health::LayerHealth;

/// Name of the synthetic layer backed by the durable store.
pub const LOCAL_LAYER: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Primary,
    Secondary,
    Tertiary,
    Local,
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
            Self::Tertiary => write!(f, "tertiary"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Point-in-time view of one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub name: String,
    pub kind: LayerKind,
    /// Lower is tried first
    pub priority: u32,
    pub healthy: bool,
    /// Last probe or retry-after-unhealthy attempt (epoch millis)
    pub last_probe: Option<i64>,
    pub consecutive_failures: u32,
}

impl LayerDescriptor {
    pub fn new(name: impl Into<String>, kind: LayerKind, priority: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            priority,
            healthy: true,
            last_probe: None,
            consecutive_failures: 0,
        }
    }

    /// The durable-store layer, always healthy and always last.
    #[must_use]
    pub fn local() -> Self {
        Self::new(LOCAL_LAYER, LayerKind::Local, u32::MAX)
    }
}

/// A remote layer registration: its descriptor and the transport behind it.
#[derive(Clone)]
pub struct Layer {
    pub descriptor: LayerDescriptor,
    pub adapter: Arc<dyn LayerAdapter>,
}

impl Layer {
    pub fn new(
        name: impl Into<String>,
        kind: LayerKind,
        priority: u32,
        adapter: Arc<dyn LayerAdapter>,
    ) -> Self {
        Self {
            descriptor: LayerDescriptor::new(name, kind, priority),
            adapter,
        }
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer").field("descriptor", &self.descriptor).finish_non_exhaustive()
    }
}
