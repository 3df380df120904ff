// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync engine coordinator.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::layer::LayerDescriptor;
use crate::queue::QueueStats;
use crate::schema::DriftReport;

/// Engine lifecycle state.
///
/// Use [`super::SyncEngine::state()`] to check current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Just created, background work not started
    Created,
    /// Background loop running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    /// Background tasks finished
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// A record as served to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub value: Value,
    pub version: u64,
    /// Served from the local cache because no remote layer answered
    pub stale: bool,
    /// Layer that produced the value (`local` for stale reads)
    pub origin: String,
    /// Set when the serving layer returned data the canonical schema rejects
    pub drift: Option<DriftReport>,
}

impl ReadResult {
    /// Turn schema drift into an error for callers that cannot use
    /// non-conforming data.
    pub fn require_conforming(self) -> SyncResult<Self> {
        match self.drift {
            Some(report) => Err(SyncError::SchemaDrift(report)),
            None => Ok(self),
        }
    }
}

/// Where a write ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Acknowledged by a remote layer
    Committed { layer: String, version: u64 },
    /// Persisted to the offline queue for later replay
    Queued { id: Uuid },
}

impl WriteOutcome {
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Snapshot for `/ready` and `/health` style endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Some remote layer answered recently
    pub online: bool,
    /// Every layer after a live probe, the local layer last
    pub layers: Vec<LayerDescriptor>,
    pub queue_pending: usize,
    pub queue_awaiting_resolution: usize,
    pub dead_letters: usize,
    pub draining: bool,
    /// Installed schema versions by resource
    pub schema_versions: Vec<(String, u32)>,
    /// Running, and at least one remote layer healthy
    pub healthy: bool,
}

impl HealthCheck {
    pub(super) fn from_parts(
        state: EngineState,
        online: bool,
        layers: Vec<LayerDescriptor>,
        queue: &QueueStats,
        schema_versions: Vec<(String, u32)>,
    ) -> Self {
        let any_remote = layers.iter().any(|l| l.healthy && l.kind != crate::layer::LayerKind::Local);
        Self {
            healthy: state == EngineState::Running && any_remote,
            state,
            online,
            layers,
            queue_pending: queue.pending,
            queue_awaiting_resolution: queue.awaiting_resolution,
            dead_letters: queue.dead_lettered,
            draining: queue.draining,
            schema_versions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerKind;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Running), "Running");
        assert_eq!(format!("{}", EngineState::Stopped), "Stopped");
    }

    #[test]
    fn test_health_requires_a_remote_layer() {
        let mut primary = LayerDescriptor::new("rest", LayerKind::Primary, 0);
        primary.healthy = false;
        let layers = vec![primary, LayerDescriptor::local()];

        let health = HealthCheck::from_parts(EngineState::Running, false, layers, &QueueStats::default(), vec![]);
        assert!(!health.healthy);

        let layers = vec![LayerDescriptor::new("rest", LayerKind::Primary, 0), LayerDescriptor::local()];
        let health = HealthCheck::from_parts(EngineState::Running, true, layers.clone(), &QueueStats::default(), vec![]);
        assert!(health.healthy);

        let health = HealthCheck::from_parts(EngineState::Created, true, layers, &QueueStats::default(), vec![]);
        assert!(!health.healthy);
    }

    #[test]
    fn test_require_conforming() {
        let read = ReadResult { value: Value::Null, version: 1, stale: false, origin: "rest".into(), drift: None };
        assert!(read.clone().require_conforming().is_ok());

        let drift = DriftReport {
            resource: "profile".into(),
            layer: "graphql".into(),
            schema_version: 2,
            unknown_fields: vec!["legacy".into()],
            violations: vec![],
            refused: None,
        };
        let err = ReadResult { drift: Some(drift), ..read }.require_conforming().unwrap_err();
        let SyncError::SchemaDrift(report) = err else { panic!("expected drift") };
        assert_eq!(report.layer, "graphql");
        assert_eq!(report.unknown_fields, vec!["legacy".to_string()]);
    }

    #[test]
    fn test_write_outcome() {
        assert!(WriteOutcome::Committed { layer: "rest".into(), version: 2 }.is_committed());
        assert!(!WriteOutcome::Queued { id: Uuid::new_v4() }.is_committed());
    }
}
