// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Uniform capability interface implemented per concrete transport
//! (REST client, GraphQL client, managed-database channel, ...).

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::batching::ChangeEvent;
use crate::operation::{Record, SyncOperation};
use crate::schema::ValidationSchema;

/// Live change notifications from a layer.
pub type ChangeFeed = mpsc::Receiver<ChangeEvent>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayerError {
    #[error("layer unreachable: {0}")]
    Unavailable(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("status {code}: {message}")]
    Status { code: u16, message: String },
    #[error("capability not supported: {0}")]
    Unsupported(&'static str),
    /// Raised by the router, not adapters: every remote layer was skipped as
    /// unhealthy, so nothing was attempted.
    #[error("no remote layer is due for an attempt")]
    Offline,
}

impl LayerError {
    /// Network errors, timeouts, 5xx and 429 are worth retrying elsewhere or later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) | Self::Offline => true,
            Self::Status { code, .. } => *code >= 500 || *code == 429,
            Self::Unsupported(_) => false,
        }
    }

    /// Optimistic-concurrency rejection (HTTP 409).
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Status { code: 409, .. })
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::Status { code, .. } if *code >= 500 => "5xx",
            Self::Status { code: 429, .. } => "throttled",
            Self::Status { .. } => "4xx",
            Self::Unsupported(_) => "unsupported",
            Self::Offline => "offline",
        }
    }
}

/// Server acknowledgement of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    pub version: u64,
    pub updated_at: i64,
}

#[async_trait]
pub trait LayerAdapter: Send + Sync {
    /// Fetch one record; `Ok(None)` means the layer authoritatively has no such record.
    async fn read(&self, resource: &str, key: &str) -> Result<Option<Record>, LayerError>;

    async fn write(&self, operation: &SyncOperation) -> Result<WriteAck, LayerError>;

    /// Cheap read-only health call used only for promotion checks.
    async fn probe(&self) -> Result<(), LayerError>;

    /// Live change feed for a resource. Layers without one keep the default.
    async fn subscribe(&self, _resource: &str) -> Result<ChangeFeed, LayerError> {
        Err(LayerError::Unsupported("subscribe"))
    }

    /// Map the canonical schema onto the layer's own validation mechanism.
    async fn apply_schema(&self, _schema: &ValidationSchema) -> Result<(), LayerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> LayerError {
        LayerError::Status { code, message: String::new() }
    }

    #[test]
    fn test_transient_classification() {
        assert!(LayerError::Unavailable("dns".into()).is_transient());
        assert!(LayerError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(status(500).is_transient());
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(LayerError::Offline.is_transient());

        assert!(!status(400).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(409).is_transient());
        assert!(!LayerError::Unsupported("subscribe").is_transient());
    }

    #[test]
    fn test_conflict_and_kind_labels() {
        assert!(status(409).is_conflict());
        assert!(!status(412).is_conflict());
        assert_eq!(status(502).kind(), "5xx");
        assert_eq!(status(429).kind(), "throttled");
        assert_eq!(status(422).kind(), "4xx");
    }
}
