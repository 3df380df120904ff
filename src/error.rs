// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Caller-facing errors.

use thiserror::Error;
use uuid::Uuid;

use crate::layer::LayerError;
use crate::schema::{DriftReport, ValidationReport};
use crate::storage::StorageError;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("layer '{layer}' unavailable: {reason}")]
    LayerUnavailable { layer: String, reason: String },

    #[error("no layer could serve {resource}/{key} and nothing is cached")]
    AllLayersUnavailable { resource: String, key: String },

    #[error("{resource}/{key} does not exist")]
    NotFound { resource: String, key: String },

    #[error("validation failed for '{}': {} error(s)", .0.resource, .0.errors.len())]
    Validation(ValidationReport),

    #[error("conflict on {resource}/{key} (operation {operation})")]
    ConflictDetected {
        operation: Uuid,
        resource: String,
        key: String,
    },

    #[error("schema drift on '{}' from layer '{}'", .0.resource, .0.layer)]
    SchemaDrift(DriftReport),

    #[error("write {id} permanently rejected: {reason}")]
    PermanentWriteFailure { id: Uuid, reason: String },

    #[error("layer '{layer}' rejected the request: {source}")]
    Rejected {
        layer: String,
        #[source]
        source: LayerError,
    },

    #[error("no layer offers a change feed for '{0}'")]
    SubscriptionUnavailable(String),

    #[error("no queued operation or conflict with id {0}")]
    UnknownOperation(Uuid),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Errors the caller may reasonably retry later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LayerUnavailable { .. }
                | Self::AllLayersUnavailable { .. }
                | Self::Cancelled
                | Self::Storage(StorageError::Backend(_))
        )
    }
}
