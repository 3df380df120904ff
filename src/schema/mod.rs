// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Canonical validation schemas, local validation and drift detection.
//!
//! One canonical [`ValidationSchema`] per resource is compiled into a
//! [`LocalValidator`]. Writes are checked before they are routed or queued;
//! read responses are checked against the same rules and mismatches are
//! reported as drift, never as errors.
//!
//! # Example
//!
//! ```
//! use failover_sync::schema::{
//!     Constraints, FieldSpec, FieldType, SchemaSynchronizer, ValidationSchema,
//! };
//! use serde_json::json;
//!
//! let schemas = SchemaSynchronizer::new();
//! schemas
//!     .sync_schema(
//!         ValidationSchema::new("profile", 1).field(
//!             "name",
//!             FieldSpec::new(FieldType::String)
//!                 .required()
//!                 .with_constraints(Constraints { max_length: Some(5), ..Default::default() }),
//!         ),
//!     )
//!     .unwrap();
//!
//! let report = schemas.validate("profile", &json!({"name": "Grace Hopper"}));
//! assert!(!report.valid);
//! assert_eq!(report.errors[0].field, "name");
//!
//! // Resources without a schema always validate
//! assert!(schemas.validate("posts", &json!({"anything": true})).valid);
//! ```
//!
//! # Design
//!
//! - **Versioned**: a newer version replaces the compiled validator; older or
//!   equal versions are ignored
//! - **Thread-safe**: `parking_lot::RwLock` over `Arc` validators, never held
//!   across an await

pub mod types;
pub mod validator;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::operation::{OperationKind, SyncOperation};

pub use types::{
    ConstraintKind, Constraints, DriftReport, FieldError, FieldSpec, FieldType, ValidationReport,
    ValidationSchema,
};
pub use validator::{LocalValidator, PatternError, ValidationMode};

#[derive(Debug, Default)]
pub struct SchemaSynchronizer {
    validators: RwLock<HashMap<String, Arc<LocalValidator>>>,
}

impl SchemaSynchronizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a canonical schema.
    ///
    /// Returns the validator now in force for the resource, which is the
    /// previous one if `schema` is not newer.
    pub fn sync_schema(&self, schema: ValidationSchema) -> Result<Arc<LocalValidator>, PatternError> {
        if let Some(current) = self.validator(&schema.resource) {
            if schema.version <= current.version() {
                warn!(
                    resource = %schema.resource,
                    offered = schema.version,
                    current = current.version(),
                    "Ignoring schema that is not newer than the installed version"
                );
                return Ok(current);
            }
        }

        let resource = schema.resource.clone();
        let version = schema.version;
        let compiled = Arc::new(LocalValidator::compile(schema)?);

        let mut validators = self.validators.write();
        // Re-check under the write lock; a concurrent sync may have won.
        if let Some(current) = validators.get(&resource) {
            if current.version() >= version {
                return Ok(current.clone());
            }
        }
        validators.insert(resource.clone(), compiled.clone());
        drop(validators);

        info!(resource = %resource, version, "Schema installed");
        Ok(compiled)
    }

    #[must_use]
    pub fn validator(&self, resource: &str) -> Option<Arc<LocalValidator>> {
        self.validators.read().get(resource).cloned()
    }

    /// Installed schema versions, sorted by resource.
    #[must_use]
    pub fn versions(&self) -> Vec<(String, u32)> {
        let mut versions: Vec<(String, u32)> = self
            .validators
            .read()
            .iter()
            .map(|(resource, v)| (resource.clone(), v.version()))
            .collect();
        versions.sort();
        versions
    }

    /// Validate a full document.
    pub fn validate(&self, resource: &str, payload: &Value) -> ValidationReport {
        self.validate_with(resource, payload, ValidationMode::Full)
    }

    pub fn validate_with(&self, resource: &str, payload: &Value, mode: ValidationMode) -> ValidationReport {
        match self.validator(resource) {
            Some(validator) => validator.validate(payload, mode),
            None => ValidationReport::ok(resource),
        }
    }

    /// Validate a write at the boundary. Updates are patches; deletes carry no payload.
    pub fn validate_operation(&self, operation: &SyncOperation) -> ValidationReport {
        match operation.kind {
            OperationKind::Create => self.validate_with(&operation.resource, &operation.payload, ValidationMode::Full),
            OperationKind::Update => self.validate_with(&operation.resource, &operation.payload, ValidationMode::Patch),
            OperationKind::Delete => ValidationReport::ok(&operation.resource),
        }
    }

    /// Compare a layer's response with the canonical schema.
    ///
    /// Returns `None` when there is no schema for the resource or the value
    /// conforms. Drift is logged and counted, never raised.
    pub fn check_drift(&self, resource: &str, layer: &str, value: &Value) -> Option<DriftReport> {
        let validator = self.validator(resource)?;
        let unknown_fields = validator.unknown_fields(value);
        let violations = validator.validate(value, ValidationMode::Full).errors;
        if unknown_fields.is_empty() && violations.is_empty() {
            debug!(resource, layer, "No schema drift");
            return None;
        }

        let report = DriftReport {
            resource: resource.to_string(),
            layer: layer.to_string(),
            schema_version: validator.version(),
            unknown_fields,
            violations,
            refused: None,
        };
        warn!(
            resource,
            layer,
            schema_version = report.schema_version,
            unknown_fields = ?report.unknown_fields,
            violations = report.violations.len(),
            "Schema drift detected"
        );
        crate::metrics::record_schema_drift(resource, layer);
        Some(report)
    }
}
