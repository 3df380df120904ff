// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Compiled validator for one schema version.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use super::types::{ConstraintKind, FieldError, FieldSpec, FieldType, ValidationReport, ValidationSchema};

/// Full documents must carry every required field; patches only the ones they touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Full,
    Patch,
}

#[derive(Debug, thiserror::Error)]
#[error("field '{field}' has an invalid pattern: {source}")]
pub struct PatternError {
    pub field: String,
    #[source]
    pub source: regex::Error,
}

#[derive(Debug)]
pub struct LocalValidator {
    schema: ValidationSchema,
    patterns: HashMap<String, Regex>,
}

impl LocalValidator {
    /// Compile every pattern in the schema once.
    pub fn compile(schema: ValidationSchema) -> Result<Self, PatternError> {
        let mut patterns = HashMap::new();
        for (name, spec) in &schema.fields {
            if let Some(pattern) = &spec.constraints.pattern {
                // Anchored: the whole value must match
                let regex = Regex::new(&format!("^(?:{})$", pattern))
                    .map_err(|source| PatternError { field: name.clone(), source })?;
                patterns.insert(name.clone(), regex);
            }
        }
        Ok(Self { schema, patterns })
    }

    #[must_use]
    pub fn schema(&self) -> &ValidationSchema {
        &self.schema
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.schema.version
    }

    pub fn validate(&self, payload: &Value, mode: ValidationMode) -> ValidationReport {
        let resource = self.schema.resource.clone();
        let Value::Object(object) = payload else {
            return ValidationReport::from_errors(
                resource,
                vec![FieldError {
                    field: String::new(),
                    constraint: ConstraintKind::Type,
                    message: "payload must be an object".to_string(),
                }],
            );
        };

        let mut errors = Vec::new();
        for (name, spec) in &self.schema.fields {
            match object.get(name) {
                None if mode == ValidationMode::Patch => {}
                None | Some(Value::Null) => {
                    if spec.required {
                        errors.push(error(name, spec, ConstraintKind::Required, || {
                            format!("{} is required", name)
                        }));
                    }
                }
                Some(value) => self.check_field(name, spec, value, &mut errors),
            }
        }
        ValidationReport::from_errors(resource, errors)
    }

    /// Top-level payload fields the schema does not declare, sorted.
    #[must_use]
    pub fn unknown_fields(&self, payload: &Value) -> Vec<String> {
        match payload {
            Value::Object(object) => {
                let mut unknown: Vec<String> = object
                    .keys()
                    .filter(|k| !self.schema.fields.contains_key(*k))
                    .cloned()
                    .collect();
                unknown.sort();
                unknown
            }
            _ => Vec::new(),
        }
    }

    fn check_field(&self, name: &str, spec: &FieldSpec, value: &Value, errors: &mut Vec<FieldError>) {
        if !type_matches(spec.field_type, value) {
            errors.push(error(name, spec, ConstraintKind::Type, || {
                format!("{} must be of type {}", name, spec.field_type)
            }));
            return;
        }

        let c = &spec.constraints;
        let length = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(items) => Some(items.len()),
            _ => None,
        };
        if let (Some(len), Some(min)) = (length, c.min_length) {
            if len < min {
                errors.push(error(name, spec, ConstraintKind::MinLength, || {
                    format!("{} must be at least {} long", name, min)
                }));
            }
        }
        if let (Some(len), Some(max)) = (length, c.max_length) {
            if len > max {
                errors.push(error(name, spec, ConstraintKind::MaxLength, || {
                    format!("{} must be at most {} long", name, max)
                }));
            }
        }
        if let (Value::String(s), Some(regex)) = (value, self.patterns.get(name)) {
            if !regex.is_match(s) {
                errors.push(error(name, spec, ConstraintKind::Pattern, || {
                    format!("{} does not match the required format", name)
                }));
            }
        }
        if let Some(n) = value.as_f64() {
            if let Some(min) = c.min {
                if n < min {
                    errors.push(error(name, spec, ConstraintKind::Min, || {
                        format!("{} must be at least {}", name, min)
                    }));
                }
            }
            if let Some(max) = c.max {
                if n > max {
                    errors.push(error(name, spec, ConstraintKind::Max, || {
                        format!("{} must be at most {}", name, max)
                    }));
                }
            }
        }
    }
}

fn type_matches(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Object => value.is_object(),
        FieldType::Array => value.is_array(),
        FieldType::Datetime => value
            .as_str()
            .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
    }
}

fn error(
    field: &str,
    spec: &FieldSpec,
    constraint: ConstraintKind,
    default_message: impl FnOnce() -> String,
) -> FieldError {
    let message = spec
        .error_messages
        .get(constraint.as_str())
        .cloned()
        .unwrap_or_else(default_message);
    FieldError { field: field.to_string(), constraint, message }
}
