// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write operations and server records.
//!
//! A [`SyncOperation`] is the unit of client intent that flows through the
//! router and, while offline, the durable queue. Its lifecycle is an explicit
//! state machine:
//!
//! ```text
//! Pending → InFlight → Committed
//!              │
//!              ├──→ Failed → Pending        (transient, retries left)
//!              └──→ DeadLettered            (permanent, or retries exhausted)
//! ```
//!
//! # Example
//!
//! ```
//! use failover_sync::{SyncOperation, OperationKind, OperationStatus, Record};
//! use serde_json::json;
//!
//! let server = Record::new(json!({"name": "Ada"}), 3);
//! let op = SyncOperation::update("profile", "u1", json!({"name": "Grace"}))
//!     .with_base(&server);
//!
//! assert_eq!(op.kind, OperationKind::Update);
//! assert_eq!(op.status, OperationStatus::Pending);
//! assert_eq!(op.base.as_ref().unwrap().version, 3);
//! assert_eq!(op.queue_key(), "profile/u1");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Current wall-clock time as epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Failed,
    Committed,
    DeadLettered,
}

impl OperationStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Failed => "failed",
            Self::Committed => "committed",
            Self::DeadLettered => "dead_lettered",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "failed" => Some(Self::Failed),
            "committed" => Some(Self::Committed),
            "dead_lettered" => Some(Self::DeadLettered),
            _ => None,
        }
    }

    /// Committed and dead-lettered operations never run again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::DeadLettered)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative state of one record as reported by a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub value: Value,
    /// Server-assigned version, strictly increasing per record
    pub version: u64,
    /// Last update timestamp (epoch millis)
    pub updated_at: i64,
}

impl Record {
    pub fn new(value: Value, version: u64) -> Self {
        Self { value, version, updated_at: now_millis() }
    }

    #[must_use]
    pub fn at(mut self, updated_at: i64) -> Self {
        self.updated_at = updated_at;
        self
    }
}

/// The record state a client edit was based on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordVersion {
    pub version: u64,
    pub updated_at: i64,
    /// Full value the client saw, used as the common ancestor for merges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Value>,
}

impl RecordVersion {
    #[must_use]
    pub fn of(record: &Record) -> Self {
        Self {
            version: record.version,
            updated_at: record.updated_at,
            snapshot: Some(record.value.clone()),
        }
    }
}

/// A client write, routed directly or replayed from the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub resource: String,
    pub key: String,
    /// Opaque document; a full value for creates, a field patch for updates
    pub payload: Value,
    /// Server state the client assumed; `None` for blind writes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<RecordVersion>,
    /// Creation timestamp (epoch millis)
    pub created_at: i64,
    /// Failed replay attempts so far
    pub retries: u32,
    pub status: OperationStatus,
    /// Suspended behind a manual conflict decision
    #[serde(default)]
    pub awaiting_resolution: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncOperation {
    pub fn new(
        kind: OperationKind,
        resource: impl Into<String>,
        key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            resource: resource.into(),
            key: key.into(),
            payload,
            base: None,
            created_at: now_millis(),
            retries: 0,
            status: OperationStatus::Pending,
            awaiting_resolution: false,
            last_error: None,
        }
    }

    pub fn create(resource: impl Into<String>, key: impl Into<String>, payload: Value) -> Self {
        Self::new(OperationKind::Create, resource, key, payload)
    }

    pub fn update(resource: impl Into<String>, key: impl Into<String>, payload: Value) -> Self {
        Self::new(OperationKind::Update, resource, key, payload)
    }

    pub fn delete(resource: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, resource, key, Value::Null)
    }

    /// Record the server state this edit was made against.
    #[must_use]
    pub fn with_base(mut self, record: &Record) -> Self {
        self.base = Some(RecordVersion::of(record));
        self
    }

    #[must_use]
    pub fn created_at(mut self, millis: i64) -> Self {
        self.created_at = millis;
        self
    }

    /// FIFO ordering domain: one logical owner per resource-key.
    #[must_use]
    pub fn queue_key(&self) -> String {
        queue_key(&self.resource, &self.key)
    }

    /// SHA-256 of the serialized payload, hex encoded.
    #[must_use]
    pub fn payload_hash(&self) -> String {
        payload_hash(&self.payload)
    }

    /// Transient failure: remember the error, count the attempt.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.retries = self.retries.saturating_add(1);
        self.status = OperationStatus::Failed;
        self.last_error = Some(error.into());
    }

    /// Failed or interrupted operations go back to pending for the next attempt.
    pub fn reschedule(&mut self) {
        self.status = OperationStatus::Pending;
    }

    /// The value the record holds once this operation is applied to `current`.
    #[must_use]
    pub fn apply_to(&self, current: Option<&Value>) -> Option<Value> {
        match self.kind {
            OperationKind::Delete => None,
            OperationKind::Create => Some(self.payload.clone()),
            OperationKind::Update => Some(match current {
                Some(existing) => apply_patch(existing, &self.payload),
                None => self.payload.clone(),
            }),
        }
    }
}

/// Key used for per-record FIFO and cache lookups.
#[must_use]
pub fn queue_key(resource: &str, key: &str) -> String {
    format!("{}/{}", resource, key)
}

#[must_use]
pub fn payload_hash(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Shallow field patch: object fields in `patch` replace those in `base`.
/// Non-object patches replace the whole value.
#[must_use]
pub fn apply_patch(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(current), Value::Object(changes)) => {
            let mut merged = current.clone();
            for (field, value) in changes {
                merged.insert(field.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_operation_defaults() {
        let op = SyncOperation::create("posts", "42", json!({"title": "hi"}));

        assert_eq!(op.kind, OperationKind::Create);
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retries, 0);
        assert!(op.base.is_none());
        assert!(!op.awaiting_resolution);
        assert!(op.created_at > 0);
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            OperationStatus::Pending,
            OperationStatus::InFlight,
            OperationStatus::Failed,
            OperationStatus::Committed,
            OperationStatus::DeadLettered,
        ] {
            assert_eq!(OperationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OperationStatus::parse("bogus"), None);
        assert_eq!(OperationKind::parse("delete"), Some(OperationKind::Delete));
    }

    #[test]
    fn test_terminal_states() {
        assert!(OperationStatus::Committed.is_terminal());
        assert!(OperationStatus::DeadLettered.is_terminal());
        assert!(!OperationStatus::Failed.is_terminal());
        assert!(!OperationStatus::InFlight.is_terminal());
    }

    #[test]
    fn test_failed_then_rescheduled() {
        let mut op = SyncOperation::update("profile", "u1", json!({"name": "A"}));
        op.mark_failed("503 from primary");
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.retries, 1);

        op.reschedule();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.last_error.as_deref(), Some("503 from primary"));
    }

    #[test]
    fn test_apply_patch_is_shallow() {
        let base = json!({"name": "Ada", "bio": "math", "tags": ["a"]});
        let patched = apply_patch(&base, &json!({"bio": "code", "tags": ["b"]}));
        assert_eq!(patched, json!({"name": "Ada", "bio": "code", "tags": ["b"]}));
    }

    #[test]
    fn test_apply_to_by_kind() {
        let current = json!({"name": "Ada", "age": 36});
        let update = SyncOperation::update("p", "1", json!({"age": 37}));
        assert_eq!(update.apply_to(Some(&current)), Some(json!({"name": "Ada", "age": 37})));

        let delete = SyncOperation::delete("p", "1");
        assert_eq!(delete.apply_to(Some(&current)), None);

        let create = SyncOperation::create("p", "1", json!({"name": "Bob"}));
        assert_eq!(create.apply_to(Some(&current)), Some(json!({"name": "Bob"})));
    }

    #[test]
    fn test_payload_hash_is_stable() {
        let a = SyncOperation::create("p", "1", json!({"x": 1}));
        let b = SyncOperation::create("p", "2", json!({"x": 1}));
        assert_eq!(a.payload_hash(), b.payload_hash());
        assert_eq!(a.payload_hash().len(), 64);
    }

    #[test]
    fn test_serialize_skips_absent_base() {
        let op = SyncOperation::delete("posts", "9");
        let json_str = serde_json::to_string(&op).unwrap();
        assert!(!json_str.contains("base"));

        let back: SyncOperation = serde_json::from_str(&json_str).unwrap();
        assert_eq!(back, op);
    }
}
