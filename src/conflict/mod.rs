// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict detection and resolution for replayed writes.
//!
//! A queued write conflicts when the server has moved on from the version the
//! client edited. A blind write, one with no known base, conflicts when the
//! server record was updated after the write was made. Each resource picks a
//! [`ConflictStrategy`]:
//!
//! | Strategy | Outcome |
//! |----------|---------|
//! | `ServerWins` | Drop the local write, keep the server state |
//! | `ClientWins` | Re-apply the local write over the server state |
//! | `Merge` | Three-way field merge, [`TieBreak`] for fields both sides changed |
//! | `Manual` | Suspend the write until a [`ManualDecision`] arrives |
//!
//! # Example
//!
//! ```
//! use failover_sync::conflict::{ConflictPolicy, ConflictResolver, Resolution, ResolvedAction};
//! use failover_sync::{Record, SyncOperation};
//! use serde_json::json;
//!
//! let resolver = ConflictResolver::new(ConflictPolicy::default());
//!
//! let seen = Record::new(json!({"name": "A0"}), 1);
//! let op = SyncOperation::update("profile", "u1", json!({"name": "A"})).with_base(&seen);
//! let server = Record::new(json!({"name": "B"}), 2);
//!
//! match resolver.resolve(&op, Some(&server)) {
//!     Resolution::Resolved { action, record } => {
//!         assert_eq!(action, ResolvedAction::Discard);
//!         assert_eq!(record.resolved_value, Some(json!({"name": "B"})));
//!     }
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

pub mod merge;

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::operation::{now_millis, OperationKind, Record, RecordVersion, SyncOperation};

pub use merge::{three_way_merge, MergeOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    ServerWins,
    ClientWins,
    Merge,
    Manual,
}

impl ConflictStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerWins => "server_wins",
            Self::ClientWins => "client_wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }
}

/// Who takes a field both sides changed during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Later timestamp wins; equal timestamps go to the server
    #[default]
    MostRecent,
    ServerWins,
    ClientWins,
}

#[derive(Debug, Clone, Default)]
pub struct ConflictPolicy {
    pub default: ConflictStrategy,
    pub per_resource: HashMap<String, ConflictStrategy>,
    pub tie_break: TieBreak,
}

impl ConflictPolicy {
    #[must_use]
    pub fn strategy_for(&self, resource: &str) -> ConflictStrategy {
        self.per_resource.get(resource).copied().unwrap_or(self.default)
    }
}

/// Audit trail of one detected conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub operation: SyncOperation,
    /// `None` when the server no longer has the record
    pub server_state: Option<Record>,
    pub client_state: Value,
    pub resolution: ConflictStrategy,
    pub resolved_value: Option<Value>,
    pub detected_at: i64,
    pub resolved_at: Option<i64>,
}

impl ConflictRecord {
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// What to do with the queued write once a conflict is settled.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedAction {
    /// Drop the write; the server state stands
    Discard,
    /// Send this write instead, rebased on the server's current version
    Apply(SyncOperation),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Server is where the client expected; send the write as-is
    Clean,
    /// Server already reflects the write (e.g. deleting a deleted record)
    AlreadyApplied,
    Resolved {
        record: ConflictRecord,
        action: ResolvedAction,
    },
    /// Needs a [`ManualDecision`]
    Pending(ConflictRecord),
}

/// External verdict on a suspended conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualDecision {
    AcceptServer,
    ForceClient,
    UseValue(Value),
}

pub struct ConflictResolver {
    policy: RwLock<ConflictPolicy>,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy: RwLock::new(policy) }
    }

    pub fn set_strategy(&self, resource: impl Into<String>, strategy: ConflictStrategy) {
        self.policy.write().per_resource.insert(resource.into(), strategy);
    }

    #[must_use]
    pub fn strategy_for(&self, resource: &str) -> ConflictStrategy {
        self.policy.read().strategy_for(resource)
    }

    /// Whether `operation` conflicts with the server's current state.
    #[must_use]
    pub fn detect(operation: &SyncOperation, server: Option<&Record>) -> bool {
        match (operation.kind, server) {
            (OperationKind::Create, server) => server.is_some(),
            // An edit of a record that has since vanished
            (OperationKind::Update, None) => operation.base.is_some(),
            (OperationKind::Delete, None) => false,
            (_, Some(current)) => match &operation.base {
                Some(base) => base.version != current.version,
                None => current.updated_at > operation.created_at,
            },
        }
    }

    /// Settle `operation` against the server's current state.
    pub fn resolve(&self, operation: &SyncOperation, server: Option<&Record>) -> Resolution {
        if operation.kind == OperationKind::Delete && server.is_none() {
            return Resolution::AlreadyApplied;
        }
        if !Self::detect(operation, server) {
            return Resolution::Clean;
        }
        if let (OperationKind::Create, Some(current)) = (operation.kind, server) {
            if current.value == operation.payload {
                return Resolution::AlreadyApplied;
            }
        }

        let (strategy, tie_break) = {
            let policy = self.policy.read();
            (policy.strategy_for(&operation.resource), policy.tie_break)
        };
        let strategy = match (operation.kind, server) {
            (OperationKind::Update, None) => ConflictStrategy::Manual,
            _ => strategy,
        };
        crate::metrics::record_conflict(&operation.resource, strategy);

        let now = now_millis();
        let mut record = ConflictRecord {
            id: Uuid::new_v4(),
            operation: operation.clone(),
            server_state: server.cloned(),
            client_state: operation.payload.clone(),
            resolution: strategy,
            resolved_value: None,
            detected_at: now,
            resolved_at: None,
        };

        let action = match (strategy, server) {
            (ConflictStrategy::Manual, _) | (_, None) => {
                info!(
                    operation = %operation.id,
                    resource = %operation.resource,
                    key = %operation.key,
                    "Conflict awaiting manual resolution"
                );
                return Resolution::Pending(record);
            }
            (ConflictStrategy::ServerWins, Some(_)) => ResolvedAction::Discard,
            (ConflictStrategy::ClientWins, Some(current)) => ResolvedAction::Apply(rebase(operation, current)),
            (ConflictStrategy::Merge, Some(current)) => {
                let client_wins_ties = match tie_break {
                    TieBreak::ClientWins => true,
                    TieBreak::ServerWins => false,
                    TieBreak::MostRecent => operation.created_at > current.updated_at,
                };
                merge_action(operation, current, client_wins_ties)
            }
        };

        record.resolved_value = match (&action, server) {
            (ResolvedAction::Discard, current) => current.map(|r| r.value.clone()),
            (ResolvedAction::Apply(op), current) => op.apply_to(current.map(|r| &r.value)),
        };
        record.resolved_at = Some(now);
        debug!(
            operation = %operation.id,
            strategy = strategy.as_str(),
            "Conflict resolved automatically"
        );
        Resolution::Resolved { record, action }
    }

    /// Apply a manual verdict to a suspended conflict.
    pub fn decide(&self, mut record: ConflictRecord, decision: ManualDecision) -> (ConflictRecord, ResolvedAction) {
        let server = record.server_state.clone();
        let action = match decision {
            ManualDecision::AcceptServer => ResolvedAction::Discard,
            ManualDecision::ForceClient => match &server {
                Some(current) => ResolvedAction::Apply(rebase(&record.operation, current)),
                None => ResolvedAction::Apply(recreate(&record.operation)),
            },
            ManualDecision::UseValue(value) => {
                let mut op = record.operation.clone();
                op.payload = value;
                match &server {
                    Some(current) => {
                        op.kind = OperationKind::Update;
                        ResolvedAction::Apply(rebase(&op, current))
                    }
                    None => {
                        op.kind = OperationKind::Create;
                        op.base = None;
                        ResolvedAction::Apply(op)
                    }
                }
            }
        };

        record.resolved_value = match &action {
            ResolvedAction::Discard => server.as_ref().map(|r| r.value.clone()),
            ResolvedAction::Apply(op) => op.apply_to(server.as_ref().map(|r| &r.value)),
        };
        record.resolved_at = Some(now_millis());
        (record, action)
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver").field("policy", &*self.policy.read()).finish()
    }
}

/// The same write, now claiming the server's current version as its base.
fn rebase(operation: &SyncOperation, current: &Record) -> SyncOperation {
    let mut op = operation.clone();
    op.base = Some(RecordVersion::of(current));
    if op.kind == OperationKind::Create {
        // The record exists now; a create would be rejected
        op.kind = OperationKind::Update;
    }
    op
}

/// Force an update whose record was deleted server-side by creating it again.
fn recreate(operation: &SyncOperation) -> SyncOperation {
    let mut op = operation.clone();
    let snapshot = op.base.as_ref().and_then(|b| b.snapshot.clone());
    if op.kind == OperationKind::Update {
        op.payload = op.apply_to(snapshot.as_ref()).unwrap_or(Value::Null);
        op.kind = OperationKind::Create;
    }
    op.base = None;
    op
}

fn merge_action(operation: &SyncOperation, current: &Record, client_wins_ties: bool) -> ResolvedAction {
    if operation.kind == OperationKind::Delete {
        // A delete cannot be merged field by field
        return if client_wins_ties {
            ResolvedAction::Apply(rebase(operation, current))
        } else {
            ResolvedAction::Discard
        };
    }
    let base = operation.base.as_ref().and_then(|b| b.snapshot.as_ref());
    let outcome = three_way_merge(base, &current.value, &operation.payload, client_wins_ties);
    if !outcome.contested.is_empty() {
        debug!(operation = %operation.id, contested = ?outcome.contested, "Merge used tie-break");
    }
    if outcome.value == current.value {
        return ResolvedAction::Discard;
    }
    let mut op = rebase(operation, current);
    op.payload = outcome.value;
    ResolvedAction::Apply(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver(strategy: ConflictStrategy, tie_break: TieBreak) -> ConflictResolver {
        ConflictResolver::new(ConflictPolicy { default: strategy, per_resource: HashMap::new(), tie_break })
    }

    fn stale_update(patch: Value, base: &Record) -> SyncOperation {
        SyncOperation::update("profile", "u1", patch).with_base(base)
    }

    #[test]
    fn test_detect_rules() {
        let v1 = Record::new(json!({"n": 1}), 1);
        let v2 = Record::new(json!({"n": 2}), 2);

        assert!(!ConflictResolver::detect(&stale_update(json!({}), &v1), Some(&v1)));
        assert!(ConflictResolver::detect(&stale_update(json!({}), &v1), Some(&v2)));
        assert!(ConflictResolver::detect(&stale_update(json!({}), &v1), None));

        assert!(ConflictResolver::detect(&SyncOperation::create("p", "1", json!({})), Some(&v1)));
        assert!(!ConflictResolver::detect(&SyncOperation::create("p", "1", json!({})), None));

        // Blind writes are judged by timestamp
        let server = Record::new(json!({"n": 2}), 2).at(2000);
        let blind = |at| SyncOperation::update("p", "1", json!({})).created_at(at);
        assert!(ConflictResolver::detect(&blind(1000), Some(&server)));
        assert!(!ConflictResolver::detect(&blind(2000), Some(&server)));
        assert!(!ConflictResolver::detect(&blind(3000), Some(&server)));
        assert!(ConflictResolver::detect(&SyncOperation::delete("p", "1").created_at(1999), Some(&server)));
        assert!(!ConflictResolver::detect(&blind(1000), None));
        assert!(!ConflictResolver::detect(&SyncOperation::delete("p", "1"), None));
    }

    #[test]
    fn test_blind_write_older_than_server_keeps_server() {
        let server = Record::new(json!({"name": "B"}), 2).at(2000);
        let op = SyncOperation::update("profile", "u1", json!({"name": "A"})).created_at(1000);
        let r = resolver(ConflictStrategy::ServerWins, TieBreak::MostRecent);

        let Resolution::Resolved { record, action } = r.resolve(&op, Some(&server)) else {
            panic!("expected resolution");
        };
        assert_eq!(action, ResolvedAction::Discard);
        assert_eq!(record.resolved_value, Some(json!({"name": "B"})));
        assert_eq!(record.client_state, json!({"name": "A"}));
    }

    #[test]
    fn test_server_wins_discards_local_write() {
        let seen = Record::new(json!({"name": "A0"}), 1);
        let server = Record::new(json!({"name": "B"}), 2);
        let r = resolver(ConflictStrategy::ServerWins, TieBreak::MostRecent);

        let Resolution::Resolved { record, action } = r.resolve(&stale_update(json!({"name": "A"}), &seen), Some(&server)) else {
            panic!("expected resolution");
        };
        assert_eq!(action, ResolvedAction::Discard);
        assert_eq!(record.resolved_value, Some(json!({"name": "B"})));
        assert!(record.is_resolved());
    }

    #[test]
    fn test_client_wins_rebases_onto_server_version() {
        let seen = Record::new(json!({"name": "A0", "age": 1}), 1);
        let server = Record::new(json!({"name": "B", "age": 2}), 7);
        let r = resolver(ConflictStrategy::ClientWins, TieBreak::MostRecent);

        let Resolution::Resolved { record, action } = r.resolve(&stale_update(json!({"name": "A"}), &seen), Some(&server)) else {
            panic!("expected resolution");
        };
        let ResolvedAction::Apply(op) = action else { panic!("expected apply") };
        assert_eq!(op.base.as_ref().unwrap().version, 7);
        assert!(!ConflictResolver::detect(&op, Some(&server)));
        assert_eq!(record.resolved_value, Some(json!({"name": "A", "age": 2})));
    }

    #[test]
    fn test_merge_most_recent_tie_goes_to_server() {
        let seen = Record::new(json!({"name": "A0", "bio": "x"}), 1).at(100);
        let server = Record::new(json!({"name": "B", "bio": "x"}), 2).at(500);
        let r = resolver(ConflictStrategy::Merge, TieBreak::MostRecent);

        // Same timestamp: server keeps the contested field, client keeps its own
        let op = stale_update(json!({"name": "A", "bio": "y"}), &seen).created_at(500);
        let Resolution::Resolved { record, .. } = r.resolve(&op, Some(&server)) else { panic!() };
        assert_eq!(record.resolved_value, Some(json!({"name": "B", "bio": "y"})));

        // Newer client edit wins the contested field
        let op = stale_update(json!({"name": "A", "bio": "y"}), &seen).created_at(501);
        let Resolution::Resolved { record, .. } = r.resolve(&op, Some(&server)) else { panic!() };
        assert_eq!(record.resolved_value, Some(json!({"name": "A", "bio": "y"})));
    }

    #[test]
    fn test_merge_that_changes_nothing_discards() {
        let seen = Record::new(json!({"name": "A0"}), 1);
        let server = Record::new(json!({"name": "B"}), 2).at(500);
        let r = resolver(ConflictStrategy::Merge, TieBreak::ServerWins);
        let op = stale_update(json!({"name": "A"}), &seen);
        let Resolution::Resolved { action, .. } = r.resolve(&op, Some(&server)) else { panic!() };
        assert_eq!(action, ResolvedAction::Discard);
    }

    #[test]
    fn test_manual_suspends() {
        let seen = Record::new(json!({"name": "A0"}), 1);
        let server = Record::new(json!({"name": "B"}), 2);
        let r = resolver(ConflictStrategy::ServerWins, TieBreak::MostRecent);
        r.set_strategy("profile", ConflictStrategy::Manual);

        let Resolution::Pending(record) = r.resolve(&stale_update(json!({"name": "A"}), &seen), Some(&server)) else {
            panic!("expected pending");
        };
        assert_eq!(record.resolution, ConflictStrategy::Manual);
        assert!(!record.is_resolved());

        let (record, action) = r.decide(record, ManualDecision::UseValue(json!({"name": "AB"})));
        let ResolvedAction::Apply(op) = action else { panic!() };
        assert_eq!(op.kind, OperationKind::Update);
        assert_eq!(record.resolved_value, Some(json!({"name": "AB"})));
    }

    #[test]
    fn test_update_of_deleted_record_is_always_manual() {
        let seen = Record::new(json!({"name": "A0"}), 1);
        let r = resolver(ConflictStrategy::ClientWins, TieBreak::MostRecent);
        let Resolution::Pending(record) = r.resolve(&stale_update(json!({"bio": "z"}), &seen), None) else {
            panic!("expected pending");
        };
        assert!(record.server_state.is_none());

        let (_, action) = r.decide(record, ManualDecision::ForceClient);
        let ResolvedAction::Apply(op) = action else { panic!() };
        assert_eq!(op.kind, OperationKind::Create);
        assert_eq!(op.payload, json!({"name": "A0", "bio": "z"}));
    }

    #[test]
    fn test_delete_of_deleted_record_is_no_op() {
        let r = resolver(ConflictStrategy::Manual, TieBreak::MostRecent);
        assert_eq!(r.resolve(&SyncOperation::delete("p", "1"), None), Resolution::AlreadyApplied);
    }

    #[test]
    fn test_create_matching_server_is_no_op() {
        let server = Record::new(json!({"n": 1}), 3);
        let r = resolver(ConflictStrategy::Manual, TieBreak::MostRecent);
        let op = SyncOperation::create("p", "1", json!({"n": 1}));
        assert_eq!(r.resolve(&op, Some(&server)), Resolution::AlreadyApplied);
    }

    #[test]
    fn test_policy_strategy_lookup() {
        let r = resolver(ConflictStrategy::ServerWins, TieBreak::MostRecent);
        r.set_strategy("notes", ConflictStrategy::Merge);
        assert_eq!(r.strategy_for("notes"), ConflictStrategy::Merge);
        assert_eq!(r.strategy_for("other"), ConflictStrategy::ServerWins);
    }
}
