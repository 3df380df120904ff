// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests (fuzzing) for queue ordering, batching and decoding.
//!
//! Uses proptest to generate random inputs and verify the invariants hold and
//! nothing panics on malformed data.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use failover_sync::batching::{BatcherConfig, ChangeBatcher};
use failover_sync::conflict::ConflictPolicy;
use failover_sync::queue::{OfflineQueue, QueueConfig, RemoteAck, RemoteTarget};
use failover_sync::schema::{LocalValidator, ValidationMode};
use failover_sync::{
    ChangeEvent, ConflictResolver, Constraints, FieldSpec, FieldType, FlushReason, InMemoryStore, LayerError, Record,
    RetryConfig, SyncOperation, ValidationSchema,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Generate arbitrary JSON values (including structures no schema expects)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        any::<f64>()
            .prop_filter("finite", |f| f.is_finite())
            .prop_map(|f| json!(f)),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,  // depth
        64, // max nodes
        10, // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
                prop::collection::hash_map("[a-z]{1,8}", inner, 0..10)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

/// Payloads shaped like the profile schema, valid or not
fn profile_payload_strategy() -> impl Strategy<Value = Value> {
    (
        prop::option::of(prop_oneof![".{0,40}".prop_map(Value::String), arbitrary_json_strategy()]),
        prop::option::of(prop_oneof![(-50i64..200).prop_map(|n| json!(n)), arbitrary_json_strategy()]),
        prop::option::of(arbitrary_json_strategy()),
    )
        .prop_map(|(email, age, extra)| {
            let mut object = serde_json::Map::new();
            if let Some(email) = email {
                object.insert("email".into(), email);
            }
            if let Some(age) = age {
                object.insert("age".into(), age);
            }
            if let Some(extra) = extra {
                object.insert("extra".into(), extra);
            }
            Value::Object(object)
        })
}

fn profile_validator() -> LocalValidator {
    let schema = ValidationSchema::new("profiles", 1)
        .field(
            "email",
            FieldSpec::new(FieldType::String).required().with_constraints(Constraints {
                pattern: Some(r"[^@\s]+@[^@\s]+".into()),
                max_length: Some(32),
                ..Default::default()
            }),
        )
        .field(
            "age",
            FieldSpec::new(FieldType::Number).with_constraints(Constraints {
                min: Some(0.0),
                max: Some(150.0),
                ..Default::default()
            }),
        );
    LocalValidator::compile(schema).expect("valid patterns")
}

/// A recording server used to observe replay order.
#[derive(Default)]
struct RecordingRemote {
    records: Mutex<HashMap<(String, String), Record>>,
    writes: Mutex<Vec<SyncOperation>>,
}

#[async_trait]
impl RemoteTarget for RecordingRemote {
    async fn read_remote(&self, resource: &str, key: &str) -> Result<Option<Record>, LayerError> {
        Ok(self.records.lock().get(&(resource.to_string(), key.to_string())).cloned())
    }

    async fn write_remote(&self, op: &SyncOperation) -> Result<RemoteAck, LayerError> {
        // Yield so chains on different keys interleave
        tokio::task::yield_now().await;
        let mut records = self.records.lock();
        let slot = (op.resource.clone(), op.key.clone());
        let version = records.get(&slot).map_or(1, |r| r.version + 1);
        match op.apply_to(records.get(&slot).map(|r| &r.value)) {
            Some(value) => {
                records.insert(slot, Record::new(value, version));
            }
            None => {
                records.remove(&slot);
            }
        }
        drop(records);
        self.writes.lock().push(op.clone());
        Ok(RemoteAck { layer: "recording".into(), version })
    }
}

// =============================================================================
// Validation
// =============================================================================

proptest! {
    /// Same payload, same schema, same verdict
    #[test]
    fn validation_is_deterministic(payload in profile_payload_strategy()) {
        let validator = profile_validator();
        let first = validator.validate(&payload, ValidationMode::Full);
        let second = validator.validate(&payload, ValidationMode::Full);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.valid, first.errors.is_empty());
    }

    /// A patch never reports more problems than the full document check
    #[test]
    fn patch_validation_is_no_stricter(payload in profile_payload_strategy()) {
        let validator = profile_validator();
        let full = validator.validate(&payload, ValidationMode::Full);
        let patch = validator.validate(&payload, ValidationMode::Patch);
        prop_assert!(patch.errors.len() <= full.errors.len());
    }

    /// Arbitrary JSON never panics the validator
    #[test]
    fn validation_handles_arbitrary_json(payload in arbitrary_json_strategy()) {
        let validator = profile_validator();
        let report = validator.validate(&payload, ValidationMode::Full);
        if !payload.is_object() {
            prop_assert!(!report.valid);
        }
    }
}

// =============================================================================
// Change batching
// =============================================================================

proptest! {
    /// Many updates to one key collapse to a single event carrying the latest value
    #[test]
    fn batch_collapses_to_latest(count in 1usize..=600) {
        let mut batcher = ChangeBatcher::new(BatcherConfig::default());
        for v in 0..count {
            let flush = batcher.push(ChangeEvent::upsert("posts", "1", json!({"v": v}), v as u64, "rest"));
            prop_assert_eq!(flush, None);
        }
        let batches = batcher.take(FlushReason::Manual);
        prop_assert_eq!(batches.len(), 1);
        prop_assert_eq!(batches[0].events.len(), 1);
        let latest = Some(json!({"v": count - 1}));
        prop_assert_eq!(&batches[0].events[0].value, &latest);
        prop_assert!(batcher.is_empty());
    }

    /// Every distinct key survives, keeping its latest value and first-seen position
    #[test]
    fn batch_keeps_latest_per_key(keys in prop::collection::vec(0u8..20, 1..200)) {
        let mut batcher = ChangeBatcher::new(BatcherConfig::default());
        let mut latest: HashMap<u8, usize> = HashMap::new();
        let mut first_seen: Vec<u8> = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            batcher.push(ChangeEvent::upsert("posts", key.to_string(), json!(i), i as u64, "rest"));
            if latest.insert(*key, i).is_none() {
                first_seen.push(*key);
            }
        }

        let events: Vec<ChangeEvent> = batcher.take(FlushReason::Manual).into_iter().flat_map(|b| b.events).collect();
        prop_assert_eq!(events.len(), first_seen.len());
        for (event, key) in events.iter().zip(&first_seen) {
            prop_assert_eq!(&event.key, &key.to_string());
            prop_assert_eq!(&event.value, &Some(json!(latest[key])));
        }
    }
}

#[test]
fn batch_count_threshold_fires_past_max_keys() {
    let mut batcher = ChangeBatcher::new(BatcherConfig::default());
    for i in 0..500 {
        let flush = batcher.push(ChangeEvent::upsert("posts", i.to_string(), json!(i), 1, "rest"));
        assert_eq!(flush, None);
    }
    assert_eq!(
        batcher.push(ChangeEvent::upsert("posts", "500", json!(500), 1, "rest")),
        Some(FlushReason::Count)
    );
}

/// Fast retries so property cases finish quickly
fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: Some(3),
        initial_delay: std::time::Duration::from_millis(1),
        max_delay: std::time::Duration::from_millis(10),
        factor: 2.0,
        jitter: false,
    }
}

// =============================================================================
// Queue ordering
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever the interleaving of keys, each key replays in enqueue order
    #[test]
    fn replay_preserves_per_key_fifo(keys in prop::collection::vec(0u8..5, 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (enqueued, written) = runtime.block_on(async {
            let store = Arc::new(InMemoryStore::new());
            let resolver = Arc::new(ConflictResolver::new(ConflictPolicy::default()));
            let queue = OfflineQueue::new(store, resolver, QueueConfig { concurrency: 4, retry: fast_retry() });
            let remote = RecordingRemote::default();

            let mut enqueued = Vec::new();
            for (i, key) in keys.iter().enumerate() {
                let op = SyncOperation::update("posts", key.to_string(), json!({"step": i}));
                enqueued.push((op.key.clone(), op.id));
                queue.enqueue(op).await.unwrap();
            }
            let report = queue.drain(&remote, &CancellationToken::new()).await.unwrap();
            assert_eq!(report.succeeded.len(), keys.len());

            let written: Vec<_> = remote.writes.lock().iter().map(|op| (op.key.clone(), op.id)).collect();
            (enqueued, written)
        });

        prop_assert_eq!(written.len(), enqueued.len());
        for key in 0u8..5 {
            let key = key.to_string();
            let expected: Vec<_> = enqueued.iter().filter(|(k, _)| *k == key).map(|(_, id)| *id).collect();
            let actual: Vec<_> = written.iter().filter(|(k, _)| *k == key).map(|(_, id)| *id).collect();
            prop_assert_eq!(expected, actual);
        }
    }
}

// =============================================================================
// Deserialization Fuzz Tests
// =============================================================================

proptest! {
    /// SyncOperation deserialization should never panic on arbitrary bytes
    #[test]
    fn fuzz_operation_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..4096)) {
        let result: Result<SyncOperation, _> = serde_json::from_slice(&bytes);
        let _ = result;
    }

    /// ChangeEvent deserialization should handle arbitrary JSON gracefully
    #[test]
    fn fuzz_change_event_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let serialized = serde_json::to_vec(&json).unwrap();
        let result: Result<ChangeEvent, _> = serde_json::from_slice(&serialized);
        let _ = result;
    }

    /// Applying an arbitrary update to an arbitrary record never panics
    #[test]
    fn fuzz_apply_update(current in arbitrary_json_strategy(), patch in arbitrary_json_strategy()) {
        let op = SyncOperation::update("posts", "1", patch);
        let next = op.apply_to(Some(&current));
        prop_assert!(next.is_some());
    }
}
