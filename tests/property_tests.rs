//! Property-based tests for the enrichment cache
//!
//! These tests verify:
//! - Store put → get round-trips (memory and SQLite)
//! - Re-running an unchanged entity leaves its entry untouched
//! - Merge completeness only grows as layers become ok
//! - Field ownership conflicts never partially register

use proptest::prelude::*;
use scenario_cache::catalog::truncate_chars;
use scenario_cache::{
    CacheError, EnrichmentRunner, Entity, EntryStatus, FieldValues, LayerDefinition,
    LayerRegistry, LayerStore, MemorySource, MemoryStore, MergeEngine, RunOptions, SqliteStore,
};
use serde_json::{json, Value};

// =============================================================================
// Strategies
// =============================================================================

fn json_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(|n| json!(n)),
        any::<bool>().prop_map(|b| json!(b)),
        "[ -~]{0,24}".prop_map(|s| json!(s)),
    ]
}

fn field_values() -> impl Strategy<Value = FieldValues> {
    prop::collection::btree_map("[a-z_]{1,12}", json_scalar(), 0..8)
}

fn status_strategy() -> impl Strategy<Value = EntryStatus> {
    prop_oneof![
        Just(EntryStatus::Ok),
        Just(EntryStatus::Failed),
        Just(EntryStatus::Stale),
    ]
}

fn noop(_: &Entity) -> Result<FieldValues, String> {
    Ok(FieldValues::new())
}

/// `count` layers, layer i producing `width` fields of its own
fn wide_registry(count: usize, width: usize) -> LayerRegistry {
    let mut registry = LayerRegistry::new();
    for i in 0..count {
        let mut layer = LayerDefinition::new(format!("layer_{}", i), noop);
        for j in 0..width {
            layer = layer.produces(format!("f{}_{}", i, j));
        }
        registry.register(layer).unwrap();
    }
    registry
}

// =============================================================================
// Store round-trip
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// MemoryStore: get returns exactly what put wrote
    #[test]
    fn memory_store_roundtrip(
        key in "[A-Z]{4}-[0-9]{3}",
        values in field_values(),
        status in status_strategy(),
    ) {
        let store = MemoryStore::with_layers(["vitals"]);
        store.put(&key, "vitals", values.clone(), status).unwrap();

        let entry = store.get(&key, "vitals").unwrap().unwrap();
        prop_assert_eq!(entry.produced_values, values);
        prop_assert_eq!(entry.status, status);
    }

    /// SqliteStore: values survive JSON encoding in the database
    #[test]
    fn sqlite_store_roundtrip(
        key in "[A-Z]{4}-[0-9]{3}",
        values in field_values(),
        status in status_strategy(),
    ) {
        let registry = wide_registry(1, 1);
        let store = SqliteStore::open_in_memory(&registry).unwrap();
        store.put(&key, "layer_0", values.clone(), status).unwrap();

        let entry = store.get(&key, "layer_0").unwrap().unwrap();
        prop_assert_eq!(entry.produced_values, values);
        prop_assert_eq!(entry.status, status);
        prop_assert!(store.get(&key, "layer_1").unwrap().is_none());
    }

    /// Latest write wins for the same (layer, entity)
    #[test]
    fn last_write_wins(first in field_values(), second in field_values()) {
        let store = MemoryStore::with_layers(["vitals"]);
        store.put("CASE-001", "vitals", first, EntryStatus::Ok).unwrap();
        store.put("CASE-001", "vitals", second.clone(), EntryStatus::Ok).unwrap();

        prop_assert_eq!(store.len(), 1);
        prop_assert_eq!(store.get("CASE-001", "vitals").unwrap().unwrap().produced_values, second);
    }
}

// =============================================================================
// Runner idempotence
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Re-running on an unchanged entity with an ok entry changes nothing
    #[test]
    fn rerun_is_idempotent(title in "[A-Za-z ]{1,40}") {
        let mut registry = LayerRegistry::new();
        registry
            .register(
                LayerDefinition::new("narrative", |entity: &Entity| {
                    let mut values = FieldValues::new();
                    values.insert("title".to_string(), json!(entity.field("title")));
                    Ok(values)
                })
                .reads("title")
                .produces("title"),
            )
            .unwrap();
        let store = MemoryStore::new(&registry);
        let source = MemorySource::new().with_entity(Entity::new("CASE-001").with_field("title", title));
        let runner = EnrichmentRunner::new(&registry, &store, &source);
        let batch = vec!["CASE-001".to_string()];

        runner.run("narrative", &batch, &RunOptions::default()).unwrap();
        let before = store.get("CASE-001", "narrative").unwrap();

        let report = runner.run("narrative", &batch, &RunOptions::default()).unwrap();
        prop_assert_eq!(report.summary.reused, 1);
        prop_assert_eq!(store.get("CASE-001", "narrative").unwrap(), before);
    }
}

// =============================================================================
// Merge completeness
// =============================================================================

proptest! {
    /// Completeness stays in [0, 1] and never drops as more layers become ok
    #[test]
    fn completeness_is_monotonic(
        order in Just((0..5).collect::<Vec<usize>>()).prop_shuffle(),
        width in 1usize..4,
    ) {
        let registry = wide_registry(5, width);
        let store = MemoryStore::new(&registry);
        let engine = MergeEngine::new(&registry, &store);

        let mut last = engine.merge("CASE-001").unwrap().completeness;
        prop_assert_eq!(last, 0.0);

        for i in order {
            let values: FieldValues = (0..width)
                .map(|j| (format!("f{}_{}", i, j), json!(j)))
                .collect();
            store.put("CASE-001", &format!("layer_{}", i), values, EntryStatus::Ok).unwrap();

            let record = engine.merge("CASE-001").unwrap();
            prop_assert!(record.completeness >= last);
            prop_assert!(record.completeness <= 1.0);
            last = record.completeness;
        }

        prop_assert_eq!(last, 1.0);
    }

    /// Every merged field comes from the layer that owns it
    #[test]
    fn merged_fields_come_from_owner(width in 1usize..4, layers in 1usize..5) {
        let registry = wide_registry(layers, width);
        let store = MemoryStore::new(&registry);
        for i in 0..layers {
            let values: FieldValues = (0..width)
                .map(|j| (format!("f{}_{}", i, j), json!(i)))
                .collect();
            store.put("CASE-001", &format!("layer_{}", i), values, EntryStatus::Ok).unwrap();
        }

        let record = MergeEngine::new(&registry, &store).merge("CASE-001").unwrap();
        for (field, layer) in &record.sources {
            prop_assert_eq!(registry.owner_of(field), Some(layer.as_str()));
        }
    }
}

// =============================================================================
// Registry ownership
// =============================================================================

proptest! {
    /// A batch that reuses an owned field registers nothing
    #[test]
    fn conflicting_batch_is_atomic(width in 1usize..4, position in 0usize..3) {
        let mut registry = wide_registry(2, width);
        let before = registry.layer_ids();

        let mut batch: Vec<LayerDefinition> = (0..3)
            .map(|n| LayerDefinition::new(format!("new_{}", n), noop).produces(format!("fresh_{}", n)))
            .collect();
        batch[position] = LayerDefinition::new("thief", noop).produces("f1_0");

        let err = registry.register_all(batch).unwrap_err();
        prop_assert_eq!(
            err,
            CacheError::FieldOwnershipConflict {
                field: "f1_0".to_string(),
                owner: "layer_1".to_string(),
                claimant: "thief".to_string(),
            }
        );
        prop_assert_eq!(registry.layer_ids(), before);
        prop_assert_eq!(registry.owner_of("fresh_0"), None);
    }
}

// =============================================================================
// Column truncation
// =============================================================================

proptest! {
    /// Truncation keeps a character prefix no longer than the limit
    #[test]
    fn truncation_is_char_safe(text in "\\PC{0,80}", max in 0usize..50) {
        let cut = truncate_chars(&text, Some(max));
        prop_assert!(cut.chars().count() <= max);
        prop_assert!(text.starts_with(&cut));
        prop_assert_eq!(truncate_chars(&text, None), text.clone());
    }
}
