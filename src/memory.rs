// 🧠 Memory Store - in-process layer store on a sharded concurrent map
// Writers to different entities land on independent shards.
// Used by tests and short-lived runs.

use crate::error::CacheError;
use crate::layers::LayerRegistry;
use crate::store::{CacheEntry, LayerStore};
use anyhow::Result;
use dashmap::DashMap;
use std::collections::HashSet;

// ============================================================================
// MEMORY STORE
// ============================================================================

pub struct MemoryStore {
    entries: DashMap<(String, String), CacheEntry>,
    known_layers: HashSet<String>,
}

impl MemoryStore {
    /// Store accepting writes for every layer of the registry
    pub fn new(registry: &LayerRegistry) -> Self {
        Self::with_layers(registry.layer_ids())
    }

    pub fn with_layers<I, S>(layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MemoryStore {
            entries: DashMap::new(),
            known_layers: layers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LayerStore for MemoryStore {
    fn get(&self, entity_key: &str, layer_id: &str) -> Result<Option<CacheEntry>> {
        let key = (layer_id.to_string(), entity_key.to_string());
        Ok(self.entries.get(&key).map(|e| e.value().clone()))
    }

    fn put_entry(&self, entry: CacheEntry) -> Result<()> {
        if !self.known_layers.contains(&entry.layer_id) {
            return Err(CacheError::UnknownLayer(entry.layer_id).into());
        }
        let key = (entry.layer_id.clone(), entry.entity_key.clone());
        self.entries.insert(key, entry);
        Ok(())
    }

    fn entry_page(
        &self,
        layer_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let mut page: Vec<CacheEntry> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == layer_id)
            .filter(|e| after.map_or(true, |cursor| e.key().1.as_str() > cursor))
            .map(|e| e.value().clone())
            .collect();

        page.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
        page.truncate(limit);
        Ok(page)
    }

    fn clear_layer(&self, layer_id: &str) -> Result<usize> {
        // counted per removal: other layers may be written during the sweep
        let mut removed = 0;
        self.entries.retain(|key, _| {
            if key.0 == layer_id {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::FieldValues;
    use crate::store::{EntryStatus, LayerEntries};
    use serde_json::json;

    fn values(hr: i64) -> FieldValues {
        let mut v = FieldValues::new();
        v.insert("hr".to_string(), json!(hr));
        v
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = MemoryStore::with_layers(["vitals"]);
        store.put("CASE-001", "vitals", values(92), EntryStatus::Ok).unwrap();

        let entry = store.get("CASE-001", "vitals").unwrap().unwrap();
        assert_eq!(entry.produced_values, values(92));
        assert_eq!(entry.status, EntryStatus::Ok);
        assert!(store.get("CASE-001", "narrative").unwrap().is_none());
    }

    #[test]
    fn test_put_overwrites() {
        let store = MemoryStore::with_layers(["vitals"]);
        store.put("CASE-001", "vitals", values(92), EntryStatus::Ok).unwrap();
        store.put("CASE-001", "vitals", values(120), EntryStatus::Ok).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("CASE-001", "vitals").unwrap().unwrap().produced_values,
            values(120)
        );
    }

    #[test]
    fn test_put_unknown_layer_fails() {
        let store = MemoryStore::with_layers(["vitals"]);
        let err = store
            .put("CASE-001", "ghost", values(1), EntryStatus::Ok)
            .unwrap_err();

        assert_eq!(
            err.downcast_ref::<CacheError>(),
            Some(&CacheError::UnknownLayer("ghost".to_string()))
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_entries_for_layer_pages_and_restarts() {
        let store = MemoryStore::with_layers(["vitals", "narrative"]);
        for i in 0..7 {
            store
                .put(&format!("CASE-{:03}", i), "vitals", values(i), EntryStatus::Ok)
                .unwrap();
        }
        store.put("CASE-000", "narrative", FieldValues::new(), EntryStatus::Ok).unwrap();

        let keys: Vec<String> = LayerEntries::new(&store, "vitals", 3)
            .map(|e| e.unwrap().entity_key)
            .collect();
        assert_eq!(keys.len(), 7);
        assert_eq!(keys[0], "CASE-000");
        assert_eq!(keys[6], "CASE-006");

        // a fresh call starts over
        assert_eq!(store.entries_for_layer("vitals").count(), 7);
        assert_eq!(store.entries_for_layer("narrative").count(), 1);
    }

    #[test]
    fn test_mark_stale_and_stats() {
        let store = MemoryStore::with_layers(["vitals"]);
        store.put("A", "vitals", values(1), EntryStatus::Ok).unwrap();
        store.put("B", "vitals", values(2), EntryStatus::Ok).unwrap();

        assert!(store.mark_stale("A", "vitals").unwrap());
        assert!(!store.mark_stale("Z", "vitals").unwrap());

        let stats = store.layer_stats("vitals").unwrap();
        assert_eq!((stats.total, stats.ok, stats.stale), (2, 1, 1));
        assert_eq!(
            store.get("A", "vitals").unwrap().unwrap().produced_values,
            values(1),
            "stale entries keep their values"
        );
    }

    #[test]
    fn test_clear_layer() {
        let store = MemoryStore::with_layers(["vitals", "narrative"]);
        store.put("A", "vitals", values(1), EntryStatus::Ok).unwrap();
        store.put("A", "narrative", FieldValues::new(), EntryStatus::Ok).unwrap();

        assert_eq!(store.clear_layer("vitals").unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_clear_layer_during_concurrent_writes() {
        let store = MemoryStore::with_layers(["vitals", "narrative"]);
        for i in 0..200 {
            store
                .put(&format!("CASE-{:03}", i), "vitals", values(i), EntryStatus::Ok)
                .unwrap();
        }

        let removed = std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..500 {
                    store
                        .put(&format!("CASE-{:03}", i), "narrative", FieldValues::new(), EntryStatus::Ok)
                        .unwrap();
                }
            });
            store.clear_layer("vitals").unwrap()
        });

        assert_eq!(removed, 200);
        assert_eq!(store.entries_for_layer("vitals").count(), 0);
        assert_eq!(store.entries_for_layer("narrative").count(), 500);
        assert_eq!(store.len(), 500);
    }
}
