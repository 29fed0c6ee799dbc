// 🔀 Merge Engine - combine every cache layer into one discovery record
//
// Merge never fails because a layer is missing: absent, failed or stale
// layers only lower completeness.

use crate::layers::{FieldValues, LayerDefinition, LayerRegistry};
use crate::source::{Entity, EntitySource};
use crate::store::LayerStore;
use anyhow::Result;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Average present-field count below which a catalog is flagged
pub const DEFAULT_MIN_USEFUL_FIELDS: usize = 10;

// ============================================================================
// MERGED RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub entity_key: String,
    pub fields: BTreeMap<String, Value>,

    /// Which layer each field came from
    pub sources: BTreeMap<String, String>,

    /// Layers that contributed, in registration order
    pub layers_merged: Vec<String>,

    /// Discovery fields not present
    pub missing_fields: Vec<String>,

    /// Present discovery fields / all discovery fields, in [0, 1]
    pub completeness: f64,
}

impl MergedRecord {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn present_count(&self) -> usize {
        self.fields.len()
    }
}

/// Result of merging every cached entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogMerge {
    pub records: Vec<MergedRecord>,
    pub total_cases: usize,

    /// Number of records each layer contributed to
    pub layers_merged: BTreeMap<String, usize>,

    /// Number of records carrying each field
    pub field_coverage: BTreeMap<String, usize>,

    pub average_completeness: f64,
    pub average_fields: f64,

    /// Records were computed from the source sheet, not read from the cache
    #[serde(default)]
    pub from_source: bool,
}

impl CatalogMerge {
    fn from_records(records: Vec<MergedRecord>, from_source: bool) -> Self {
        let mut layers_merged: BTreeMap<String, usize> = BTreeMap::new();
        let mut field_coverage: BTreeMap<String, usize> = BTreeMap::new();
        for record in &records {
            for layer in &record.layers_merged {
                *layers_merged.entry(layer.clone()).or_default() += 1;
            }
            for field in record.fields.keys() {
                *field_coverage.entry(field.clone()).or_default() += 1;
            }
        }

        let total_cases = records.len();
        let (average_completeness, average_fields) = if total_cases == 0 {
            (0.0, 0.0)
        } else {
            (
                records.iter().map(|r| r.completeness).sum::<f64>() / total_cases as f64,
                records.iter().map(|r| r.present_count()).sum::<usize>() as f64
                    / total_cases as f64,
            )
        };

        CatalogMerge {
            records,
            total_cases,
            layers_merged,
            field_coverage,
            average_completeness,
            average_fields,
            from_source,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} cases merged{}, {:.1} fields per case, {:.1}% complete",
            self.total_cases,
            if self.from_source { " from source" } else { "" },
            self.average_fields,
            self.average_completeness * 100.0
        )
    }
}

// ============================================================================
// MERGE ENGINE
// ============================================================================

pub struct MergeEngine<'a, S> {
    registry: &'a LayerRegistry,
    store: &'a S,
    max_age: Option<Duration>,
    min_useful_fields: usize,
}

impl<'a, S: LayerStore> MergeEngine<'a, S> {
    pub fn new(registry: &'a LayerRegistry, store: &'a S) -> Self {
        MergeEngine {
            registry,
            store,
            max_age: None,
            min_useful_fields: DEFAULT_MIN_USEFUL_FIELDS,
        }
    }

    /// Builder: `ok` entries older than this are left out
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_min_useful_fields(mut self, min: usize) -> Self {
        self.min_useful_fields = min;
        self
    }

    /// Merge all usable layers of one entity, in registration order
    pub fn merge(&self, entity_key: &str) -> Result<MergedRecord> {
        let now = Utc::now();
        let mut contributions = Vec::new();

        for layer in self.registry.all_layers() {
            let Some(entry) = self.store.get(entity_key, &layer.id)? else {
                continue;
            };

            if !entry.is_usable(self.max_age, now) {
                debug!(
                    entity = entity_key,
                    layer = %layer.id,
                    status = %entry.status,
                    "layer not merged"
                );
                continue;
            }
            contributions.push((layer, entry.produced_values));
        }

        Ok(self.assemble(entity_key, contributions))
    }

    pub fn merge_many(&self, keys: &[String]) -> Result<Vec<MergedRecord>> {
        keys.iter().map(|key| self.merge(key)).collect()
    }

    /// Compute every layer for one entity in memory, without touching the store.
    /// Layers with missing inputs or compute errors are left out.
    pub fn preview(&self, entity: &Entity) -> MergedRecord {
        let mut contributions = Vec::new();

        for layer in self.registry.all_layers() {
            if let Some(field) = layer.first_missing_field(entity) {
                debug!(entity = %entity.key, layer = %layer.id, field, "preview skipped layer");
                continue;
            }
            match layer.compute(entity) {
                Ok(values) => contributions.push((layer, values)),
                Err(e) => debug!(entity = %entity.key, layer = %layer.id, error = %e, "preview compute failed"),
            }
        }

        self.assemble(&entity.key, contributions)
    }

    fn assemble(
        &self,
        entity_key: &str,
        contributions: Vec<(&LayerDefinition, FieldValues)>,
    ) -> MergedRecord {
        let mut fields = BTreeMap::new();
        let mut sources = BTreeMap::new();
        let mut layers_merged = Vec::new();

        for (layer, values) in contributions {
            for (field, value) in values {
                if value.is_null() || !layer.produced_fields.contains(&field) {
                    continue;
                }
                sources.insert(field.clone(), layer.id.clone());
                fields.insert(field, value);
            }
            layers_merged.push(layer.id.clone());
        }

        let discovery = self.registry.discovery_fields();
        let missing_fields: Vec<String> = discovery
            .iter()
            .filter(|f| !fields.contains_key(*f))
            .cloned()
            .collect();
        let completeness = if discovery.is_empty() {
            0.0
        } else {
            (discovery.len() - missing_fields.len()) as f64 / discovery.len() as f64
        };

        MergedRecord {
            entity_key: entity_key.to_string(),
            fields,
            sources,
            layers_merged,
            missing_fields,
            completeness,
        }
    }

    /// Merge every entity that has an entry in any layer
    pub fn catalog(&self) -> Result<CatalogMerge> {
        let mut keys = BTreeSet::new();
        for layer in self.registry.all_layers() {
            for entry in self.store.entries_for_layer(&layer.id) {
                keys.insert(entry?.entity_key);
            }
        }

        let records = keys
            .iter()
            .map(|key| self.merge(key))
            .collect::<Result<Vec<_>>>()?;
        let merge = CatalogMerge::from_records(records, false);

        self.check_quality(&merge);
        info!("catalog merge complete: {}", merge.summary());
        Ok(merge)
    }

    /// Like `catalog`, but an empty cache falls back to previewing every
    /// source row so callers still get a catalog before the first run.
    pub fn catalog_or_source<E: EntitySource>(&self, source: &E) -> Result<CatalogMerge> {
        let merge = self.catalog()?;
        if merge.total_cases > 0 {
            return Ok(merge);
        }

        warn!("cache is empty, building catalog from the source sheet");
        let mut records = Vec::new();
        for key in source.keys()? {
            if let Some(entity) = source.fetch(&key)? {
                records.push(self.preview(&entity));
            }
        }
        let merge = CatalogMerge::from_records(records, true);

        self.check_quality(&merge);
        info!("catalog preview complete: {}", merge.summary());
        Ok(merge)
    }

    fn check_quality(&self, merge: &CatalogMerge) {
        if merge.total_cases > 0 && merge.average_fields < self.min_useful_fields as f64 {
            warn!(
                average_fields = merge.average_fields,
                minimum = self.min_useful_fields,
                "merged cases carry few fields, discovery quality will be low"
            );
        }
    }
}
