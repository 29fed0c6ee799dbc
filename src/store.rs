// 🗄️ Layer Store - per-layer cache of derived entity fields
// Keyed by (layer_id, entity_key). One entry per key, latest write wins.

use crate::layers::{FieldValues, LayerDefinition};
use crate::source::Entity;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

/// Entries fetched per page by `entries_for_layer`
pub const DEFAULT_PAGE_SIZE: usize = 256;

// ============================================================================
// CACHE ENTRY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Ok,
    Failed,
    Stale,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Ok => "ok",
            EntryStatus::Failed => "failed",
            EntryStatus::Stale => "stale",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(EntryStatus::Ok),
            "failed" => Some(EntryStatus::Failed),
            "stale" => Some(EntryStatus::Stale),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached output of one layer for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub entity_key: String,
    pub layer_id: String,
    pub produced_values: FieldValues,
    pub computed_at: DateTime<Utc>,
    pub status: EntryStatus,

    /// Hash of the source inputs the values were computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_fingerprint: Option<String>,

    /// Failure detail for `failed` entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl CacheEntry {
    pub fn new(
        entity_key: impl Into<String>,
        layer_id: impl Into<String>,
        produced_values: FieldValues,
        status: EntryStatus,
    ) -> Self {
        CacheEntry {
            entity_key: entity_key.into(),
            layer_id: layer_id.into(),
            produced_values,
            computed_at: Utc::now(),
            status,
            source_fingerprint: None,
            failure: None,
        }
    }

    /// Builder: record the source fingerprint
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.source_fingerprint = Some(fingerprint.into());
        self
    }

    /// Builder: record the failure detail
    pub fn with_failure(mut self, detail: impl Into<String>) -> Self {
        self.failure = Some(detail.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == EntryStatus::Ok
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.computed_at
    }

    /// Status `ok` and younger than `max_age` (no limit when `None`)
    pub fn is_usable(&self, max_age: Option<Duration>, now: DateTime<Utc>) -> bool {
        if !self.is_ok() {
            return false;
        }
        match max_age {
            Some(limit) => self.age(now) < limit,
            None => true,
        }
    }
}

/// SHA-256 over the layer's source inputs, in field-name order
pub fn source_fingerprint(layer: &LayerDefinition, entity: &Entity) -> String {
    let mut fields: Vec<&String> = layer.source_fields().collect();
    fields.sort();
    fields.dedup();

    let mut hasher = Sha256::new();
    hasher.update(layer.id.as_bytes());
    for field in fields {
        hasher.update(b"\x1f");
        hasher.update(field.as_bytes());
        hasher.update(b"=");
        hasher.update(entity.field(field).unwrap_or("").as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Backing store for cache entries.
///
/// Implementations must support point lookup and point overwrite by
/// `(layer_id, entity_key)`. A single write is indivisible.
pub trait LayerStore: Send + Sync {
    /// Point lookup
    fn get(&self, entity_key: &str, layer_id: &str) -> Result<Option<CacheEntry>>;

    /// Replace the entry for `(entry.layer_id, entry.entity_key)`.
    /// Fails with `CacheError::UnknownLayer` for unregistered layers.
    fn put_entry(&self, entry: CacheEntry) -> Result<()>;

    /// Up to `limit` entries of a layer with key greater than `after`,
    /// in ascending key order
    fn entry_page(&self, layer_id: &str, after: Option<&str>, limit: usize)
        -> Result<Vec<CacheEntry>>;

    /// Drop every entry of a layer, returns how many were removed
    fn clear_layer(&self, layer_id: &str) -> Result<usize>;

    /// Write produced values for an entity (stamped now)
    fn put(
        &self,
        entity_key: &str,
        layer_id: &str,
        produced_values: FieldValues,
        status: EntryStatus,
    ) -> Result<()> {
        self.put_entry(CacheEntry::new(entity_key, layer_id, produced_values, status))
    }

    /// Lazy, restartable iteration over a layer's entries
    fn entries_for_layer(&self, layer_id: &str) -> LayerEntries<'_, Self>
    where
        Self: Sized,
    {
        LayerEntries::new(self, layer_id, DEFAULT_PAGE_SIZE)
    }

    /// Mark an existing entry stale, keeping its values.
    /// Returns false when there is no entry.
    fn mark_stale(&self, entity_key: &str, layer_id: &str) -> Result<bool> {
        match self.get(entity_key, layer_id)? {
            Some(mut entry) => {
                entry.status = EntryStatus::Stale;
                self.put_entry(entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Counts per status for one layer
    fn layer_stats(&self, layer_id: &str) -> Result<LayerStats>
    where
        Self: Sized,
    {
        let mut stats = LayerStats::empty(layer_id);
        for entry in self.entries_for_layer(layer_id) {
            stats.record(&entry?);
        }
        Ok(stats)
    }
}

// ============================================================================
// LAZY LAYER ITERATION
// ============================================================================

/// Pages through a layer with keyset pagination.
/// Yields `Err` once and stops if the store fails.
pub struct LayerEntries<'a, S> {
    store: &'a S,
    layer_id: String,
    page_size: usize,
    cursor: Option<String>,
    buffer: VecDeque<CacheEntry>,
    exhausted: bool,
}

impl<'a, S: LayerStore> LayerEntries<'a, S> {
    pub fn new(store: &'a S, layer_id: &str, page_size: usize) -> Self {
        LayerEntries {
            store,
            layer_id: layer_id.to_string(),
            page_size: page_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        let page = self
            .store
            .entry_page(&self.layer_id, self.cursor.as_deref(), self.page_size)?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(last.entity_key.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<'a, S: LayerStore> Iterator for LayerEntries<'a, S> {
    type Item = Result<CacheEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                self.buffer.clear();
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

// ============================================================================
// LAYER STATISTICS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    pub layer_id: String,
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
    pub stale: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl LayerStats {
    pub fn empty(layer_id: &str) -> Self {
        LayerStats {
            layer_id: layer_id.to_string(),
            total: 0,
            ok: 0,
            failed: 0,
            stale: 0,
            oldest: None,
            newest: None,
        }
    }

    pub fn record(&mut self, entry: &CacheEntry) {
        self.total += 1;
        match entry.status {
            EntryStatus::Ok => self.ok += 1,
            EntryStatus::Failed => self.failed += 1,
            EntryStatus::Stale => self.stale += 1,
        }
        self.oldest = Some(match self.oldest {
            Some(t) if t <= entry.computed_at => t,
            _ => entry.computed_at,
        });
        self.newest = Some(match self.newest {
            Some(t) if t >= entry.computed_at => t,
            _ => entry.computed_at,
        });
    }

    /// Fraction of `total_entities` with an `ok` entry
    pub fn coverage(&self, total_entities: usize) -> f64 {
        if total_entities == 0 {
            return 0.0;
        }
        (self.ok as f64 / total_entities as f64).min(1.0)
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} entries ({} ok, {} failed, {} stale)",
            self.layer_id, self.total, self.ok, self.failed, self.stale
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================
