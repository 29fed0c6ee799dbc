// 🚀 Enrichment Runner - compute and persist one layer for a batch of entities
//
// Each entity is an independent unit of work: a failure is recorded in the
// outcome list and the batch moves on. Cancellation is checked between
// entities, never in the middle of one, so no entry is ever half written.

use crate::error::{CacheError, FailureReason};
use crate::layers::{FieldValues, LayerDefinition, LayerRegistry};
use crate::source::EntitySource;
use crate::store::{source_fingerprint, CacheEntry, EntryStatus, LayerStore};
use chrono::{Duration, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

// ============================================================================
// RUN OPTIONS
// ============================================================================

/// Shared cancellation flag, checked between entities
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Upper bound on entities computed at the same time (1 = sequential)
    pub concurrency: usize,

    /// Recompute even when a fresh entry exists
    pub force: bool,

    pub cancel: CancelToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            concurrency: 1,
            force: false,
            cancel: CancelToken::new(),
        }
    }
}

impl RunOptions {
    /// Builder: bounded worker pool
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit.max(1);
        self
    }

    /// Builder: ignore fresh entries
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Builder: share a cancellation token
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Ok,
    Failed,
    /// Not started because the batch was cancelled
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub entity_key: String,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// A fresh entry already existed and was kept as is
    #[serde(default)]
    pub reused: bool,
}

impl EntityOutcome {
    fn ok(key: &str, reused: bool) -> Self {
        EntityOutcome {
            entity_key: key.to_string(),
            status: OutcomeStatus::Ok,
            reason: None,
            reused,
        }
    }

    fn failed(key: &str, reason: FailureReason) -> Self {
        EntityOutcome {
            entity_key: key.to_string(),
            status: OutcomeStatus::Failed,
            reason: Some(reason),
            reused: false,
        }
    }

    fn cancelled(key: &str) -> Self {
        EntityOutcome {
            entity_key: key.to_string(),
            status: OutcomeStatus::Cancelled,
            reason: None,
            reused: false,
        }
    }
}

/// Counts reported to batch callers; partial success is the common case
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub ok: usize,
    pub reused: usize,
    pub failed_missing_field: usize,
    pub failed_unknown_entity: usize,
    pub failed_compute_error: usize,
    pub failed_store: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[EntityOutcome]) -> Self {
        let mut summary = BatchSummary {
            total: outcomes.len(),
            ..Default::default()
        };

        for outcome in outcomes {
            match (&outcome.status, &outcome.reason) {
                (OutcomeStatus::Ok, _) => {
                    summary.ok += 1;
                    if outcome.reused {
                        summary.reused += 1;
                    }
                }
                (OutcomeStatus::Cancelled, _) => summary.cancelled += 1,
                (OutcomeStatus::Failed, Some(FailureReason::MissingSourceField { .. })) => {
                    summary.failed_missing_field += 1
                }
                (OutcomeStatus::Failed, Some(FailureReason::UnknownEntity)) => {
                    summary.failed_unknown_entity += 1
                }
                (OutcomeStatus::Failed, Some(FailureReason::StoreError(_))) => {
                    summary.failed_store += 1
                }
                (OutcomeStatus::Failed, _) => summary.failed_compute_error += 1,
            }
        }

        summary
    }

    pub fn failed(&self) -> usize {
        self.failed_missing_field
            + self.failed_unknown_entity
            + self.failed_compute_error
            + self.failed_store
    }

    pub fn summary(&self) -> String {
        format!(
            "{} ok ({} reused), {} missing field, {} unknown entity, {} compute error, {} store error, {} cancelled",
            self.ok,
            self.reused,
            self.failed_missing_field,
            self.failed_unknown_entity,
            self.failed_compute_error,
            self.failed_store,
            self.cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub layer_id: String,
    pub outcomes: Vec<EntityOutcome>,
    pub summary: BatchSummary,
    pub elapsed_ms: u64,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn outcome(&self, entity_key: &str) -> Option<&EntityOutcome> {
        self.outcomes.iter().find(|o| o.entity_key == entity_key)
    }

    /// Failed keys worth re-running (compute and store errors)
    pub fn retryable_keys(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.reason.as_ref().map_or(false, |r| r.is_retryable()))
            .map(|o| o.entity_key.as_str())
            .collect()
    }
}

// ============================================================================
// RUNNER
// ============================================================================

pub struct EnrichmentRunner<'a, S, E> {
    registry: &'a LayerRegistry,
    store: &'a S,
    source: &'a E,
    max_age: Option<Duration>,
}

impl<'a, S: LayerStore, E: EntitySource> EnrichmentRunner<'a, S, E> {
    pub fn new(registry: &'a LayerRegistry, store: &'a S, source: &'a E) -> Self {
        EnrichmentRunner {
            registry,
            store,
            source,
            max_age: None,
        }
    }

    /// Builder: `ok` entries older than this are recomputed
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    /// Compute and persist `layer_id` for every key that lacks a fresh entry.
    ///
    /// Only an unknown layer fails the call; everything else is reported per
    /// entity. Outcomes follow input order, duplicate keys are dropped.
    pub fn run(
        &self,
        layer_id: &str,
        keys: &[String],
        options: &RunOptions,
    ) -> Result<BatchReport, CacheError> {
        let layer = self.registry.resolve(layer_id)?;
        let start = Instant::now();

        let mut seen = HashSet::new();
        let batch: Vec<&String> = keys.iter().filter(|k| seen.insert(k.as_str())).collect();

        info!(
            layer = %layer.id,
            entities = batch.len(),
            concurrency = options.concurrency,
            force = options.force,
            "enriching cache layer"
        );

        let outcomes: Vec<EntityOutcome> = if options.concurrency <= 1 || batch.len() <= 1 {
            batch
                .iter()
                .map(|key| self.process(layer, key, options))
                .collect()
        } else {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(options.concurrency)
                .thread_name(|i| format!("enrich-{}", i))
                .build()
            {
                Ok(pool) => pool.install(|| {
                    batch
                        .par_iter()
                        .map(|key| self.process(layer, key, options))
                        .collect()
                }),
                Err(e) => {
                    warn!(error = %e, "worker pool unavailable, running sequentially");
                    batch
                        .iter()
                        .map(|key| self.process(layer, key, options))
                        .collect()
                }
            }
        };

        let summary = BatchSummary::from_outcomes(&outcomes);
        let elapsed_ms = start.elapsed().as_millis() as u64;

        info!(
            layer = %layer.id,
            elapsed_ms,
            "layer enrichment finished: {}",
            summary.summary()
        );

        Ok(BatchReport {
            layer_id: layer.id.clone(),
            cancelled: summary.cancelled > 0,
            outcomes,
            summary,
            elapsed_ms,
        })
    }

    /// Run a layer over every entity the source knows
    pub fn run_all_keys(&self, layer_id: &str, options: &RunOptions) -> anyhow::Result<BatchReport> {
        let keys = self.source.keys()?;
        Ok(self.run(layer_id, &keys, options)?)
    }

    /// Run every layer in registration order; stops when cancelled
    pub fn enrich_all(&self, keys: &[String], options: &RunOptions) -> Vec<BatchReport> {
        let mut reports = Vec::new();

        for layer in self.registry.all_layers() {
            if options.cancel.is_cancelled() {
                info!(layer = %layer.id, "enrichment cancelled, remaining layers skipped");
                break;
            }
            match self.run(&layer.id, keys, options) {
                Ok(report) => reports.push(report),
                // registered layers always resolve
                Err(e) => warn!(error = %e, "layer skipped"),
            }
        }

        let ok_layers = reports.iter().filter(|r| r.summary.failed() == 0).count();
        info!(
            layers = reports.len(),
            clean = ok_layers,
            "multi-layer enrichment complete"
        );
        reports
    }

    /// Re-run the keys whose entries are `failed`
    pub fn retry_failed(&self, layer_id: &str, options: &RunOptions) -> anyhow::Result<BatchReport> {
        self.registry.resolve(layer_id)?;

        let mut keys = Vec::new();
        for entry in self.store.entries_for_layer(layer_id) {
            let entry = entry?;
            if entry.status == EntryStatus::Failed {
                keys.push(entry.entity_key);
            }
        }

        debug!(layer = layer_id, failed = keys.len(), "retrying failed entries");
        Ok(self.run(layer_id, &keys, options)?)
    }

    /// Mark entries stale so the next run recomputes them.
    /// `None` invalidates the whole layer.
    pub fn invalidate(&self, layer_id: &str, keys: Option<&[String]>) -> anyhow::Result<usize> {
        self.registry.resolve(layer_id)?;

        let keys: Vec<String> = match keys {
            Some(keys) => keys.to_vec(),
            None => self
                .store
                .entries_for_layer(layer_id)
                .map(|e| e.map(|entry| entry.entity_key))
                .collect::<anyhow::Result<Vec<_>>>()?,
        };

        let mut marked = 0;
        for key in &keys {
            if self.store.mark_stale(key, layer_id)? {
                marked += 1;
            }
        }

        info!(layer = layer_id, marked, "cache entries invalidated");
        Ok(marked)
    }

    /// Drop every entry of a layer
    pub fn clear(&self, layer_id: &str) -> anyhow::Result<usize> {
        self.registry.resolve(layer_id)?;
        let removed = self.store.clear_layer(layer_id)?;
        info!(layer = layer_id, removed, "cache layer cleared");
        Ok(removed)
    }

    fn process(&self, layer: &LayerDefinition, key: &str, options: &RunOptions) -> EntityOutcome {
        if options.cancel.is_cancelled() {
            return EntityOutcome::cancelled(key);
        }

        let entity = match self.source.fetch(key) {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                warn!(layer = %layer.id, entity = key, "entity not found in source");
                self.retire_outdated(layer, key);
                return EntityOutcome::failed(key, FailureReason::UnknownEntity);
            }
            Err(e) => {
                warn!(layer = %layer.id, entity = key, error = %e, "source read failed");
                return EntityOutcome::failed(
                    key,
                    FailureReason::ComputeError(format!("source read failed: {:#}", e)),
                );
            }
        };

        if let Some(field) = layer.first_missing_field(&entity) {
            warn!(layer = %layer.id, entity = key, field, "missing source field");
            self.retire_outdated(layer, key);
            return EntityOutcome::failed(
                key,
                FailureReason::MissingSourceField {
                    field: field.to_string(),
                },
            );
        }

        let fingerprint = source_fingerprint(layer, &entity);

        let existing = match self.store.get(key, &layer.id) {
            Ok(existing) => existing,
            Err(e) => return self.store_failure(layer, key, e),
        };

        if !options.force {
            if let Some(entry) = &existing {
                let fresh = entry.is_usable(self.max_age, Utc::now())
                    && entry.source_fingerprint.as_deref() == Some(fingerprint.as_str());
                if fresh {
                    debug!(layer = %layer.id, entity = key, "fresh entry reused");
                    return EntityOutcome::ok(key, true);
                }
            }
        }

        let computed = layer
            .compute(&entity)
            .and_then(|values| check_declared(layer, values));

        match computed {
            Ok(values) => {
                let entry = CacheEntry::new(key, layer.id.clone(), values, EntryStatus::Ok)
                    .with_fingerprint(fingerprint);
                match self.store.put_entry(entry) {
                    Ok(()) => EntityOutcome::ok(key, false),
                    Err(e) => self.store_failure(layer, key, e),
                }
            }
            Err(detail) => {
                warn!(layer = %layer.id, entity = key, error = %detail, "compute failed");

                // a transient error never replaces data computed from the same inputs
                let keep_existing = existing.as_ref().map_or(false, |e| {
                    e.is_ok() && e.source_fingerprint.as_deref() == Some(fingerprint.as_str())
                });
                if !keep_existing {
                    let entry =
                        CacheEntry::new(key, layer.id.clone(), FieldValues::new(), EntryStatus::Failed)
                            .with_fingerprint(fingerprint)
                            .with_failure(detail.clone());
                    if let Err(e) = self.store.put_entry(entry) {
                        warn!(layer = %layer.id, entity = key, error = %e, "could not record failure");
                    }
                }

                EntityOutcome::failed(key, FailureReason::ComputeError(detail))
            }
        }
    }

    /// Source row no longer supports the cached values: an `ok` entry
    /// becomes `stale` so merges stop using it. Absent entries stay absent.
    fn retire_outdated(&self, layer: &LayerDefinition, key: &str) {
        let result = match self.store.get(key, &layer.id) {
            Ok(Some(entry)) if entry.is_ok() => self.store.mark_stale(key, &layer.id).map(|_| ()),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(layer = %layer.id, entity = key, error = %e, "could not retire outdated entry");
        }
    }

    fn store_failure(&self, layer: &LayerDefinition, key: &str, err: anyhow::Error) -> EntityOutcome {
        warn!(layer = %layer.id, entity = key, error = %err, "cache store failed");
        EntityOutcome::failed(key, FailureReason::StoreError(format!("{:#}", err)))
    }
}

/// Compute output may only contain fields the layer declares
fn check_declared(layer: &LayerDefinition, values: FieldValues) -> Result<FieldValues, String> {
    let undeclared: Vec<&str> = values
        .keys()
        .filter(|field| !layer.produced_fields.contains(*field))
        .map(|field| field.as_str())
        .collect();

    if undeclared.is_empty() {
        Ok(values)
    } else {
        Err(format!("undeclared field(s): {}", undeclared.join(", ")))
    }
}

// ============================================================================
// TESTS
// ============================================================================
