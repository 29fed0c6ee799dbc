// 🧱 Layer Definitions Registry
// Each layer is an independently computable subset of an entity's derived fields.
// One producing layer per field: the registry refuses overlapping ownership.

use crate::error::CacheError;
use crate::source::Entity;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Produced values of one layer for one entity (deterministic order)
pub type FieldValues = BTreeMap<String, serde_json::Value>;

// ============================================================================
// COMPUTE FUNCTION
// ============================================================================

/// Pluggable per-layer computation.
///
/// May call a remote service; must have no side effects on the cache.
/// An `Err` is recorded as a `ComputeError` for that entity only.
pub trait ComputeFn: Send + Sync {
    fn compute(&self, entity: &Entity) -> Result<FieldValues, String>;
}

impl<F> ComputeFn for F
where
    F: Fn(&Entity) -> Result<FieldValues, String> + Send + Sync,
{
    fn compute(&self, entity: &Entity) -> Result<FieldValues, String> {
        self(entity)
    }
}

// ============================================================================
// LAYER DEFINITION
// ============================================================================

#[derive(Clone)]
pub struct LayerDefinition {
    /// Unique layer id (e.g., "vitals")
    pub id: String,

    /// What this layer enriches
    pub description: String,

    /// Source fields that must be present and non-blank
    pub required_source_fields: BTreeSet<String>,

    /// Additional source fields read when present (part of the fingerprint)
    pub optional_source_fields: BTreeSet<String>,

    /// Fields this layer (and only this layer) produces
    pub produced_fields: BTreeSet<String>,

    compute: Arc<dyn ComputeFn>,
}

impl LayerDefinition {
    pub fn new(id: impl Into<String>, compute: impl ComputeFn + 'static) -> Self {
        LayerDefinition {
            id: id.into(),
            description: String::new(),
            required_source_fields: BTreeSet::new(),
            optional_source_fields: BTreeSet::new(),
            produced_fields: BTreeSet::new(),
            compute: Arc::new(compute),
        }
    }

    /// Builder: add description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Builder: add a required source field
    pub fn requires(mut self, field: impl Into<String>) -> Self {
        self.required_source_fields.insert(field.into());
        self
    }

    /// Builder: add an optional source field
    pub fn reads(mut self, field: impl Into<String>) -> Self {
        self.optional_source_fields.insert(field.into());
        self
    }

    /// Builder: add a produced field
    pub fn produces(mut self, field: impl Into<String>) -> Self {
        self.produced_fields.insert(field.into());
        self
    }

    pub fn compute(&self, entity: &Entity) -> Result<FieldValues, String> {
        self.compute.compute(entity)
    }

    /// All source fields the layer looks at (required + optional)
    pub fn source_fields(&self) -> impl Iterator<Item = &String> {
        self.required_source_fields
            .iter()
            .chain(self.optional_source_fields.iter())
    }

    /// First required source field that is missing or blank
    pub fn first_missing_field(&self, entity: &Entity) -> Option<&str> {
        self.required_source_fields
            .iter()
            .find(|field| !entity.has_value(field))
            .map(|field| field.as_str())
    }
}

impl fmt::Debug for LayerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerDefinition")
            .field("id", &self.id)
            .field("required_source_fields", &self.required_source_fields)
            .field("optional_source_fields", &self.optional_source_fields)
            .field("produced_fields", &self.produced_fields)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// LAYER REGISTRY
// ============================================================================

/// Catalog of cache layers, in registration order.
///
/// Built once at startup and then shared read-only. Registration order is
/// the merge order, so merged output is reproducible.
#[derive(Debug, Clone, Default)]
pub struct LayerRegistry {
    layers: Vec<LayerDefinition>,
    index: HashMap<String, usize>,
    field_owners: HashMap<String, String>,
    discovery_fields: Option<BTreeSet<String>>,
    version: String,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: tag this layer configuration with a version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Builder: fields a merged record needs for discovery.
    /// Defaults to every produced field of every layer.
    pub fn with_discovery_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.discovery_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Register a layer. Fails without side effects on duplicate id or
    /// field ownership conflict.
    pub fn register(&mut self, definition: LayerDefinition) -> Result<(), CacheError> {
        if self.index.contains_key(&definition.id) {
            return Err(CacheError::DuplicateLayer(definition.id.clone()));
        }

        for field in &definition.produced_fields {
            if let Some(owner) = self.field_owners.get(field) {
                return Err(CacheError::FieldOwnershipConflict {
                    field: field.clone(),
                    owner: owner.clone(),
                    claimant: definition.id.clone(),
                });
            }
        }

        for field in &definition.produced_fields {
            self.field_owners
                .insert(field.clone(), definition.id.clone());
        }
        self.index.insert(definition.id.clone(), self.layers.len());
        self.layers.push(definition);

        Ok(())
    }

    /// Register several layers; on the first error nothing from this call
    /// stays registered
    pub fn register_all<I>(&mut self, definitions: I) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = LayerDefinition>,
    {
        let mut staged = self.clone();
        for definition in definitions {
            staged.register(definition)?;
        }
        *self = staged;
        Ok(())
    }

    pub fn resolve(&self, layer_id: &str) -> Result<&LayerDefinition, CacheError> {
        self.index
            .get(layer_id)
            .map(|&i| &self.layers[i])
            .ok_or_else(|| CacheError::UnknownLayer(layer_id.to_string()))
    }

    pub fn contains(&self, layer_id: &str) -> bool {
        self.index.contains_key(layer_id)
    }

    /// All layers in registration order
    pub fn all_layers(&self) -> impl Iterator<Item = &LayerDefinition> {
        self.layers.iter()
    }

    pub fn layer_ids(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.id.clone()).collect()
    }

    /// Layer that owns a produced field
    pub fn owner_of(&self, field: &str) -> Option<&str> {
        self.field_owners.get(field).map(|s| s.as_str())
    }

    /// The discovery requirement set used for completeness
    pub fn discovery_fields(&self) -> BTreeSet<String> {
        match &self.discovery_fields {
            Some(fields) => fields.clone(),
            None => self.field_owners.keys().cloned().collect(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn count(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
