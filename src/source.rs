// 📥 Entity Source - read-only access to scenario rows
// The enrichment cache never writes back to the source.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// Key column of the master scenario sheet
pub const DEFAULT_KEY_COLUMN: &str = "Case_Organization_Case_ID";

// ============================================================================
// ENTITY
// ============================================================================

/// One scenario row: stable key + current source field values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub key: String,
    pub fields: BTreeMap<String, String>,
}

impl Entity {
    pub fn new(key: impl Into<String>) -> Self {
        Entity {
            key: key.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder: set a source field
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|v| v.as_str())
    }

    /// True when the field exists and is not blank
    pub fn has_value(&self, name: &str) -> bool {
        self.field(name).map(|v| !v.trim().is_empty()).unwrap_or(false)
    }
}

// ============================================================================
// SOURCE TRAIT
// ============================================================================

/// Where entity rows come from (spreadsheet export, database, API...)
pub trait EntitySource: Send + Sync {
    /// Current fields for one entity, `None` if the key is unknown
    fn fetch(&self, key: &str) -> Result<Option<Entity>>;

    /// Every entity key, in source order
    fn keys(&self) -> Result<Vec<String>>;
}

// ============================================================================
// IN-MEMORY SOURCE
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    entities: HashMap<String, Entity>,
    order: Vec<String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity (replacing keeps its original position)
    pub fn insert(&mut self, entity: Entity) {
        if !self.entities.contains_key(&entity.key) {
            self.order.push(entity.key.clone());
        }
        self.entities.insert(entity.key.clone(), entity);
    }

    /// Builder variant of `insert`
    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.insert(entity);
        self
    }

    /// Update a single source field of an existing entity
    pub fn set_field(&mut self, key: &str, name: &str, value: &str) -> bool {
        match self.entities.get_mut(key) {
            Some(entity) => {
                entity.fields.insert(name.to_string(), value.to_string());
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl EntitySource for MemorySource {
    fn fetch(&self, key: &str) -> Result<Option<Entity>> {
        Ok(self.entities.get(key).cloned())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.order.clone())
    }
}

// ============================================================================
// CSV SOURCE (spreadsheet export)
// ============================================================================

/// How to read a scenario sheet export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvOptions {
    /// Column holding the entity key
    pub key_column: String,

    /// Number of header rows; the last one names the fields (tier-2 headers)
    pub header_rows: usize,

    /// Canonical column name → alternate header names, tried in order
    #[serde(default)]
    pub aliases: HashMap<String, Vec<String>>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        CsvOptions {
            key_column: DEFAULT_KEY_COLUMN.to_string(),
            header_rows: 2,
            aliases: HashMap::new(),
        }
    }
}

/// Entity source loaded from a CSV export of the master scenario sheet
#[derive(Debug, Clone)]
pub struct CsvSource {
    inner: MemorySource,
    headers: Vec<String>,
}

impl CsvSource {
    pub fn from_path(path: &Path, options: &CsvOptions) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open source CSV: {:?}", path))?;
        Self::from_reader(file, options)
    }

    pub fn from_reader<R: Read>(reader: R, options: &CsvOptions) -> Result<Self> {
        if options.header_rows == 0 {
            return Err(anyhow!("header_rows must be at least 1"));
        }

        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut records = Vec::new();
        for result in rdr.records() {
            records.push(result.context("Failed to read CSV record")?);
        }

        if records.len() < options.header_rows {
            return Err(anyhow!(
                "CSV has {} rows, expected at least {} header rows",
                records.len(),
                options.header_rows
            ));
        }

        let mut headers: Vec<String> = records[options.header_rows - 1]
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        resolve_aliases(&mut headers, &options.aliases);

        let key_index = headers
            .iter()
            .position(|h| h == &options.key_column)
            .ok_or_else(|| anyhow!("Key column '{}' not found in headers", options.key_column))?;

        let mut inner = MemorySource::new();
        let mut skipped = 0;

        for record in records.iter().skip(options.header_rows) {
            let key = record.get(key_index).unwrap_or("").trim();
            if key.is_empty() {
                skipped += 1;
                continue;
            }

            if inner.entities.contains_key(key) {
                warn!(key, "duplicate entity key in source CSV, later row wins");
            }

            let mut entity = Entity::new(key);
            for (index, header) in headers.iter().enumerate() {
                if header.is_empty() {
                    continue;
                }
                let value = record.get(index).unwrap_or("");
                entity.fields.insert(header.clone(), value.to_string());
            }
            inner.insert(entity);
        }

        debug!(
            rows = inner.len(),
            skipped,
            columns = headers.len(),
            "loaded scenario rows from CSV"
        );

        Ok(CsvSource { inner, headers })
    }

    /// Field names after alias resolution
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl EntitySource for CsvSource {
    fn fetch(&self, key: &str) -> Result<Option<Entity>> {
        self.inner.fetch(key)
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys()
    }
}

/// Rename the first matching alternate header to its canonical name,
/// unless the canonical header is already present
fn resolve_aliases(headers: &mut [String], aliases: &HashMap<String, Vec<String>>) {
    for (canonical, alternates) in aliases {
        if headers.iter().any(|h| h == canonical) {
            continue;
        }

        let found = alternates
            .iter()
            .find_map(|alt| headers.iter().position(|h| h == alt));

        match found {
            Some(index) => {
                debug!(from = %headers[index], to = %canonical, "resolved header alias");
                headers[index] = canonical.clone();
            }
            None => debug!(column = %canonical, "no header or alias found"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
