// ⚙️ Configuration - JSON file plus environment overrides

use crate::catalog::{load_specs, registry_from_specs, standard_header_aliases, standard_registry};
use crate::layers::LayerRegistry;
use crate::source::{CsvOptions, DEFAULT_KEY_COLUMN};
use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_DATABASE: &str = "SCENARIO_CACHE_DB";
pub const ENV_SOURCE: &str = "SCENARIO_CACHE_SOURCE";
pub const ENV_CONCURRENCY: &str = "SCENARIO_CACHE_CONCURRENCY";
pub const ENV_ADDR: &str = "SCENARIO_CACHE_ADDR";

/// Longest accepted `max_age_hours` (100 years)
pub const MAX_AGE_HOURS_LIMIT: i64 = 24 * 365 * 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// SQLite cache database
    pub database_path: PathBuf,

    /// Master scenario sheet (CSV export)
    pub source_csv: Option<PathBuf>,

    pub key_column: String,

    /// Header rows at the top of the sheet; the last one names the fields
    pub header_rows: usize,

    /// Worker pool size for enrichment runs
    pub concurrency: usize,

    /// Entries older than this are recomputed and left out of merges.
    /// `None` disables expiry.
    pub max_age_hours: Option<i64>,

    /// Catalog merges below this average field count are flagged
    pub min_useful_fields: usize,

    /// JSON layer catalog replacing the built-in one
    pub layers_file: Option<PathBuf>,

    pub server_addr: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            database_path: PathBuf::from("scenario_cache.db"),
            source_csv: None,
            key_column: DEFAULT_KEY_COLUMN.to_string(),
            header_rows: 2,
            concurrency: 4,
            max_age_hours: Some(24),
            min_useful_fields: 10,
            layers_file: None,
            server_addr: "127.0.0.1:3000".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        serde_json::from_str(&content).context("Failed to parse config JSON")
    }

    /// File (or defaults), then environment, then validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(db) = env::var(ENV_DATABASE) {
            self.database_path = PathBuf::from(db);
        }
        if let Ok(source) = env::var(ENV_SOURCE) {
            self.source_csv = Some(PathBuf::from(source));
        }
        if let Ok(concurrency) = env::var(ENV_CONCURRENCY) {
            self.concurrency = concurrency
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number, got {:?}", ENV_CONCURRENCY, concurrency))?;
        }
        if let Ok(addr) = env::var(ENV_ADDR) {
            self.server_addr = addr;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.header_rows == 0 {
            bail!("header_rows must be at least 1");
        }
        if self.key_column.trim().is_empty() {
            bail!("key_column must not be empty");
        }
        if matches!(self.max_age_hours, Some(hours) if hours <= 0) {
            bail!("max_age_hours must be positive (use null to disable expiry)");
        }
        if matches!(self.max_age_hours, Some(hours) if hours > MAX_AGE_HOURS_LIMIT) {
            bail!(
                "max_age_hours must be at most {} (use null to disable expiry)",
                MAX_AGE_HOURS_LIMIT
            );
        }
        Ok(())
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_hours
            .map(|hours| Duration::hours(hours.clamp(0, MAX_AGE_HOURS_LIMIT)))
    }

    /// Layer catalog from `layers_file`, or the built-in one
    pub fn registry(&self) -> Result<LayerRegistry> {
        let registry = match &self.layers_file {
            Some(path) => registry_from_specs(load_specs(path)?)?,
            None => standard_registry()?,
        };
        Ok(registry)
    }

    /// CSV reader settings, with the standard header aliases
    pub fn csv_options(&self) -> CsvOptions {
        CsvOptions {
            key_column: self.key_column.clone(),
            header_rows: self.header_rows,
            aliases: standard_header_aliases(),
        }
    }
}
