// Scenario Enrichment Cache - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod source;
pub mod layers;   // Layer Definitions Registry
pub mod store;    // Layer Store trait + freshness
pub mod memory;   // In-memory store
pub mod db;       // SQLite store + audit events
pub mod catalog;  // Standard 7-layer scenario catalog
pub mod runner;   // Enrichment Runner
pub mod merge;    // Merge Engine
pub mod config;

// Re-export commonly used types
pub use error::{CacheError, FailureReason};
pub use source::{CsvOptions, CsvSource, Entity, EntitySource, MemorySource};
pub use layers::{ComputeFn, FieldValues, LayerDefinition, LayerRegistry};
pub use store::{
    source_fingerprint, CacheEntry, EntryStatus, LayerEntries, LayerStats, LayerStore,
};
pub use memory::MemoryStore;
pub use db::{Event, SqliteStore};
pub use catalog::{
    load_specs, registry_from_specs, standard_registry, standard_specs, ColumnRule, LayerSpec,
};
pub use runner::{
    BatchReport, BatchSummary, CancelToken, EnrichmentRunner, EntityOutcome, OutcomeStatus,
    RunOptions,
};
pub use merge::{CatalogMerge, MergeEngine, MergedRecord};
pub use config::CacheConfig;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
