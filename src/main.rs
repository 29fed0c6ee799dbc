use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use scenario_cache::{
    BatchReport, CacheConfig, CsvSource, EnrichmentRunner, EntitySource, LayerRegistry,
    LayerStore, MergeEngine, RunOptions, SqliteStore,
};

#[derive(Parser)]
#[command(name = "scenario-cache", version, about = "Layered enrichment cache for the scenario catalog")]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered layers with their fields and cache stats
    Layers,

    /// Enrich one layer (all source rows unless --keys is given)
    Enrich {
        layer: String,
        #[arg(long, value_delimiter = ',')]
        keys: Vec<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Enrich every layer in registration order
    EnrichAll {
        #[arg(long)]
        force: bool,
    },

    /// Print the merged records of one or more cases as JSON
    Merge {
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Merge every cached case and print the coverage summary.
    /// An empty cache falls back to computing from the source sheet.
    Catalog {
        /// Also write the merged records to this JSON file
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Mark entries stale so the next run recomputes them
    Invalidate {
        layer: String,
        #[arg(long, value_delimiter = ',')]
        keys: Vec<String>,
    },

    /// Re-run the cases whose entries failed
    Retry { layer: String },

    /// Delete every cached entry of one layer
    Clear { layer: String },
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = CacheConfig::load(cli.config.as_deref())?;
    let registry = config.registry()?;
    let store = SqliteStore::open(&config.database_path, &registry)?;

    match cli.command {
        Command::Layers => run_layers(&registry, &store),
        Command::Enrich {
            layer,
            keys,
            force,
            concurrency,
        } => {
            let source = open_source(&config)?;
            let mut options =
                RunOptions::default().with_concurrency(concurrency.unwrap_or(config.concurrency));
            if force {
                options = options.forced();
            }

            let runner = EnrichmentRunner::new(&registry, &store, &source)
                .with_max_age(config.max_age());
            let report = if keys.is_empty() {
                runner.run_all_keys(&layer, &options)?
            } else {
                runner.run(&layer, &keys, &options)?
            };
            print_report(&report);
            Ok(())
        }
        Command::EnrichAll { force } => {
            let source = open_source(&config)?;
            let keys = source.keys()?;
            let mut options = RunOptions::default().with_concurrency(config.concurrency);
            if force {
                options = options.forced();
            }

            println!("🔄 Enriching {} layers for {} cases", registry.count(), keys.len());
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

            let runner = EnrichmentRunner::new(&registry, &store, &source)
                .with_max_age(config.max_age());
            let reports = runner.enrich_all(&keys, &options);
            for report in &reports {
                print_report(report);
            }

            let failed: usize = reports.iter().map(|r| r.summary.failed()).sum();
            println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            if failed == 0 {
                println!("🎉 All layers enriched");
            } else {
                println!("⚠️  {} entity failures across layers (see above)", failed);
            }
            Ok(())
        }
        Command::Merge { keys } => {
            let engine = MergeEngine::new(&registry, &store).with_max_age(config.max_age());
            let records = engine.merge_many(&keys)?;
            let json = match records.as_slice() {
                [record] => serde_json::to_string_pretty(record)?,
                _ => serde_json::to_string_pretty(&records)?,
            };
            println!("{}", json);
            Ok(())
        }
        Command::Catalog { output } => {
            let engine = MergeEngine::new(&registry, &store)
                .with_max_age(config.max_age())
                .with_min_useful_fields(config.min_useful_fields);
            let catalog = match &config.source_csv {
                Some(_) => engine.catalog_or_source(&open_source(&config)?)?,
                None => engine.catalog()?,
            };

            if catalog.from_source {
                println!("📚 Catalog preview (cache is empty, computed from the source sheet)");
            } else {
                println!("📚 Merged catalog");
            }
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            println!("✓ {}", catalog.summary());
            println!("\n📊 Layer coverage:");
            for layer in registry.all_layers() {
                let count = catalog.layers_merged.get(&layer.id).copied().unwrap_or(0);
                println!("   {:<14} {:>5} / {}", layer.id, count, catalog.total_cases);
            }
            println!("\n📊 Field coverage:");
            for field in registry.discovery_fields() {
                let count = catalog.field_coverage.get(&field).copied().unwrap_or(0);
                println!("   {:<24} {:>5}", field, count);
            }

            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&catalog.records)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write merged catalog: {:?}", path))?;
                println!("\n💾 Wrote {} records to {:?}", catalog.records.len(), path);
            }
            Ok(())
        }
        Command::Invalidate { layer, keys } => {
            // invalidation never reads the source
            let source = scenario_cache::MemorySource::new();
            let runner = EnrichmentRunner::new(&registry, &store, &source);
            let keys = (!keys.is_empty()).then_some(keys);
            let marked = runner.invalidate(&layer, keys.as_deref())?;
            println!("✓ {} entries of layer '{}' marked stale", marked, layer);
            Ok(())
        }
        Command::Retry { layer } => {
            let source = open_source(&config)?;
            let options = RunOptions::default().with_concurrency(config.concurrency);
            let runner = EnrichmentRunner::new(&registry, &store, &source)
                .with_max_age(config.max_age());
            let report = runner.retry_failed(&layer, &options)?;
            print_report(&report);
            Ok(())
        }
        Command::Clear { layer } => {
            let source = scenario_cache::MemorySource::new();
            let runner = EnrichmentRunner::new(&registry, &store, &source);
            let removed = runner.clear(&layer)?;
            println!("🗑️  Removed {} entries of layer '{}'", removed, layer);
            Ok(())
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open_source(config: &CacheConfig) -> Result<CsvSource> {
    let Some(path) = &config.source_csv else {
        bail!("no source sheet configured (set source_csv or SCENARIO_CACHE_SOURCE)");
    };
    CsvSource::from_path(path, &config.csv_options())
}

fn run_layers(registry: &LayerRegistry, store: &SqliteStore) -> Result<()> {
    println!("🧱 {} cache layers ({})", registry.count(), registry.version());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for layer in registry.all_layers() {
        let stats = store.layer_stats(&layer.id)?;
        println!("\n📦 {}  {}", layer.id, layer.description);
        if !layer.required_source_fields.is_empty() {
            let required: Vec<&str> = layer.required_source_fields.iter().map(|s| s.as_str()).collect();
            println!("   requires: {}", required.join(", "));
        }
        let produced: Vec<&str> = layer.produced_fields.iter().map(|s| s.as_str()).collect();
        println!("   produces: {}", produced.join(", "));
        println!("   cache:    {}", stats.summary());
    }

    println!("\n✓ Database contains {} cache entries", store.count()?);
    Ok(())
}

fn print_report(report: &BatchReport) {
    let icon = if report.summary.failed() == 0 { "✅" } else { "⚠️ " };
    println!(
        "{} {} ({} ms): {}",
        icon,
        report.layer_id,
        report.elapsed_ms,
        report.summary.summary()
    );
    for outcome in &report.outcomes {
        if let Some(reason) = &outcome.reason {
            println!("   ✗ {}: {}", outcome.entity_key, reason);
        }
    }

    let retryable = report.retryable_keys();
    if !retryable.is_empty() {
        println!(
            "   ↻ {} retryable, run `retry {}`: {}",
            retryable.len(),
            report.layer_id,
            retryable.join(", ")
        );
    }
}
