// Scenario Enrichment Cache - Web Server
// REST trigger surface over the runner and merge engine

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use scenario_cache::{
    CacheConfig, CacheError, CsvSource, EnrichmentRunner, LayerRegistry,
    LayerStats, LayerStore, MergeEngine, RunOptions, SqliteStore,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    registry: Arc<LayerRegistry>,
    store: Arc<SqliteStore>,
    source: Option<Arc<CsvSource>>,
    config: Arc<CacheConfig>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    if status.is_server_error() {
        error!("{}", message);
    }
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
        }),
    )
        .into_response()
}

/// Cache errors are the caller's fault, anything else is ours
fn error_response(err: anyhow::Error) -> Response {
    match err.downcast_ref::<CacheError>() {
        Some(cache_err @ CacheError::UnknownLayer(_)) => {
            failure(StatusCode::NOT_FOUND, cache_err.to_string())
        }
        Some(cache_err) => {
            info!(layer = cache_err.layer_id(), "rejected: {}", cache_err);
            failure(StatusCode::CONFLICT, cache_err.to_string())
        }
        None => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err)),
    }
}

#[derive(Serialize)]
struct LayerResponse {
    id: String,
    description: String,
    required_source_fields: Vec<String>,
    optional_source_fields: Vec<String>,
    produced_fields: Vec<String>,
    stats: LayerStats,
}

#[derive(Deserialize, Default)]
struct EnrichRequest {
    #[serde(default)]
    keys: Option<Vec<String>>,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    concurrency: Option<usize>,
}

#[derive(Deserialize, Default)]
struct InvalidateRequest {
    #[serde(default)]
    keys: Option<Vec<String>>,
}

#[derive(Serialize)]
struct InvalidateResponse {
    layer_id: String,
    marked: usize,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok("OK")
}

/// GET /api/layers - Registered layers with cache stats
async fn get_layers(State(state): State<AppState>) -> Response {
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<LayerResponse>> {
        state
            .registry
            .all_layers()
            .map(|layer| -> anyhow::Result<LayerResponse> {
                Ok(LayerResponse {
                    id: layer.id.clone(),
                    description: layer.description.clone(),
                    required_source_fields: layer.required_source_fields.iter().cloned().collect(),
                    optional_source_fields: layer.optional_source_fields.iter().cloned().collect(),
                    produced_fields: layer.produced_fields.iter().cloned().collect(),
                    stats: state.store.layer_stats(&layer.id)?,
                })
            })
            .collect()
    })
    .await;

    respond(result)
}

/// GET /api/layers/:layer/stats - Entry counts for one layer
async fn get_layer_stats(State(state): State<AppState>, Path(layer): Path<String>) -> Response {
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<LayerStats> {
        state.registry.resolve(&layer)?;
        state.store.layer_stats(&layer)
    })
    .await;

    respond(result)
}

/// POST /api/layers/:layer/enrich - Run the layer over the source sheet
async fn enrich_layer(
    State(state): State<AppState>,
    Path(layer): Path<String>,
    body: Option<Json<EnrichRequest>>,
) -> Response {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let Some(source) = state.source.clone() else {
        return failure(
            StatusCode::SERVICE_UNAVAILABLE,
            "No source sheet configured (set source_csv)",
        );
    };

    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let mut options = RunOptions::default()
            .with_concurrency(request.concurrency.unwrap_or(state.config.concurrency));
        if request.force {
            options = options.forced();
        }

        let runner = EnrichmentRunner::new(&state.registry, state.store.as_ref(), source.as_ref())
            .with_max_age(state.config.max_age());
        let report = match &request.keys {
            Some(keys) => runner.run(&layer, keys, &options)?,
            None => runner.run_all_keys(&layer, &options)?,
        };
        info!(layer = %layer, "{}", report.summary.summary());
        Ok(report)
    })
    .await;

    respond(result)
}

/// POST /api/layers/:layer/invalidate - Mark entries stale
async fn invalidate_layer(
    State(state): State<AppState>,
    Path(layer): Path<String>,
    body: Option<Json<InvalidateRequest>>,
) -> Response {
    let request = body.map(|Json(request)| request).unwrap_or_default();

    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let source = scenario_cache::MemorySource::new();
        let runner = EnrichmentRunner::new(&state.registry, state.store.as_ref(), &source);
        let marked = runner.invalidate(&layer, request.keys.as_deref())?;
        Ok(InvalidateResponse {
            layer_id: layer,
            marked,
        })
    })
    .await;

    respond(result)
}

/// GET /api/merge/:key - Merged record for one case
async fn merge_case(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    let result = tokio::task::spawn_blocking(move || {
        MergeEngine::new(&state.registry, state.store.as_ref())
            .with_max_age(state.config.max_age())
            .merge(&key)
    })
    .await;

    respond(result)
}

/// GET /api/catalog - Merge every cached case, or preview from the sheet when the cache is empty
async fn merge_catalog(State(state): State<AppState>) -> Response {
    let result = tokio::task::spawn_blocking(move || {
        let engine = MergeEngine::new(&state.registry, state.store.as_ref())
            .with_max_age(state.config.max_age())
            .with_min_useful_fields(state.config.min_useful_fields);
        match &state.source {
            Some(source) => engine.catalog_or_source(source.as_ref()),
            None => engine.catalog(),
        }
    })
    .await;

    respond(result)
}

fn respond<T: Serialize>(
    result: Result<anyhow::Result<T>, tokio::task::JoinError>,
) -> Response {
    match result {
        Ok(Ok(data)) => ApiResponse::ok(data),
        Ok(Err(e)) => error_response(e),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("worker task failed: {}", e)),
    }
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/layers", get(get_layers))
        .route("/layers/:layer/stats", get(get_layer_stats))
        .route("/layers/:layer/enrich", post(enrich_layer))
        .route("/layers/:layer/invalidate", post(invalidate_layer))
        .route("/merge/:key", get(merge_case))
        .route("/catalog", get(merge_catalog))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("🌐 Scenario Enrichment Cache - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = CacheConfig::load(config_path.as_deref())?;
    let registry = config.registry()?;

    let store = SqliteStore::open(&config.database_path, &registry)?;
    println!("✓ Database opened: {:?}", config.database_path);

    let source = match &config.source_csv {
        Some(path) => {
            let source = CsvSource::from_path(path, &config.csv_options())?;
            println!("✓ Source sheet loaded: {} cases", source.len());
            Some(Arc::new(source))
        }
        None => {
            println!("⚠️  No source sheet configured, enrichment disabled");
            None
        }
    };

    let addr = config.server_addr.clone();
    let state = AppState {
        registry: Arc::new(registry),
        store: Arc::new(store),
        source,
        config: Arc::new(config),
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("\n🚀 Server running on http://{}", addr);
    println!("   API: http://{}/api/layers", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, router(state)).await?;
    Ok(())
}
