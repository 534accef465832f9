pub mod ai;
pub mod analyzer;
pub mod config;
pub mod conversation;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod middleware;
pub mod models;
pub mod prompts;
pub mod queries;
pub mod recommend;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod vector;

pub use config::Config;
pub use error::{Error, Result};
pub use hub::{HubOptions, IntelligenceHub};
pub use state::AppState;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::ai::{AiClientManager, ClientPriority, OuterTokenRotatingClient, StandardClient, TokenRotator};
use crate::conversation::ConversationRecorder;
use crate::middleware::AccessManager;
use crate::models::intelligence::{COLLECTION_ARCHIVED, COLLECTION_CACHED, COLLECTION_RECOMMENDATION};
use crate::storage::DocumentStore;
use crate::vector::VectorEngine;

/// Load configuration from environment variables
pub fn load_config() -> Result<Config> {
    Ok(Config::load()?)
}

/// Initialize tracing subscriber with environment filter
///
/// Reads the RUST_LOG environment variable for the log level and defaults
/// to "info" when unset.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

/// Create the hub API routes
pub fn create_api_router() -> Router<AppState> {
    use handlers::{health, intelligence};

    Router::new()
        .route("/health", get(health::health_check))
        .route("/submit/collected", post(intelligence::submit_collected))
        .route("/submit/archived", post(intelligence::submit_archived))
        .route("/intelligence/{id}", get(intelligence::get_intelligence))
        .route("/query", post(intelligence::query_intelligence))
        .route("/vector-search", post(intelligence::vector_search))
        .route("/recommendations", get(intelligence::recommendations))
        .route("/statistics", get(intelligence::statistics))
        .route("/rating/{id}", post(intelligence::submit_rating))
}

/// Create the vector service routes (split-process capable surface)
pub fn create_vector_router() -> Router<AppState> {
    use handlers::vector_service as vs;

    Router::new()
        .route("/api/status", get(vs::status))
        .route("/api/health", get(vs::health))
        .route(
            "/api/collections",
            post(vs::create_collection).get(vs::list_collections),
        )
        .route("/api/collections/{name}/upsert", post(vs::upsert_document))
        .route("/api/collections/{name}/search", post(vs::search))
        .route(
            "/api/collections/{name}/documents/{doc_id}",
            delete(vs::delete_document),
        )
        .route("/api/collections/{name}/clear", post(vs::clear_collection))
        .route("/api/collections/{name}/stats", get(vs::collection_stats))
        .route("/api/collections/{name}/documents", get(vs::list_documents))
        .route("/api/admin/backup", get(vs::backup))
        .route(
            "/api/admin/restore",
            post(vs::restore).layer(axum::extract::DefaultBodyLimit::max(256 * 1024 * 1024)),
        )
}

async fn connect_store(
    config: &Config,
    collection: &str,
    indexes: &[&str],
) -> Option<Arc<DocumentStore>> {
    match DocumentStore::connect(&config.mongodb, collection, indexes).await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            // Degraded mode: the hub keeps running without this store
            tracing::error!(collection, error = %e, "Document store unavailable");
            None
        }
    }
}

fn build_ai_client_manager(
    config: &Config,
    shutdown_tx: &broadcast::Sender<()>,
) -> Arc<AiClientManager> {
    let manager = AiClientManager::new();
    let ai = &config.intelligence_hub.ai_service;
    let rotator = &config.ai_service_rotator;
    let timeout = config.hub.chat_timeout();

    if rotator.enabled && !rotator.key_file.is_empty() {
        tracing::info!(
            key_file = %rotator.key_file,
            threshold = rotator.threshold,
            "AI service key rotator enabled"
        );
        let client = Arc::new(OuterTokenRotatingClient::new(
            "Default AI Client",
            &ai.url,
            &ai.model,
            "default",
            ClientPriority::Normal,
            timeout,
            ai.proxies.as_deref(),
            rotator.threshold,
        ));
        manager.register_client(client.clone());
        let _rotator = TokenRotator::new(
            client,
            PathBuf::from(&rotator.key_file),
            rotator.threshold,
            Duration::from_secs(300),
        )
        .start(shutdown_tx.subscribe());
    } else {
        let client = Arc::new(StandardClient::new(
            "Default AI Client",
            &ai.url,
            ai.token.clone(),
            &ai.model,
            "default",
            ClientPriority::Normal,
            timeout,
            ai.proxies.as_deref(),
            0.0,
        ));
        manager.register_client(client);
    }

    manager
}

/// Assembles the full service: stores, client pool, vector engine, hub and
/// access control. Store connection failures degrade rather than abort.
pub async fn build_app_state(
    config: &Config,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<AppState> {
    let recorder = Arc::new(ConversationRecorder::open(Path::new(
        &config.conversation.directory,
    ))?);

    let clients = build_ai_client_manager(config, &shutdown_tx);
    let _monitor = clients.start_monitoring(
        Duration::from_secs(config.hub.monitor_interval_seconds),
        shutdown_tx.subscribe(),
    );

    let cache_store = connect_store(config, COLLECTION_CACHED, &["UUID"]).await;
    let archive_store = connect_store(config, COLLECTION_ARCHIVED, &["UUID", "PUB_TIME"]).await;
    let recommendation_store = connect_store(config, COLLECTION_RECOMMENDATION, &["TIME"]).await;

    let vectordb = &config.intelligence_hub.vectordb;
    let vector_engine = if vectordb.enabled && !vectordb.vector_db_path.is_empty() {
        Some(VectorEngine::start(
            Path::new(&vectordb.vector_db_path),
            &vectordb.embedding_model_name,
        ))
    } else {
        None
    };

    let options = HubOptions {
        analysis_workers: config.hub.analysis_workers,
        fulltext_source: vectordb.fulltext_source,
        export_directory: PathBuf::from(&config.export.directory),
    };
    let hub = IntelligenceHub::new(
        cache_store,
        archive_store,
        recommendation_store,
        vector_engine.clone(),
        clients,
        recorder,
        shutdown_tx,
        options,
    );
    hub.startup().await;

    let access = Arc::new(AccessManager::from_config(
        &config.intelligence_hub_web_service,
    ));
    Ok(AppState::new(hub, access, vector_engine))
}

/// Start the API server. Returns when the server has shut down.
pub async fn run_api_server(config: &Config) -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(8);
    let state = build_app_state(config, shutdown_tx.clone()).await?;
    let hub = state.hub.clone();

    let app = Router::new()
        .merge(create_api_router())
        .merge(create_vector_router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Intelligence hub listening on http://{}", addr);

    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install CTRL+C handler");
        }
        tracing::info!("Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    hub.shutdown(Duration::from_secs(10)).await;
    Ok(())
}
