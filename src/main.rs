//! Diagnosis Service - Main Entry Point

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use diagnosis::clients::{GatewayClient, OpenAIEmbedder};
use diagnosis::config::Config;
use diagnosis::handlers::{self, AppState};
use diagnosis::services::{
    Collaborators, DiagnosisOrchestrator, EmbeddingStore, IngestionPipeline, RetrievalService,
};
use diagnosis::traits::EmbeddingProvider;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "diagnosis=info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    info!("Starting Diagnosis Service v{}", env!("CARGO_PKG_VERSION"));
    info!("Port: {}", config.port);
    info!(
        "Retrieval: top_k={} threshold={}",
        config.top_k_results, config.similarity_threshold
    );

    let store = match &config.vector_store_path {
        Some(path) => {
            let store = EmbeddingStore::load_or_empty(path)
                .with_context(|| format!("failed to load vector store from {path}"))?;
            info!("Loaded {} manual records from {}", store.len(), path);
            store
        }
        None => {
            warn!("VECTOR_STORE_PATH not set; the store lives in memory only");
            EmbeddingStore::new()
        }
    };
    let store = Arc::new(store);

    let gateway = Arc::new(
        GatewayClient::new(config.gateway_base_url.clone(), config.gateway_api_key.clone())
            .with_embedding_model(config.embedding_model.clone()),
    );

    // Ingestion and retrieval must embed into the same space.
    let provider: Arc<dyn EmbeddingProvider> = match config.embedding_provider.as_str() {
        "openai" => {
            let key = config
                .openai_api_key
                .clone()
                .context("EMBEDDING_PROVIDER=openai requires OPENAI_API_KEY")?;
            warn!("OpenAI embeddings are text only; image diagnosis will fail retrieval");
            match &config.openai_base_url {
                Some(base_url) => Arc::new(OpenAIEmbedder::with_base_url(
                    key,
                    config.embedding_model.clone(),
                    base_url.clone(),
                )),
                None => Arc::new(OpenAIEmbedder::new(key, config.embedding_model.clone())),
            }
        }
        "gateway" => gateway.clone(),
        other => anyhow::bail!("unknown EMBEDDING_PROVIDER {other}"),
    };
    info!(
        "Embeddings: {} ({})",
        provider.provider_name(),
        config.embedding_model
    );

    reqwest::Url::parse(&config.product_search_url).with_context(|| {
        format!("invalid PRODUCT_SEARCH_URL {}", config.product_search_url)
    })?;

    let policy = config.retrieval_policy()?;
    let retrieval = Arc::new(RetrievalService::new(
        Arc::clone(&store),
        Arc::clone(&provider),
        policy,
        config.cache_size,
    ));
    info!("Embedding cache: {} entries", config.cache_size);

    let orchestrator = Arc::new(DiagnosisOrchestrator::new(
        retrieval,
        Collaborators {
            transcriber: gateway.clone(),
            reasoner: gateway.clone(),
            synthesizer: gateway.clone(),
            storage: gateway,
        },
        config.orchestrator_settings(),
    ));

    let ingestion = Arc::new(IngestionPipeline::new(
        store,
        provider,
        config.ingest_max_concurrency,
    ));

    let state = Arc::new(AppState {
        orchestrator,
        ingestion,
        snapshot_path: config.vector_store_path.as_ref().map(PathBuf::from),
    });

    // Build HTTP routes
    let app = handlers::router(state)
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;
    info!("Diagnosis Service listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
