//! Metadata service binary: graph-backed retrieval + ingestion behind the
//! scope-gated HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;
use tablerag::auth::AuthService;
use tablerag::auth::store::{AuthStore, SqlAuthStore};
use tablerag::config::Config;
use tablerag::embeddings::create_embedder;
use tablerag::graph::GraphStore;
use tablerag::http::{AppState, router};
use tablerag::ingest::Ingestor;
use tablerag::ingest::source::SourcePool;
use tablerag::retrieve::Retriever;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tablerag::load_env();
    let config = Config::load()?;
    tablerag::init_tracing(&config.runtime.log_level);

    let graph = GraphStore::connect(&config).await?;
    let embedder = create_embedder(&config)?;
    let config = Arc::new(config);

    let auth_pool = SourcePool::connect(&config.auth.database).await?;
    let auth_store: Arc<dyn AuthStore> = Arc::new(SqlAuthStore::new(auth_pool));
    let scopes = auth_store.all_scopes().await?;
    info!("loaded {} scopes from the auth database", scopes.len());
    let auth = Arc::new(AuthService::new(auth_store, &config)?);

    let retriever = Retriever::new(graph.clone(), embedder.clone());
    let ingestor = Arc::new(Ingestor::new(graph.clone(), embedder, config.clone()));

    let state = AppState {
        auth,
        retriever,
        ingestor,
        graph,
        scopes,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.service.bind).await?;
    info!("listening on {}", config.service.bind);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
