pub mod auth;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod graph;
pub mod http;
pub mod ingest;
pub mod keywords;
pub mod llm;
pub mod model;
pub mod pipeline;
pub mod prompts;
pub mod retrieve;
pub mod retry;

// Load env from a simple, standardized location resolution.
// Loads .env if present and silently ignores if missing.
pub fn load_env() {
    let _ = dotenvy::dotenv();
}

/// Tracing subscriber with the env filter from RUST_LOG (config fallback).
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
