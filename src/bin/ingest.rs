//! Ingestion CLI: save or clear the metadata graph without going through
//! the HTTP API.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tablerag::config::Config;
use tablerag::embeddings::create_embedder;
use tablerag::error::TableRagError;
use tablerag::graph::GraphStore;
use tablerag::ingest::Ingestor;
use tablerag::model::SaveSpec;

#[derive(Parser)]
#[command(name = "ingest", about = "Ingest database metadata into the graph")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest configured databases; an optional JSON save spec narrows the run
    Save {
        /// e.g. '{"pg_demo": {"table": ["t_shipment"]}}'
        #[arg(long)]
        spec: Option<String>,
    },
    /// Drop every node, constraint, and index
    Clear,
}

async fn run(cli: Cli) -> Result<(), TableRagError> {
    let config = Config::load().map_err(|e| TableRagError::Config {
        message: e.to_string(),
    })?;
    tablerag::init_tracing(&config.runtime.log_level);

    let graph = GraphStore::connect(&config).await?;
    match cli.command {
        Command::Save { spec } => {
            let spec: SaveSpec = match spec {
                Some(text) => {
                    Some(serde_json::from_str(&text).map_err(|e| TableRagError::Validation {
                        message: format!("malformed save spec: {}", e),
                    })?)
                }
                None => None,
            };
            let embedder = create_embedder(&config)?;
            let ingestor = Ingestor::new(graph, embedder, Arc::new(config));
            ingestor.save_meta(&spec).await?;
        }
        Command::Clear => {
            graph.clear_meta().await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tablerag::load_env();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{e}");
        std::process::exit(e.exit_code());
    }
}
