//! Pipeline CLI: run a single stage against a session's state, or the
//! whole stage graph end-to-end.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tablerag::config::Config;
use tablerag::error::TableRagError;
use tablerag::llm::OpenAiChat;
use tablerag::pipeline::client::HttpMetaApi;
use tablerag::pipeline::state::{FileStateStore, SqliteStateStore, StateStore};
use tablerag::pipeline::{Pipeline, PipelineSettings};
use tablerag::prompts::PromptRegistry;

#[derive(Parser)]
#[command(name = "pipeline", about = "Retrieval-augmented context pipeline")]
struct Cli {
    /// Session whose state the stage reads and writes
    #[arg(long, default_value = "default")]
    session: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Seed the session with query, keywords, date info, and table captions
    AddContext {
        query: String,
        /// Defaults to pipeline.use_db_code from the config
        #[arg(long)]
        db_code: Option<String>,
    },
    RecallKnowledge,
    FilterKnowledge,
    ExtendColumn,
    ExtendCell,
    RecallColumn,
    RecallCell,
    MergeColCell,
    AddKnCol,
    FilterTbCol,
    /// Every stage in order
    Run {
        query: String,
        #[arg(long)]
        db_code: Option<String>,
    },
}

fn build_pipeline(config: &Config, session: &str) -> Result<Pipeline, TableRagError> {
    let store: Arc<dyn StateStore> = match config.pipeline.state_backend.as_str() {
        "sqlite" => Arc::new(SqliteStateStore::new(
            config.service.session_dir.join("sessions.db"),
            session,
        )),
        _ => Arc::new(FileStateStore::new(&config.service.session_dir, session)?),
    };
    let meta = HttpMetaApi::new(
        config.service.meta_base_url.clone(),
        std::env::var("TRAG_ACCESS_TOKEN").ok(),
    );
    Ok(Pipeline {
        meta: Arc::new(meta),
        llm: Arc::new(OpenAiChat::from_config(config)),
        store,
        prompts: PromptRegistry::new(&config.service.prompt_dir),
        settings: PipelineSettings {
            extend_model: config.llm.extend_model.clone(),
            filter_model: config.llm.filter_model.clone(),
            max_tb_num: config.pipeline.max_tb_num,
            max_col_per_tb: config.pipeline.max_col_per_tb,
        },
    })
}

fn resolve_db_code(config: &Config, db_code: Option<String>) -> Result<String, TableRagError> {
    let code = db_code.unwrap_or_else(|| config.pipeline.use_db_code.clone());
    if code.is_empty() {
        return Err(TableRagError::Validation {
            message: "no db_code given and pipeline.use_db_code is unset".into(),
        });
    }
    Ok(code)
}

async fn run(cli: Cli) -> Result<(), TableRagError> {
    let config = Config::load().map_err(|e| TableRagError::Config {
        message: e.to_string(),
    })?;
    tablerag::init_tracing(&config.runtime.log_level);
    let pipeline = build_pipeline(&config, &cli.session)?;

    match cli.command {
        Command::AddContext { query, db_code } => {
            let db_code = resolve_db_code(&config, db_code)?;
            pipeline.add_context(&db_code, &query).await?;
        }
        Command::RecallKnowledge => pipeline.recall_knowledge().await?,
        Command::FilterKnowledge => pipeline.filter_knowledge().await?,
        Command::ExtendColumn => pipeline.extend_column().await?,
        Command::ExtendCell => pipeline.extend_cell().await?,
        Command::RecallColumn => pipeline.recall_column().await?,
        Command::RecallCell => pipeline.recall_cell().await?,
        Command::MergeColCell => pipeline.merge_col_cell().await?,
        Command::AddKnCol => pipeline.add_kn_col().await?,
        Command::FilterTbCol => pipeline.filter_tb_col().await?,
        Command::Run { query, db_code } => {
            let db_code = resolve_db_code(&config, db_code)?;
            pipeline.run(&db_code, &query).await?;
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
