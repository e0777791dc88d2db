use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Main configuration structure loaded from tablerag.toml and environment variables
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub graph: GraphConfig,
    pub llm: LlmConfig,
    pub auth: AuthConfig,
    pub pipeline: PipelineConfig,
    /// Registered source databases, keyed by db_code.
    #[serde(default)]
    pub databases: IndexMap<String, DatabaseCfg>,
    /// Runtime configuration loaded from environment variables
    #[serde(skip)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub bind: std::net::SocketAddr,
    /// Base URL the pipeline uses to reach this service.
    pub meta_base_url: String,
    pub prompt_dir: PathBuf,
    pub session_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphConfig {
    pub url: String,
    pub ns: String,
    pub db: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    pub embed_model: String,
    pub extend_model: String,
    pub filter_model: String,
    /// Extra attempts for embedding batches (total tries = retries + 1).
    pub embed_retries: u32,
    pub embed_dimensions: usize,
    pub models: HashMap<String, ModelConfig>,
}

/// One OpenAI-compatible endpoint entry under `[llm.models.<name>]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    /// Passed through verbatim into the completion request body.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    pub algorithm: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_days: i64,
    /// Fixed UTC offset for token expiry bookkeeping (hours).
    pub utc_offset_hours: i32,
    pub database: SqlConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub max_tb_num: usize,
    pub max_col_per_tb: usize,
    /// `file` or `sqlite`
    pub state_backend: String,
    /// Default db_code for the pipeline CLI.
    #[serde(default)]
    pub use_db_code: String,
}

/// Connection parameters for a relational database.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SqlConfig {
    /// `mysql` or `postgresql`
    pub db_type: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseCfg {
    pub db_name: String,
    #[serde(flatten)]
    pub conn: SqlConfig,
    #[serde(default)]
    pub table: IndexMap<String, TableCfg>,
    #[serde(default)]
    pub knowledge: BTreeMap<i64, KnowledgeCfg>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableCfg {
    pub tb_name: String,
    pub tb_meaning: String,
    /// Columns eligible for cell indexing; `None` means all string columns.
    #[serde(default)]
    pub sync_col: Option<Vec<String>>,
    #[serde(default)]
    pub no_sync_col: Option<Vec<String>>,
    /// Curated per-column semantics layered over discovery.
    #[serde(default)]
    pub column: Option<IndexMap<String, ColumnCfg>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ColumnCfg {
    #[serde(default)]
    pub col_meaning: Option<String>,
    #[serde(default)]
    pub field_meaning: Option<serde_json::Value>,
    #[serde(default)]
    pub col_alias: Option<Vec<String>>,
    /// Overrides the discovered foreign-key target.
    #[serde(default)]
    pub rel_col: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KnowledgeCfg {
    pub kn_name: String,
    pub kn_desc: String,
    #[serde(default)]
    pub kn_def: Option<String>,
    #[serde(default)]
    pub kn_alias: Option<Vec<String>>,
    #[serde(default)]
    pub rel_kn: Option<Vec<i64>>,
    #[serde(default)]
    pub rel_col: Option<Vec<String>>,
}

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub graph_user: String,
    pub graph_pass: String,
    pub secret_key: String,
    pub log_level: String,
    pub embed_api_key: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            graph_user: "root".to_string(),
            graph_pass: "root".to_string(),
            secret_key: String::new(),
            log_level: "tablerag=info".to_string(),
            embed_api_key: None,
        }
    }
}

impl RuntimeConfig {
    pub fn load_from_env() -> Self {
        Self {
            graph_user: std::env::var("TRAG_GRAPH_USER").unwrap_or_else(|_| "root".to_string()),
            graph_pass: std::env::var("TRAG_GRAPH_PASS").unwrap_or_else(|_| "root".to_string()),
            secret_key: std::env::var("TRAG_SECRET_KEY").unwrap_or_default(),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "tablerag=info".to_string()),
            embed_api_key: std::env::var("TRAG_EMBED_API_KEY").ok(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file and environment variables.
    /// Uses the TABLERAG_CONFIG environment variable or defaults to "tablerag.toml".
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let config_path =
            std::env::var("TABLERAG_CONFIG").unwrap_or_else(|_| "tablerag.toml".to_string());
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", config_path, e))?;
        let mut config: Config = toml::from_str(&content)?;

        // Env-first overrides for the graph endpoint and secrets
        if let Ok(url) = std::env::var("TRAG_GRAPH_URL") {
            config.graph.url = url;
        }
        config.runtime = RuntimeConfig::load_from_env();
        if config.runtime.secret_key.is_empty() {
            anyhow::bail!("TRAG_SECRET_KEY must be set for token signing");
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> anyhow::Result<()> {
        // Clamp embed retries
        if self.llm.embed_retries > 10 {
            tracing::warn!(
                "embed_retries {} exceeds max 10, clamping to 10",
                self.llm.embed_retries
            );
            self.llm.embed_retries = 10;
        }

        if self.llm.embed_dimensions == 0 {
            anyhow::bail!("llm.embed_dimensions must be positive");
        }

        for name in [
            &self.llm.embed_model,
            &self.llm.extend_model,
            &self.llm.filter_model,
        ] {
            if !self.llm.models.contains_key(name) {
                anyhow::bail!("llm.models is missing an entry for '{}'", name);
            }
        }

        for (db_code, db) in &self.databases {
            if db.conn.db_type != "mysql" && db.conn.db_type != "postgresql" {
                anyhow::bail!(
                    "database '{}' has unsupported db_type '{}'",
                    db_code,
                    db.conn.db_type
                );
            }
        }

        match self.pipeline.state_backend.as_str() {
            "file" | "sqlite" => {}
            other => anyhow::bail!("unsupported pipeline.state_backend '{}'", other),
        }

        if self.auth.algorithm != "HS256" && self.auth.algorithm != "HS384" {
            tracing::warn!(
                "unusual auth.algorithm '{}', HS256 is the expected default",
                self.auth.algorithm
            );
        }

        Ok(())
    }

    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.llm.models.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [service]
            bind = "127.0.0.1:12321"
            meta_base_url = "http://127.0.0.1:12321/api/v1"
            prompt_dir = "prompts"
            session_dir = "sessions"

            [graph]
            url = "ws://127.0.0.1:8000"
            ns = "tablerag"
            db = "meta"

            [llm]
            embed_model = "embedder"
            extend_model = "extender"
            filter_model = "filterer"
            embed_retries = 1
            embed_dimensions = 1024

            [llm.models.embedder]
            base_url = "http://127.0.0.1:9000/v1"
            model = "bge-large-zh-v1.5"

            [llm.models.extender]
            base_url = "http://127.0.0.1:9001/v1"
            model = "qwen-plus"

            [llm.models.filterer]
            base_url = "http://127.0.0.1:9001/v1"
            model = "qwen-plus"

            [auth]
            algorithm = "HS256"
            access_ttl_minutes = 30
            refresh_ttl_days = 7
            utc_offset_hours = 8

            [auth.database]
            db_type = "mysql"
            host = "127.0.0.1"
            port = 3306
            user = "auth"
            password = "auth"
            database = "auth"

            [pipeline]
            max_tb_num = 5
            max_col_per_tb = 8
            state_backend = "file"

            [databases.pg_cold_chain]
            db_name = "冷链医药合规库"
            db_type = "postgresql"
            host = "127.0.0.1"
            port = 5432
            user = "reader"
            password = "reader"
            database = "cold_chain"

            [databases.pg_cold_chain.table.t_shipment]
            tb_name = "shipment"
            tb_meaning = "运单"
            sync_col = ["status"]
        "#
    }

    #[test]
    fn parses_minimal_config() {
        let mut cfg: Config = toml::from_str(minimal_toml()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.databases["pg_cold_chain"].conn.db_type, "postgresql");
        let tb = &cfg.databases["pg_cold_chain"].table["t_shipment"];
        assert_eq!(tb.tb_name, "shipment");
        assert_eq!(tb.sync_col.as_deref(), Some(&["status".to_string()][..]));
    }

    #[test]
    fn rejects_unknown_db_type() {
        let toml_str = minimal_toml().replace(
            "db_type = \"postgresql\"",
            "db_type = \"oracle\"",
        );
        let mut cfg: Config = toml::from_str(&toml_str).unwrap();
        assert!(cfg.validate().is_err());
    }
}
