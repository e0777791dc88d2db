//! Typed wrapper over the SurrealDB graph driver.
//!
//! One process-wide handle; every operation is a parameterized query (user
//! strings only ever travel through bind parameters). DDL helpers cover the
//! uniqueness, vector, and full-text indexes of the metadata graph.

use crate::config::Config;
use crate::error::{Result, TableRagError};
use std::sync::Arc;
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::{Client, Ws};
use tracing::{info, warn};

/// Metadata node tables, containment leaves first.
pub const META_TABLES: &[&str] = &[
    "cell",
    "embed_kn",
    "embed_col",
    "kn",
    "col",
    "tb",
    "database",
];

/// Analyzer backing the full-text indexes; tscontent is pre-tokenized, so
/// a blank tokenizer with lowercasing is all that is needed.
const KW_ANALYZER: &str = "kw_analyzer";

#[derive(Clone)]
pub struct GraphStore {
    db: Arc<Surreal<Client>>,
}

fn normalize_ws_url(s: &str) -> String {
    s.strip_prefix("ws://")
        .or_else(|| s.strip_prefix("wss://"))
        .or_else(|| s.strip_prefix("http://"))
        .or_else(|| s.strip_prefix("https://"))
        .unwrap_or(s)
        .to_string()
}

impl GraphStore {
    /// Connect with exponential backoff, sign in, select ns/db.
    pub async fn connect(config: &Config) -> Result<Self> {
        info!("Connecting to graph store via WebSocket");
        let url = normalize_ws_url(&config.graph.url);
        let max_retries = 5u32;

        let mut db = None;
        for attempt in 0..=max_retries {
            match Surreal::new::<Ws>(url.clone()).await {
                Ok(conn) => {
                    db = Some(conn);
                    if attempt > 0 {
                        info!("Connected to graph store after {} attempts", attempt + 1);
                    }
                    break;
                }
                Err(e) => {
                    if attempt == max_retries {
                        return Err(TableRagError::Graph {
                            message: format!(
                                "failed to connect to graph store at {} after {} attempts: {}",
                                config.graph.url,
                                max_retries + 1,
                                e
                            ),
                        });
                    }
                    let delay_ms = (1000 * (1u64 << attempt.min(5))).min(60_000);
                    warn!(
                        "graph connection attempt {} failed: {}. Retrying in {}ms",
                        attempt + 1,
                        e,
                        delay_ms
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }
        let db = db.expect("connection should be initialized");

        db.signin(surrealdb::opt::auth::Root {
            username: config.runtime.graph_user.as_str(),
            password: config.runtime.graph_pass.as_str(),
        })
        .await?;
        db.use_ns(&config.graph.ns).await?;
        db.use_db(&config.graph.db).await?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn inner(&self) -> &Surreal<Client> {
        &self.db
    }

    /// Unique index standing in for a property-uniqueness constraint.
    pub async fn ensure_unique_index(&self, table: &str, fields: &[&str]) -> Result<()> {
        let name = format!("uniq_{}_{}", table, fields.join("_"));
        let ddl = format!(
            "DEFINE INDEX IF NOT EXISTS {name} ON TABLE {table} FIELDS {} UNIQUE",
            fields.join(", ")
        );
        self.db.query(ddl).await?;
        Ok(())
    }

    /// HNSW vector index with the given distance metric.
    pub async fn ensure_vector_index(
        &self,
        table: &str,
        field: &str,
        dims: usize,
        metric: &str,
    ) -> Result<()> {
        let ddl = format!(
            "DEFINE INDEX IF NOT EXISTS idx_{table}_{field} ON TABLE {table} FIELDS {field} \
             HNSW DIMENSION {dims} DIST {metric}"
        );
        self.db.query(ddl).await?;
        Ok(())
    }

    /// BM25 full-text index over a pre-tokenized keyword list.
    pub async fn ensure_fulltext_index(&self, table: &str, field: &str) -> Result<()> {
        let ddl = format!(
            "DEFINE ANALYZER IF NOT EXISTS {KW_ANALYZER} TOKENIZERS blank FILTERS lowercase;\n\
             DEFINE INDEX IF NOT EXISTS idx_{table}_{field} ON TABLE {table} FIELDS {field} \
             SEARCH ANALYZER {KW_ANALYZER} BM25"
        );
        self.db.query(ddl).await?;
        Ok(())
    }

    /// Define every constraint and index of the metadata graph. A failure
    /// here is fatal to ingestion.
    pub async fn ensure_schema(&self, dims: usize) -> Result<()> {
        self.ensure_unique_index("database", &["db_code"]).await?;
        self.ensure_unique_index("tb", &["tb_code"]).await?;
        self.ensure_unique_index("col", &["tb_code", "col_name"])
            .await?;
        self.ensure_unique_index("kn", &["db_code", "kn_code"])
            .await?;
        self.ensure_unique_index("embed_col", &["content"]).await?;
        self.ensure_unique_index("embed_kn", &["content"]).await?;
        self.ensure_unique_index("cell", &["content"]).await?;

        self.ensure_vector_index("embed_col", "embed", dims, "COSINE")
            .await?;
        self.ensure_vector_index("embed_kn", "embed", dims, "COSINE")
            .await?;
        self.ensure_vector_index("cell", "embed", dims, "COSINE")
            .await?;

        self.ensure_fulltext_index("embed_kn", "tscontent").await?;
        self.ensure_fulltext_index("cell", "tscontent").await?;
        info!("graph schema ensured");
        Ok(())
    }

    /// All-or-nothing wipe: every node, constraint, and index goes.
    pub async fn clear_meta(&self) -> Result<()> {
        for table in META_TABLES {
            self.db
                .query(format!("REMOVE TABLE IF EXISTS {table}"))
                .await?;
        }
        self.db
            .query(format!("REMOVE ANALYZER IF EXISTS {KW_ANALYZER}"))
            .await?;
        info!("cleared metadata graph");
        Ok(())
    }
}
