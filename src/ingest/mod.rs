//! Metadata ingestion: introspect configured source databases, embed and
//! keyword-index every atom, and merge the result into the graph.
//!
//! Ordering: Database → Table → Column → (Column REL, Knowledge, embeds) →
//! Cell. Per-table failures are logged and skipped; DDL failures abort.

pub mod atoms;
pub mod source;

use crate::config::{Config, DatabaseCfg, TableCfg};
use crate::embeddings::Embedder;
use crate::error::{Result, TableRagError};
use crate::graph::GraphStore;
use crate::keywords::extract_keywords;
use crate::model::{Column, DatabaseNode, DbSaveSpec, Knowledge, SaveSpec};
use crate::retry::{Backoff, retry};
use atoms::{column_atoms, is_indexable_cell, knowledge_atoms};
use once_cell::sync::Lazy;
use serde::Serialize;
use source::SourcePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Atoms per embedding upsert batch.
const EMBED_BATCH_SIZE: usize = 128;
/// Rows per source-table scan partition.
const SELECT_BATCH_SIZE: usize = 5000;
/// Cells per processing batch.
const PROCESS_BATCH_SIZE: usize = 128;
/// Embedding-batch attempts before the batch is dropped.
const BATCH_ATTEMPTS: u32 = 3;

/// Process-wide bound on concurrent cell batches.
static CELL_SEMAPHORE: Lazy<Arc<Semaphore>> = Lazy::new(|| Arc::new(Semaphore::new(20)));

#[derive(Debug, Clone, Serialize)]
struct TbItem {
    tb_code: String,
    tb_name: String,
    tb_meaning: String,
    db_code: String,
}

/// A `col` node at the storage boundary: field_meaning as JSON text.
#[derive(Debug, Clone, Serialize)]
struct ColItem {
    tb_code: String,
    col_name: String,
    col_type: Option<String>,
    col_comment: Option<String>,
    col_meaning: Option<String>,
    field_meaning: Option<String>,
    col_alias: Option<Vec<String>>,
    fewshot: Option<Vec<String>>,
    rel_col: Option<String>,
}

impl ColItem {
    fn from_column(col: &Column) -> Result<Self> {
        let field_meaning = match &col.field_meaning {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        Ok(Self {
            tb_code: col.tb_code.clone(),
            col_name: col.col_name.clone(),
            col_type: col.col_type.clone(),
            col_comment: col.col_comment.clone(),
            col_meaning: col.col_meaning.clone(),
            field_meaning,
            col_alias: col.col_alias.clone(),
            fewshot: col.fewshot.clone(),
            rel_col: col.rel_col.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct RelFix {
    tb_code: String,
    col_name: String,
    rel_tb_name: String,
    rel_col_name: String,
}

#[derive(Debug, Clone, Serialize)]
struct KnLinkItem {
    db_code: String,
    kn_code: i64,
    rel_kn: Vec<i64>,
    rel_col_pairs: Vec<[String; 2]>,
}

#[derive(Debug, Clone, Serialize)]
struct ColAtomItem {
    tb_code: String,
    col_name: String,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    embed: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
struct KnAtomItem {
    db_code: String,
    kn_code: i64,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    embed: Vec<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tscontent: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct CellItem {
    tb_code: String,
    col_name: String,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    embed: Vec<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tscontent: Vec<String>,
}

/// One table whose sync-set cells get indexed.
struct CellJob {
    db_code: String,
    tb_code: String,
    tb_name: String,
    col_names: Vec<String>,
}

struct LoadedMeta {
    databases: Vec<DatabaseNode>,
    tables: Vec<TbItem>,
    columns: Vec<Column>,
    knowledges: Vec<Knowledge>,
    cell_jobs: Vec<CellJob>,
}

pub struct Ingestor {
    graph: GraphStore,
    embedder: Arc<dyn Embedder>,
    config: Arc<Config>,
}

impl Ingestor {
    pub fn new(graph: GraphStore, embedder: Arc<dyn Embedder>, config: Arc<Config>) -> Self {
        Self {
            graph,
            embedder,
            config,
        }
    }

    /// Ingest configured databases into the graph, optionally narrowed by
    /// a save spec (`None` = everything).
    pub async fn save_meta(&self, spec: &SaveSpec) -> Result<()> {
        // DDL failures are fatal
        self.graph.ensure_schema(self.embedder.dimensions()).await?;

        let loaded = self.load_meta(spec).await?;
        self.save_tb_info(&loaded).await?;
        self.save_tb_column(&loaded.columns).await?;
        self.save_knowledge(&loaded.knowledges).await?;
        self.save_col_embed(&loaded.columns).await?;
        self.save_kn_embed(&loaded.knowledges).await?;
        self.save_cell(&loaded.cell_jobs).await?;
        Ok(())
    }

    fn db_spec<'a>(
        spec: &'a SaveSpec,
        db_code: &str,
    ) -> Option<std::borrow::Cow<'a, DbSaveSpec>> {
        match spec {
            None => Some(std::borrow::Cow::Owned(DbSaveSpec::default())),
            Some(map) => match map.get(db_code) {
                None => None,
                Some(None) => Some(std::borrow::Cow::Owned(DbSaveSpec::default())),
                Some(Some(db_spec)) => Some(std::borrow::Cow::Borrowed(db_spec)),
            },
        }
    }

    async fn load_meta(&self, spec: &SaveSpec) -> Result<LoadedMeta> {
        let mut loaded = LoadedMeta {
            databases: Vec::new(),
            tables: Vec::new(),
            columns: Vec::new(),
            knowledges: Vec::new(),
            cell_jobs: Vec::new(),
        };

        for (db_code, db_cfg) in &self.config.databases {
            let Some(db_spec) = Self::db_spec(spec, db_code) else {
                continue;
            };
            loaded.databases.push(DatabaseNode {
                db_code: db_code.clone(),
                db_name: db_cfg.db_name.clone(),
                db_type: db_cfg.conn.db_type.clone(),
                database: db_cfg.conn.database.clone(),
            });

            if !db_cfg.table.is_empty() {
                let pool = SourcePool::connect(&db_cfg.conn).await?;
                for (tb_code, tb_cfg) in &db_cfg.table {
                    if !db_spec.wants_table(tb_code) {
                        continue;
                    }
                    match self.load_table(&pool, db_code, tb_code, tb_cfg).await {
                        Ok(cols) => {
                            loaded.tables.push(TbItem {
                                tb_code: tb_code.clone(),
                                tb_name: tb_cfg.tb_name.clone(),
                                tb_meaning: tb_cfg.tb_meaning.clone(),
                                db_code: db_code.clone(),
                            });
                            if db_spec.wants_cell(tb_code) {
                                if let Some(job) =
                                    sync_job(db_code, tb_code, tb_cfg, &cols)
                                {
                                    loaded.cell_jobs.push(job);
                                }
                            }
                            loaded.columns.extend(cols);
                        }
                        Err(e) => {
                            error!("{}.{} load table error: {}", db_code, tb_code, e);
                            continue;
                        }
                    }
                }
                pool.close().await;
            }

            for (kn_code, kn_cfg) in &db_cfg.knowledge {
                if !db_spec.wants_knowledge(*kn_code) {
                    continue;
                }
                loaded.knowledges.push(Knowledge {
                    db_code: db_code.clone(),
                    kn_code: *kn_code,
                    kn_name: kn_cfg.kn_name.clone(),
                    kn_desc: kn_cfg.kn_desc.clone(),
                    kn_def: kn_cfg.kn_def.clone(),
                    kn_alias: kn_cfg.kn_alias.clone(),
                    rel_kn: kn_cfg.rel_kn.clone(),
                    rel_col: kn_cfg.rel_col.clone(),
                });
            }
            info!(
                "{} load knowledge ({})",
                db_code,
                db_cfg.knowledge.len()
            );
        }
        Ok(loaded)
    }

    /// Attribute discovery + fewshot sampling + config overrides for one
    /// table.
    async fn load_table(
        &self,
        pool: &SourcePool,
        db_code: &str,
        tb_code: &str,
        tb_cfg: &TableCfg,
    ) -> Result<Vec<Column>> {
        let attrs = pool.introspect_columns(&tb_cfg.tb_name).await?;
        if attrs.is_empty() {
            return Err(TableRagError::SourceDb {
                message: format!("table '{}' has no columns", tb_cfg.tb_name),
            });
        }
        info!("{}.{} load column ({})", db_code, tb_code, attrs.len());

        let col_names: Vec<String> = attrs.iter().map(|a| a.name.clone()).collect();
        let mut fewshot = pool.fetch_fewshot(&tb_cfg.tb_name, &col_names).await?;
        info!("{}.{} load column fewshot", db_code, tb_code);

        let mut columns = Vec::with_capacity(attrs.len());
        for attr in attrs {
            let col_cfg = tb_cfg
                .column
                .as_ref()
                .and_then(|m| m.get(&attr.name))
                .cloned()
                .unwrap_or_default();
            let samples: Vec<String> = fewshot
                .remove(&attr.name)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default();
            columns.push(Column {
                tb_code: tb_code.to_string(),
                col_name: attr.name,
                col_type: Some(attr.data_type),
                col_comment: attr.comment,
                col_meaning: col_cfg.col_meaning,
                field_meaning: col_cfg.field_meaning,
                col_alias: col_cfg.col_alias,
                fewshot: if samples.is_empty() {
                    None
                } else {
                    Some(samples)
                },
                // Config wins over the discovered foreign key
                rel_col: col_cfg.rel_col.or(attr.fk_target),
            });
        }
        Ok(columns)
    }

    async fn save_tb_info(&self, loaded: &LoadedMeta) -> Result<()> {
        if loaded.databases.is_empty() {
            return Ok(());
        }
        self.graph
            .inner()
            .query(
                "FOR $item IN $dbs { \
                     UPSERT type::thing('database', $item.db_code) MERGE $item; \
                 };",
            )
            .bind(("dbs", loaded.databases.clone()))
            .await?;
        info!("save database ({})", loaded.databases.len());

        self.graph
            .inner()
            .query(
                "FOR $item IN $tbs { \
                     LET $id = type::thing('tb', $item.tb_code); \
                     UPSERT $id MERGE { \
                         tb_code: $item.tb_code, \
                         tb_name: $item.tb_name, \
                         tb_meaning: $item.tb_meaning \
                     }; \
                     UPDATE $id SET db = type::thing('database', $item.db_code); \
                 };",
            )
            .bind(("tbs", loaded.tables.clone()))
            .await?;
        info!("save table ({})", loaded.tables.len());
        Ok(())
    }

    async fn save_tb_column(&self, columns: &[Column]) -> Result<()> {
        if columns.is_empty() {
            return Ok(());
        }
        let items: Vec<ColItem> = columns
            .iter()
            .map(ColItem::from_column)
            .collect::<Result<_>>()?;
        self.graph
            .inner()
            .query(
                "FOR $item IN $cols { \
                     LET $id = type::thing('col', [$item.tb_code, $item.col_name]); \
                     UPSERT $id MERGE $item; \
                     UPDATE $id SET tb = type::thing('tb', $item.tb_code); \
                 };",
            )
            .bind(("cols", items))
            .await?;
        info!("save column ({})", columns.len());

        // Deferred REL fix-up: both endpoints exist by now
        let rels: Vec<RelFix> = columns
            .iter()
            .filter_map(|col| {
                let rel = col.rel_col.as_ref()?;
                let (tb_name, col_name) = rel.split_once('.')?;
                Some(RelFix {
                    tb_code: col.tb_code.clone(),
                    col_name: col.col_name.clone(),
                    rel_tb_name: tb_name.to_string(),
                    rel_col_name: col_name.to_string(),
                })
            })
            .collect();
        let rel_count = rels.len();
        if !rels.is_empty() {
            self.graph
                .inner()
                .query(
                    "FOR $rel IN $rels { \
                         LET $src = type::thing('col', [$rel.tb_code, $rel.col_name]); \
                         LET $targets = (SELECT VALUE id FROM col \
                             WHERE col_name = $rel.rel_col_name \
                             AND tb.tb_name = $rel.rel_tb_name \
                             AND tb.db = $src.tb.db); \
                         UPDATE $src SET rel = array::union(rel ?? [], $targets); \
                     };",
                )
                .bind(("rels", rels))
                .await?;
        }
        info!("save column-rel->column ({})", rel_count);
        Ok(())
    }

    async fn save_knowledge(&self, knowledges: &[Knowledge]) -> Result<()> {
        if knowledges.is_empty() {
            return Ok(());
        }
        self.graph
            .inner()
            .query(
                "FOR $item IN $kns { \
                     LET $id = type::thing('kn', [$item.db_code, $item.kn_code]); \
                     UPSERT $id MERGE $item; \
                     UPDATE $id SET db = type::thing('database', $item.db_code); \
                 };",
            )
            .bind(("kns", knowledges.to_vec()))
            .await?;
        info!("save knowledge ({})", knowledges.len());

        // Containment and column links once every kn node exists
        let links: Vec<KnLinkItem> = knowledges
            .iter()
            .map(|kn| KnLinkItem {
                db_code: kn.db_code.clone(),
                kn_code: kn.kn_code,
                rel_kn: kn.rel_kn.clone().unwrap_or_default(),
                rel_col_pairs: kn
                    .rel_col
                    .clone()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|rc| {
                        rc.split_once('.')
                            .map(|(tb, col)| [tb.to_string(), col.to_string()])
                    })
                    .collect(),
            })
            .collect();
        self.graph
            .inner()
            .query(
                "FOR $item IN $links { \
                     LET $id = type::thing('kn', [$item.db_code, $item.kn_code]); \
                     UPDATE $id SET contain = (SELECT VALUE id FROM kn \
                         WHERE db_code = $item.db_code AND kn_code INSIDE $item.rel_kn); \
                     UPDATE $id SET rel_cols = (SELECT VALUE id FROM col \
                         WHERE tb.db.db_code = $item.db_code \
                         AND [tb.tb_name, col_name] INSIDE $item.rel_col_pairs); \
                 };",
            )
            .bind(("links", links))
            .await?;
        info!("save knowledge links ({})", knowledges.len());
        Ok(())
    }

    async fn save_col_embed(&self, columns: &[Column]) -> Result<()> {
        let mut atoms: Vec<ColAtomItem> = Vec::new();
        for col in columns {
            for content in column_atoms(col) {
                atoms.push(ColAtomItem {
                    tb_code: col.tb_code.clone(),
                    col_name: col.col_name.clone(),
                    content,
                    embed: Vec::new(),
                });
            }
        }
        if atoms.is_empty() {
            return Ok(());
        }
        info!("embed column atoms ({})", atoms.len());

        let batches: Vec<Vec<ColAtomItem>> = atoms
            .chunks(EMBED_BATCH_SIZE)
            .map(|c| c.to_vec())
            .collect();
        let results = futures_util::future::join_all(
            batches.into_iter().map(|batch| self.upsert_col_batch(batch)),
        )
        .await;
        for res in results {
            if let Err(e) = res {
                warn!("drop column embed batch: {}", e);
            }
        }
        Ok(())
    }

    async fn upsert_col_batch(&self, mut batch: Vec<ColAtomItem>) -> Result<()> {
        let contents: Vec<String> = batch.iter().map(|a| a.content.clone()).collect();
        let embeds = retry(
            "embed_col_batch",
            BATCH_ATTEMPTS,
            None,
            Backoff::default(),
            || async { self.embedder.embed(&contents).await },
        )
        .await?;
        for (atom, embed) in batch.iter_mut().zip(embeds) {
            atom.embed = embed;
        }
        self.graph
            .inner()
            .query(
                "FOR $item IN $atoms { \
                     LET $id = type::thing('embed_col', $item.content); \
                     UPSERT $id SET content = $item.content, embed = embed ?? $item.embed; \
                     UPDATE $id SET cols = array::union(cols ?? [], \
                         [type::thing('col', [$item.tb_code, $item.col_name])]); \
                 };",
            )
            .bind(("atoms", batch.clone()))
            .await?;
        info!("save embed_col ({})", batch.len());
        Ok(())
    }

    async fn save_kn_embed(&self, knowledges: &[Knowledge]) -> Result<()> {
        let mut atoms: Vec<KnAtomItem> = Vec::new();
        for kn in knowledges {
            for content in knowledge_atoms(kn) {
                atoms.push(KnAtomItem {
                    db_code: kn.db_code.clone(),
                    kn_code: kn.kn_code,
                    content,
                    embed: Vec::new(),
                    tscontent: Vec::new(),
                });
            }
        }
        if atoms.is_empty() {
            return Ok(());
        }

        let batches: Vec<Vec<KnAtomItem>> = atoms
            .chunks(EMBED_BATCH_SIZE)
            .map(|c| c.to_vec())
            .collect();
        let results = futures_util::future::join_all(
            batches.into_iter().map(|batch| self.upsert_kn_batch(batch)),
        )
        .await;
        for res in results {
            if let Err(e) = res {
                warn!("drop knowledge embed batch: {}", e);
            }
        }
        Ok(())
    }

    async fn upsert_kn_batch(&self, mut batch: Vec<KnAtomItem>) -> Result<()> {
        let contents: Vec<String> = batch.iter().map(|a| a.content.clone()).collect();
        let (embeds, tscontents) = retry(
            "embed_kn_batch",
            BATCH_ATTEMPTS,
            None,
            Backoff::default(),
            || async {
                let (embeds, tscontents) = tokio::try_join!(
                    self.embedder.embed(&contents),
                    extract_keywords(contents.clone())
                )?;
                Ok((embeds, tscontents))
            },
        )
        .await?;
        for ((atom, embed), tscontent) in batch.iter_mut().zip(embeds).zip(tscontents) {
            atom.embed = embed;
            atom.tscontent = tscontent;
        }
        info!("process knowledge {}", batch.len());
        self.graph
            .inner()
            .query(
                "FOR $item IN $atoms { \
                     LET $id = type::thing('embed_kn', $item.content); \
                     UPSERT $id SET content = $item.content, \
                         embed = embed ?? $item.embed, \
                         tscontent = tscontent ?? $item.tscontent; \
                     UPDATE $id SET kns = array::union(kns ?? [], \
                         [type::thing('kn', [$item.db_code, $item.kn_code])]); \
                 };",
            )
            .bind(("atoms", batch.clone()))
            .await?;
        info!("save embed_kn ({})", batch.len());
        Ok(())
    }

    async fn save_cell(&self, jobs: &[CellJob]) -> Result<()> {
        for job in jobs {
            if let Err(e) = self.save_cell_table(job).await {
                error!("{}.{} save cell error: {}", job.db_code, job.tb_code, e);
            }
        }
        Ok(())
    }

    async fn save_cell_table(&self, job: &CellJob) -> Result<()> {
        let db_cfg: &DatabaseCfg =
            self.config
                .databases
                .get(&job.db_code)
                .ok_or_else(|| TableRagError::Config {
                    message: format!("unknown db_code '{}'", job.db_code),
                })?;
        let pool = SourcePool::connect(&db_cfg.conn).await?;
        let result = pool
            .for_each_partition(&job.tb_name, &job.col_names, SELECT_BATCH_SIZE, |rows| {
                Box::pin(self.process_cell_partition(job, rows))
            })
            .await;
        pool.close().await;
        result
    }

    async fn process_cell_partition(
        &self,
        job: &CellJob,
        rows: Vec<Vec<Option<String>>>,
    ) -> Result<()> {
        // Distinct indexable strings per column
        let mut distinct: HashMap<usize, HashSet<String>> = HashMap::new();
        for row in rows {
            for (idx, value) in row.into_iter().enumerate() {
                if let Some(v) = value {
                    if is_indexable_cell(&v) {
                        distinct.entry(idx).or_default().insert(v);
                    }
                }
            }
        }

        let mut items: Vec<CellItem> = Vec::new();
        for (idx, values) in distinct {
            for content in values {
                items.push(CellItem {
                    tb_code: job.tb_code.clone(),
                    col_name: job.col_names[idx].clone(),
                    content,
                    embed: Vec::new(),
                    tscontent: Vec::new(),
                });
            }
        }
        info!("process {} cell", job.tb_code);

        let batches: Vec<Vec<CellItem>> = items
            .chunks(PROCESS_BATCH_SIZE)
            .map(|c| c.to_vec())
            .collect();
        let results = futures_util::future::join_all(
            batches.into_iter().map(|batch| self.upsert_cell_batch(batch)),
        )
        .await;
        for res in results {
            if let Err(e) = res {
                warn!("drop cell batch for {}: {}", job.tb_code, e);
            }
        }
        Ok(())
    }

    async fn upsert_cell_batch(&self, mut batch: Vec<CellItem>) -> Result<()> {
        let _permit = CELL_SEMAPHORE
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| TableRagError::Internal {
                message: format!("cell semaphore closed: {}", e),
            })?;
        let contents: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        let (embeds, tscontents) = retry(
            "embed_cell_batch",
            BATCH_ATTEMPTS,
            None,
            Backoff::default(),
            || async {
                let (embeds, tscontents) = tokio::try_join!(
                    self.embedder.embed(&contents),
                    extract_keywords(contents.clone())
                )?;
                Ok((embeds, tscontents))
            },
        )
        .await?;
        for ((cell, embed), tscontent) in batch.iter_mut().zip(embeds).zip(tscontents) {
            cell.embed = embed;
            cell.tscontent = tscontent;
        }
        self.graph
            .inner()
            .query(
                "FOR $item IN $cells { \
                     LET $id = type::thing('cell', $item.content); \
                     UPSERT $id SET content = $item.content, \
                         embed = embed ?? $item.embed, \
                         tscontent = tscontent ?? $item.tscontent; \
                     UPDATE $id SET cols = array::union(cols ?? [], \
                         [type::thing('col', [$item.tb_code, $item.col_name])]); \
                 };",
            )
            .bind(("cells", batch.clone()))
            .await?;
        info!("save cell ({})", batch.len());
        Ok(())
    }
}

/// Sync-set computation: string-typed columns in sync_col (all when null)
/// and not in no_sync_col.
fn sync_job(
    db_code: &str,
    tb_code: &str,
    tb_cfg: &TableCfg,
    columns: &[Column],
) -> Option<CellJob> {
    let is_string = |col: &Column| {
        col.col_type
            .as_deref()
            .map(|t| {
                let t = t.to_lowercase();
                t.contains("varchar") || t.contains("char") || t.contains("text")
            })
            .unwrap_or(false)
    };
    let col_names: Vec<String> = columns
        .iter()
        .filter(|col| is_string(col))
        .filter(|col| {
            tb_cfg
                .sync_col
                .as_ref()
                .is_none_or(|ls| ls.contains(&col.col_name))
        })
        .filter(|col| {
            tb_cfg
                .no_sync_col
                .as_ref()
                .is_none_or(|ls| !ls.contains(&col.col_name))
        })
        .map(|col| col.col_name.clone())
        .collect();
    if col_names.is_empty() {
        return None;
    }
    Some(CellJob {
        db_code: db_code.to_string(),
        tb_code: tb_code.to_string(),
        tb_name: tb_cfg.tb_name.clone(),
        col_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, ty: &str) -> Column {
        Column {
            tb_code: "t1".into(),
            col_name: name.into(),
            col_type: Some(ty.into()),
            ..Default::default()
        }
    }

    fn cfg(sync: Option<Vec<&str>>, no_sync: Option<Vec<&str>>) -> TableCfg {
        TableCfg {
            tb_name: "shipment".into(),
            tb_meaning: "运单".into(),
            sync_col: sync.map(|v| v.into_iter().map(String::from).collect()),
            no_sync_col: no_sync.map(|v| v.into_iter().map(String::from).collect()),
            column: None,
        }
    }

    #[test]
    fn sync_set_defaults_to_all_string_columns() {
        let cols = vec![
            col("status", "character varying"),
            col("qty", "integer"),
            col("note", "text"),
        ];
        let job = sync_job("db", "t1", &cfg(None, None), &cols).unwrap();
        assert_eq!(job.col_names, vec!["status", "note"]);
    }

    #[test]
    fn sync_set_respects_allow_and_deny_lists() {
        let cols = vec![col("status", "varchar"), col("note", "text")];
        let job = sync_job("db", "t1", &cfg(Some(vec!["status", "note"]), Some(vec!["note"])), &cols)
            .unwrap();
        assert_eq!(job.col_names, vec!["status"]);
        assert!(sync_job("db", "t1", &cfg(Some(vec![]), None), &cols).is_none());
    }
}
