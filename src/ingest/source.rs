//! Source-database access: introspection, fewshot sampling, and cell
//! streaming over MySQL / PostgreSQL via sqlx.
//!
//! Engines are created per session and closed after use; ingestion is not
//! a hot path, so there is no shared connection pool.

use crate::config::SqlConfig;
use crate::error::{Result, TableRagError};
use futures_util::TryStreamExt;
use futures_util::future::BoxFuture;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::{MySqlPool, PgPool, Row};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Rows scanned for fewshot sampling.
const FEWSHOT_SCAN_LIMIT: usize = 10_000;
/// Distinct sample values kept per column.
const FEWSHOT_QUOTA: usize = 5;
/// Sample value truncation, in chars.
const FEWSHOT_MAX_CHARS: usize = 300;

/// Discovered column attributes plus the foreign-key target, if any.
#[derive(Debug, Clone)]
pub struct ColumnAttr {
    pub name: String,
    pub data_type: String,
    pub comment: Option<String>,
    /// "referenced_table.referenced_column"
    pub fk_target: Option<String>,
}

pub enum SourcePool {
    MySql(MySqlPool),
    Postgres(PgPool),
}

impl SourcePool {
    pub async fn connect(cfg: &SqlConfig) -> Result<Self> {
        match cfg.db_type.as_str() {
            "mysql" => {
                let url = format!(
                    "mysql://{}:{}@{}:{}/{}",
                    cfg.user, cfg.password, cfg.host, cfg.port, cfg.database
                );
                let pool = MySqlPoolOptions::new()
                    .max_connections(1)
                    .connect(&url)
                    .await?;
                Ok(SourcePool::MySql(pool))
            }
            "postgresql" => {
                let url = format!(
                    "postgres://{}:{}@{}:{}/{}",
                    cfg.user, cfg.password, cfg.host, cfg.port, cfg.database
                );
                let pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect(&url)
                    .await?;
                Ok(SourcePool::Postgres(pool))
            }
            other => Err(TableRagError::Config {
                message: format!("unsupported db_type '{}'", other),
            }),
        }
    }

    pub async fn close(&self) {
        match self {
            SourcePool::MySql(pool) => pool.close().await,
            SourcePool::Postgres(pool) => pool.close().await,
        }
    }

    /// Column names, types, comments, and FK targets from information_schema.
    pub async fn introspect_columns(&self, tb_name: &str) -> Result<Vec<ColumnAttr>> {
        let mut attrs: Vec<ColumnAttr> = Vec::new();
        match self {
            SourcePool::MySql(pool) => {
                let rows = sqlx::query(
                    "SELECT column_name, data_type, column_comment \
                     FROM information_schema.columns \
                     WHERE table_schema = DATABASE() AND table_name = ? \
                     ORDER BY ordinal_position",
                )
                .bind(tb_name)
                .fetch_all(pool)
                .await?;
                for row in rows {
                    let comment: Option<String> = row.try_get("column_comment")?;
                    attrs.push(ColumnAttr {
                        name: row.try_get("column_name")?,
                        data_type: row.try_get("data_type")?,
                        comment: comment.filter(|c| !c.is_empty()),
                        fk_target: None,
                    });
                }
                let fk_rows = sqlx::query(
                    "SELECT column_name, referenced_table_name, referenced_column_name \
                     FROM information_schema.key_column_usage \
                     WHERE table_schema = DATABASE() AND table_name = ? \
                     AND referenced_table_name IS NOT NULL",
                )
                .bind(tb_name)
                .fetch_all(pool)
                .await?;
                let mut fk_map: HashMap<String, String> = HashMap::new();
                for row in fk_rows {
                    let col: String = row.try_get("column_name")?;
                    let ref_tb: String = row.try_get("referenced_table_name")?;
                    let ref_col: String = row.try_get("referenced_column_name")?;
                    fk_map.insert(col, format!("{}.{}", ref_tb, ref_col));
                }
                for attr in &mut attrs {
                    attr.fk_target = fk_map.remove(&attr.name);
                }
            }
            SourcePool::Postgres(pool) => {
                let rows = sqlx::query(
                    "SELECT c.column_name, c.data_type, pgd.description AS column_comment \
                     FROM information_schema.columns c \
                     LEFT JOIN pg_catalog.pg_statio_all_tables st \
                       ON st.relname = c.table_name AND st.schemaname = c.table_schema \
                     LEFT JOIN pg_catalog.pg_description pgd \
                       ON pgd.objoid = st.relid AND pgd.objsubid = c.ordinal_position \
                     WHERE c.table_schema = 'public' AND c.table_name = $1 \
                     ORDER BY c.ordinal_position",
                )
                .bind(tb_name)
                .fetch_all(pool)
                .await?;
                for row in rows {
                    let comment: Option<String> = row.try_get("column_comment")?;
                    attrs.push(ColumnAttr {
                        name: row.try_get("column_name")?,
                        data_type: row.try_get("data_type")?,
                        comment: comment.filter(|c| !c.is_empty()),
                        fk_target: None,
                    });
                }
                let fk_rows = sqlx::query(
                    "SELECT kcu.column_name, \
                            ccu.table_name AS referenced_table_name, \
                            ccu.column_name AS referenced_column_name \
                     FROM information_schema.table_constraints tc \
                     JOIN information_schema.key_column_usage kcu \
                       ON tc.constraint_name = kcu.constraint_name \
                      AND tc.table_schema = kcu.table_schema \
                     JOIN information_schema.constraint_column_usage ccu \
                       ON ccu.constraint_name = tc.constraint_name \
                      AND ccu.table_schema = tc.table_schema \
                     WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_name = $1",
                )
                .bind(tb_name)
                .fetch_all(pool)
                .await?;
                let mut fk_map: HashMap<String, String> = HashMap::new();
                for row in fk_rows {
                    let col: String = row.try_get("column_name")?;
                    let ref_tb: String = row.try_get("referenced_table_name")?;
                    let ref_col: String = row.try_get("referenced_column_name")?;
                    fk_map.insert(col, format!("{}.{}", ref_tb, ref_col));
                }
                for attr in &mut attrs {
                    attr.fk_target = fk_map.remove(&attr.name);
                }
            }
        }
        Ok(attrs)
    }

    /// Render every requested column as text, so sampling works on any type.
    fn select_as_text(&self, tb_name: &str, col_names: &[String], limit: Option<usize>) -> String {
        let projection: Vec<String> = match self {
            SourcePool::MySql(_) => col_names
                .iter()
                .map(|c| format!("CAST(`{c}` AS CHAR) AS `{c}`"))
                .collect(),
            SourcePool::Postgres(_) => col_names
                .iter()
                .map(|c| format!("\"{c}\"::text AS \"{c}\""))
                .collect(),
        };
        let table = match self {
            SourcePool::MySql(_) => format!("`{tb_name}`"),
            SourcePool::Postgres(_) => format!("\"{tb_name}\""),
        };
        let mut sql = format!("SELECT {} FROM {}", projection.join(", "), table);
        if let Some(n) = limit {
            sql.push_str(&format!(" LIMIT {n}"));
        }
        sql
    }

    /// Fewshot sampling: up to 5 distinct non-null, non-blank, non-numeric
    /// values per column, truncated to 300 chars. Stops scanning as soon
    /// as every column reached its quota.
    pub async fn fetch_fewshot(
        &self,
        tb_name: &str,
        col_names: &[String],
    ) -> Result<HashMap<String, BTreeSet<String>>> {
        let sql = self.select_as_text(tb_name, col_names, Some(FEWSHOT_SCAN_LIMIT));
        tracing::debug!("fewshot scan: {}", sql);
        let mut samples: HashMap<String, BTreeSet<String>> = col_names
            .iter()
            .map(|c| (c.clone(), BTreeSet::new()))
            .collect();
        let mut pending: HashSet<usize> = (0..col_names.len()).collect();

        let mut scan = |values: Vec<Option<String>>| {
            let done: Vec<usize> = pending
                .iter()
                .copied()
                .filter(|&idx| {
                    let Some(Some(raw)) = values.get(idx).map(|v| v.as_ref()) else {
                        return false;
                    };
                    if raw.trim().is_empty() || crate::keywords::is_numeric(raw) {
                        return false;
                    }
                    let value: String = raw.chars().take(FEWSHOT_MAX_CHARS).collect();
                    let set = samples.get_mut(&col_names[idx]).expect("known column");
                    set.insert(value);
                    set.len() >= FEWSHOT_QUOTA
                })
                .collect();
            for idx in done {
                pending.remove(&idx);
            }
            pending.is_empty()
        };

        match self {
            SourcePool::MySql(pool) => {
                let mut rows = sqlx::query(&sql).fetch(pool);
                while let Some(row) = rows.try_next().await? {
                    let values = (0..col_names.len())
                        .map(|i| row.try_get::<Option<String>, usize>(i))
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    if scan(values) {
                        break;
                    }
                }
            }
            SourcePool::Postgres(pool) => {
                let mut rows = sqlx::query(&sql).fetch(pool);
                while let Some(row) = rows.try_next().await? {
                    let values = (0..col_names.len())
                        .map(|i| row.try_get::<Option<String>, usize>(i))
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    if scan(values) {
                        break;
                    }
                }
            }
        }
        Ok(samples)
    }

    /// Stream the sync-set columns of a table in row partitions, invoking
    /// `handle` once per partition.
    pub async fn for_each_partition<'a, F>(
        &self,
        tb_name: &str,
        col_names: &[String],
        partition_size: usize,
        mut handle: F,
    ) -> Result<()>
    where
        F: FnMut(Vec<Vec<Option<String>>>) -> BoxFuture<'a, Result<()>>,
    {
        let sql = self.select_as_text(tb_name, col_names, None);
        tracing::info!("execute sql statement: {}", sql);
        let mut partition: Vec<Vec<Option<String>>> = Vec::with_capacity(partition_size);

        match self {
            SourcePool::MySql(pool) => {
                let mut rows = sqlx::query(&sql).fetch(pool);
                while let Some(row) = rows.try_next().await? {
                    let values = (0..col_names.len())
                        .map(|i| row.try_get::<Option<String>, usize>(i))
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    partition.push(values);
                    if partition.len() >= partition_size {
                        handle(std::mem::take(&mut partition)).await?;
                    }
                }
            }
            SourcePool::Postgres(pool) => {
                let mut rows = sqlx::query(&sql).fetch(pool);
                while let Some(row) = rows.try_next().await? {
                    let values = (0..col_names.len())
                        .map(|i| row.try_get::<Option<String>, usize>(i))
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    partition.push(values);
                    if partition.len() >= partition_size {
                        handle(std::mem::take(&mut partition)).await?;
                    }
                }
            }
        }
        if !partition.is_empty() {
            handle(partition).await?;
        }
        Ok(())
    }
}
