//! Hybrid retrieval over the metadata graph, scoped by database.
//!
//! Branch recall (vector / full-text) runs in the store; max-aggregation,
//! RRF fusion, CONTAIN closure, and grouping happen here, so the fused
//! ordering is deterministic for a given candidate set.

pub mod fusion;

use crate::embeddings::Embedder;
use crate::error::Result;
use crate::graph::GraphStore;
use crate::model::{ColLookupMap, ColMap, Column, DbInfo, KnMap, Knowledge, ScoredColumn, TbMap};
use crate::retry::{Backoff, retry};
use fusion::{BranchScores, rrf_fuse};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info};

/// Vector hits per query vector on embed_kn / embed_col.
const VEC_SEARCH_NUM: usize = 10;
/// Vector and full-text hits per pair on cell.
const CELL_SEARCH_NUM: usize = 20;
/// Full-text hits on embed_kn.
const FT_SEARCH_NUM: usize = 20;
/// Knowledges surviving fusion.
const KN_FINAL_NUM: usize = 5;
/// Fused cells kept per (vector, keyword) pair.
const CELL_PER_PAIR_NUM: usize = 10;
/// Minimum cosine similarity for a dense hit.
const VEC_THRESHOLD: f64 = 0.7;
/// Brings fused cell scores onto the column score scale.
const CELL_SCORE_SCALE: f64 = 30.0;

/// Graph round-trips in the request path retry on transient store failures.
const QUERY_ATTEMPTS: u32 = 3;

static SENTENCE_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[，。！？；,;!?\s]+").expect("static regex"));

/// A `col` row as stored: field_meaning is JSON text at this boundary.
#[derive(Debug, Clone, Deserialize)]
struct ColRow {
    tb_code: String,
    col_name: String,
    #[serde(default)]
    col_type: Option<String>,
    #[serde(default)]
    col_comment: Option<String>,
    #[serde(default)]
    col_meaning: Option<String>,
    #[serde(default)]
    field_meaning: Option<String>,
    #[serde(default)]
    col_alias: Option<Vec<String>>,
    #[serde(default)]
    fewshot: Option<Vec<String>>,
    #[serde(default)]
    rel_col: Option<String>,
}

impl ColRow {
    fn into_column(self) -> Column {
        let field_meaning = self
            .field_meaning
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok());
        Column {
            tb_code: self.tb_code,
            col_name: self.col_name,
            col_type: self.col_type,
            col_comment: self.col_comment,
            col_meaning: self.col_meaning,
            field_meaning,
            col_alias: self.col_alias,
            fewshot: self.fewshot,
            rel_col: self.rel_col,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DenseKnHit {
    v_score: f64,
    #[serde(default)]
    kns: Vec<Knowledge>,
}

#[derive(Debug, Deserialize)]
struct SparseKnHit {
    f_score: f64,
    #[serde(default)]
    kns: Vec<Knowledge>,
}

#[derive(Debug, Deserialize)]
struct DenseColHit {
    v_score: f64,
    #[serde(default)]
    cols: Vec<ColRow>,
}

#[derive(Debug, Deserialize)]
struct DenseCellHit {
    content: String,
    v_score: f64,
    #[serde(default)]
    cols: Vec<ColRow>,
}

#[derive(Debug, Deserialize)]
struct SparseCellHit {
    content: String,
    f_score: f64,
    #[serde(default)]
    cols: Vec<ColRow>,
}

#[derive(Debug, Deserialize)]
struct DbRow {
    db_code: String,
    db_name: String,
}

#[derive(Debug, Deserialize)]
struct TbRow {
    tb_code: String,
    tb_name: String,
    tb_meaning: String,
}

#[derive(Clone)]
pub struct Retriever {
    graph: GraphStore,
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    pub fn new(graph: GraphStore, embedder: Arc<dyn Embedder>) -> Self {
        Self { graph, embedder }
    }

    /// All tables of a database.
    pub async fn get_tb_info(&self, db_code: &str) -> Result<(DbInfo, TbMap)> {
        info!("query table by db_code: {}", db_code);
        let db_code = db_code.to_string();
        let (db_rows, tb_rows) = retry(
            "get_tb_info",
            QUERY_ATTEMPTS,
            None,
            Backoff::default(),
            || async {
                let mut response = self
                    .graph
                    .inner()
                    .query("SELECT db_code, db_name FROM database WHERE db_code = $db_code")
                    .query(
                        "SELECT tb_code, tb_name, tb_meaning FROM tb \
                         WHERE db.db_code = $db_code ORDER BY tb_code",
                    )
                    .bind(("db_code", db_code.clone()))
                    .await?;
                let db_rows: Vec<DbRow> = response.take(0)?;
                let tb_rows: Vec<TbRow> = response.take(1)?;
                Ok((db_rows, tb_rows))
            },
        )
        .await?;

        let db_info = db_rows
            .into_iter()
            .next()
            .map(|r| DbInfo {
                db_code: r.db_code,
                db_name: r.db_name,
            })
            .unwrap_or_default();
        let tb_map = tb_rows
            .into_iter()
            .map(|r| {
                (
                    r.tb_code,
                    crate::model::TableInfo {
                        tb_name: r.tb_name,
                        tb_meaning: r.tb_meaning,
                    },
                )
            })
            .collect();
        Ok((db_info, tb_map))
    }

    /// Column descriptors looked up by `(tb_name, col_name)` pairs.
    /// Returns an empty map on store failure.
    pub async fn get_col_by_name(
        &self,
        db_code: &str,
        tb_col_pairs: &[(String, String)],
    ) -> ColLookupMap {
        match self.get_col_by_name_inner(db_code, tb_col_pairs).await {
            Ok(map) => map,
            Err(e) => {
                error!("get_col_by_name failed: {}", e);
                ColLookupMap::new()
            }
        }
    }

    async fn get_col_by_name_inner(
        &self,
        db_code: &str,
        tb_col_pairs: &[(String, String)],
    ) -> Result<ColLookupMap> {
        info!(
            "query column by db_code: {}, pairs: {:?}",
            db_code, tb_col_pairs
        );
        let mut col_map = ColLookupMap::new();
        for (tb_name, col_name) in tb_col_pairs {
            let (db_code, tb_name, col_name) =
                (db_code.to_string(), tb_name.clone(), col_name.clone());
            let rows: Vec<ColRow> = retry(
                "get_col_by_name",
                QUERY_ATTEMPTS,
                None,
                Backoff::default(),
                || async {
                    let mut response = self
                        .graph
                        .inner()
                        .query(
                            "SELECT * FROM col WHERE col_name = $col_name \
                             AND tb.tb_name = $tb_name AND tb.db.db_code = $db_code",
                        )
                        .bind(("db_code", db_code.clone()))
                        .bind(("tb_name", tb_name.clone()))
                        .bind(("col_name", col_name.clone()))
                        .await?;
                    Ok(response.take::<Vec<ColRow>>(0)?)
                },
            )
            .await?;
            for row in rows {
                let column = row.into_column();
                col_map
                    .entry(column.tb_code.clone())
                    .or_default()
                    .entry(column.col_name.clone())
                    .or_insert(column);
            }
        }
        Ok(col_map)
    }

    /// Hybrid knowledge retrieval. Returns an empty map on store failure.
    pub async fn retrieve_knowledge(&self, db_code: &str, query: &str, keywords: &[String]) -> KnMap {
        match self.retrieve_knowledge_inner(db_code, query, keywords).await {
            Ok(map) => map,
            Err(e) => {
                error!("retrieve_knowledge failed: {}", e);
                KnMap::new()
            }
        }
    }

    async fn retrieve_knowledge_inner(
        &self,
        db_code: &str,
        query: &str,
        keywords: &[String],
    ) -> Result<KnMap> {
        info!(
            "query knowledge by db_code: {}, query: {}, keywords: {:?}",
            db_code, query, keywords
        );
        let sub_statements = split_sub_statements(query);
        let embeds = self.embedder.embed(&sub_statements).await?;
        let tsquery = keywords.join(" ");

        let mut candidates: BTreeMap<i64, BranchScores> = BTreeMap::new();
        let mut seen: HashMap<i64, Knowledge> = HashMap::new();

        // Dense branch: each sub-statement vector independently
        for vec in &embeds {
            let hits = self.dense_kn_hits(vec.clone()).await?;
            for hit in hits {
                for kn in hit.kns {
                    if kn.db_code != db_code {
                        continue;
                    }
                    candidates.entry(kn.kn_code).or_default().absorb(BranchScores {
                        dense: hit.v_score,
                        sparse: 0.0,
                    });
                    seen.entry(kn.kn_code).or_insert(kn);
                }
            }
        }

        // Sparse branch: one OR-joined full-text query
        if !tsquery.trim().is_empty() {
            let hits = self.sparse_kn_hits(tsquery).await?;
            for hit in hits {
                for kn in hit.kns {
                    if kn.db_code != db_code {
                        continue;
                    }
                    candidates.entry(kn.kn_code).or_default().absorb(BranchScores {
                        dense: 0.0,
                        sparse: hit.f_score,
                    });
                    seen.entry(kn.kn_code).or_insert(kn);
                }
            }
        }

        let fused = rrf_fuse(&candidates, KN_FINAL_NUM);

        // Expand transitively along CONTAIN (rel_kn targets), then sort by
        // kn_code ascending via the BTreeMap.
        let mut kn_map = KnMap::new();
        let mut frontier: Vec<i64> = fused.iter().map(|(code, _)| *code).collect();
        let mut visited: HashSet<i64> = frontier.iter().copied().collect();
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for code in frontier {
                let kn = match seen.get(&code) {
                    Some(kn) => kn.clone(),
                    None => match self.fetch_kn(db_code, code).await? {
                        Some(kn) => kn,
                        None => continue,
                    },
                };
                for child in kn.rel_kn.clone().unwrap_or_default() {
                    if visited.insert(child) {
                        next.push(child);
                    }
                }
                kn_map.insert(code, kn);
            }
            frontier = next;
        }
        Ok(kn_map)
    }

    async fn dense_kn_hits(&self, vec: Vec<f32>) -> Result<Vec<DenseKnHit>> {
        retry("dense_kn", QUERY_ATTEMPTS, None, Backoff::default(), || {
            let vec = vec.clone();
            async move {
                let mut response = self
                    .graph
                    .inner()
                    .query(format!(
                        "SELECT vector::similarity::cosine(embed, $vec) AS v_score, kns \
                         FROM embed_kn WHERE embed <|{VEC_SEARCH_NUM},40|> $vec \
                         AND vector::similarity::cosine(embed, $vec) > $threshold \
                         FETCH kns"
                    ))
                    .bind(("vec", vec))
                    .bind(("threshold", VEC_THRESHOLD))
                    .await?;
                Ok(response.take::<Vec<DenseKnHit>>(0)?)
            }
        })
        .await
    }

    async fn sparse_kn_hits(&self, tsquery: String) -> Result<Vec<SparseKnHit>> {
        retry("sparse_kn", QUERY_ATTEMPTS, None, Backoff::default(), || {
            let tsquery = tsquery.clone();
            async move {
                let mut response = self
                    .graph
                    .inner()
                    .query(format!(
                        "SELECT search::score(0) AS f_score, kns FROM embed_kn \
                         WHERE tscontent @0@ $tsquery \
                         ORDER BY f_score DESC LIMIT {FT_SEARCH_NUM} FETCH kns"
                    ))
                    .bind(("tsquery", tsquery))
                    .await?;
                Ok(response.take::<Vec<SparseKnHit>>(0)?)
            }
        })
        .await
    }

    async fn fetch_kn(&self, db_code: &str, kn_code: i64) -> Result<Option<Knowledge>> {
        let db_code = db_code.to_string();
        retry("fetch_kn", QUERY_ATTEMPTS, None, Backoff::default(), || {
            let db_code = db_code.clone();
            async move {
                let mut response = self
                    .graph
                    .inner()
                    .query("SELECT * FROM kn WHERE db_code = $db_code AND kn_code = $kn_code")
                    .bind(("db_code", db_code))
                    .bind(("kn_code", kn_code))
                    .await?;
                let rows: Vec<Knowledge> = response.take(0)?;
                Ok(rows.into_iter().next())
            }
        })
        .await
    }

    /// Dense column retrieval. Returns an empty map on store failure.
    pub async fn retrieve_column(&self, db_code: &str, keywords: &[String]) -> ColMap {
        match self.retrieve_column_inner(db_code, keywords).await {
            Ok(map) => map,
            Err(e) => {
                error!("retrieve_column failed: {}", e);
                ColMap::new()
            }
        }
    }

    async fn retrieve_column_inner(&self, db_code: &str, keywords: &[String]) -> Result<ColMap> {
        info!(
            "query column by db_code: {}, keywords: {:?}",
            db_code, keywords
        );
        let embeds = self.embedder.embed(keywords).await?;
        let allowed = self.tb_codes_of(db_code).await?;

        // (tb_code, col_name) -> (column, best score over matching atoms)
        let mut scored: HashMap<(String, String), (Column, f64)> = HashMap::new();
        for vec in embeds {
            let hits = self.dense_col_hits(vec).await?;
            for hit in hits {
                for row in hit.cols {
                    if !allowed.contains(&row.tb_code) {
                        continue;
                    }
                    let key = (row.tb_code.clone(), row.col_name.clone());
                    let entry = scored
                        .entry(key)
                        .or_insert_with(|| (row.into_column(), f64::MIN));
                    entry.1 = entry.1.max(hit.v_score);
                }
            }
        }

        // Sort by score descending; insertion order carries the ranking
        let mut ranked: Vec<(Column, f64)> = scored.into_values().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (&a.0.tb_code, &a.0.col_name).cmp(&(&b.0.tb_code, &b.0.col_name)))
        });

        let mut col_map = ColMap::new();
        for (column, score) in ranked {
            col_map
                .entry(column.tb_code.clone())
                .or_default()
                .insert(column.col_name.clone(), ScoredColumn {
                    column,
                    score,
                    cells: Vec::new(),
                });
        }
        Ok(col_map)
    }

    async fn dense_col_hits(&self, vec: Vec<f32>) -> Result<Vec<DenseColHit>> {
        retry("dense_col", QUERY_ATTEMPTS, None, Backoff::default(), || {
            let vec = vec.clone();
            async move {
                let mut response = self
                    .graph
                    .inner()
                    .query(format!(
                        "SELECT vector::similarity::cosine(embed, $vec) AS v_score, cols \
                         FROM embed_col WHERE embed <|{VEC_SEARCH_NUM},40|> $vec \
                         AND vector::similarity::cosine(embed, $vec) > $threshold \
                         FETCH cols"
                    ))
                    .bind(("vec", vec))
                    .bind(("threshold", VEC_THRESHOLD))
                    .await?;
                Ok(response.take::<Vec<DenseColHit>>(0)?)
            }
        })
        .await
    }

    /// Hybrid cell retrieval. Returns an empty map on store failure.
    pub async fn retrieve_cell(&self, db_code: &str, keywords: &[String]) -> ColMap {
        match self.retrieve_cell_inner(db_code, keywords).await {
            Ok(map) => map,
            Err(e) => {
                error!("retrieve_cell failed: {}", e);
                ColMap::new()
            }
        }
    }

    async fn retrieve_cell_inner(&self, db_code: &str, keywords: &[String]) -> Result<ColMap> {
        info!("query cell by db_code: {}, keywords: {:?}", db_code, keywords);
        let embeds = self.embedder.embed(keywords).await?;
        let allowed = self.tb_codes_of(db_code).await?;

        // content -> best fused score across all (vector, keyword) pairs
        let mut best: BTreeMap<String, f64> = BTreeMap::new();
        let mut owners: HashMap<String, Vec<ColRow>> = HashMap::new();

        for (vec, keyword) in embeds.into_iter().zip(keywords.iter()) {
            let mut pair_candidates: BTreeMap<String, BranchScores> = BTreeMap::new();

            for hit in self.dense_cell_hits(vec).await? {
                let cols: Vec<ColRow> = hit
                    .cols
                    .into_iter()
                    .filter(|c| allowed.contains(&c.tb_code))
                    .collect();
                if cols.is_empty() {
                    continue;
                }
                pair_candidates
                    .entry(hit.content.clone())
                    .or_default()
                    .absorb(BranchScores {
                        dense: hit.v_score,
                        sparse: 0.0,
                    });
                owners.entry(hit.content).or_insert(cols);
            }

            for hit in self.sparse_cell_hits(keyword.clone()).await? {
                let cols: Vec<ColRow> = hit
                    .cols
                    .into_iter()
                    .filter(|c| allowed.contains(&c.tb_code))
                    .collect();
                if cols.is_empty() {
                    continue;
                }
                pair_candidates
                    .entry(hit.content.clone())
                    .or_default()
                    .absorb(BranchScores {
                        dense: 0.0,
                        sparse: hit.f_score,
                    });
                owners.entry(hit.content).or_insert(cols);
            }

            for (content, rrf_score) in rrf_fuse(&pair_candidates, CELL_PER_PAIR_NUM) {
                let entry = best.entry(content).or_insert(f64::MIN);
                *entry = entry.max(rrf_score);
            }
        }

        // Group by owning column; distinct cells, max score, scaled
        let mut ranked: Vec<(String, f64)> = best.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut cell_map = ColMap::new();
        for (content, rrf_score) in ranked {
            let score = rrf_score * CELL_SCORE_SCALE;
            let Some(cols) = owners.remove(&content) else {
                continue;
            };
            for row in cols {
                let tb_code = row.tb_code.clone();
                let col_name = row.col_name.clone();
                match cell_map.entry(tb_code).or_default().entry(col_name) {
                    indexmap::map::Entry::Occupied(mut occupied) => {
                        let existing = occupied.get_mut();
                        if !existing.cells.contains(&content) {
                            existing.cells.push(content.clone());
                        }
                        existing.score = existing.score.max(score);
                    }
                    indexmap::map::Entry::Vacant(vacant) => {
                        vacant.insert(ScoredColumn {
                            column: row.into_column(),
                            score,
                            cells: vec![content.clone()],
                        });
                    }
                }
            }
        }
        Ok(cell_map)
    }

    async fn dense_cell_hits(&self, vec: Vec<f32>) -> Result<Vec<DenseCellHit>> {
        retry("dense_cell", QUERY_ATTEMPTS, None, Backoff::default(), || {
            let vec = vec.clone();
            async move {
                let mut response = self
                    .graph
                    .inner()
                    .query(format!(
                        "SELECT content, vector::similarity::cosine(embed, $vec) AS v_score, cols \
                         FROM cell WHERE embed <|{CELL_SEARCH_NUM},40|> $vec \
                         AND vector::similarity::cosine(embed, $vec) > $threshold \
                         FETCH cols"
                    ))
                    .bind(("vec", vec))
                    .bind(("threshold", VEC_THRESHOLD))
                    .await?;
                Ok(response.take::<Vec<DenseCellHit>>(0)?)
            }
        })
        .await
    }

    async fn sparse_cell_hits(&self, keyword: String) -> Result<Vec<SparseCellHit>> {
        retry("sparse_cell", QUERY_ATTEMPTS, None, Backoff::default(), || {
            let keyword = keyword.clone();
            async move {
                let mut response = self
                    .graph
                    .inner()
                    .query(format!(
                        "SELECT content, search::score(0) AS f_score, cols FROM cell \
                         WHERE tscontent @0@ $keyword \
                         ORDER BY f_score DESC LIMIT {CELL_SEARCH_NUM} FETCH cols"
                    ))
                    .bind(("keyword", keyword))
                    .await?;
                Ok(response.take::<Vec<SparseCellHit>>(0)?)
            }
        })
        .await
    }

    /// tb_codes belonging to a database, for scoping candidates.
    async fn tb_codes_of(&self, db_code: &str) -> Result<HashSet<String>> {
        let db_code = db_code.to_string();
        let rows: Vec<String> = retry(
            "tb_codes_of",
            QUERY_ATTEMPTS,
            None,
            Backoff::default(),
            || {
                let db_code = db_code.clone();
                async move {
                    let mut response = self
                        .graph
                        .inner()
                        .query("SELECT VALUE tb_code FROM tb WHERE db.db_code = $db_code")
                        .bind(("db_code", db_code))
                        .await?;
                    Ok(response.take::<Vec<String>>(0)?)
                }
            },
        )
        .await?;
        Ok(rows.into_iter().collect())
    }
}

/// Split a query into sub-statements the way `retrieve_knowledge` does.
pub fn split_sub_statements(query: &str) -> Vec<String> {
    SENTENCE_SPLIT
        .split(query)
        .map(|s| s.trim().to_string())
        .filter(|s| s.chars().count() >= 3)
        .collect()
}
