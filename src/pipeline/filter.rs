//! LLM filter stages: knowledge selection with rel_kn closure, and the
//! two-stage table/column filter with pipelined handoff.

use super::state::require;
use super::xml::{kn_info_xml_str, tb_col_xml_str};
use super::{PROMPT_FILE, Pipeline, delta};
use crate::error::{Result, TableRagError};
use crate::llm::{ChatCompleter, ChatMessage, parse_json};
use crate::model::{ColMap, KnMap, ScoredColumn, TbMap};
use crate::prompts::PromptRegistry;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use indexmap::IndexMap;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Bound on concurrent table-filter and column-filter LLM calls; the two
/// semaphores are independent so stage B never starves stage A.
const MAX_CONCURRENT: usize = 20;
/// Tables per table-filter batch.
const TABLE_FILTER_BATCH_SIZE: usize = 5;
/// Per-attempt timeout for filter calls.
const FILTER_TIMEOUT: Duration = Duration::from_secs(20);

impl Pipeline {
    /// LLM picks the relevant knowledge codes; the picked set is closed
    /// under rel_kn to fixpoint so multi-hop dependencies survive.
    pub async fn filter_knowledge(&self) -> Result<()> {
        let state = self.store.read().await?;
        let query: String = require(&state, "query")?;
        let retrieved: KnMap = require(&state, "retrieved_knowledge")?;
        if retrieved.is_empty() {
            tracing::info!("knowledge is empty");
            return Ok(());
        }

        let vars = HashMap::from([
            ("knowledge_info".to_string(), json!(kn_info_xml_str(&retrieved))),
            ("query".to_string(), json!(query)),
        ]);
        let prompt = self
            .prompts
            .get(PROMPT_FILE, "knowledge_filter_prompt", &vars)?;
        let resp = self
            .llm
            .complete(
                &self.settings.filter_model,
                &[
                    ChatMessage::system(prompt.system),
                    ChatMessage::user(prompt.user),
                ],
                1,
                Some(FILTER_TIMEOUT),
            )
            .await?;
        let picked: Vec<i64> = serde_json::from_value(parse_json(&resp)?)?;

        let mut needed: HashSet<i64> = picked
            .into_iter()
            .filter(|code| retrieved.contains_key(code))
            .collect();
        // Close over rel_kn until nothing new appears
        loop {
            let additions: HashSet<i64> = needed
                .iter()
                .flat_map(|code| {
                    retrieved
                        .get(code)
                        .and_then(|kn| kn.rel_kn.clone())
                        .unwrap_or_default()
                })
                .filter(|code| !needed.contains(code) && retrieved.contains_key(code))
                .collect();
            if additions.is_empty() {
                break;
            }
            needed.extend(additions);
        }

        let kn_map: KnMap = retrieved
            .into_iter()
            .filter(|(code, _)| needed.contains(code))
            .collect();
        self.store
            .write(delta(vec![("kn_map", serde_json::to_value(&kn_map)?)]))
            .await
    }

    /// Two-stage LLM filter over the merged column map. Stage A screens
    /// tables in batches; stage B filters columns per surviving table,
    /// starting as soon as its table batch finishes.
    pub async fn filter_tb_col(&self) -> Result<()> {
        let state = self.store.read().await?;
        let query: String = require(&state, "query")?;
        let tb_map: TbMap = require(&state, "tb_map")?;
        let col_map: ColMap = require(&state, "col_map")?;
        let cur_date_info: String = require(&state, "cur_date_info")?;

        let table_sem = Arc::new(Semaphore::new(MAX_CONCURRENT));
        let column_sem = Arc::new(Semaphore::new(MAX_CONCURRENT));

        let tb_codes: Vec<String> = col_map.keys().cloned().collect();
        let mut table_futures = FuturesUnordered::new();
        for batch in tb_codes.chunks(TABLE_FILTER_BATCH_SIZE) {
            table_futures.push(self.filter_table(
                batch.to_vec(),
                &tb_map,
                &col_map,
                &query,
                &cur_date_info,
                table_sem.clone(),
            ));
        }

        // Stage B starts per-table column filters as stage-A results land
        let mut column_tasks = Vec::new();
        while let Some(batch_result) = table_futures.next().await {
            let kept = batch_result?;
            for tb_code in kept {
                let Some(cols) = col_map.get(&tb_code) else {
                    continue;
                };
                let Some(tb_info) = tb_map.get(&tb_code) else {
                    continue;
                };
                column_tasks.push(tokio::spawn(filter_column(
                    self.llm.clone(),
                    self.prompts.clone(),
                    self.settings.filter_model.clone(),
                    column_sem.clone(),
                    query.clone(),
                    cur_date_info.clone(),
                    tb_code.clone(),
                    tb_info.clone(),
                    cols.clone(),
                )));
            }
        }

        let mut filtered = ColMap::new();
        for task in column_tasks {
            let result = task.await.map_err(|e| TableRagError::Internal {
                message: format!("column filter task failed: {}", e),
            })??;
            if let Some((tb_code, cols)) = result {
                filtered.insert(tb_code, cols);
            }
        }

        self.store
            .write(delta(vec![("col_map", serde_json::to_value(&filtered)?)]))
            .await
    }

    async fn filter_table(
        &self,
        batch: Vec<String>,
        tb_map: &TbMap,
        col_map: &ColMap,
        query: &str,
        cur_date_info: &str,
        sem: Arc<Semaphore>,
    ) -> Result<Vec<String>> {
        let _permit = sem
            .acquire_owned()
            .await
            .map_err(|e| TableRagError::Internal {
                message: format!("table filter semaphore closed: {}", e),
            })?;
        let sub_col_map: ColMap = batch
            .iter()
            .filter_map(|code| col_map.get(code).map(|cols| (code.clone(), cols.clone())))
            .collect();
        let vars = HashMap::from([
            ("time_info".to_string(), json!(cur_date_info)),
            (
                "table_info".to_string(),
                json!(tb_col_xml_str(tb_map, &sub_col_map)),
            ),
            ("query".to_string(), json!(query)),
        ]);
        let prompt = self.prompts.get(PROMPT_FILE, "table_filter_prompt", &vars)?;
        let resp = self
            .llm
            .complete(
                &self.settings.filter_model,
                &[
                    ChatMessage::system(prompt.system),
                    ChatMessage::user(prompt.user),
                ],
                1,
                Some(FILTER_TIMEOUT),
            )
            .await?;
        let kept: Vec<String> = serde_json::from_value(parse_json(&resp)?)?;
        Ok(kept)
    }
}

/// Stage-B worker: filter one table's columns. Malformed LLM output keeps
/// every column (conservative); an unrelated table or an empty pick drops
/// the table.
#[allow(clippy::too_many_arguments)]
async fn filter_column(
    llm: Arc<dyn ChatCompleter>,
    prompts: PromptRegistry,
    filter_model: String,
    sem: Arc<Semaphore>,
    query: String,
    cur_date_info: String,
    tb_code: String,
    tb_info: crate::model::TableInfo,
    cols: IndexMap<String, ScoredColumn>,
) -> Result<Option<(String, IndexMap<String, ScoredColumn>)>> {
    let _permit = sem
        .acquire_owned()
        .await
        .map_err(|e| TableRagError::Internal {
            message: format!("column filter semaphore closed: {}", e),
        })?;

    let mut tb_map = TbMap::new();
    tb_map.insert(tb_code.clone(), tb_info);
    let mut sub_col_map = ColMap::new();
    sub_col_map.insert(tb_code.clone(), cols.clone());

    let vars = HashMap::from([
        ("time_info".to_string(), json!(cur_date_info)),
        (
            "table_info".to_string(),
            json!(tb_col_xml_str(&tb_map, &sub_col_map)),
        ),
        ("query".to_string(), json!(query)),
    ]);
    let prompt = prompts.get(PROMPT_FILE, "column_filter_prompt", &vars)?;
    let resp = llm
        .complete(
            &filter_model,
            &[
                ChatMessage::system(prompt.system),
                ChatMessage::user(prompt.user),
            ],
            1,
            Some(FILTER_TIMEOUT),
        )
        .await?;
    let parsed = parse_json(&resp)?;

    // Expected shape: {"related_flag": bool, "column_names": [..]}
    let related_flag = parsed.get("related_flag");
    let column_names = parsed.get("column_names");
    let (Some(related_flag), Some(column_names)) = (related_flag, column_names) else {
        // Malformed output: keep the table's columns untouched
        return Ok(Some((tb_code, cols)));
    };

    let related = related_flag.as_bool().unwrap_or(false);
    let names: Vec<String> =
        serde_json::from_value(column_names.clone()).unwrap_or_default();
    if !related || names.is_empty() {
        return Ok(None);
    }

    let filtered: IndexMap<String, ScoredColumn> = names
        .into_iter()
        .filter_map(|name| cols.get(&name).map(|col| (name, col.clone())))
        .collect();
    Ok(Some((tb_code, filtered)))
}
