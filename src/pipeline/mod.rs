//! Retrieval-augmented context pipeline: a sequence of resumable stages,
//! each reading the session state, computing, and writing its delta back.

pub mod client;
pub mod filter;
pub mod merge;
pub mod state;
pub mod xml;

use crate::error::Result;
use crate::keywords;
use crate::llm::{ChatCompleter, ChatMessage, parse_json};
use crate::model::{ColLookupMap, ColMap, KnMap, ScoredColumn};
use crate::prompts::PromptRegistry;
use client::MetaApi;
use serde_json::json;
use state::{StateStore, optional, require};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Prompt file the pipeline stages draw from.
pub const PROMPT_FILE: &str = "table_rag";

#[derive(Clone)]
pub struct PipelineSettings {
    pub extend_model: String,
    pub filter_model: String,
    pub max_tb_num: usize,
    pub max_col_per_tb: usize,
}

#[derive(Clone)]
pub struct Pipeline {
    pub meta: Arc<dyn MetaApi>,
    pub llm: Arc<dyn ChatCompleter>,
    pub store: Arc<dyn StateStore>,
    pub prompts: PromptRegistry,
    pub settings: PipelineSettings,
}

fn delta(pairs: Vec<(&str, serde_json::Value)>) -> state::State {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

impl Pipeline {
    /// Seed the session: query, keywords, date info, and table captions.
    pub async fn add_context(&self, db_code: &str, query: &str) -> Result<()> {
        let keywords = keywords::extract_keywords(vec![query.to_string()])
            .await?
            .pop()
            .unwrap_or_default();

        let now = chrono::Local::now();
        let cur_date_info = format!(
            "当前日期信息:{},{}",
            now.format("%Y-%m-%d"),
            now.format("%A")
        );

        let (db_info, tb_map) = self.meta.get_table(db_code).await?;
        let mut tb_caption = format!("数据库: {}\n", db_info.db_name);
        for tb in tb_map.values() {
            tb_caption.push_str(&format!(
                "表名: {}，表含义: {}\n",
                tb.tb_name, tb.tb_meaning
            ));
        }

        self.store
            .write(delta(vec![
                ("db_code", json!(db_code)),
                ("query", json!(query)),
                ("keywords", json!(keywords)),
                ("cur_date_info", json!(cur_date_info)),
                ("tb_map", serde_json::to_value(&tb_map)?),
                ("tb_caption", json!(tb_caption)),
            ]))
            .await
    }

    pub async fn recall_knowledge(&self) -> Result<()> {
        let state = self.store.read().await?;
        let db_code: String = require(&state, "db_code")?;
        let query: String = require(&state, "query")?;
        let keywords: Vec<String> = require(&state, "keywords")?;
        let kn_map = self
            .meta
            .retrieve_knowledge(&db_code, &query, &keywords)
            .await?;
        self.store
            .write(delta(vec![(
                "retrieved_knowledge",
                serde_json::to_value(&kn_map)?,
            )]))
            .await
    }

    pub async fn recall_column(&self) -> Result<()> {
        let state = self.store.read().await?;
        let db_code: String = require(&state, "db_code")?;
        let keywords: Vec<String> = match optional::<Vec<String>>(&state, "extracted_columns")? {
            Some(extracted) if !extracted.is_empty() => extracted,
            _ => require(&state, "keywords")?,
        };
        let col_map = self.meta.retrieve_column(&db_code, &keywords).await?;
        self.store
            .write(delta(vec![(
                "retrieved_col_map",
                serde_json::to_value(&col_map)?,
            )]))
            .await
    }

    pub async fn recall_cell(&self) -> Result<()> {
        let state = self.store.read().await?;
        let db_code: String = require(&state, "db_code")?;
        let keywords: Vec<String> = match optional::<Vec<String>>(&state, "extracted_cells")? {
            Some(extracted) if !extracted.is_empty() => extracted,
            _ => require(&state, "keywords")?,
        };
        let cell_map = self.meta.retrieve_cell(&db_code, &keywords).await?;
        self.store
            .write(delta(vec![(
                "retrieved_cell_map",
                serde_json::to_value(&cell_map)?,
            )]))
            .await
    }

    /// LLM-extend the keyword set with likely column-name tokens.
    pub async fn extend_column(&self) -> Result<()> {
        let state = self.store.read().await?;
        let query: String = require(&state, "query")?;
        let keywords: Vec<String> = require(&state, "keywords")?;
        let tb_caption: String = require(&state, "tb_caption")?;

        let vars = std::collections::HashMap::from([
            ("query".to_string(), json!(query)),
            ("keywords".to_string(), json!(serde_json::to_string(&keywords)?)),
            ("table_caption".to_string(), json!(tb_caption)),
        ]);
        let prompt = self.prompts.get(PROMPT_FILE, "extend_column_prompt", &vars)?;
        let resp = self
            .llm
            .complete(
                &self.settings.extend_model,
                &[
                    ChatMessage::system(prompt.system),
                    ChatMessage::user(prompt.user),
                ],
                1,
                Some(Duration::from_secs(5)),
            )
            .await?;
        let extended: Vec<String> = serde_json::from_value(parse_json(&resp)?)?;

        let mut extracted: Vec<String> = Vec::new();
        for word in extended.into_iter().chain(keywords) {
            if !extracted.contains(&word) {
                extracted.push(word);
            }
        }
        self.store
            .write(delta(vec![("extracted_columns", json!(extracted))]))
            .await
    }

    /// LLM-extend the keyword set with likely cell values, disambiguating
    /// along the way.
    pub async fn extend_cell(&self) -> Result<()> {
        let state = self.store.read().await?;
        let query: String = require(&state, "query")?;
        let keywords: Vec<String> = require(&state, "keywords")?;
        let tb_caption: String = require(&state, "tb_caption")?;

        let vars = std::collections::HashMap::from([
            ("query".to_string(), json!(query)),
            ("table_caption".to_string(), json!(tb_caption)),
        ]);
        let prompt = self.prompts.get(PROMPT_FILE, "extend_cell_prompt", &vars)?;
        let resp = self
            .llm
            .complete(
                &self.settings.extend_model,
                &[
                    ChatMessage::system(prompt.system),
                    ChatMessage::user(prompt.user),
                ],
                1,
                Some(Duration::from_secs(5)),
            )
            .await?;
        let extended: Vec<String> = serde_json::from_value(parse_json(&resp)?)?;

        let mut extracted: Vec<String> = Vec::new();
        for word in extended.into_iter().chain(keywords) {
            if !extracted.contains(&word) {
                extracted.push(word);
            }
        }
        self.store
            .write(delta(vec![("extracted_cells", json!(extracted))]))
            .await
    }

    /// Merge cell hits into column hits and prune to the configured caps.
    pub async fn merge_col_cell(&self) -> Result<()> {
        let state = self.store.read().await?;
        let mut col_map: ColMap = require(&state, "retrieved_col_map")?;
        let cell_map: ColMap = require(&state, "retrieved_cell_map")?;
        merge::merge_col_cell_maps(
            &mut col_map,
            cell_map,
            self.settings.max_tb_num,
            self.settings.max_col_per_tb,
        );
        self.store
            .write(delta(vec![("col_map", serde_json::to_value(&col_map)?)]))
            .await
    }

    /// Pull in the columns each selected knowledge references, even when
    /// retrieval missed them.
    pub async fn add_kn_col(&self) -> Result<()> {
        let state = self.store.read().await?;
        let db_code: String = require(&state, "db_code")?;
        let mut col_map: ColMap = require(&state, "col_map")?;
        let kn_map: KnMap = optional(&state, "kn_map")?.unwrap_or_default();

        let pairs: BTreeSet<(String, String)> = kn_map
            .values()
            .flat_map(|kn| kn.rel_col.clone().unwrap_or_default())
            .filter_map(|rc| {
                rc.split_once('.')
                    .map(|(tb, col)| (tb.to_string(), col.to_string()))
            })
            .collect();
        if pairs.is_empty() {
            return Ok(());
        }

        let pairs: Vec<(String, String)> = pairs.into_iter().collect();
        let kn_rel_col_map: ColLookupMap = self.meta.get_column(&db_code, &pairs).await?;
        for (tb_code, name_col_map) in kn_rel_col_map {
            let entry = col_map.entry(tb_code).or_default();
            for (col_name, column) in name_col_map {
                entry.insert(col_name, ScoredColumn {
                    column,
                    score: 0.0,
                    cells: Vec::new(),
                });
            }
        }
        self.store
            .write(delta(vec![("col_map", serde_json::to_value(&col_map)?)]))
            .await
    }

    /// Every stage in order.
    pub async fn run(&self, db_code: &str, query: &str) -> Result<()> {
        self.add_context(db_code, query).await?;
        self.recall_knowledge().await?;
        self.filter_knowledge().await?;
        self.extend_column().await?;
        self.extend_cell().await?;
        self.recall_column().await?;
        self.recall_cell().await?;
        self.merge_col_cell().await?;
        self.add_kn_col().await?;
        self.filter_tb_col().await?;
        Ok(())
    }
}
