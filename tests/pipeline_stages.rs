//! Stage-level pipeline tests over in-memory state, a scripted LLM, and a
//! canned metadata service.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tablerag::error::Result;
use tablerag::llm::{ChatCompleter, ChatMessage};
use tablerag::model::{
    ColLookupMap, ColMap, Column, DbInfo, KnMap, Knowledge, ScoredColumn, TableInfo, TbMap,
};
use tablerag::pipeline::client::MetaApi;
use tablerag::pipeline::state::{MemoryStateStore, StateStore};
use tablerag::pipeline::{Pipeline, PipelineSettings};
use tablerag::prompts::PromptRegistry;
use tokio::sync::Mutex;

struct FakeLlm {
    handler: Box<dyn Fn(usize, &[ChatMessage]) -> String + Send + Sync>,
    calls: AtomicUsize,
}

impl FakeLlm {
    fn new(handler: impl Fn(usize, &[ChatMessage]) -> String + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ChatCompleter for FakeLlm {
    async fn complete(
        &self,
        _model_name: &str,
        messages: &[ChatMessage],
        _retries: u32,
        _timeout: Option<Duration>,
    ) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.handler)(n, messages))
    }
}

#[derive(Default)]
struct FakeMeta {
    db_info: DbInfo,
    tb_map: TbMap,
    kn_map: KnMap,
    col_map: ColMap,
    cell_map: ColMap,
    lookup: ColLookupMap,
    last_column_keywords: Mutex<Vec<String>>,
}

#[async_trait]
impl MetaApi for FakeMeta {
    async fn get_table(&self, _db_code: &str) -> Result<(DbInfo, TbMap)> {
        Ok((self.db_info.clone(), self.tb_map.clone()))
    }

    async fn get_column(
        &self,
        _db_code: &str,
        _tb_col_tuple_list: &[(String, String)],
    ) -> Result<ColLookupMap> {
        Ok(self.lookup.clone())
    }

    async fn retrieve_knowledge(
        &self,
        _db_code: &str,
        _query: &str,
        _keywords: &[String],
    ) -> Result<KnMap> {
        Ok(self.kn_map.clone())
    }

    async fn retrieve_column(&self, _db_code: &str, keywords: &[String]) -> Result<ColMap> {
        *self.last_column_keywords.lock().await = keywords.to_vec();
        Ok(self.col_map.clone())
    }

    async fn retrieve_cell(&self, _db_code: &str, _keywords: &[String]) -> Result<ColMap> {
        Ok(self.cell_map.clone())
    }
}

fn pipeline_with(
    meta: Arc<FakeMeta>,
    llm: FakeLlm,
    max_tb_num: usize,
    max_col_per_tb: usize,
) -> Pipeline {
    Pipeline {
        meta,
        llm: Arc::new(llm),
        store: Arc::new(MemoryStateStore::default()),
        prompts: PromptRegistry::new("prompts"),
        settings: PipelineSettings {
            extend_model: "extender".into(),
            filter_model: "filterer".into(),
            max_tb_num,
            max_col_per_tb,
        },
    }
}

fn seed(pairs: Vec<(&str, serde_json::Value)>) -> serde_json::Map<String, serde_json::Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn knowledge(code: i64, name: &str, rel_kn: Option<Vec<i64>>, rel_col: Option<Vec<&str>>) -> Knowledge {
    Knowledge {
        db_code: "pg_demo".into(),
        kn_code: code,
        kn_name: name.into(),
        kn_desc: format!("{name}的定义"),
        rel_kn,
        rel_col: rel_col.map(|v| v.into_iter().map(String::from).collect()),
        ..Default::default()
    }
}

fn scored(tb: &str, name: &str, score: f64) -> ScoredColumn {
    ScoredColumn {
        column: Column {
            tb_code: tb.into(),
            col_name: name.into(),
            ..Default::default()
        },
        score,
        cells: Vec::new(),
    }
}

fn one_table_state(cols: &[&str]) -> serde_json::Map<String, serde_json::Value> {
    let mut tb_map = TbMap::new();
    tb_map.insert(
        "t1".into(),
        TableInfo {
            tb_name: "shipment".into(),
            tb_meaning: "运单".into(),
        },
    );
    let mut col_map = ColMap::new();
    let mut name_col_map = IndexMap::new();
    for (idx, name) in cols.iter().enumerate() {
        name_col_map.insert(name.to_string(), scored("t1", name, 1.0 + idx as f64));
    }
    col_map.insert("t1".into(), name_col_map);
    seed(vec![
        ("query", json!("查审批状态")),
        ("cur_date_info", json!("当前日期信息:2026-08-01,Saturday")),
        ("tb_map", serde_json::to_value(&tb_map).unwrap()),
        ("col_map", serde_json::to_value(&col_map).unwrap()),
    ])
}

#[tokio::test]
async fn add_context_seeds_keywords_and_captions() {
    let mut tb_map = TbMap::new();
    tb_map.insert(
        "t1".into(),
        TableInfo {
            tb_name: "shipment".into(),
            tb_meaning: "冷链运单".into(),
        },
    );
    let meta = FakeMeta {
        db_info: DbInfo {
            db_code: "pg_demo".into(),
            db_name: "冷链医药合规库".into(),
        },
        tb_map,
        ..Default::default()
    };
    let pipeline = pipeline_with(Arc::new(meta), FakeLlm::new(|_, _| String::new()), 5, 8);

    pipeline.add_context("pg_demo", "统计温度精度影响因子").await.unwrap();

    let state = pipeline.store.read().await.unwrap();
    assert_eq!(state["db_code"], json!("pg_demo"));
    let keywords: Vec<String> = serde_json::from_value(state["keywords"].clone()).unwrap();
    assert!(keywords.contains(&"统计温度精度影响因子".to_string()));
    let caption = state["tb_caption"].as_str().unwrap();
    assert!(caption.contains("数据库: 冷链医药合规库"));
    assert!(caption.contains("表名: shipment"));
    assert!(state["cur_date_info"].as_str().unwrap().starts_with("当前日期信息:"));
}

#[tokio::test]
async fn filter_knowledge_closes_over_rel_kn_to_fixpoint() {
    let pipeline = pipeline_with(
        Arc::new(FakeMeta::default()),
        // LLM picks only K3; K2 and K1 must come back via the closure
        FakeLlm::new(|_, _| "[3]".to_string()),
        5,
        8,
    );
    let mut retrieved = KnMap::new();
    retrieved.insert(1, knowledge(1, "冷链温度合规", None, None));
    retrieved.insert(2, knowledge(2, "温度精度影响因子", Some(vec![1]), None));
    retrieved.insert(3, knowledge(3, "精度漂移告警", Some(vec![2]), None));
    pipeline
        .store
        .write(seed(vec![
            ("query", json!("温度精度影响因子")),
            ("retrieved_knowledge", serde_json::to_value(&retrieved).unwrap()),
        ]))
        .await
        .unwrap();

    pipeline.filter_knowledge().await.unwrap();

    let state = pipeline.store.read().await.unwrap();
    let kn_map: KnMap = serde_json::from_value(state["kn_map"].clone()).unwrap();
    let codes: Vec<i64> = kn_map.keys().copied().collect();
    assert_eq!(codes, vec![1, 2, 3]);
}

#[tokio::test]
async fn filter_knowledge_ignores_picks_outside_the_candidates() {
    let pipeline = pipeline_with(Arc::new(FakeMeta::default()), FakeLlm::new(|_, _| "[7, 1]".into()), 5, 8);
    let mut retrieved = KnMap::new();
    retrieved.insert(1, knowledge(1, "冷链温度合规", None, None));
    pipeline
        .store
        .write(seed(vec![
            ("query", json!("温度")),
            ("retrieved_knowledge", serde_json::to_value(&retrieved).unwrap()),
        ]))
        .await
        .unwrap();

    pipeline.filter_knowledge().await.unwrap();

    let state = pipeline.store.read().await.unwrap();
    let kn_map: KnMap = serde_json::from_value(state["kn_map"].clone()).unwrap();
    assert_eq!(kn_map.keys().copied().collect::<Vec<_>>(), vec![1]);
}

#[tokio::test]
async fn extend_column_unions_llm_output_with_keywords() {
    let pipeline = pipeline_with(
        Arc::new(FakeMeta::default()),
        FakeLlm::new(|_, _| "```json\n[\"销售数量\", \"销量\"]\n```".into()),
        5,
        8,
    );
    pipeline
        .store
        .write(seed(vec![
            ("query", json!("按月统计销量")),
            ("keywords", json!(["销量", "按月"])),
            ("tb_caption", json!("数据库: sales\n")),
        ]))
        .await
        .unwrap();

    pipeline.extend_column().await.unwrap();

    let state = pipeline.store.read().await.unwrap();
    let extracted: Vec<String> =
        serde_json::from_value(state["extracted_columns"].clone()).unwrap();
    assert_eq!(extracted, vec!["销售数量", "销量", "按月"]);
}

#[tokio::test]
async fn recall_column_prefers_extracted_columns_over_keywords() {
    let meta = Arc::new(FakeMeta::default());
    let pipeline = pipeline_with(meta.clone(), FakeLlm::new(|_, _| String::new()), 5, 8);
    pipeline
        .store
        .write(seed(vec![
            ("db_code", json!("pg_demo")),
            ("keywords", json!(["销量"])),
            ("extracted_columns", json!(["销售数量"])),
        ]))
        .await
        .unwrap();

    pipeline.recall_column().await.unwrap();

    assert_eq!(*meta.last_column_keywords.lock().await, vec!["销售数量"]);
}

#[tokio::test]
async fn merge_col_cell_enforces_table_and_column_caps() {
    // 4 tables x 5 columns with strictly increasing scores; caps 2 and 3
    let mut col_map = ColMap::new();
    let mut score = 0.0;
    for tb in ["t1", "t2", "t3", "t4"] {
        let entry = col_map.entry(tb.to_string()).or_default();
        for idx in 0..5 {
            score += 1.0;
            entry.insert(format!("c{idx}"), scored(tb, &format!("c{idx}"), score));
        }
    }
    let pipeline = pipeline_with(Arc::new(FakeMeta::default()), FakeLlm::new(|_, _| String::new()), 2, 3);
    pipeline
        .store
        .write(seed(vec![
            ("retrieved_col_map", serde_json::to_value(&col_map).unwrap()),
            ("retrieved_cell_map", serde_json::to_value(&ColMap::new()).unwrap()),
        ]))
        .await
        .unwrap();

    pipeline.merge_col_cell().await.unwrap();

    let state = pipeline.store.read().await.unwrap();
    let merged: ColMap = serde_json::from_value(state["col_map"].clone()).unwrap();
    assert_eq!(merged.len(), 2);
    for cols in merged.values() {
        assert_eq!(cols.len(), 3);
    }
}

#[tokio::test]
async fn add_kn_col_merges_knowledge_columns_into_col_map() {
    let mut lookup = ColLookupMap::new();
    let mut by_name = IndexMap::new();
    by_name.insert(
        "status".to_string(),
        Column {
            tb_code: "t1".into(),
            col_name: "status".into(),
            col_comment: Some("审批状态".into()),
            ..Default::default()
        },
    );
    lookup.insert("t1".into(), by_name);
    let meta = FakeMeta {
        lookup,
        ..Default::default()
    };
    let pipeline = pipeline_with(Arc::new(meta), FakeLlm::new(|_, _| String::new()), 5, 8);

    let mut col_map = ColMap::new();
    col_map
        .entry("t1".to_string())
        .or_default()
        .insert("carrier".to_string(), scored("t1", "carrier", 2.0));
    let mut kn_map = KnMap::new();
    kn_map.insert(1, knowledge(1, "审批合规", None, Some(vec!["shipment.status"])));
    pipeline
        .store
        .write(seed(vec![
            ("db_code", json!("pg_demo")),
            ("col_map", serde_json::to_value(&col_map).unwrap()),
            ("kn_map", serde_json::to_value(&kn_map).unwrap()),
        ]))
        .await
        .unwrap();

    pipeline.add_kn_col().await.unwrap();

    let state = pipeline.store.read().await.unwrap();
    let merged: ColMap = serde_json::from_value(state["col_map"].clone()).unwrap();
    assert!(merged["t1"].contains_key("carrier"));
    assert!(merged["t1"].contains_key("status"));
}

#[tokio::test]
async fn filter_tb_col_keeps_picked_columns() {
    let pipeline = pipeline_with(
        Arc::new(FakeMeta::default()),
        FakeLlm::new(|n, _| match n {
            0 => "[\"t1\"]".to_string(),
            _ => "{\"related_flag\": true, \"column_names\": [\"status\"]}".to_string(),
        }),
        5,
        8,
    );
    pipeline.store.write(one_table_state(&["status", "carrier"])).await.unwrap();

    pipeline.filter_tb_col().await.unwrap();

    let state = pipeline.store.read().await.unwrap();
    let filtered: ColMap = serde_json::from_value(state["col_map"].clone()).unwrap();
    assert_eq!(filtered["t1"].len(), 1);
    assert!(filtered["t1"].contains_key("status"));
}

#[tokio::test]
async fn filter_tb_col_falls_back_to_all_columns_on_malformed_output() {
    let pipeline = pipeline_with(
        Arc::new(FakeMeta::default()),
        FakeLlm::new(|n, _| match n {
            0 => "[\"t1\"]".to_string(),
            // column_names missing: keep every column
            _ => "{\"related_flag\": true}".to_string(),
        }),
        5,
        8,
    );
    pipeline.store.write(one_table_state(&["status", "carrier"])).await.unwrap();

    pipeline.filter_tb_col().await.unwrap();

    let state = pipeline.store.read().await.unwrap();
    let filtered: ColMap = serde_json::from_value(state["col_map"].clone()).unwrap();
    assert_eq!(filtered["t1"].len(), 2);
}

#[tokio::test]
async fn filter_tb_col_drops_unrelated_tables() {
    let pipeline = pipeline_with(
        Arc::new(FakeMeta::default()),
        FakeLlm::new(|n, _| match n {
            0 => "[\"t1\"]".to_string(),
            _ => "{\"related_flag\": false, \"column_names\": []}".to_string(),
        }),
        5,
        8,
    );
    pipeline.store.write(one_table_state(&["status"])).await.unwrap();

    pipeline.filter_tb_col().await.unwrap();

    let state = pipeline.store.read().await.unwrap();
    let filtered: ColMap = serde_json::from_value(state["col_map"].clone()).unwrap();
    assert!(filtered.is_empty());
}

#[tokio::test]
async fn filter_tb_col_skips_tables_the_llm_rejects_in_stage_a() {
    let pipeline = pipeline_with(
        Arc::new(FakeMeta::default()),
        // Stage A returns no tables, so no column filter ever runs
        FakeLlm::new(|_, _| "[]".to_string()),
        5,
        8,
    );
    pipeline.store.write(one_table_state(&["status"])).await.unwrap();

    pipeline.filter_tb_col().await.unwrap();

    let state = pipeline.store.read().await.unwrap();
    let filtered: ColMap = serde_json::from_value(state["col_map"].clone()).unwrap();
    assert!(filtered.is_empty());
}
