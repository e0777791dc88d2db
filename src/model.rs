//! Shared domain types: graph node shapes and retrieval result shapes.
//!
//! `field_meaning` is a structured JSON value everywhere in memory; it is
//! serialized to a JSON string only at the graph storage boundary.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Database head info returned by `get_table`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbInfo {
    pub db_code: String,
    pub db_name: String,
}

/// A `database` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseNode {
    pub db_code: String,
    pub db_name: String,
    /// `mysql` or `postgresql`
    pub db_type: String,
    pub database: String,
}

/// A `tb` node, as surfaced in `tb_map`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub tb_name: String,
    pub tb_meaning: String,
}

/// A `col` node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Column {
    pub tb_code: String,
    pub col_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_meaning: Option<String>,
    /// Nested semantic map for JSON-typed columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_meaning: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_alias: Option<Vec<String>>,
    /// Up to 5 sample cell strings, each at most 300 chars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fewshot: Option<Vec<String>>,
    /// Optional "tbl.col" foreign-key hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_col: Option<String>,
}

/// A column carrying a retrieval score and (for cell retrieval) the matched
/// cell contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredColumn {
    #[serde(flatten)]
    pub column: Column,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cells: Vec<String>,
}

/// A `kn` node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Knowledge {
    pub db_code: String,
    pub kn_code: i64,
    pub kn_name: String,
    pub kn_desc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kn_def: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kn_alias: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_kn: Option<Vec<i64>>,
    /// "tb_name.col_name" references, resolved inside the owning database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_col: Option<Vec<String>>,
}

/// `tb_code -> tb info`, stable iteration order.
pub type TbMap = IndexMap<String, TableInfo>;

/// `tb_code -> col_name -> column` for plain lookups.
pub type ColLookupMap = IndexMap<String, IndexMap<String, Column>>;

/// `tb_code -> col_name -> scored column` for retrieval results.
pub type ColMap = IndexMap<String, IndexMap<String, ScoredColumn>>;

/// `kn_code -> knowledge`. BTreeMap keeps kn_code ordering; serde_json
/// round-trips the integer keys through JSON string keys, which is how
/// stringified keys from persisted state are coerced back.
pub type KnMap = BTreeMap<i64, Knowledge>;

/// Per-database narrowing of a save request. `None` lists mean "all".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbSaveSpec {
    #[serde(default)]
    pub table: Option<Vec<String>>,
    #[serde(default)]
    pub knowledge: Option<Vec<i64>>,
    #[serde(default)]
    pub cell: Option<Vec<String>>,
}

/// `save_metadata` body: `None` = ingest every configured database.
pub type SaveSpec = Option<IndexMap<String, Option<DbSaveSpec>>>;

impl DbSaveSpec {
    pub fn wants_table(&self, tb_code: &str) -> bool {
        self.table
            .as_ref()
            .is_none_or(|ls| ls.iter().any(|t| t == tb_code))
    }

    pub fn wants_knowledge(&self, kn_code: i64) -> bool {
        self.knowledge
            .as_ref()
            .is_none_or(|ls| ls.contains(&kn_code))
    }

    pub fn wants_cell(&self, tb_code: &str) -> bool {
        self.cell
            .as_ref()
            .is_none_or(|ls| ls.iter().any(|t| t == tb_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kn_map_roundtrips_stringified_keys() {
        let mut map = KnMap::new();
        map.insert(
            2,
            Knowledge {
                db_code: "pg_demo".into(),
                kn_code: 2,
                kn_name: "温度精度影响因子".into(),
                kn_desc: "影响温度精度的因素".into(),
                ..Default::default()
            },
        );
        let json = serde_json::to_string(&map).unwrap();
        assert!(json.contains("\"2\""));
        let back: KnMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back[&2].kn_name, "温度精度影响因子");
    }

    #[test]
    fn save_spec_defaults_to_everything() {
        let spec = DbSaveSpec::default();
        assert!(spec.wants_table("t1"));
        assert!(spec.wants_knowledge(7));
        assert!(spec.wants_cell("t1"));
        let narrowed = DbSaveSpec {
            table: Some(vec!["t1".into()]),
            ..Default::default()
        };
        assert!(!narrowed.wants_table("t2"));
    }
}
