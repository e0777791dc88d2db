//! Embedding-atom emission: the textual descriptors derived from column
//! and knowledge attributes. One atom is one unit of embedding and of
//! content-addressed dedup.

use crate::keywords::is_numeric;
use crate::model::{Column, Knowledge};

/// Leaf values of a nested semantic map, depth-first. Maps recurse;
/// anything else is a leaf, rendered as text.
pub fn flatten_json_leaves(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Object(map) => map.values().flat_map(flatten_json_leaves).collect(),
        serde_json::Value::String(s) => vec![s.clone()],
        other => vec![other.to_string()],
    }
}

/// Atom contents for one column: name, comment, non-numeric fewshots,
/// meaning, field-meaning leaves, aliases.
pub fn column_atoms(col: &Column) -> Vec<String> {
    let mut atoms = vec![col.col_name.clone()];
    if let Some(comment) = &col.col_comment {
        atoms.push(comment.clone());
    }
    if let Some(fewshot) = &col.fewshot {
        atoms.extend(fewshot.iter().filter(|v| !is_numeric(v)).cloned());
    }
    if let Some(meaning) = &col.col_meaning {
        atoms.push(meaning.clone());
    }
    if let Some(field_meaning) = &col.field_meaning {
        atoms.extend(flatten_json_leaves(field_meaning));
    }
    if let Some(aliases) = &col.col_alias {
        atoms.extend(aliases.iter().cloned());
    }
    atoms
}

/// Atom contents for one knowledge: name, description, aliases.
pub fn knowledge_atoms(kn: &Knowledge) -> Vec<String> {
    let mut atoms = vec![kn.kn_name.clone(), kn.kn_desc.clone()];
    if let Some(aliases) = &kn.kn_alias {
        atoms.extend(aliases.iter().cloned());
    }
    atoms
}

/// Cell filter: keep distinct, non-empty, non-numeric strings.
pub fn is_indexable_cell(value: &str) -> bool {
    !value.trim().is_empty() && !is_numeric(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_nested_maps_to_leaves() {
        let value = json!({
            "a": "一级",
            "b": {"c": "二级", "d": {"e": "三级"}},
        });
        let mut leaves = flatten_json_leaves(&value);
        leaves.sort();
        assert_eq!(leaves, vec!["一级", "三级", "二级"]);
    }

    #[test]
    fn column_atoms_skip_numeric_fewshots() {
        let col = Column {
            tb_code: "t_ship".into(),
            col_name: "status".into(),
            col_comment: Some("运单状态".into()),
            fewshot: Some(vec!["Validated".into(), "123".into(), "4.56".into()]),
            col_alias: Some(vec!["状态".into()]),
            ..Default::default()
        };
        let atoms = column_atoms(&col);
        assert_eq!(atoms, vec!["status", "运单状态", "Validated", "状态"]);
    }

    #[test]
    fn knowledge_atoms_cover_name_desc_aliases() {
        let kn = Knowledge {
            db_code: "pg_demo".into(),
            kn_code: 1,
            kn_name: "冷链温度合规".into(),
            kn_desc: "温度在允许区间内".into(),
            kn_alias: Some(vec!["冷链温控".into()]),
            ..Default::default()
        };
        assert_eq!(
            knowledge_atoms(&kn),
            vec!["冷链温度合规", "温度在允许区间内", "冷链温控"]
        );
    }

    #[test]
    fn cell_filter_drops_blank_and_numeric() {
        assert!(is_indexable_cell("Validated"));
        assert!(!is_indexable_cell(""));
        assert!(!is_indexable_cell("   "));
        assert!(!is_indexable_cell("123"));
        assert!(!is_indexable_cell("4.56"));
    }
}
