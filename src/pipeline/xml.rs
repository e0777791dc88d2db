//! XML context builders for LLM prompts.
//!
//! Empty values are omitted; list- and JSON-typed values are embedded as
//! JSON text inside their tag.

use crate::model::{ColMap, KnMap, TbMap};

fn tag(name: &str, value: Option<&serde_json::Value>) -> String {
    let Some(value) = value else {
        return String::new();
    };
    let content = match value {
        serde_json::Value::Null => return String::new(),
        serde_json::Value::String(s) => {
            if s.trim().is_empty() {
                return String::new();
            }
            s.clone()
        }
        serde_json::Value::Array(a) => {
            if a.is_empty() {
                return String::new();
            }
            value.to_string()
        }
        serde_json::Value::Object(o) => {
            if o.is_empty() {
                return String::new();
            }
            value.to_string()
        }
        other => other.to_string(),
    };
    format!("<{name}>{content}</{name}>")
}

fn tag_str(name: &str, value: Option<&str>) -> String {
    match value {
        Some(s) if !s.trim().is_empty() => format!("<{name}>{s}</{name}>"),
        _ => String::new(),
    }
}

fn tag_list(name: &str, value: Option<&Vec<String>>) -> String {
    match value {
        Some(list) if !list.is_empty() => {
            let json = serde_json::to_string(list).unwrap_or_default();
            format!("<{name}>{json}</{name}>")
        }
        _ => String::new(),
    }
}

/// `<tables>` context: tables with their surviving columns.
pub fn tb_col_xml_str(tb_map: &TbMap, col_map: &ColMap) -> String {
    let mut out = String::from("<tables>");
    for (tb_code, col_dict) in col_map {
        let Some(tb_info) = tb_map.get(tb_code) else {
            continue;
        };
        out.push_str(&format!(
            "\n    <table>\n        <table_code>{}</table_code>\n        \
             <table_name>{}</table_name>\n        \
             <table_meaning>{}</table_meaning>\n        <columns>",
            tb_code, tb_info.tb_name, tb_info.tb_meaning
        ));
        for col in col_dict.values() {
            out.push_str("\n            <column>");
            out.push_str(&tag_str("column_name", Some(&col.column.col_name)));
            out.push_str(&tag_str("column_comment", col.column.col_comment.as_deref()));
            out.push_str(&tag_str("column_meaning", col.column.col_meaning.as_deref()));
            out.push_str(&tag_list("column_alias", col.column.col_alias.as_ref()));
            out.push_str(&tag("column_json_meaning", col.column.field_meaning.as_ref()));
            out.push_str(&tag_list("fewshot", col.column.fewshot.as_ref()));
            if !col.cells.is_empty() {
                out.push_str(&tag_list("cells", Some(&col.cells)));
            }
            out.push_str("</column>");
        }
        out.push_str("\n        </columns>\n    </table>");
    }
    out.push_str("\n</tables>");
    out
}

/// `<knowledges>` context.
pub fn kn_info_xml_str(kn_map: &KnMap) -> String {
    let mut out = String::from("<knowledges>");
    for kn in kn_map.values() {
        out.push_str("\n    <knowledge>");
        out.push_str(&format!("<kn_code>{}</kn_code>", kn.kn_code));
        out.push_str(&tag_str("kn_name", Some(&kn.kn_name)));
        out.push_str(&tag_str("kn_def", kn.kn_def.as_deref()));
        out.push_str(&tag_str("kn_desc", Some(&kn.kn_desc)));
        if let Some(rel_kn) = &kn.rel_kn {
            if !rel_kn.is_empty() {
                let json = serde_json::to_string(rel_kn).unwrap_or_default();
                out.push_str(&format!("<rel_kn>{json}</rel_kn>"));
            }
        }
        out.push_str(&tag_list("kn_alias", kn.kn_alias.as_ref()));
        out.push_str("</knowledge>");
    }
    out.push_str("\n</knowledges>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, Knowledge, ScoredColumn, TableInfo};
    use serde_json::json;

    fn sample_maps() -> (TbMap, ColMap) {
        let mut tb_map = TbMap::new();
        tb_map.insert(
            "t_ship".into(),
            TableInfo {
                tb_name: "shipment".into(),
                tb_meaning: "运单".into(),
            },
        );
        let mut col_map = ColMap::new();
        let mut cols = indexmap::IndexMap::new();
        cols.insert(
            "status".to_string(),
            ScoredColumn {
                column: Column {
                    tb_code: "t_ship".into(),
                    col_name: "status".into(),
                    col_comment: Some("运单状态".into()),
                    field_meaning: Some(json!({"审批": "approval"})),
                    fewshot: Some(vec!["Validated".into()]),
                    ..Default::default()
                },
                score: 0.9,
                cells: vec!["Rejected".into()],
            },
        );
        col_map.insert("t_ship".into(), cols);
        (tb_map, col_map)
    }

    #[test]
    fn table_xml_contains_expected_tags_and_omits_empty() {
        let (tb_map, col_map) = sample_maps();
        let xml = tb_col_xml_str(&tb_map, &col_map);
        assert!(xml.contains("<table_code>t_ship</table_code>"));
        assert!(xml.contains("<column_name>status</column_name>"));
        assert!(xml.contains("<column_comment>运单状态</column_comment>"));
        assert!(xml.contains("<column_json_meaning>{\"审批\":\"approval\"}</column_json_meaning>"));
        assert!(xml.contains("<cells>[\"Rejected\"]</cells>"));
        // no meaning or alias configured
        assert!(!xml.contains("<column_meaning>"));
        assert!(!xml.contains("<column_alias>"));
    }

    #[test]
    fn knowledge_xml_lists_entries_in_code_order() {
        let mut kn_map = KnMap::new();
        for (code, name) in [(2, "温度精度影响因子"), (1, "冷链温度合规")] {
            kn_map.insert(
                code,
                Knowledge {
                    db_code: "pg_demo".into(),
                    kn_code: code,
                    kn_name: name.into(),
                    kn_desc: "desc".into(),
                    rel_kn: if code == 2 { Some(vec![1]) } else { None },
                    ..Default::default()
                },
            );
        }
        let xml = kn_info_xml_str(&kn_map);
        let first = xml.find("<kn_code>1</kn_code>").unwrap();
        let second = xml.find("<kn_code>2</kn_code>").unwrap();
        assert!(first < second);
        assert!(xml.contains("<rel_kn>[1]</rel_kn>"));
    }
}
