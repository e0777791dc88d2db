//! Merging retrieved cells into retrieved columns, with top-K pruning.

use crate::model::ColMap;

/// Merge cell results into column results, then prune: per table keep the
/// `max_col_per_tb` best-scored columns, then keep the `max_tb_num` tables
/// with the highest column-score sums.
pub fn merge_col_cell_maps(
    col_map: &mut ColMap,
    cell_map: ColMap,
    max_tb_num: usize,
    max_col_per_tb: usize,
) {
    for (tb_code, cell_cols) in cell_map {
        let name_col_map = col_map.entry(tb_code).or_default();
        for (col_name, cell_col) in cell_cols {
            match name_col_map.entry(col_name) {
                indexmap::map::Entry::Occupied(mut occupied) => {
                    let existing = occupied.get_mut();
                    for cell in cell_col.cells {
                        if !existing.cells.contains(&cell) {
                            existing.cells.push(cell);
                        }
                    }
                    existing.score = existing.score.max(cell_col.score);
                }
                indexmap::map::Entry::Vacant(vacant) => {
                    vacant.insert(cell_col);
                }
            }
        }
    }

    let mut tb_scores: Vec<(String, f64)> = Vec::with_capacity(col_map.len());
    for (tb_code, name_col_map) in col_map.iter_mut() {
        if name_col_map.len() > max_col_per_tb {
            let mut cols: Vec<_> = std::mem::take(name_col_map).into_iter().collect();
            cols.sort_by(|a, b| {
                b.1.score
                    .partial_cmp(&a.1.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            cols.truncate(max_col_per_tb);
            *name_col_map = cols.into_iter().collect();
        }
        let total: f64 = name_col_map.values().map(|c| c.score).sum();
        tb_scores.push((tb_code.clone(), total));
    }

    if tb_scores.len() > max_tb_num {
        tb_scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (tb_code, _) in &tb_scores[max_tb_num..] {
            col_map.shift_remove(tb_code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, ScoredColumn};
    use indexmap::IndexMap;

    fn scored(tb: &str, name: &str, score: f64, cells: &[&str]) -> ScoredColumn {
        ScoredColumn {
            column: Column {
                tb_code: tb.into(),
                col_name: name.into(),
                ..Default::default()
            },
            score,
            cells: cells.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn insert(map: &mut ColMap, tb: &str, name: &str, score: f64, cells: &[&str]) {
        map.entry(tb.to_string())
            .or_default()
            .insert(name.to_string(), scored(tb, name, score, cells));
    }

    #[test]
    fn merges_cells_and_keeps_max_score() {
        let mut col_map = ColMap::new();
        insert(&mut col_map, "t1", "status", 0.8, &["Validated"]);
        let mut cell_map = ColMap::new();
        insert(&mut cell_map, "t1", "status", 1.2, &["Rejected", "Validated"]);
        insert(&mut cell_map, "t1", "note", 0.5, &["urgent"]);

        merge_col_cell_maps(&mut col_map, cell_map, 10, 10);

        let status = &col_map["t1"]["status"];
        assert_eq!(status.score, 1.2);
        assert_eq!(status.cells, vec!["Validated", "Rejected"]);
        assert!(col_map["t1"].contains_key("note"));
    }

    #[test]
    fn prunes_columns_then_tables_by_score() {
        // 4 tables, 5 columns each, strictly increasing scores
        let mut col_map = ColMap::new();
        let mut score = 0.0;
        for tb in ["t1", "t2", "t3", "t4"] {
            for idx in 0..5 {
                score += 1.0;
                insert(&mut col_map, tb, &format!("c{idx}"), score, &[]);
            }
        }

        merge_col_cell_maps(&mut col_map, ColMap::new(), 2, 3);

        assert_eq!(col_map.len(), 2);
        assert!(col_map.contains_key("t3") && col_map.contains_key("t4"));
        for cols in col_map.values() {
            assert_eq!(cols.len(), 3);
        }
        // t4 keeps its 3 highest-scored columns
        let kept: Vec<&String> = col_map["t4"].keys().collect();
        assert_eq!(kept, vec!["c4", "c3", "c2"]);
    }

    #[test]
    fn within_limits_nothing_is_dropped() {
        let mut col_map = ColMap::new();
        insert(&mut col_map, "t1", "a", 1.0, &[]);
        insert(&mut col_map, "t1", "b", 2.0, &[]);
        merge_col_cell_maps(&mut col_map, ColMap::new(), 5, 5);
        assert_eq!(col_map["t1"].len(), 2);
    }
}
