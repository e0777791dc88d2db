//! Reciprocal Rank Fusion over dense and sparse retrieval branches.
//!
//! Each candidate carries its best dense score and best sparse score. The
//! branches are ranked independently (score descending, key ascending on
//! ties) and fused with `1/(k + rank)`, `k = 60`, 0-based ranks. A
//! candidate absent from a branch contributes 0 from that branch.

use std::collections::BTreeMap;

pub const RRF_K: f64 = 60.0;

/// Best per-branch scores for one candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BranchScores {
    pub dense: f64,
    pub sparse: f64,
}

impl BranchScores {
    /// Fold another observation in, keeping the per-branch maximum.
    pub fn absorb(&mut self, other: BranchScores) {
        self.dense = self.dense.max(other.dense);
        self.sparse = self.sparse.max(other.sparse);
    }
}

fn ranked<K: Ord + Clone>(
    candidates: &BTreeMap<K, BranchScores>,
    pick: impl Fn(&BranchScores) -> f64,
) -> Vec<K> {
    let mut list: Vec<(&K, f64)> = candidates
        .iter()
        .map(|(k, s)| (k, pick(s)))
        .filter(|(_, score)| *score > 0.0)
        .collect();
    list.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    list.into_iter().map(|(k, _)| k.clone()).collect()
}

/// Fuse the branches and return `(key, rrf_score)` pairs, best first,
/// truncated to `top_k`. Deterministic: score ties break on key order.
pub fn rrf_fuse<K: Ord + Clone>(
    candidates: &BTreeMap<K, BranchScores>,
    top_k: usize,
) -> Vec<(K, f64)> {
    let dense_rank = ranked(candidates, |s| s.dense);
    let sparse_rank = ranked(candidates, |s| s.sparse);

    let mut fused: Vec<(K, f64)> = candidates
        .keys()
        .map(|key| {
            let mut score = 0.0;
            if let Some(rank) = dense_rank.iter().position(|k| k == key) {
                score += 1.0 / (RRF_K + rank as f64);
            }
            if let Some(rank) = sparse_rank.iter().position(|k| k == key) {
                score += 1.0 / (RRF_K + rank as f64);
            }
            (key.clone(), score)
        })
        .filter(|(_, score)| *score > 0.0)
        .collect();

    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    fused.truncate(top_k);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(dense: f64, sparse: f64) -> BranchScores {
        BranchScores { dense, sparse }
    }

    #[test]
    fn fuses_ranked_lists_deterministically() {
        // Dense branch ranks A > B > C; sparse branch ranks B > D.
        let mut candidates = BTreeMap::new();
        candidates.insert("A", scores(0.9, 0.0));
        candidates.insert("B", scores(0.8, 5.0));
        candidates.insert("C", scores(0.75, 0.0));
        candidates.insert("D", scores(0.0, 4.0));

        let fused = rrf_fuse(&candidates, 10);
        let keys: Vec<&str> = fused.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["B", "A", "D", "C"]);

        let by_key: BTreeMap<&str, f64> = fused.into_iter().collect();
        assert!((by_key["A"] - 1.0 / 60.0).abs() < 1e-12);
        assert!((by_key["B"] - (1.0 / 61.0 + 1.0 / 60.0)).abs() < 1e-12);
        assert!((by_key["C"] - 1.0 / 62.0).abs() < 1e-12);
        assert!((by_key["D"] - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn absent_candidates_are_dropped() {
        let mut candidates = BTreeMap::new();
        candidates.insert("X", scores(0.0, 0.0));
        candidates.insert("Y", scores(0.71, 0.0));
        let fused = rrf_fuse(&candidates, 10);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].0, "Y");
    }

    #[test]
    fn truncates_to_top_k() {
        let mut candidates = BTreeMap::new();
        for (i, key) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
            candidates.insert(*key, scores(1.0 - i as f64 * 0.01, 0.0));
        }
        assert_eq!(rrf_fuse(&candidates, 5).len(), 5);
    }

    #[test]
    fn absorb_keeps_per_branch_maximum() {
        let mut s = scores(0.5, 1.0);
        s.absorb(scores(0.9, 0.2));
        assert_eq!(s, scores(0.9, 1.0));
    }
}
