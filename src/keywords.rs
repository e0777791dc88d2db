//! Chinese+English keyword extraction.
//!
//! TF-IDF tags restricted to a fixed POS allow-list, numeric tokens
//! dropped, and the full input string appended as one extra keyword. The
//! tokenizer is CPU-bound, so batch extraction runs on a blocking worker.

use crate::error::{Result, TableRagError};
use jieba_rs::{Jieba, KeywordExtract, TfIdf};
use once_cell::sync::Lazy;

static JIEBA: Lazy<Jieba> = Lazy::new(Jieba::new);
static TFIDF: Lazy<TfIdf> = Lazy::new(TfIdf::default);

const TOP_K: usize = 20;

/// POS tags worth indexing: nouns, proper names, verbs, adjectives,
/// English tokens, idioms, fixed phrases.
const ALLOW_POS: &[&str] = &[
    "n", "nr", "ns", "nt", "nz", "v", "vn", "a", "an", "eng", "i", "l",
];

/// True when the whole string parses as a floating-point number.
pub fn is_numeric(s: &str) -> bool {
    s.trim().parse::<f64>().is_ok()
}

fn allowed_pos() -> Vec<String> {
    ALLOW_POS.iter().map(|s| s.to_string()).collect()
}

/// Synchronous single-text extraction. Keeps insertion order, dedups, and
/// always ends with the original string.
pub fn extract_sync(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for kw in TFIDF.extract_keywords(&JIEBA, text, TOP_K, allowed_pos()) {
        let word = kw.keyword;
        if is_numeric(&word) || out.contains(&word) {
            continue;
        }
        out.push(word);
    }
    if !out.contains(&text.to_string()) {
        out.push(text.to_string());
    }
    out
}

/// Batch extraction on a blocking worker, one keyword list per input text.
pub async fn extract_keywords(texts: Vec<String>) -> Result<Vec<Vec<String>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    tokio::task::spawn_blocking(move || texts.iter().map(|t| extract_sync(t)).collect())
        .await
        .map_err(|e| TableRagError::Internal {
            message: format!("keyword worker panicked: {}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_detection_matches_float_parse() {
        assert!(is_numeric("123"));
        assert!(is_numeric("4.56"));
        assert!(is_numeric(" -7.5 "));
        assert!(!is_numeric("A12"));
        assert!(!is_numeric("温度"));
        assert!(!is_numeric(""));
    }

    #[test]
    fn extraction_appends_original_and_drops_numbers() {
        let kws = extract_sync("2023年冷链温度合规审计");
        assert_eq!(kws.last().unwrap(), "2023年冷链温度合规审计");
        assert!(kws.iter().all(|k| !is_numeric(k)));
        assert!(kws.iter().any(|k| k.contains("温度") || k.contains("冷链")));
    }

    #[tokio::test]
    async fn batch_extraction_preserves_order() {
        let out = extract_keywords(vec!["销售数量".into(), "shipment status".into()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].last().unwrap(), "销售数量");
        assert_eq!(out[1].last().unwrap(), "shipment status");
    }
}
