//! Chat-completion client for the extend/filter stages.

use crate::config::{Config, ModelConfig};
use crate::error::{Result, TableRagError};
use crate::retry::{Backoff, retry};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatCompleter: Send + Sync {
    /// Ask the named model; `retries` are extra attempts, `timeout` bounds
    /// each attempt (`None` = unlimited).
    async fn complete(
        &self,
        model_name: &str,
        messages: &[ChatMessage],
        retries: u32,
        timeout: Option<Duration>,
    ) -> Result<String>;
}

pub struct OpenAiChat {
    models: HashMap<String, ModelConfig>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

impl OpenAiChat {
    pub fn from_config(config: &Config) -> Self {
        Self {
            models: config.llm.models.clone(),
        }
    }

    async fn ask_once(
        &self,
        client: &reqwest::Client,
        model_cfg: &ModelConfig,
        messages: &[ChatMessage],
    ) -> Result<String> {
        let mut body = serde_json::Map::new();
        body.insert("model".into(), model_cfg.model.clone().into());
        body.insert("messages".into(), serde_json::to_value(messages)?);
        for (k, v) in &model_cfg.params {
            body.insert(k.clone(), v.clone());
        }

        let response = client
            .post(format!(
                "{}/chat/completions",
                model_cfg.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&model_cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TableRagError::Llm {
                message: format!("request failed: {}", e),
            })?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(TableRagError::Llm {
                message: format!("LLM API error {}: {}", status, error_text),
            });
        }
        let parsed: ChatResponse = response.json().await.map_err(|e| TableRagError::Llm {
            message: format!("malformed completion response: {}", e),
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| TableRagError::Llm {
                message: "completion returned no content".into(),
            })
    }
}

#[async_trait]
impl ChatCompleter for OpenAiChat {
    async fn complete(
        &self,
        model_name: &str,
        messages: &[ChatMessage],
        retries: u32,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let model_cfg = self
            .models
            .get(model_name)
            .ok_or_else(|| TableRagError::Config {
                message: format!("unknown LLM model '{}'", model_name),
            })?;
        // Disposable client per call
        let client = reqwest::Client::new();
        retry("ask_llm", retries + 1, timeout, Backoff::default(), || {
            self.ask_once(&client, model_cfg, messages)
        })
        .await
    }
}

static JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```json\s*([\s\S]*?)\s*```").expect("static regex"));

/// Parse an LLM reply as JSON, accepting either a bare JSON document or a
/// ```json fenced block.
pub fn parse_json(input: &str) -> Result<serde_json::Value> {
    if let Ok(v) = serde_json::from_str(input.trim()) {
        return Ok(v);
    }
    let captured = JSON_FENCE
        .captures(input)
        .and_then(|c| c.get(1))
        .ok_or_else(|| TableRagError::Data {
            message: format!("no JSON found in LLM output: {}", truncate(input, 200)),
        })?;
    serde_json::from_str(captured.as_str()).map_err(|e| TableRagError::Data {
        message: format!("invalid JSON in LLM output: {}", e),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bare_json() {
        assert_eq!(parse_json("  [1, 2, 3] ").unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn parses_fenced_json() {
        let reply = "Sure, here you go:\n```json\n{\"related_flag\": true}\n```\nDone.";
        assert_eq!(parse_json(reply).unwrap(), json!({"related_flag": true}));
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_json("no structured data here").is_err());
    }
}
