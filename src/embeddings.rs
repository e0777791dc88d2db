use crate::config::Config;
use crate::error::{Result, TableRagError};
use crate::retry::{Backoff, retry};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Inputs per embedding request.
const EMBED_CHUNK_SIZE: usize = 64;

/// Process-wide bound on in-flight embedding requests.
static EMBED_SEMAPHORE: Lazy<Arc<Semaphore>> = Lazy::new(|| Arc::new(Semaphore::new(20)));

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, order preserved.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dimensions(&self) -> usize;
}

// OpenAI-compatible embeddings endpoint
pub struct OpenAiEmbedder {
    base_url: String,
    api_key: String,
    model: String,
    dims: usize,
    retries: u32,
    timeout: Option<Duration>,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponseData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedResponseData>,
}

impl OpenAiEmbedder {
    pub fn from_config(config: &Config) -> Result<Self> {
        let model_cfg =
            config
                .model(&config.llm.embed_model)
                .ok_or_else(|| TableRagError::Config {
                    message: format!("unknown embed model '{}'", config.llm.embed_model),
                })?;
        let api_key = config
            .runtime
            .embed_api_key
            .clone()
            .unwrap_or_else(|| model_cfg.api_key.clone());
        Ok(Self {
            base_url: model_cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model_cfg.model.clone(),
            dims: config.llm.embed_dimensions,
            retries: config.llm.embed_retries,
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn embed_chunk(
        &self,
        client: &reqwest::Client,
        chunk: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let _permit =
            EMBED_SEMAPHORE
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| TableRagError::Internal {
                    message: format!("embed semaphore closed: {}", e),
                })?;
        let body = EmbedRequest {
            model: &self.model,
            input: chunk,
            encoding_format: "float",
        };
        let response = client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TableRagError::Embedding {
                message: format!("request failed: {}", e),
            })?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(TableRagError::Embedding {
                message: format!("embedding API error {}: {}", status, error_text),
            });
        }
        let parsed: EmbedResponse =
            response
                .json()
                .await
                .map_err(|e| TableRagError::Embedding {
                    message: format!("malformed embedding response: {}", e),
                })?;
        if parsed.data.len() != chunk.len() {
            return Err(TableRagError::Embedding {
                message: format!(
                    "embedding count mismatch: sent {}, got {}",
                    chunk.len(),
                    parsed.data.len()
                ),
            });
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            "embedding {} texts (model={}, chunks of {})",
            texts.len(),
            self.model,
            EMBED_CHUNK_SIZE
        );

        // The client is disposable: built per call, dropped on return.
        let client = reqwest::Client::new();
        let futures = texts.chunks(EMBED_CHUNK_SIZE).map(|chunk| {
            retry(
                "embed",
                self.retries + 1,
                self.timeout,
                Backoff::default(),
                || self.embed_chunk(&client, chunk),
            )
        });
        let chunk_results = futures_util::future::try_join_all(futures).await?;
        Ok(chunk_results.into_iter().flatten().collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

// Deterministic, local FakeEmbedder for testing/dev (no network)
pub struct FakeEmbedder {
    dims: usize,
}

impl FakeEmbedder {
    pub fn new(dims: Option<usize>) -> Self {
        Self {
            dims: dims.unwrap_or(1024).max(1),
        }
    }

    fn generate(&self, text: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};
        let mut out = Vec::with_capacity(self.dims);
        let mut i: u32 = 0;
        while out.len() < self.dims {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(i.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks(4) {
                if out.len() >= self.dims {
                    break;
                }
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(chunk);
                let val = u32::from_le_bytes(bytes);
                let v01 = (val as f32) / (u32::MAX as f32 + 1.0);
                out.push(v01 * 2.0 - 1.0);
            }
            i = i.wrapping_add(1);
        }

        // Unit length, matching real cosine-indexed embeddings
        let norm: f32 = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut out {
                *v /= norm;
            }
        }
        out
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.generate(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Factory: OpenAI-compatible endpoint from config, or the deterministic
/// fake when TRAG_EMBED_FAKE is set (local dev without an endpoint).
pub fn create_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    let fake = std::env::var("TRAG_EMBED_FAKE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if fake {
        let fe = FakeEmbedder::new(Some(config.llm.embed_dimensions));
        info!("Using FakeEmbedder with {} dimensions", fe.dimensions());
        return Ok(Arc::new(fe));
    }
    let embedder = OpenAiEmbedder::from_config(config)?;
    info!(
        "Using OpenAI-compatible embeddings (model={}, dims={})",
        embedder.model, embedder.dims
    );
    Ok(Arc::new(embedder))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_embedder_is_deterministic_and_unit_norm() {
        let fe = FakeEmbedder::new(Some(128));
        let a = fe.embed(&["hello world".to_string()]).await.unwrap();
        let b = fe.embed(&["hello world".to_string()]).await.unwrap();
        assert_eq!(a[0].len(), 128);
        assert!(a[0].iter().zip(&b[0]).all(|(x, y)| (x - y).abs() < 1e-8));
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn fake_embedder_varies_with_input() {
        let fe = FakeEmbedder::new(None);
        let out = fe
            .embed(&["foo".to_string(), "bar".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 1024);
        assert!(out[0].iter().zip(&out[1]).any(|(x, y)| (x - y).abs() > 1e-6));
    }

    #[tokio::test]
    async fn empty_input_returns_empty_without_io() {
        let fe = FakeEmbedder::new(Some(8));
        assert!(fe.embed(&[]).await.unwrap().is_empty());
    }
}
