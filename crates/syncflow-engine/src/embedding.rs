//! Embedders turning record text into vectors
//!
//! [`HashingEmbedder`] is a local feature-hashing model that needs no network
//! access; [`OpenAiEmbedder`] calls an OpenAI-compatible `/embeddings`
//! endpoint. Both are used behind the [`Embedder`] trait.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::collection::{default_vector_size, openai_model_for_size};
use crate::config::EmbeddingConfig;
use crate::error::{SyncError, SyncResult};

pub const DEFAULT_BATCH_SIZE: usize = 64;
pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Converts texts into fixed-size vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Short name used as the rate-limit scope
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Largest number of texts accepted by one `embed` call
    fn max_batch_size(&self) -> usize;

    /// One vector per input text, in input order
    async fn embed(&self, texts: &[String]) -> SyncResult<Vec<Vec<f32>>>;
}

/// Deterministic local embedder based on signed feature hashing
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    batch_size: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed(&self, texts: &[String]) -> SyncResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible embeddings API
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    dimensions: usize,
    batch_size: usize,
}

impl OpenAiEmbedder {
    pub fn from_config(config: &EmbeddingConfig) -> SyncResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| SyncError::Configuration("OPENAI_API_KEY is not set".into()))?;
        let dimensions = default_vector_size(config);
        let model = openai_model_for_size(dimensions, config.model.as_deref())?;

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent("Syncflow-Engine/1.0")
            .build()
            .map_err(|e| SyncError::Configuration(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model,
            dimensions,
            batch_size: config.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &str {
        "embedding"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed(&self, texts: &[String]) -> SyncResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.model.starts_with("text-embedding-3").then_some(self.dimensions),
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status, body));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Transient(format!("malformed embeddings response: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(SyncError::Internal(format!(
                "embeddings API returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }
        parsed.data.sort_by_key(|item| item.index);

        parsed
            .data
            .into_iter()
            .map(|item| {
                if item.embedding.len() == self.dimensions {
                    Ok(item.embedding)
                } else {
                    Err(SyncError::Configuration(format!(
                        "model {} returned {} dimensions, expected {}",
                        self.model,
                        item.embedding.len(),
                        self.dimensions
                    )))
                }
            })
            .collect()
    }
}
