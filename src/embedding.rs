//! Dense and sparse embedding services.
//!
//! Dense embeddings come from an OpenAI-compatible HTTP endpoint with
//! batching, retry, and backoff; vectors are unit-normalized so cosine
//! similarity reduces to a dot product. Sparse embeddings are computed
//! in-process with BM25-style term weighting over a hashed vocabulary.
//!
//! Both services preserve input order 1:1 and return an empty result for
//! empty input rather than an error.
//!
//! # Retry Strategy
//!
//! The HTTP embedder retries transient failures with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::models::SparseVector;

/// Produces fixed-dimension dense vectors for text.
#[async_trait]
pub trait DenseEmbedder: Send + Sync {
    /// Embed a batch of texts, one unit-normalized vector per input, in
    /// input order. Empty input returns an empty vector.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vector dimensionality.
    fn dims(&self) -> usize;
}

/// Dense embedder backed by an OpenAI-compatible embeddings endpoint.
pub struct HttpDenseEmbedder {
    endpoint: String,
    model: String,
    dims: usize,
    api_key: Option<String>,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpDenseEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                anyhow::anyhow!("environment variable {} not set for embedding API", var)
            })?),
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            dims: config.dims,
            api_key,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            client,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(&self.endpoint).json(&body);
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_embedding_response(&json, texts.len());
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("embedding API error {}: {}", status, body_text));
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("embedding failed after retries")))
    }
}

#[async_trait]
impl DenseEmbedder for HttpDenseEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let mut vectors = self.embed_batch(batch).await?;
            for v in &mut vectors {
                normalize(v);
            }
            all.append(&mut vectors);
        }

        tracing::debug!(count = all.len(), model = %self.model, "dense embeddings created");
        Ok(all)
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

fn parse_embedding_response(json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("invalid embedding response: missing data array"))?;

    if data.len() != expected {
        bail!(
            "embedding response count mismatch: expected {}, got {}",
            expected,
            data.len()
        );
    }

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("invalid embedding response: missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }

    Ok(embeddings)
}

/// Scale a vector to unit length in place. Zero vectors are left as-is.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine distance between two unit-normalized vectors (`1 - dot`).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    1.0 - dot
}

// ============ Sparse embedder ============

/// BM25 term-frequency saturation parameter.
const BM25_K1: f32 = 1.2;
/// BM25 length-normalization parameter.
const BM25_B: f32 = 0.75;

/// In-process sparse embedder producing BM25-style term weights over a
/// hashed vocabulary (32-bit FNV-1a of each lowercased token).
#[derive(Debug, Clone)]
pub struct SparseEmbedder {
    avgdl: f32,
}

impl SparseEmbedder {
    pub fn new(avgdl: f32) -> Self {
        Self {
            avgdl: avgdl.max(1.0),
        }
    }

    /// Embed a batch of texts; output order matches input order. Empty
    /// input returns an empty vector.
    pub fn embed(&self, texts: &[String]) -> Vec<SparseVector> {
        texts.iter().map(|t| self.embed_one(t)).collect()
    }

    pub fn embed_one(&self, text: &str) -> SparseVector {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return SparseVector::default();
        }
        let len = tokens.len() as f32;

        let mut counts: BTreeMap<u32, f32> = BTreeMap::new();
        for token in &tokens {
            *counts.entry(fnv1a(token)).or_insert(0.0) += 1.0;
        }

        let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * len / self.avgdl);
        let mut indices = Vec::with_capacity(counts.len());
        let mut values = Vec::with_capacity(counts.len());
        for (index, tf) in counts {
            indices.push(index);
            values.push(tf * (BM25_K1 + 1.0) / (tf + norm));
        }

        SparseVector { indices, values }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn fnv1a(token: &str) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in token.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}
