//! Cross-encoder reranking.
//!
//! Candidates that survive hybrid search are rescored against the query by
//! a cross-encoder served over HTTP (the text-embeddings-inference rerank
//! API shape: POST `{query, texts}` -> `[{index, score}]`).

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::RerankConfig;

/// One reranked candidate: `index` points into the input document list.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RerankResult {
    pub index: usize,
    pub score: f32,
}

/// Scores query/document pairs with a cross-encoder.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score every document against the query and return results in
    /// descending score order, truncated to `top_k` unless `return_all`.
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
        return_all: bool,
    ) -> Result<Vec<RerankResult>>;
}

pub struct HttpReranker {
    endpoint: String,
    model: Option<String>,
    client: reqwest::Client,
}

impl HttpReranker {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            client,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
        return_all: bool,
    ) -> Result<Vec<RerankResult>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let mut body = serde_json::json!({
            "query": query,
            "texts": documents,
        });
        if let Some(model) = &self.model {
            body["model"] = serde_json::json!(model);
        }

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("rerank request failed ({}): {}", status, text);
        }

        let mut results: Vec<RerankResult> = response.json().await?;
        for result in &results {
            if result.index >= documents.len() {
                bail!(
                    "rerank response index {} out of range for {} documents",
                    result.index,
                    documents.len()
                );
            }
        }

        sort_and_truncate(&mut results, top_k, return_all);
        Ok(results)
    }
}

/// Sort by descending score (ties keep response order) and truncate to
/// `top_k` unless `return_all` is set.
pub fn sort_and_truncate(results: &mut Vec<RerankResult>, top_k: usize, return_all: bool) {
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    if !return_all {
        results.truncate(top_k);
    }
}
