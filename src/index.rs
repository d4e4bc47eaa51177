//! Vector index abstraction and implementations.
//!
//! Child-chunk vectors live in a vector index that supports hybrid
//! similarity search: dense and sparse candidate lists are retrieved
//! independently and fused with reciprocal-rank fusion. Two backends are
//! provided:
//!
//! - **[`QdrantIndex`]** — talks to a Qdrant server over its REST API.
//! - **[`MemoryIndex`]** — in-process brute-force index used in tests and
//!   as an embedded fallback.
//!
//! Point identity is a monotonically increasing integer assigned at upsert
//! time; it is not stable across re-ingestion. Uniqueness of chunks is
//! enforced upstream in the document store, not here.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::config::IndexConfig;
use crate::models::{IndexPoint, ScoredPoint, SparseVector};

/// Result of a vector search: fused in hybrid mode, separate dense and
/// sparse lists otherwise.
#[derive(Debug)]
pub enum SearchOutput {
    Fused(Vec<ScoredPoint>),
    Split {
        dense: Vec<ScoredPoint>,
        sparse: Vec<ScoredPoint>,
    },
}

impl SearchOutput {
    /// Flatten to a single ranked hit list (hybrid results as-is, split
    /// results dense-then-sparse).
    pub fn into_hits(self) -> Vec<ScoredPoint> {
        match self {
            SearchOutput::Fused(hits) => hits,
            SearchOutput::Split { mut dense, sparse } => {
                dense.extend(sparse);
                dense
            }
        }
    }
}

/// Store and search child-chunk vectors.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the backing collection if it does not exist yet.
    async fn ensure_ready(&self) -> Result<()>;

    /// Upsert points in batches of `batch_size`, assigning monotonically
    /// increasing integer ids in input order.
    async fn upsert(&self, points: Vec<IndexPoint>, batch_size: usize) -> Result<()>;

    /// Retrieve candidates for a query. In hybrid mode dense and sparse
    /// top-`top_k` lists are fused with reciprocal-rank fusion; otherwise
    /// the two lists are returned independently. `source_filter` restricts
    /// candidates to the named sources.
    async fn search(
        &self,
        dense: &[f32],
        sparse: &SparseVector,
        hybrid: bool,
        top_k: usize,
        source_filter: Option<&[String]>,
    ) -> Result<SearchOutput>;

    /// Drop all points belonging to `source`. Called when a file is
    /// deleted so the index never diverges from the document store.
    async fn delete_by_source(&self, source: &str) -> Result<()>;
}

/// Fuse ranked candidate lists with reciprocal-rank fusion.
///
/// Each candidate's fused score is `Σ 1/(rank_constant + rank)` over the
/// lists it appears in, with 1-based ranks. Ordering is by descending
/// fused score; ties keep first-appearance order (dense list first).
pub fn rrf_fuse(
    lists: &[&[ScoredPoint]],
    rank_constant: usize,
    top_k: usize,
) -> Vec<ScoredPoint> {
    let mut order: Vec<u64> = Vec::new();
    let mut fused: HashMap<u64, (f32, ScoredPoint)> = HashMap::new();

    for list in lists {
        for (rank, hit) in list.iter().enumerate() {
            let contribution = 1.0 / (rank_constant as f32 + rank as f32 + 1.0);
            match fused.get_mut(&hit.id) {
                Some((score, _)) => *score += contribution,
                None => {
                    order.push(hit.id);
                    fused.insert(hit.id, (contribution, hit.clone()));
                }
            }
        }
    }

    let mut hits: Vec<ScoredPoint> = order
        .into_iter()
        .filter_map(|id| {
            let (score, mut hit) = fused.remove(&id)?;
            hit.score = score;
            Some(hit)
        })
        .collect();

    // Stable sort keeps insertion order for equal scores.
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(top_k);
    hits
}

// ============ In-memory index ============

/// Brute-force in-process index. Dense scoring is a dot product (vectors
/// are unit-normalized upstream), sparse scoring a sparse dot product.
pub struct MemoryIndex {
    points: Mutex<Vec<(u64, IndexPoint)>>,
    next_id: AtomicU64,
    rank_constant: usize,
}

impl MemoryIndex {
    pub fn new(rank_constant: usize) -> Self {
        Self {
            points: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            rank_constant,
        }
    }

    fn top_by<F>(&self, top_k: usize, source_filter: Option<&[String]>, score: F) -> Vec<ScoredPoint>
    where
        F: Fn(&IndexPoint) -> f32,
    {
        let points = self.points.lock().expect("index lock");
        let mut scored: Vec<ScoredPoint> = points
            .iter()
            .filter(|(_, p)| match source_filter {
                Some(sources) => sources.iter().any(|s| *s == p.payload.source),
                None => true,
            })
            .map(|(id, p)| ScoredPoint {
                id: *id,
                score: score(p),
                payload: p.payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, points: Vec<IndexPoint>, _batch_size: usize) -> Result<()> {
        let mut store = self.points.lock().expect("index lock");
        for point in points {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            store.push((id, point));
        }
        Ok(())
    }

    async fn search(
        &self,
        dense: &[f32],
        sparse: &SparseVector,
        hybrid: bool,
        top_k: usize,
        source_filter: Option<&[String]>,
    ) -> Result<SearchOutput> {
        let dense_hits = self.top_by(top_k, source_filter, |p| {
            p.dense.iter().zip(dense.iter()).map(|(a, b)| a * b).sum()
        });
        let sparse_hits = self.top_by(top_k, source_filter, |p| p.sparse.dot(sparse));

        if hybrid {
            Ok(SearchOutput::Fused(rrf_fuse(
                &[&dense_hits, &sparse_hits],
                self.rank_constant,
                top_k,
            )))
        } else {
            Ok(SearchOutput::Split {
                dense: dense_hits,
                sparse: sparse_hits,
            })
        }
    }

    async fn delete_by_source(&self, source: &str) -> Result<()> {
        let mut store = self.points.lock().expect("index lock");
        store.retain(|(_, p)| p.payload.source != source);
        Ok(())
    }
}

// ============ Qdrant adapter ============

const DENSE_VECTOR_NAME: &str = "dense";
const SPARSE_VECTOR_NAME: &str = "sparse";

/// Vector index backed by a Qdrant server, addressed over REST.
pub struct QdrantIndex {
    base_url: String,
    collection: String,
    dims: usize,
    rank_constant: usize,
    next_id: AtomicU64,
    client: reqwest::Client,
}

impl QdrantIndex {
    pub fn new(config: &IndexConfig, dims: usize) -> Result<Self> {
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            dims,
            rank_constant: config.rank_constant,
            next_id: AtomicU64::new(1),
            client: reqwest::Client::new(),
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    async fn query_one(
        &self,
        query: serde_json::Value,
        using: &str,
        top_k: usize,
        filter: &Option<serde_json::Value>,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = serde_json::json!({
            "query": query,
            "using": using,
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(f) = filter {
            body["filter"] = f.clone();
        }

        let response = self
            .client
            .post(self.collection_url("/points/query"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("index search failed ({}): {}", status, text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_query_response(&json)
    }
}

fn source_filter_json(source_filter: Option<&[String]>) -> Option<serde_json::Value> {
    source_filter.map(|sources| {
        serde_json::json!({
            "must": [{ "key": "source", "match": { "any": sources } }]
        })
    })
}

fn parse_query_response(json: &serde_json::Value) -> Result<Vec<ScoredPoint>> {
    let points = json
        .pointer("/result/points")
        .and_then(|p| p.as_array())
        .ok_or_else(|| anyhow::anyhow!("invalid index response: missing result.points"))?;

    let mut hits = Vec::with_capacity(points.len());
    for point in points {
        let id = point.get("id").and_then(|v| v.as_u64()).unwrap_or(0);
        let score = point.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32;
        let payload = point
            .get("payload")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("invalid index response: hit without payload"))?;
        hits.push(ScoredPoint {
            id,
            score,
            payload: serde_json::from_value(payload)?,
        });
    }
    Ok(hits)
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_ready(&self) -> Result<()> {
        let response = self.client.get(self.collection_url("")).send().await?;
        if response.status().is_success() {
            tracing::debug!(collection = %self.collection, "using existing collection");
            return Ok(());
        }

        tracing::info!(collection = %self.collection, "creating collection");
        let body = serde_json::json!({
            "vectors": {
                "dense": { "size": self.dims, "distance": "Cosine" }
            },
            "sparse_vectors": {
                "sparse": { "modifier": "idf" }
            }
        });
        let response = self
            .client
            .put(self.collection_url(""))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("failed to create collection ({}): {}", status, text);
        }
        Ok(())
    }

    async fn upsert(&self, points: Vec<IndexPoint>, batch_size: usize) -> Result<()> {
        let total = points.len();
        for batch in points.chunks(batch_size.max(1)) {
            let body_points: Vec<serde_json::Value> = batch
                .iter()
                .map(|p| {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    serde_json::json!({
                        "id": id,
                        "vector": {
                            "dense": p.dense,
                            "sparse": {
                                "indices": p.sparse.indices,
                                "values": p.sparse.values,
                            },
                        },
                        "payload": p.payload,
                    })
                })
                .collect();

            let response = self
                .client
                .put(self.collection_url("/points"))
                .json(&serde_json::json!({ "points": body_points }))
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                bail!("index upsert failed ({}): {}", status, text);
            }
        }
        tracing::debug!(points = total, collection = %self.collection, "points upserted");
        Ok(())
    }

    async fn search(
        &self,
        dense: &[f32],
        sparse: &SparseVector,
        hybrid: bool,
        top_k: usize,
        source_filter: Option<&[String]>,
    ) -> Result<SearchOutput> {
        let filter = source_filter_json(source_filter);
        let dense_query = serde_json::json!(dense);
        let sparse_query = serde_json::json!({
            "indices": sparse.indices,
            "values": sparse.values,
        });

        let dense_hits = self
            .query_one(dense_query, DENSE_VECTOR_NAME, top_k, &filter)
            .await?;
        let sparse_hits = self
            .query_one(sparse_query, SPARSE_VECTOR_NAME, top_k, &filter)
            .await?;

        if hybrid {
            Ok(SearchOutput::Fused(rrf_fuse(
                &[&dense_hits, &sparse_hits],
                self.rank_constant,
                top_k,
            )))
        } else {
            Ok(SearchOutput::Split {
                dense: dense_hits,
                sparse: sparse_hits,
            })
        }
    }

    async fn delete_by_source(&self, source: &str) -> Result<()> {
        let body = serde_json::json!({
            "filter": {
                "must": [{ "key": "source", "match": { "value": source } }]
            }
        });
        let response = self
            .client
            .post(self.collection_url("/points/delete"))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("index delete failed ({}): {}", status, text);
        }
        tracing::debug!(source, "index points deleted");
        Ok(())
    }
}
