//! Core data models used throughout Dochive.
//!
//! These types represent the two chunk granularities, index points and
//! search hits, and the file records that flow through the ingestion and
//! retrieval pipeline.

use serde::{Deserialize, Serialize};

/// Large text span stored in the document store and shown to generation.
///
/// `seq` values are contiguous per `source`, starting at 0, assigned in
/// split order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentChunk {
    pub source: String,
    pub seq: i64,
    pub text: String,
}

/// Small text span that is embedded and indexed for search.
///
/// Never shown to the user directly; `parent_seq` references the owning
/// [`ParentChunk`] within the same `source`. `child_id` is a monotonic
/// counter across one ingestion run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildChunk {
    pub source: String,
    pub parent_seq: i64,
    pub child_id: i64,
    pub text: String,
}

/// Payload attached to each indexed child point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildPayload {
    pub text: String,
    pub source: String,
    pub parent_id: i64,
    pub child_id: i64,
}

impl ChildChunk {
    pub fn payload(&self) -> ChildPayload {
        ChildPayload {
            text: self.text.clone(),
            source: self.source.clone(),
            parent_id: self.parent_seq,
            child_id: self.child_id,
        }
    }
}

/// Sparse term-weighted vector: parallel `(index, weight)` pairs over a
/// hashed vocabulary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Dot product against another sparse vector.
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let mut sum = 0.0;
        for (i, idx) in self.indices.iter().enumerate() {
            if let Ok(j) = other.indices.binary_search(idx) {
                sum += self.values[i] * other.values[j];
            }
        }
        sum
    }
}

/// A single point to upsert into the vector index.
#[derive(Debug, Clone)]
pub struct IndexPoint {
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
    pub payload: ChildPayload,
}

/// A ranked hit returned from the vector index.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: u64,
    pub score: f32,
    pub payload: ChildPayload,
}

/// A parent chunk resolved from search hits, optionally carrying a
/// cross-encoder score after reranking. After neighbor expansion, `text`
/// is the space-joined concatenation of the parent and its neighbors and
/// `seq` remains the center parent's sequence id.
#[derive(Debug, Clone)]
pub struct RetrievedParent {
    pub source: String,
    pub seq: i64,
    pub text: String,
    pub rerank_score: Option<f32>,
}

/// A file row in the relational store; `name` is globally unique and is
/// the `source` key for all of its parent chunks.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub name: String,
    pub storage_json: String,
    pub collection: String,
    pub created_at: i64,
}

/// A chat message exchanged with the language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_dot_disjoint() {
        let a = SparseVector {
            indices: vec![1, 2],
            values: vec![1.0, 1.0],
        };
        let b = SparseVector {
            indices: vec![3, 4],
            values: vec![1.0, 1.0],
        };
        assert_eq!(a.dot(&b), 0.0);
    }

    #[test]
    fn test_sparse_dot_overlap() {
        let a = SparseVector {
            indices: vec![1, 5, 9],
            values: vec![2.0, 3.0, 1.0],
        };
        let b = SparseVector {
            indices: vec![5, 9],
            values: vec![0.5, 2.0],
        };
        assert!((a.dot(&b) - 3.5).abs() < 1e-6);
    }
}
