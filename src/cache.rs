//! Semantic response cache.
//!
//! Finished answers are stored alongside the query embedding that produced
//! them. A later query whose embedding sits within the configured cosine
//! distance of a stored entry is answered from the cache without touching
//! the retrieval pipeline.
//!
//! Entries expire lazily: an expired entry is dropped the next time the
//! cache is consulted. `clear` empties the cache but keeps it usable;
//! `delete` tears the structure down until the next `store` recreates it.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::embedding::cosine_distance;

struct CacheEntry {
    prompt: String,
    embedding: Vec<f32>,
    answer: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A cache hit: the stored prompt and its answer.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub prompt: String,
    pub answer: String,
}

pub struct SemanticCache {
    // None means the structure was deleted; store() recreates it.
    entries: RwLock<Option<Vec<CacheEntry>>>,
    distance_threshold: f32,
    ttl: Option<Duration>,
}

impl SemanticCache {
    pub fn new(distance_threshold: f32, ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(Some(Vec::new())),
            distance_threshold,
            ttl,
        }
    }

    /// Closest non-expired entry within the distance threshold
    /// (inclusive), if any.
    pub fn lookup(&self, embedding: &[f32]) -> Option<CacheHit> {
        let now = Instant::now();
        let mut guard = self.entries.write().expect("cache lock");
        let entries = guard.as_mut()?;
        entries.retain(|e| !e.expired(now));

        let mut best: Option<(f32, &CacheEntry)> = None;
        for entry in entries.iter() {
            let distance = cosine_distance(embedding, &entry.embedding);
            if distance <= self.distance_threshold
                && best.map_or(true, |(d, _)| distance < d)
            {
                best = Some((distance, entry));
            }
        }

        best.map(|(distance, entry)| {
            tracing::debug!(distance, "semantic cache hit");
            CacheHit {
                prompt: entry.prompt.clone(),
                answer: entry.answer.clone(),
            }
        })
    }

    /// Store an answer under its query embedding, recreating the cache if
    /// it was deleted.
    pub fn store(&self, prompt: &str, embedding: Vec<f32>, answer: &str) {
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        let mut guard = self.entries.write().expect("cache lock");
        guard.get_or_insert_with(Vec::new).push(CacheEntry {
            prompt: prompt.to_string(),
            embedding,
            answer: answer.to_string(),
            expires_at,
        });
    }

    /// Drop all entries; the cache stays usable.
    pub fn clear(&self) {
        let mut guard = self.entries.write().expect("cache lock");
        if let Some(entries) = guard.as_mut() {
            entries.clear();
        }
    }

    /// Tear down the cache structure entirely.
    pub fn delete(&self) {
        let mut guard = self.entries.write().expect("cache lock");
        *guard = None;
    }
}
