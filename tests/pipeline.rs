//! End-to-end pipeline tests with in-process components: an in-memory
//! SQLite store, a brute-force vector index, and deterministic fakes for
//! the embedding, rerank, and chat services.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use dochive::config::Config;
use dochive::db;
use dochive::docstore::Docstore;
use dochive::embedding::{normalize, DenseEmbedder, SparseEmbedder};
use dochive::gate::DEFLECTION_MESSAGE;
use dochive::index::{MemoryIndex, VectorIndex};
use dochive::llm::ChatModel;
use dochive::models::Message;
use dochive::pipeline::{Answer, Pipeline, QueryOptions};
use dochive::rerank::{RerankResult, Reranker};
use dochive::storage::LocalObjectStore;

// ============ Fakes ============

/// Deterministic dense embedder: axis 0 counts occurrences of the marker
/// term, axis 1 is a constant. Texts containing the marker embed close to
/// marker queries; everything else lands at a fixed distance.
struct MarkerEmbedder {
    marker: &'static str,
}

#[async_trait]
impl DenseEmbedder for MarkerEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let count = text.to_lowercase().matches(self.marker).count();
                let mut v = vec![count as f32, 1.0];
                normalize(&mut v);
                v
            })
            .collect())
    }

    fn dims(&self) -> usize {
        2
    }
}

/// Embedder standing in for an unreachable embedding service.
struct UnavailableEmbedder;

#[async_trait]
impl DenseEmbedder for UnavailableEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        anyhow::bail!("embedding service unavailable")
    }

    fn dims(&self) -> usize {
        2
    }
}

/// Scores documents containing the marker term above everything else.
struct MarkerReranker {
    marker: String,
}

#[async_trait]
impl Reranker for MarkerReranker {
    async fn rerank(
        &self,
        _query: &str,
        documents: &[String],
        top_k: usize,
        return_all: bool,
    ) -> Result<Vec<RerankResult>> {
        let mut results: Vec<RerankResult> = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| RerankResult {
                index,
                score: if doc.contains(&self.marker) { 1.0 } else { 0.0 },
            })
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        if !return_all {
            results.truncate(top_k);
        }
        Ok(results)
    }
}

/// Chat model returning a fixed gate rating and a fixed token stream.
struct ScriptedChat {
    rating: &'static str,
    tokens: Vec<&'static str>,
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn complete(&self, _messages: &[Message]) -> Result<String> {
        Ok(format!(
            r#"{{"rating": {}, "remarks": "scripted"}}"#,
            self.rating
        ))
    }

    async fn stream(&self, _messages: &[Message]) -> Result<mpsc::Receiver<Result<String>>> {
        let (tx, rx) = mpsc::channel(32);
        for token in &self.tokens {
            tx.try_send(Ok(token.to_string())).expect("channel capacity");
        }
        Ok(rx)
    }
}

// ============ Harness ============

fn test_config() -> Config {
    toml::from_str(
        r#"
        [db]
        path = ":memory:"

        [chunking]
        parent_window = 60
        parent_overlap = 0
        child_window = 40
        child_overlap = 0

        [retrieval]
        top_k = 10
        rerank_top_k = 2

        [cache]
        enabled = true
        distance_threshold = 0.2
        "#,
    )
    .unwrap()
}

struct Harness {
    pipeline: Pipeline,
    index: Arc<MemoryIndex>,
    _storage_dir: tempfile::TempDir,
}

async fn harness(rating: &'static str, tokens: Vec<&'static str>) -> Harness {
    harness_with(
        Arc::new(MarkerEmbedder { marker: "zephyrite" }),
        rating,
        tokens,
    )
    .await
}

async fn harness_with(
    dense: Arc<dyn DenseEmbedder>,
    rating: &'static str,
    tokens: Vec<&'static str>,
) -> Harness {
    let config = test_config();
    let storage_dir = tempfile::tempdir().unwrap();
    let mut storage_config = config.storage.clone();
    storage_config.root = storage_dir.path().to_path_buf();

    let pool = db::connect_memory().await.unwrap();
    db::run_migrations(&pool).await.unwrap();

    let index = Arc::new(MemoryIndex::new(60));
    let pipeline = Pipeline::new(
        config,
        dense,
        index.clone(),
        Arc::new(Docstore::new(pool)),
        Arc::new(MarkerReranker {
            marker: "zephyrite".to_string(),
        }),
        Arc::new(ScriptedChat { rating, tokens }),
        Arc::new(LocalObjectStore::new(&storage_config)),
    );

    Harness {
        pipeline,
        index,
        _storage_dir: storage_dir,
    }
}

/// Three ~55-byte paragraphs; with a 60-byte parent window none of them
/// merge, so the document splits into exactly three parents.
const DOCUMENT: &str = "Alpha section discusses ordinary matters at length.\n\n\
The zephyrite crystal glows blue under bright moonlight.\n\n\
Omega section closes the document with final remarks.";

const QUESTION: &str = "Where does the zephyrite crystal glow?";

async fn drain(answer: Answer) -> (String, &'static str) {
    match answer {
        Answer::Cached(text) => (text, "cache"),
        Answer::Deflected(text) => (text, "deflected"),
        Answer::Stream(mut rx) => {
            let mut full = String::new();
            while let Some(token) = rx.recv().await {
                full.push_str(&token.unwrap());
            }
            (full, "stream")
        }
    }
}

// ============ Tests ============

#[tokio::test]
async fn test_ingest_splits_into_three_parents() {
    let h = harness("4", vec![]).await;
    let stats = h
        .pipeline
        .ingest_documents(&[("notes.txt".to_string(), DOCUMENT.to_string())])
        .await
        .unwrap();

    assert_eq!(stats.files, 1);
    assert_eq!(stats.parents, 3);
    assert!(stats.children >= 3);
    assert_eq!(h.pipeline.docstore().count_parents("notes.txt").await.unwrap(), 3);
}

#[tokio::test]
async fn test_retrieve_resolves_and_widens_matching_parent() {
    let h = harness("4", vec![]).await;
    h.pipeline
        .ingest_documents(&[("notes.txt".to_string(), DOCUMENT.to_string())])
        .await
        .unwrap();

    let parents = h.pipeline.retrieve(QUESTION, &QueryOptions::default()).await.unwrap();
    assert!(!parents.is_empty());

    // The reranker puts the zephyrite parent first; neighbor expansion
    // pulled in the surrounding sections.
    let top = &parents[0];
    assert_eq!(top.seq, 1);
    assert_eq!(top.rerank_score, Some(1.0));
    assert!(top.text.contains("Alpha section"));
    assert!(top.text.contains("zephyrite"));
    assert!(top.text.contains("Omega section"));
    assert!(parents.len() <= 2);
}

#[tokio::test]
async fn test_answer_streams_and_caches() {
    let h = harness("4", vec!["The crystal ", "glows blue."]).await;
    h.pipeline
        .ingest_documents(&[("notes.txt".to_string(), DOCUMENT.to_string())])
        .await
        .unwrap();

    let (text, kind) = drain(h.pipeline.answer(QUESTION, &QueryOptions::default()).await.unwrap()).await;
    assert_eq!(kind, "stream");
    assert_eq!(text, "The crystal glows blue.");

    // The identical question now hits the semantic cache.
    let (text, kind) = drain(h.pipeline.answer(QUESTION, &QueryOptions::default()).await.unwrap()).await;
    assert_eq!(kind, "cache");
    assert_eq!(text, "The crystal glows blue.");
}

#[tokio::test]
async fn test_unrelated_question_misses_cache() {
    let h = harness("4", vec!["answer one"]).await;
    h.pipeline
        .ingest_documents(&[("notes.txt".to_string(), DOCUMENT.to_string())])
        .await
        .unwrap();

    let (_, kind) = drain(h.pipeline.answer(QUESTION, &QueryOptions::default()).await.unwrap()).await;
    assert_eq!(kind, "stream");

    // Disjoint vocabulary embeds far from the cached entry.
    let (_, kind) = drain(
        h.pipeline
            .answer("How do penguins huddle for warmth?", &QueryOptions::default())
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(kind, "stream");
}

#[tokio::test]
async fn test_low_rating_deflects() {
    let h = harness("1", vec!["should never stream"]).await;
    h.pipeline
        .ingest_documents(&[("notes.txt".to_string(), DOCUMENT.to_string())])
        .await
        .unwrap();

    let (text, kind) = drain(h.pipeline.answer(QUESTION, &QueryOptions::default()).await.unwrap()).await;
    assert_eq!(kind, "deflected");
    assert_eq!(text, DEFLECTION_MESSAGE);
}

#[tokio::test]
async fn test_empty_corpus_deflects() {
    let h = harness("4", vec!["should never stream"]).await;
    let (text, kind) = drain(h.pipeline.answer(QUESTION, &QueryOptions::default()).await.unwrap()).await;
    assert_eq!(kind, "deflected");
    assert_eq!(text, DEFLECTION_MESSAGE);
}

#[tokio::test]
async fn test_upload_then_delete_clears_every_store() {
    let h = harness("4", vec![]).await;
    h.pipeline
        .ingest_upload("notes.txt", DOCUMENT.as_bytes())
        .await
        .unwrap();
    assert_eq!(h.pipeline.docstore().list_files().await.unwrap().len(), 1);

    assert!(h.pipeline.delete_file("notes.txt").await.unwrap());
    assert!(h.pipeline.docstore().list_files().await.unwrap().is_empty());
    assert_eq!(h.pipeline.docstore().count_parents("notes.txt").await.unwrap(), 0);

    // Nothing left to retrieve.
    let parents = h.pipeline.retrieve(QUESTION, &QueryOptions::default()).await.unwrap();
    assert!(parents.is_empty());

    // Deleting again reports the file as unknown.
    assert!(!h.pipeline.delete_file("notes.txt").await.unwrap());
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let h = harness("4", vec![]).await;
    let doc = [("notes.txt".to_string(), DOCUMENT.to_string())];
    h.pipeline.ingest_documents(&doc).await.unwrap();
    h.pipeline.ingest_documents(&doc).await.unwrap();

    assert_eq!(h.pipeline.docstore().list_files().await.unwrap().len(), 1);
    assert_eq!(h.pipeline.docstore().count_parents("notes.txt").await.unwrap(), 3);
}

#[tokio::test]
async fn test_failed_embedding_leaves_no_partial_state() {
    let h = harness_with(Arc::new(UnavailableEmbedder), "4", vec![]).await;
    let result = h
        .pipeline
        .ingest_documents(&[("notes.txt".to_string(), DOCUMENT.to_string())])
        .await;
    assert!(result.is_err());

    // The failed run must not leave a file or parent rows behind.
    assert!(h.pipeline.docstore().list_files().await.unwrap().is_empty());
    assert_eq!(h.pipeline.docstore().count_parents("notes.txt").await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_upload_leaves_no_partial_state() {
    let h = harness_with(Arc::new(UnavailableEmbedder), "4", vec![]).await;
    assert!(h
        .pipeline
        .ingest_upload("notes.txt", DOCUMENT.as_bytes())
        .await
        .is_err());

    assert!(h.pipeline.docstore().list_files().await.unwrap().is_empty());
    assert_eq!(h.pipeline.docstore().count_parents("notes.txt").await.unwrap(), 0);
}

#[tokio::test]
async fn test_reingest_shrunken_file_drops_stale_chunks() {
    let h = harness("4", vec![]).await;
    h.pipeline
        .ingest_documents(&[("notes.txt".to_string(), DOCUMENT.to_string())])
        .await
        .unwrap();
    assert_eq!(h.pipeline.docstore().count_parents("notes.txt").await.unwrap(), 3);

    // A shorter version of the same file replaces all three parents.
    let short = "Only the zephyrite shard remains on record.";
    h.pipeline
        .ingest_documents(&[("notes.txt".to_string(), short.to_string())])
        .await
        .unwrap();

    assert_eq!(h.pipeline.docstore().count_parents("notes.txt").await.unwrap(), 1);
    assert!(h.pipeline.docstore().get_parent("notes.txt", 1).await.unwrap().is_none());
    assert_eq!(
        h.pipeline.docstore().expand_neighbors("notes.txt", 0).await.unwrap(),
        short
    );

    // The old version's vectors are gone from the index too.
    let sparse = SparseEmbedder::new(256.0).embed_one("Omega section final remarks");
    let out = h.index.search(&[0.0, 1.0], &sparse, true, 10, None).await.unwrap();
    for hit in out.into_hits() {
        assert!(!hit.payload.text.contains("Omega"));
    }
}

#[tokio::test]
async fn test_neighbor_override_disables_expansion() {
    let h = harness("4", vec![]).await;
    h.pipeline
        .ingest_documents(&[("notes.txt".to_string(), DOCUMENT.to_string())])
        .await
        .unwrap();

    let opts = QueryOptions {
        neighbors: Some(false),
        rerank_top_k: Some(1),
        ..QueryOptions::default()
    };
    let parents = h.pipeline.retrieve(QUESTION, &opts).await.unwrap();
    assert_eq!(parents.len(), 1);
    assert!(parents[0].text.contains("zephyrite"));
    assert!(!parents[0].text.contains("Alpha section"));
    assert!(!parents[0].text.contains("Omega section"));
}
