//! Retrieval pipeline orchestration.
//!
//! Wires the chunker, embedders, vector index, document store, reranker,
//! relevance gate, semantic cache, and chat model into the two top-level
//! flows: ingestion (text in, chunks stored and indexed) and answering
//! (question in, streamed answer out).
//!
//! All components are injected, so tests and the server construct the same
//! pipeline from different parts.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cache::SemanticCache;
use crate::chunk::Chunker;
use crate::config::Config;
use crate::docstore::Docstore;
use crate::embedding::{DenseEmbedder, HttpDenseEmbedder, SparseEmbedder};
use crate::gate::{GateDecision, RelevanceGate, DEFLECTION_MESSAGE};
use crate::index::{QdrantIndex, VectorIndex};
use crate::llm::{ChatModel, HttpChatModel};
use crate::loader;
use crate::models::{IndexPoint, Message, RetrievedParent};
use crate::rerank::{HttpReranker, Reranker};
use crate::storage::{LocalObjectStore, ObjectStore, StorageRef};

const ANSWER_SYSTEM_PROMPT: &str = "You answer questions using only the provided context. \
If the context does not contain the answer, say so. Be concise and cite the source \
document names when helpful.";

/// Counters reported after an ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub files: usize,
    pub parents: usize,
    pub children: usize,
}

/// Per-query overrides for the `[retrieval]` configuration. Unset fields
/// fall back to the configured defaults.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub rerank_top_k: Option<usize>,
    pub rerank: Option<bool>,
    pub neighbors: Option<bool>,
    pub relevance_gate: Option<bool>,
}

/// The outcome of answering a question.
pub enum Answer {
    /// Served from the semantic cache without retrieval.
    Cached(String),
    /// The relevance gate rejected the retrieved context.
    Deflected(String),
    /// Tokens streaming from the language model.
    Stream(mpsc::Receiver<Result<String>>),
}

pub struct Pipeline {
    chunker: Chunker,
    dense: Arc<dyn DenseEmbedder>,
    sparse: SparseEmbedder,
    index: Arc<dyn VectorIndex>,
    docstore: Arc<Docstore>,
    reranker: Arc<dyn Reranker>,
    chat: Arc<dyn ChatModel>,
    gate: RelevanceGate,
    cache: Option<Arc<SemanticCache>>,
    storage: Arc<dyn ObjectStore>,
    config: Config,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        dense: Arc<dyn DenseEmbedder>,
        index: Arc<dyn VectorIndex>,
        docstore: Arc<Docstore>,
        reranker: Arc<dyn Reranker>,
        chat: Arc<dyn ChatModel>,
        storage: Arc<dyn ObjectStore>,
    ) -> Self {
        let chunking = &config.chunking;
        let chunker = Chunker::new(
            chunking.parent_window,
            chunking.parent_overlap,
            chunking.effective_child_window(),
            chunking.child_overlap,
        );
        let sparse = SparseEmbedder::new(config.embedding.sparse_avgdl);
        let gate = RelevanceGate::new(chat.clone());
        let cache = config.cache.enabled.then(|| {
            Arc::new(SemanticCache::new(
                config.cache.distance_threshold,
                config
                    .cache
                    .ttl_secs
                    .map(std::time::Duration::from_secs),
            ))
        });

        Self {
            chunker,
            dense,
            sparse,
            index,
            docstore,
            reranker,
            chat,
            gate,
            cache,
            storage,
            config,
        }
    }

    /// Wire a pipeline from configuration with the HTTP-backed components.
    pub fn from_config(config: Config, docstore: Arc<Docstore>) -> Result<Self> {
        let dense = Arc::new(HttpDenseEmbedder::new(&config.embedding)?);
        let index = Arc::new(QdrantIndex::new(&config.index, config.embedding.dims)?);
        let reranker = Arc::new(HttpReranker::new(&config.rerank)?);
        let chat = Arc::new(HttpChatModel::new(&config.llm)?);
        let storage = Arc::new(LocalObjectStore::new(&config.storage));
        Ok(Self::new(config, dense, index, docstore, reranker, chat, storage))
    }

    pub fn docstore(&self) -> &Docstore {
        &self.docstore
    }

    pub async fn ensure_ready(&self) -> Result<()> {
        self.index.ensure_ready().await
    }

    /// Ingest a batch of `(name, text)` documents: chunk, store parents,
    /// embed children, index.
    ///
    /// The relational rows are staged in one transaction that commits only
    /// after the index accepts the new vectors; a failed embedding or
    /// upsert leaves no file or parent rows behind.
    pub async fn ingest_documents(&self, docs: &[(String, String)]) -> Result<IngestStats> {
        let (parents, children) = self.chunker.split_documents(docs);

        let mut tx = self.docstore.begin().await?;
        for (name, _) in docs {
            let file_id =
                Docstore::upsert_file_in(&mut tx, name, "{}", &self.config.index.collection)
                    .await?;
            let file_parents: Vec<_> = parents
                .iter()
                .filter(|p| p.source == *name)
                .cloned()
                .collect();
            Docstore::replace_parents_in(&mut tx, file_id, name, &file_parents).await?;
        }

        // Clear vectors from any previous version of these sources before
        // indexing the new children.
        for (name, _) in docs {
            self.index.delete_by_source(name).await?;
        }
        self.index_children(&children).await?;
        tx.commit().await?;

        let stats = IngestStats {
            files: docs.len(),
            parents: parents.len(),
            children: children.len(),
        };
        tracing::info!(
            files = stats.files,
            parents = stats.parents,
            children = stats.children,
            "ingestion complete"
        );
        Ok(stats)
    }

    /// Ingest an uploaded file: persist the raw bytes, extract text, then
    /// chunk and index it. Re-uploading a name replaces the previous
    /// version completely, parents and vectors both.
    ///
    /// Same commit discipline as [`ingest_documents`](Self::ingest_documents):
    /// the file and parent rows become visible only once indexing succeeds.
    pub async fn ingest_upload(&self, name: &str, bytes: &[u8]) -> Result<IngestStats> {
        let text = loader::load_bytes(name, bytes)?;
        let reference = self.storage.put(name, bytes).await?;
        let storage_json = serde_json::to_string(&reference)?;

        let mut next_child_id = 0i64;
        let (parents, children) = self.chunker.split_document(name, &text, &mut next_child_id);

        let mut tx = self.docstore.begin().await?;
        let file_id =
            Docstore::upsert_file_in(&mut tx, name, &storage_json, &self.config.index.collection)
                .await?;
        Docstore::replace_parents_in(&mut tx, file_id, name, &parents).await?;

        self.index.delete_by_source(name).await?;
        self.index_children(&children).await?;
        tx.commit().await?;

        Ok(IngestStats {
            files: 1,
            parents: parents.len(),
            children: children.len(),
        })
    }

    async fn index_children(&self, children: &[crate::models::ChildChunk]) -> Result<()> {
        if children.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = children.iter().map(|c| c.text.clone()).collect();
        let dense = self.dense.embed(&texts).await?;
        let sparse = self.sparse.embed(&texts);

        let points: Vec<IndexPoint> = children
            .iter()
            .zip(dense)
            .zip(sparse)
            .map(|((child, dense), sparse)| IndexPoint {
                dense,
                sparse,
                payload: child.payload(),
            })
            .collect();

        self.index
            .upsert(points, self.config.index.upsert_batch_size)
            .await
    }

    /// Delete a file everywhere: relational store (cascading to parents),
    /// vector index, and object storage. Returns `false` if the file was
    /// not known.
    pub async fn delete_file(&self, name: &str) -> Result<bool> {
        let Some(record) = self.docstore.delete_file(name).await? else {
            return Ok(false);
        };

        self.index.delete_by_source(name).await?;
        if let Ok(reference) = serde_json::from_str::<StorageRef>(&record.storage_json) {
            self.storage.delete(&reference).await?;
        }

        tracing::info!(name, "file deleted");
        Ok(true)
    }

    /// Merge per-query overrides with the configured retrieval defaults.
    fn effective_retrieval(&self, opts: &QueryOptions) -> crate::config::RetrievalConfig {
        let defaults = &self.config.retrieval;
        crate::config::RetrievalConfig {
            top_k: opts.top_k.unwrap_or(defaults.top_k),
            rerank_top_k: opts.rerank_top_k.unwrap_or(defaults.rerank_top_k),
            rerank: opts.rerank.unwrap_or(defaults.rerank),
            neighbors: opts.neighbors.unwrap_or(defaults.neighbors),
            relevance_gate: opts.relevance_gate.unwrap_or(defaults.relevance_gate),
        }
    }

    /// Retrieve context for a question: hybrid search over children,
    /// resolve to parents, rerank, then widen with neighbors.
    pub async fn retrieve(
        &self,
        question: &str,
        opts: &QueryOptions,
    ) -> Result<Vec<RetrievedParent>> {
        let dense = self
            .dense
            .embed(std::slice::from_ref(&question.to_string()))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no vector for query"))?;
        self.retrieve_with_embedding(question, &dense, opts).await
    }

    async fn retrieve_with_embedding(
        &self,
        question: &str,
        dense: &[f32],
        opts: &QueryOptions,
    ) -> Result<Vec<RetrievedParent>> {
        let retrieval = self.effective_retrieval(opts);
        let sparse = self.sparse.embed_one(question);

        let hits = self
            .index
            .search(dense, &sparse, true, retrieval.top_k, None)
            .await?
            .into_hits();
        tracing::debug!(hits = hits.len(), "hybrid search");

        let mut parents = self.docstore.resolve_parents(&hits).await?;

        if retrieval.rerank && !parents.is_empty() {
            let documents: Vec<String> = parents.iter().map(|p| p.text.clone()).collect();
            let ranked = self
                .reranker
                .rerank(question, &documents, retrieval.rerank_top_k, false)
                .await?;
            parents = ranked
                .into_iter()
                .map(|r| {
                    let mut parent = parents[r.index].clone();
                    parent.rerank_score = Some(r.score);
                    parent
                })
                .collect();
        } else {
            parents.truncate(retrieval.rerank_top_k);
        }

        if retrieval.neighbors {
            for parent in &mut parents {
                parent.text = self
                    .docstore
                    .expand_neighbors(&parent.source, parent.seq)
                    .await?;
            }
        }

        Ok(parents)
    }

    /// Answer a question end to end: cache, retrieval, relevance gate,
    /// then streamed generation. Completed answers are written back to the
    /// cache.
    pub async fn answer(&self, question: &str, opts: &QueryOptions) -> Result<Answer> {
        let dense = self
            .dense
            .embed(std::slice::from_ref(&question.to_string()))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no vector for query"))?;

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lookup(&dense) {
                tracing::info!("answer served from cache");
                return Ok(Answer::Cached(hit.answer));
            }
        }

        let parents = self.retrieve_with_embedding(question, &dense, opts).await?;
        if parents.is_empty() {
            return Ok(Answer::Deflected(DEFLECTION_MESSAGE.to_string()));
        }

        let context = parents
            .iter()
            .map(|p| format!("[Source: {}, ID: {}]\n{}", p.source, p.seq, p.text))
            .collect::<Vec<_>>()
            .join("\n\n");

        if self.effective_retrieval(opts).relevance_gate {
            if self.gate.assess(question, &context).await? == GateDecision::Deflect {
                tracing::info!("relevance gate deflected the question");
                return Ok(Answer::Deflected(DEFLECTION_MESSAGE.to_string()));
            }
        }

        let messages = vec![
            Message::system(ANSWER_SYSTEM_PROMPT),
            Message::user(format!(
                "Context:\n{}\n\nQuestion: {}",
                context, question
            )),
        ];
        let mut upstream = self.chat.stream(&messages).await?;

        // Relay the stream so the finished answer can be cached.
        let (tx, rx) = mpsc::channel(32);
        let cache = self.cache.clone();
        let question = question.to_string();
        tokio::spawn(async move {
            let mut full = String::new();
            let mut failed = false;
            while let Some(item) = upstream.recv().await {
                match &item {
                    Ok(token) => full.push_str(token),
                    Err(_) => failed = true,
                }
                if tx.send(item).await.is_err() {
                    // Consumer went away; do not cache a partial answer.
                    return;
                }
            }
            if !failed && !full.is_empty() {
                if let Some(cache) = cache {
                    cache.store(&question, dense, &full);
                }
            }
        });

        Ok(Answer::Stream(rx))
    }
}
