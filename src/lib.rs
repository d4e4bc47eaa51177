//! # Dochive
//!
//! A hybrid parent/child retrieval pipeline for question answering over
//! document collections.
//!
//! Dochive ingests documents by splitting them into a two-level hierarchy
//! (large parent chunks for generation, small child chunks for indexing),
//! embeds the children densely and sparsely, and serves queries through a
//! hybrid search → parent resolution → rerank → neighbor expansion →
//! relevance gate → generation flow, fronted by a semantic response cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌───────────────┐
//! │  Loader  │──▶│    Chunker    │──▶│ Vector index  │ (children)
//! │ txt/pdf  │   │ parent/child  │   ├───────────────┤
//! └──────────┘   └───────────────┘   │ SQLite store  │ (parents)
//!                                    └───────┬───────┘
//!                                            ▼
//!   query ─▶ cache ─▶ search ─▶ resolve ─▶ rerank ─▶ neighbors
//!                                       ─▶ relevance gate ─▶ generate
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`chunk`] | Two-level recursive text chunking |
//! | [`embedding`] | Dense and sparse embedding services |
//! | [`index`] | Vector index trait, RRF fusion, Qdrant adapter |
//! | [`db`] | SQLite pool and migrations |
//! | [`docstore`] | Parent chunk and file persistence |
//! | [`loader`] | Text extraction from txt/md/pdf |
//! | [`storage`] | Object storage for raw uploads |
//! | [`rerank`] | Cross-encoder reranking |
//! | [`gate`] | Relevance gate |
//! | [`cache`] | Semantic response cache |
//! | [`llm`] | Chat model client with streaming |
//! | [`pipeline`] | Retrieval orchestrator |
//! | [`server`] | HTTP API |

pub mod cache;
pub mod chunk;
pub mod config;
pub mod db;
pub mod docstore;
pub mod embedding;
pub mod gate;
pub mod index;
pub mod llm;
pub mod loader;
pub mod models;
pub mod pipeline;
pub mod rerank;
pub mod server;
pub mod storage;
