use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_parent_window")]
    pub parent_window: usize,
    #[serde(default = "default_parent_overlap")]
    pub parent_overlap: usize,
    /// Child window in bytes; defaults to `max_seq_len - 30` so children
    /// stay inside the embedding model's input budget.
    #[serde(default)]
    pub child_window: Option<usize>,
    #[serde(default = "default_child_overlap")]
    pub child_overlap: usize,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            parent_window: default_parent_window(),
            parent_overlap: default_parent_overlap(),
            child_window: None,
            child_overlap: default_child_overlap(),
            max_seq_len: default_max_seq_len(),
        }
    }
}

impl ChunkingConfig {
    pub fn effective_child_window(&self) -> usize {
        self.child_window
            .unwrap_or_else(|| self.max_seq_len.saturating_sub(30))
    }
}

fn default_parent_window() -> usize {
    2000
}
fn default_parent_overlap() -> usize {
    200
}
fn default_child_overlap() -> usize {
    80
}
fn default_max_seq_len() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Environment variable holding the API key, if the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Average document length (in tokens) for BM25 sparse weighting.
    #[serde(default = "default_avgdl")]
    pub sparse_avgdl: f32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_embedding_endpoint(),
            model: default_embedding_model(),
            dims: default_dims(),
            api_key_env: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            sparse_avgdl: default_avgdl(),
        }
    }
}

fn default_embedding_endpoint() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_avgdl() -> f32 {
    256.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Rank constant for reciprocal-rank fusion.
    #[serde(default = "default_rank_constant")]
    pub rank_constant: usize,
    #[serde(default = "default_upsert_batch")]
    pub upsert_batch_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: default_index_url(),
            collection: default_collection(),
            rank_constant: default_rank_constant(),
            upsert_batch_size: default_upsert_batch(),
        }
    }
}

fn default_index_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_collection() -> String {
    "dochive".to_string()
}
fn default_rank_constant() -> usize {
    60
}
fn default_upsert_batch() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_rerank_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            endpoint: default_rerank_endpoint(),
            model: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_rerank_endpoint() -> String {
    "http://localhost:8080/rerank".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
            api_key_env: default_llm_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_llm_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds until a stored entry expires; `None` means no expiry.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: None,
            distance_threshold: default_distance_threshold(),
        }
    }
}

fn default_distance_threshold() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: usize,
    #[serde(default = "default_true")]
    pub rerank: bool,
    #[serde(default = "default_true")]
    pub neighbors: bool,
    #[serde(default = "default_true")]
    pub relevance_gate: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            rerank_top_k: default_rerank_top_k(),
            rerank: true,
            neighbors: true,
            relevance_gate: true,
        }
    }
}

fn default_top_k() -> usize {
    50
}
fn default_rerank_top_k() -> usize {
    5
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            bucket: default_bucket(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/objects")
}
fn default_bucket() -> String {
    "uploads".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8008".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let c = &config.chunking;
    if c.parent_window == 0 {
        anyhow::bail!("chunking.parent_window must be > 0");
    }
    if c.effective_child_window() == 0 {
        anyhow::bail!("chunking.child_window (or max_seq_len - 30) must be > 0");
    }
    if c.effective_child_window() >= c.parent_window {
        anyhow::bail!("chunking.child_window must be smaller than parent_window");
    }
    if c.parent_overlap >= c.parent_window {
        anyhow::bail!("chunking.parent_overlap must be smaller than parent_window");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.index.upsert_batch_size == 0 {
        anyhow::bail!("index.upsert_batch_size must be > 0");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=2.0).contains(&config.cache.distance_threshold) {
        anyhow::bail!("cache.distance_threshold must be in [0.0, 2.0]");
    }

    Ok(())
}
