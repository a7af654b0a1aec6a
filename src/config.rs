//! TOML configuration.
//!
//! The file is read once at startup by [`load_config`] and the resulting
//! [`Config`] is passed explicitly to every component. Secrets (API keys,
//! AWS credentials) are read from the environment, never from the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use pdf_rag_core::chunk::{
    ChunkingParams, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, FULL_HASH_LEN,
};
use pdf_rag_core::models::DEFAULT_QUERY_TTL_SECS;
use pdf_rag_core::query::{
    RetrievalParams, DEFAULT_MIN_SCORE, DEFAULT_SOURCE_MIN_SCORE, DEFAULT_TOP_K,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub queries: QueriesConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    /// Parent of the per-user document directories.
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.pdf".to_string()]
}
fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default = "default_s3_prefix")]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_s3_prefix() -> String {
    "source/".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_id_hash_len")]
    pub id_hash_len: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            id_hash_len: FULL_HASH_LEN,
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkingParams {
        ChunkingParams {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            id_hash_len: self.id_hash_len,
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_chunk_overlap() -> usize {
    DEFAULT_CHUNK_OVERLAP
}
fn default_id_hash_len() -> usize {
    FULL_HASH_LEN
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_source_min_score")]
    pub source_min_score: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            min_score: DEFAULT_MIN_SCORE,
            source_min_score: DEFAULT_SOURCE_MIN_SCORE,
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> RetrievalParams {
        RetrievalParams {
            top_k: self.top_k,
            min_score: self.min_score,
            source_min_score: self.source_min_score,
        }
    }
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}
fn default_min_score() -> f64 {
    DEFAULT_MIN_SCORE
}
fn default_source_min_score() -> f64 {
    DEFAULT_SOURCE_MIN_SCORE
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama, OpenAI-compatible gateways).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
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

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            url: None,
            max_retries: 0,
            timeout_secs: 120,
        }
    }
}

fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueriesConfig {
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,
    #[serde(default = "default_user")]
    pub default_user: String,
}

impl Default for QueriesConfig {
    fn default() -> Self {
        Self {
            max_query_chars: default_max_query_chars(),
            list_limit: default_list_limit(),
            ttl_secs: DEFAULT_QUERY_TTL_SECS,
            default_user: default_user(),
        }
    }
}

fn default_max_query_chars() -> usize {
    2000
}
fn default_list_limit() -> usize {
    25
}
fn default_ttl_secs() -> i64 {
    DEFAULT_QUERY_TTL_SECS
}
fn default_user() -> String {
    "nobody".to_string()
}

/// How `POST /users/{user_id}/queries` processes the question.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// Answer before responding.
    #[default]
    Inline,
    /// Respond with the pending record and answer on a worker.
    Background,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub query_mode: QueryMode,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            query_mode: QueryMode::default(),
            workers: default_workers(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    let chunking = &config.chunking;
    if chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if chunking.chunk_overlap >= chunking.chunk_size {
        bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }
    if !(1..=FULL_HASH_LEN).contains(&chunking.id_hash_len) {
        bail!("chunking.id_hash_len must be in [1, {}]", FULL_HASH_LEN);
    }

    // Validate retrieval
    let retrieval = &config.retrieval;
    if retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if retrieval.min_score > retrieval.source_min_score {
        bail!("retrieval.min_score must be <= retrieval.source_min_score");
    }

    // Validate embedding
    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" | "gemini" => {
            if embedding.dims.is_none() || embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    embedding.provider
                );
            }
            if embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, gemini, or local.",
            other
        ),
    }
    if embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    // Validate llm
    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" | "ollama" | "gemini" => {
            if config.llm.model.is_none() {
                bail!(
                    "llm.model must be specified when provider is '{}'",
                    config.llm.provider
                );
            }
        }
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, ollama, or gemini.",
            other
        ),
    }

    // Validate queries
    if config.queries.max_query_chars == 0 {
        bail!("queries.max_query_chars must be > 0");
    }
    if config.queries.list_limit == 0 {
        bail!("queries.list_limit must be > 0");
    }
    if config.queries.ttl_secs <= 0 {
        bail!("queries.ttl_secs must be > 0");
    }
    if crate::loader::validate_user(&config.queries.default_user).is_err() {
        bail!(
            "queries.default_user is not a valid user id: '{}'",
            config.queries.default_user
        );
    }

    if config.server.workers == 0 {
        bail!("server.workers must be > 0");
    }

    Ok(())
}

/// Defaults rooted in a scratch directory.
#[cfg(test)]
pub(crate) fn test_config(root: &Path) -> Config {
    Config {
        db: DbConfig {
            path: root.join("rag.sqlite"),
        },
        documents: DocumentsConfig {
            root: root.join("documents"),
            include_globs: default_include_globs(),
            max_upload_bytes: 1024 * 1024,
            s3: None,
        },
        chunking: ChunkingConfig::default(),
        retrieval: RetrievalConfig::default(),
        embedding: EmbeddingConfig::default(),
        llm: LlmConfig::default(),
        queries: QueriesConfig::default(),
        server: ServerConfig::default(),
        logging: LoggingConfig::default(),
    }
}
