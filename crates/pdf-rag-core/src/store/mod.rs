//! Storage abstraction for PDF RAG.
//!
//! Two traits cover everything the pipelines persist:
//!
//! - [`VectorStore`] holds embedded chunks, partitioned by tenant.
//! - [`QueryStore`] holds per-user query records with an expiry.
//!
//! Implementations must be `Send + Sync` to work with async runtimes. The
//! in-memory implementations in [`memory`] back unit tests; the SQLite
//! implementations live in the app crate.

pub mod memory;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::models::{Chunk, QueryRecord};

/// The embedding space a vector belongs to.
///
/// Vectors are only comparable within one key. A stored chunk whose key
/// differs from the current provider's is stale: it is invisible to
/// search, absent from [`VectorStore::existing_ids`], and replaced by the
/// next [`VectorStore::upsert`] of the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub model: String,
    pub dims: usize,
}

impl ModelKey {
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
        }
    }

    pub fn of(provider: &dyn EmbeddingProvider) -> Self {
        Self::new(provider.model_name(), provider.dims())
    }
}

/// A chunk returned from similarity search with its cosine similarity.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Cosine similarity in `[-1.0, 1.0]`; higher is more similar.
    pub score: f64,
}

/// Tenant-partitioned vector index.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`existing_ids`](VectorStore::existing_ids) | Identifiers embedded under a key, no vectors |
/// | [`upsert`](VectorStore::upsert) | Conditional insert keyed by chunk id |
/// | [`similarity_search`](VectorStore::similarity_search) | Top-k by cosine similarity within a key |
/// | [`count`](VectorStore::count) | Number of stored chunks |
/// | [`clear`](VectorStore::clear) | Drop every chunk of a tenant |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Chunk identifiers stored for `tenant` with vectors from `key`.
    async fn existing_ids(&self, tenant: &str, key: &ModelKey) -> Result<HashSet<String>>;

    /// Insert chunks with their `key` vectors. A chunk whose id is already
    /// stored under the same key is left untouched; one stored under
    /// another key gets the new vector.
    ///
    /// Returns the number of rows inserted or replaced.
    async fn upsert(
        &self,
        tenant: &str,
        key: &ModelKey,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<usize>;

    /// The `k` chunks under `key` most similar to `query_vec`, best first.
    async fn similarity_search(
        &self,
        tenant: &str,
        key: &ModelKey,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>>;

    /// Chunks stored for `tenant`, whatever their key.
    async fn count(&self, tenant: &str) -> Result<usize>;

    /// Delete every chunk of `tenant`. Returns the number removed.
    async fn clear(&self, tenant: &str) -> Result<usize>;
}

/// Per-user query history.
///
/// Records past their `ttl` are invisible to [`get`](QueryStore::get)
/// and [`list`](QueryStore::list).
#[async_trait]
pub trait QueryStore: Send + Sync {
    /// Insert or replace a record, keyed by `query_id`.
    async fn put(&self, record: &QueryRecord) -> Result<()>;

    async fn get(&self, user_id: &str, query_id: &str) -> Result<Option<QueryRecord>>;

    /// Newest first, at most `limit` records. Records created in the same
    /// second come back in reverse insertion order.
    async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<QueryRecord>>;

    /// Delete expired records. Returns the number removed.
    async fn purge_expired(&self) -> Result<usize>;
}

/// Order candidates best first and keep the top `k`.
///
/// Ties keep their incoming order.
pub fn rank_top_k(mut scored: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(k);
    scored
}
