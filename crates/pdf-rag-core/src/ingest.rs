//! Idempotent ingestion into a [`VectorStore`].
//!
//! [`add_chunks`] embeds and stores only chunks whose identifier is not yet
//! present for the tenant:
//!
//! 1. Read the tenant's identifier set for the provider's [`ModelKey`]
//!    (no vectors).
//! 2. Drop chunks already stored, and repeats within the input.
//! 3. Embed the remainder in batches and insert them keyed by identifier.
//!
//! Because identifiers are content-addressed, re-ingesting an unchanged
//! corpus embeds nothing and inserts nothing. The store's conditional
//! insert covers concurrent writers that both pass step 2.
//!
//! Chunks embedded by a different model (or at a different dimension) are
//! not in step 1's set, so switching `[embedding]` re-embeds the corpus on
//! the next run.

use std::collections::HashSet;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::embedding::EmbeddingProvider;
use crate::models::Chunk;
use crate::store::{ModelKey, VectorStore};

/// Counts from one [`add_chunks`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Chunks offered.
    pub total: usize,
    /// Chunks skipped because their identifier was already stored or repeated.
    pub skipped: usize,
    /// Rows the store actually inserted, or re-embedded from a stale model.
    pub added: usize,
}

/// Embed and store the chunks that are new for `tenant`.
pub async fn add_chunks(
    store: &dyn VectorStore,
    embedder: &dyn EmbeddingProvider,
    tenant: &str,
    chunks: &[Chunk],
    batch_size: usize,
) -> Result<IngestReport> {
    let key = ModelKey::of(embedder);
    let existing = store.existing_ids(tenant, &key).await?;
    debug!(tenant, model = %key.model, existing = existing.len(), "loaded stored chunk ids");

    let fresh = filter_new(chunks, &existing);
    let mut report = IngestReport {
        total: chunks.len(),
        skipped: chunks.len() - fresh.len(),
        added: 0,
    };

    if fresh.is_empty() {
        info!(tenant, total = report.total, "no new chunks to add");
        return Ok(report);
    }

    for batch in fresh.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed_texts(&texts).await?;
        if vectors.len() != batch.len() {
            bail!(
                "embedding provider returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            );
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != key.dims) {
            bail!(
                "embedding model '{}' returned a {}-dimensional vector, expected {}",
                key.model,
                bad.len(),
                key.dims
            );
        }

        let inserted = store.upsert(tenant, &key, batch, &vectors).await?;
        report.skipped += batch.len() - inserted;
        report.added += inserted;
    }

    info!(
        tenant,
        total = report.total,
        added = report.added,
        skipped = report.skipped,
        "added chunks"
    );
    Ok(report)
}

/// Chunks whose id is absent from `existing`, first occurrence only.
pub fn filter_new(chunks: &[Chunk], existing: &HashSet<String>) -> Vec<Chunk> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .filter(|c| !existing.contains(&c.id) && seen.insert(c.id.as_str()))
        .cloned()
        .collect()
}
