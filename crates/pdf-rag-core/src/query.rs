//! Retrieval and answer generation.
//!
//! [`answer_question`] runs the query pipeline for one tenant:
//!
//! ```text
//! question ─► embed ─► top-k search ─► best score >= min_score? ─no─► NoMatch
//!                                              │ yes
//!                                              ▼
//!                         context = texts joined by "\n\n---\n\n"
//!                                              ▼
//!                              prompt template ─► LLM ─► Answered
//! ```
//!
//! Sources are the retrieved chunks scoring at least `source_min_score`,
//! de-duplicated by (filename, page) in rank order. An LLM failure is
//! returned to the caller unchanged.

use std::collections::HashSet;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::embedding::{embed_query, EmbeddingProvider};
use crate::llm::LlmProvider;
use crate::models::Source;
use crate::store::{ModelKey, ScoredChunk, VectorStore};

pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Stored as the answer of a query whose retrieval found nothing usable.
pub const NO_MATCH_ANSWER: &str = "Unable to find matching results.";

pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_MIN_SCORE: f64 = 0.4;
pub const DEFAULT_SOURCE_MIN_SCORE: f64 = 0.5;

/// Retrieval knobs; scores are cosine similarities.
#[derive(Debug, Clone)]
pub struct RetrievalParams {
    pub top_k: usize,
    /// Below this best score the question is answered with "no match".
    pub min_score: f64,
    /// Minimum score for a chunk to be cited as a source.
    pub source_min_score: f64,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            min_score: DEFAULT_MIN_SCORE,
            source_min_score: DEFAULT_SOURCE_MIN_SCORE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Nothing retrieved, or the best score was under `min_score`.
    NoMatch,
    Answered { answer: String, sources: Vec<Source> },
}

impl QueryOutcome {
    /// Answer text and sources to store on a completed record.
    pub fn into_parts(self) -> (String, Vec<Source>) {
        match self {
            QueryOutcome::NoMatch => (NO_MATCH_ANSWER.to_string(), Vec::new()),
            QueryOutcome::Answered { answer, sources } => (answer, sources),
        }
    }
}

/// Answer `question` from the tenant's indexed chunks.
pub async fn answer_question(
    store: &dyn VectorStore,
    embedder: &dyn EmbeddingProvider,
    llm: &dyn LlmProvider,
    tenant: &str,
    question: &str,
    params: &RetrievalParams,
) -> Result<QueryOutcome> {
    let key = ModelKey::of(embedder);
    let query_vec = embed_query(embedder, question).await?;
    let results = store
        .similarity_search(tenant, &key, &query_vec, params.top_k)
        .await?;

    if results.is_empty() {
        let stored = store.count(tenant).await?;
        if stored > 0 {
            warn!(
                tenant,
                stored,
                model = %key.model,
                dims = key.dims,
                "index holds no chunks for the current embedding model; re-run ingest"
            );
        }
    }

    let best = results.first().map(|r| r.score);
    match best {
        Some(score) if score >= params.min_score => {
            debug!(tenant, best = score, hits = results.len(), "retrieved context");
        }
        _ => {
            info!(tenant, best = ?best, "no matching chunks");
            return Ok(QueryOutcome::NoMatch);
        }
    }

    let prompt = build_prompt(&build_context(&results), question);
    let answer = llm.generate(&prompt).await?;
    let sources = collect_sources(&results, params.source_min_score);

    info!(tenant, sources = sources.len(), model = llm.model_name(), "answered query");
    Ok(QueryOutcome::Answered { answer, sources })
}

pub fn build_context(results: &[ScoredChunk]) -> String {
    results
        .iter()
        .map(|r| r.chunk.text.as_str())
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

/// Render the fixed prompt. Braces inside `context` or `question` are
/// copied through untouched.
pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "Answer the question based only on the following context:\n\n\
         {context}\n\n---\n\n\
         Answer the question based on the above context: {question}"
    )
}

/// Sources scoring at least `min_score`, first occurrence of each
/// (filename, page) in rank order.
pub fn collect_sources(results: &[ScoredChunk], min_score: f64) -> Vec<Source> {
    let mut seen = HashSet::new();
    results
        .iter()
        .filter(|r| r.score >= min_score)
        .map(|r| r.chunk.source_ref())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}
