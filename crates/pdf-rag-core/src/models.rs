//! Core data models shared by the ingestion and query pipelines.
//!
//! These types are storage-agnostic. Pages come out of the document loader,
//! chunks go into a [`VectorStore`](crate::store::VectorStore), and query
//! records go into a [`QueryStore`](crate::store::QueryStore).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Six months of thirty days, in seconds.
pub const DEFAULT_QUERY_TTL_SECS: i64 = 60 * 60 * 24 * 30 * 6;

/// Text of one PDF page (or of one window cut from a page by the splitter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRecord {
    /// Document path relative to the tenant directory, e.g. `"manual.pdf"`.
    pub source: String,
    /// One-based page number.
    pub page: u32,
    pub text: String,
}

impl PageRecord {
    pub fn new(source: impl Into<String>, page: u32, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            page,
            text: text.into(),
        }
    }
}

/// A chunk with its content-addressed identifier assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// `"{source}:{page}:{chunk_index}:{hash prefix}"`.
    pub id: String,
    pub source: String,
    pub page: u32,
    /// Zero-based position among the chunks of the same (source, page).
    pub chunk_index: u32,
    pub text: String,
    /// Full hex SHA-256 of `text`.
    pub hash: String,
}

impl Chunk {
    /// The provenance entry this chunk contributes to an answer.
    pub fn source_ref(&self) -> Source {
        Source {
            filename: self.source.clone(),
            page: self.page,
        }
    }
}

/// Provenance of an answer: a document file name and page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Source {
    pub filename: String,
    pub page: u32,
}

/// A submitted question and, once processed, its answer.
///
/// A record is pending while `answer_text` is `None` and complete once it
/// holds an answer. There is no other state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query_id: String,
    pub user_id: String,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds after which the record is no longer served.
    pub ttl: i64,
    pub query_text: String,
    pub answer_text: Option<String>,
    #[serde(default)]
    pub sources: Vec<Source>,
}

impl QueryRecord {
    /// Create a pending record with a fresh id, stamped now.
    pub fn new(user_id: impl Into<String>, query_text: impl Into<String>, ttl_secs: i64) -> Self {
        let created_at = Utc::now().timestamp();
        Self {
            query_id: Uuid::new_v4().simple().to_string(),
            user_id: user_id.into(),
            created_at,
            ttl: created_at + ttl_secs,
            query_text: query_text.into(),
            answer_text: None,
            sources: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.answer_text.is_some()
    }

    /// Move the record from pending to complete.
    pub fn complete(&mut self, answer: impl Into<String>, sources: Vec<Source>) {
        self.answer_text = Some(answer.into());
        self.sources = sources;
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.ttl <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_pending() {
        let record = QueryRecord::new("alice", "what is rust?", DEFAULT_QUERY_TTL_SECS);
        assert!(!record.is_complete());
        assert_eq!(record.query_id.len(), 32);
        assert_eq!(record.ttl - record.created_at, DEFAULT_QUERY_TTL_SECS);
        assert!(!record.is_expired(record.created_at));
    }

    #[test]
    fn complete_sets_answer_and_sources() {
        let mut record = QueryRecord::new("alice", "q", 60);
        record.complete(
            "a",
            vec![Source {
                filename: "x.pdf".into(),
                page: 2,
            }],
        );
        assert!(record.is_complete());
        assert_eq!(record.sources.len(), 1);
    }

    #[test]
    fn ids_are_unique() {
        let a = QueryRecord::new("u", "q", 60);
        let b = QueryRecord::new("u", "q", 60);
        assert_ne!(a.query_id, b.query_id);
    }
}
