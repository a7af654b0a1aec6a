//! Application services shared by the CLI, the HTTP server and the
//! background worker.
//!
//! A [`Pipeline`] owns the loaded [`Config`], both stores and both model
//! providers. Every operation takes the user id explicitly; nothing about
//! the current tenant is kept in global state.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use pdf_rag_core::chunk::chunk_pages;
use pdf_rag_core::embedding::EmbeddingProvider;
use pdf_rag_core::ingest::add_chunks;
use pdf_rag_core::llm::LlmProvider;
use pdf_rag_core::models::QueryRecord;
use pdf_rag_core::query::answer_question;
use pdf_rag_core::store::{QueryStore, VectorStore};

use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::llm::create_llm;
use crate::loader::{self, load_pages, validate_user, DocumentInfo};
use crate::migrate;
use crate::s3;
use crate::sqlite_store::{SqliteQueryStore, SqliteVectorStore};

/// A question refused before any retrieval or LLM work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryRejected {
    Empty,
    TooLong { chars: usize, max: usize },
}

impl std::fmt::Display for QueryRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryRejected::Empty => write!(f, "query_text must not be empty"),
            QueryRejected::TooLong { chars, max } => write!(
                f,
                "query_text is {} characters, the limit is {}",
                chars, max
            ),
        }
    }
}

impl std::error::Error for QueryRejected {}

/// Outcome of [`Pipeline::ingest_user`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct IngestSummary {
    pub user_id: String,
    /// Files downloaded from S3 before loading.
    pub synced: usize,
    /// Chunks deleted by `reset`.
    pub cleared: usize,
    pub documents: usize,
    pub pages: usize,
    pub chunks: usize,
    pub added: usize,
    pub skipped: usize,
}

pub struct Pipeline {
    config: Arc<Config>,
    vectors: Arc<dyn VectorStore>,
    queries: Arc<dyn QueryStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LlmProvider>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        vectors: Arc<dyn VectorStore>,
        queries: Arc<dyn QueryStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            vectors,
            queries,
            embedder,
            llm,
        }
    }

    /// Open the database (creating the schema if needed) and build the
    /// configured providers.
    pub async fn from_config(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::migrate(&pool).await?;

        let embedder = create_provider(&config.embedding)?;
        let llm = create_llm(&config.llm)?;

        Ok(Self::new(
            config,
            Arc::new(SqliteVectorStore::new(pool.clone())),
            Arc::new(SqliteQueryStore::new(pool)),
            embedder,
            llm,
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load, split, identify and add every document of `user_id`.
    ///
    /// With `reset`, the user's chunks are deleted first so everything is
    /// re-embedded.
    pub async fn ingest_user(&self, user_id: &str, reset: bool) -> Result<IngestSummary> {
        validate_user(user_id)?;
        let mut summary = IngestSummary {
            user_id: user_id.to_string(),
            ..IngestSummary::default()
        };

        if let Some(ref s3_config) = self.config.documents.s3 {
            match s3::sync_user(&self.config, s3_config, user_id).await {
                Ok(n) => summary.synced = n,
                Err(e) => warn!(user = user_id, error = %e, "S3 sync failed; using local files"),
            }
        }

        if reset {
            summary.cleared = self.vectors.clear(user_id).await?;
            info!(user = user_id, cleared = summary.cleared, "cleared index");
        }

        let config = Arc::clone(&self.config);
        let user = user_id.to_string();
        let pages = tokio::task::spawn_blocking(move || load_pages(&config, &user)).await??;

        let chunks = chunk_pages(&pages, &self.config.chunking.params());
        let report = add_chunks(
            self.vectors.as_ref(),
            self.embedder.as_ref(),
            user_id,
            &chunks,
            self.config.embedding.batch_size,
        )
        .await?;

        summary.documents = pages
            .iter()
            .map(|p| p.source.as_str())
            .collect::<HashSet<_>>()
            .len();
        summary.pages = pages.len();
        summary.chunks = report.total;
        summary.added = report.added;
        summary.skipped = report.skipped;
        Ok(summary)
    }

    /// Trimmed question text, or why it is refused.
    pub fn validate_query(&self, text: &str) -> Result<String, QueryRejected> {
        let text = text.trim();
        if text.is_empty() {
            return Err(QueryRejected::Empty);
        }
        let chars = text.chars().count();
        let max = self.config.queries.max_query_chars;
        if chars > max {
            return Err(QueryRejected::TooLong { chars, max });
        }
        Ok(text.to_string())
    }

    /// Validate the question and store it as a pending record.
    pub async fn submit(&self, user_id: &str, text: &str) -> Result<QueryRecord> {
        validate_user(user_id)?;
        let text = self.validate_query(text)?;
        let record = QueryRecord::new(user_id, text, self.config.queries.ttl_secs);
        self.queries.put(&record).await?;
        info!(user = user_id, query_id = %record.query_id, "query submitted");
        Ok(record)
    }

    /// Answer a pending record and store the completed record.
    ///
    /// On error the stored record is left pending.
    pub async fn complete(&self, mut record: QueryRecord) -> Result<QueryRecord> {
        let outcome = answer_question(
            self.vectors.as_ref(),
            self.embedder.as_ref(),
            self.llm.as_ref(),
            &record.user_id,
            &record.query_text,
            &self.config.retrieval.params(),
        )
        .await?;

        let (answer, sources) = outcome.into_parts();
        record.complete(answer, sources);
        self.queries.put(&record).await?;
        info!(
            user = %record.user_id,
            query_id = %record.query_id,
            sources = record.sources.len(),
            "query completed"
        );
        Ok(record)
    }

    /// Submit and answer in one call.
    pub async fn ask(&self, user_id: &str, text: &str) -> Result<QueryRecord> {
        let record = self.submit(user_id, text).await?;
        self.complete(record).await
    }

    pub async fn get_query(&self, user_id: &str, query_id: &str) -> Result<Option<QueryRecord>> {
        validate_user(user_id)?;
        self.queries.get(user_id, query_id).await
    }

    /// Newest first. `count` defaults to, and is capped at,
    /// `queries.list_limit`.
    pub async fn list_queries(&self, user_id: &str, count: Option<usize>) -> Result<Vec<QueryRecord>> {
        validate_user(user_id)?;
        let limit = self.config.queries.list_limit;
        let count = count.map(|c| c.min(limit)).unwrap_or(limit);
        self.queries.list(user_id, count).await
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        self.queries.purge_expired().await
    }

    /// The user's stored PDFs. The directory walk runs on the blocking pool.
    pub async fn list_documents(&self, user_id: &str) -> Result<Vec<DocumentInfo>> {
        validate_user(user_id)?;
        let config = Arc::clone(&self.config);
        let user = user_id.to_string();
        tokio::task::spawn_blocking(move || loader::list_documents(&config, &user)).await?
    }

    /// Write one uploaded PDF into the user directory on the blocking pool.
    /// Returns the stored name.
    pub async fn save_upload<B>(&self, user_id: &str, filename: &str, bytes: B) -> Result<String>
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        validate_user(user_id)?;
        let config = Arc::clone(&self.config);
        let user = user_id.to_string();
        let filename = filename.to_string();
        tokio::task::spawn_blocking(move || {
            loader::save_upload(&config, &user, &filename, bytes.as_ref())
        })
        .await?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::test_config;
    use anyhow::bail;
    use async_trait::async_trait;
    use pdf_rag_core::query::NO_MATCH_ANSWER;
    use pdf_rag_core::store::memory::{InMemoryQueryStore, InMemoryVectorStore};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Two-axis embedding: "rust" or not.
    pub(crate) struct KeywordEmbedder;

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        fn model_name(&self) -> &str {
            "keyword"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.to_lowercase().contains("rust") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    #[derive(Default)]
    pub(crate) struct EchoLlm {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    #[async_trait]
    impl LlmProvider for EchoLlm {
        fn model_name(&self) -> &str {
            "echo"
        }
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("llm offline");
            }
            Ok(format!("answered from {} chars of prompt", prompt.len()))
        }
    }

    pub(crate) fn memory_pipeline(root: &Path, llm: Arc<EchoLlm>) -> Pipeline {
        Pipeline::new(
            test_config(root),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(InMemoryQueryStore::new()),
            Arc::new(KeywordEmbedder),
            llm,
        )
    }

    pub(crate) async fn seed(pipeline: &Pipeline, user: &str, texts: &[(&str, u32, &str)]) {
        let pages: Vec<_> = texts
            .iter()
            .map(|(s, p, t)| pdf_rag_core::models::PageRecord::new(*s, *p, *t))
            .collect();
        let chunks = chunk_pages(&pages, &pipeline.config.chunking.params());
        add_chunks(
            pipeline.vectors.as_ref(),
            pipeline.embedder.as_ref(),
            user,
            &chunks,
            16,
        )
        .await
        .unwrap();
    }

    #[test]
    fn test_validate_query() {
        let tmp = TempDir::new().unwrap();
        let pipeline = memory_pipeline(tmp.path(), Arc::new(EchoLlm::default()));

        assert_eq!(pipeline.validate_query("  hi  ").unwrap(), "hi");
        assert_eq!(pipeline.validate_query("   "), Err(QueryRejected::Empty));
        let long = "x".repeat(2001);
        assert!(matches!(
            pipeline.validate_query(&long),
            Err(QueryRejected::TooLong { chars: 2001, max: 2000 })
        ));
        assert!(pipeline.validate_query(&"x".repeat(2000)).is_ok());
    }

    #[tokio::test]
    async fn test_too_long_query_never_stored() {
        let tmp = TempDir::new().unwrap();
        let llm = Arc::new(EchoLlm::default());
        let pipeline = memory_pipeline(tmp.path(), llm.clone());

        let err = pipeline.ask("alice", &"y".repeat(5000)).await.unwrap_err();
        assert!(err.downcast_ref::<QueryRejected>().is_some());
        assert!(pipeline.list_queries("alice", None).await.unwrap().is_empty());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ask_completes_record() {
        let tmp = TempDir::new().unwrap();
        let llm = Arc::new(EchoLlm::default());
        let pipeline = memory_pipeline(tmp.path(), llm.clone());
        seed(&pipeline, "alice", &[("book.pdf", 3, "Rust ownership rules")]).await;

        let record = pipeline.ask("alice", "What is Rust?").await.unwrap();
        assert!(record.is_complete());
        assert_eq!(record.sources.len(), 1);
        assert_eq!(record.sources[0].page, 3);

        let stored = pipeline
            .get_query("alice", &record.query_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_no_match_completes_without_llm() {
        let tmp = TempDir::new().unwrap();
        let llm = Arc::new(EchoLlm::default());
        let pipeline = memory_pipeline(tmp.path(), llm.clone());
        seed(&pipeline, "alice", &[("book.pdf", 1, "Boiling pasta")]).await;

        let record = pipeline.ask("alice", "rust?").await.unwrap();
        assert_eq!(record.answer_text.as_deref(), Some(NO_MATCH_ANSWER));
        assert!(record.sources.is_empty());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_llm_failure_leaves_record_pending() {
        let tmp = TempDir::new().unwrap();
        let llm = Arc::new(EchoLlm {
            fail: true,
            ..EchoLlm::default()
        });
        let pipeline = memory_pipeline(tmp.path(), llm);
        seed(&pipeline, "alice", &[("book.pdf", 1, "Rust")]).await;

        let record = pipeline.submit("alice", "rust").await.unwrap();
        assert!(pipeline.complete(record.clone()).await.is_err());

        let stored = pipeline
            .get_query("alice", &record.query_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.is_complete());
    }

    #[tokio::test]
    async fn test_list_count_capped() {
        let tmp = TempDir::new().unwrap();
        let pipeline = memory_pipeline(tmp.path(), Arc::new(EchoLlm::default()));
        for i in 0..30 {
            pipeline.submit("alice", &format!("q{}", i)).await.unwrap();
        }
        assert_eq!(pipeline.list_queries("alice", None).await.unwrap().len(), 25);
        assert_eq!(pipeline.list_queries("alice", Some(500)).await.unwrap().len(), 25);
        assert_eq!(pipeline.list_queries("alice", Some(3)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_ingest_empty_user_dir() {
        let tmp = TempDir::new().unwrap();
        let pipeline = memory_pipeline(tmp.path(), Arc::new(EchoLlm::default()));
        let summary = pipeline.ingest_user("alice", false).await.unwrap();
        assert_eq!(summary.documents, 0);
        assert_eq!(summary.added, 0);
        assert!(pipeline.ingest_user("../x", false).await.is_err());
    }

    #[tokio::test]
    async fn test_saved_upload_is_listed() {
        let tmp = TempDir::new().unwrap();
        let pipeline = memory_pipeline(tmp.path(), Arc::new(EchoLlm::default()));
        assert!(pipeline.list_documents("alice").await.unwrap().is_empty());

        let name = pipeline
            .save_upload("alice", "nested/dir/report.pdf", b"%PDF-1.4".to_vec())
            .await
            .unwrap();
        assert_eq!(name, "report.pdf");

        let docs = pipeline.list_documents("alice").await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].filename, "report.pdf");
        assert!(pipeline.list_documents("bob").await.unwrap().is_empty());

        assert!(pipeline
            .save_upload("alice", "notes.txt", b"hello".to_vec())
            .await
            .is_err());
        assert!(pipeline.list_documents("../etc").await.is_err());
    }
}
