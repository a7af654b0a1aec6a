//! SQLite-backed [`VectorStore`] and [`QueryStore`] implementations.
//!
//! Both share one [`SqlitePool`] and the schema from [`crate::migrate`].
//! Chunk rows are keyed by `(tenant, id)` and tagged with the `(model, dims)`
//! that produced their vector. Inserts are conditional: a row under the same
//! model is left alone, a row under another model gets the new vector, so a
//! chunk id is stored at most once per tenant no matter how many writers
//! race on it.

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use pdf_rag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use pdf_rag_core::models::{Chunk, QueryRecord, Source};
use pdf_rag_core::store::{rank_top_k, ModelKey, QueryStore, ScoredChunk, VectorStore};

/// SQLite implementation of [`VectorStore`].
///
/// Similarity search loads the tenant's vectors and scores them in process.
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn existing_ids(&self, tenant: &str, key: &ModelKey) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM chunks WHERE tenant = ? AND model = ? AND dims = ?",
        )
        .bind(tenant)
        .bind(&key.model)
        .bind(key.dims as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    async fn upsert(
        &self,
        tenant: &str,
        key: &ModelKey,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<usize> {
        if chunks.len() != vectors.len() {
            anyhow::bail!(
                "chunk/vector count mismatch: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            );
        }

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;

        for (chunk, vector) in chunks.iter().zip(vectors) {
            let result = sqlx::query(
                r#"
                INSERT INTO chunks (tenant, id, source, page, chunk_index, text, hash,
                                    embedding, model, dims, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(tenant, id) DO UPDATE SET
                    embedding = excluded.embedding,
                    model = excluded.model,
                    dims = excluded.dims,
                    created_at = excluded.created_at
                WHERE chunks.model <> excluded.model OR chunks.dims <> excluded.dims
                "#,
            )
            .bind(tenant)
            .bind(&chunk.id)
            .bind(&chunk.source)
            .bind(chunk.page as i64)
            .bind(chunk.chunk_index as i64)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(vec_to_blob(vector))
            .bind(&key.model)
            .bind(key.dims as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn similarity_search(
        &self,
        tenant: &str,
        key: &ModelKey,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source, page, chunk_index, text, hash, embedding
            FROM chunks
            WHERE tenant = ? AND model = ? AND dims = ?
            ORDER BY source, page, chunk_index
            "#,
        )
        .bind(tenant)
        .bind(&key.model)
        .bind(key.dims as i64)
        .fetch_all(&self.pool)
        .await?;

        let scored = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let score = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                ScoredChunk {
                    chunk: chunk_from_row(row),
                    score,
                }
            })
            .collect();

        Ok(rank_top_k(scored, k))
    }

    async fn count(&self, tenant: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE tenant = ?")
            .bind(tenant)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn clear(&self, tenant: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM chunks WHERE tenant = ?")
            .bind(tenant)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    let page: i64 = row.get("page");
    let chunk_index: i64 = row.get("chunk_index");
    Chunk {
        id: row.get("id"),
        source: row.get("source"),
        page: page as u32,
        chunk_index: chunk_index as u32,
        text: row.get("text"),
        hash: row.get("hash"),
    }
}

/// SQLite implementation of [`QueryStore`].
pub struct SqliteQueryStore {
    pool: SqlitePool,
}

impl SqliteQueryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueryStore for SqliteQueryStore {
    async fn put(&self, record: &QueryRecord) -> Result<()> {
        let sources_json = serde_json::to_string(&record.sources)?;
        sqlx::query(
            r#"
            INSERT INTO queries (query_id, user_id, created_at, ttl, query_text,
                                 answer_text, sources_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(query_id) DO UPDATE SET
                ttl = excluded.ttl,
                answer_text = excluded.answer_text,
                sources_json = excluded.sources_json
            "#,
        )
        .bind(&record.query_id)
        .bind(&record.user_id)
        .bind(record.created_at)
        .bind(record.ttl)
        .bind(&record.query_text)
        .bind(&record.answer_text)
        .bind(&sources_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, user_id: &str, query_id: &str) -> Result<Option<QueryRecord>> {
        let row = sqlx::query(
            r#"
            SELECT query_id, user_id, created_at, ttl, query_text, answer_text, sources_json
            FROM queries
            WHERE query_id = ? AND user_id = ? AND ttl > ?
            "#,
        )
        .bind(query_id)
        .bind(user_id)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<QueryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT query_id, user_id, created_at, ttl, query_text, answer_text, sources_json
            FROM queries
            WHERE user_id = ? AND ttl > ?
            ORDER BY created_at DESC, seq DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(Utc::now().timestamp())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn purge_expired(&self) -> Result<usize> {
        let result = sqlx::query("DELETE FROM queries WHERE ttl <= ?")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<QueryRecord> {
    let query_id: String = row.get("query_id");
    let sources_json: String = row.get("sources_json");
    let sources: Vec<Source> = serde_json::from_str(&sources_json)
        .with_context(|| format!("corrupt sources for query {}", query_id))?;

    Ok(QueryRecord {
        query_id,
        user_id: row.get("user_id"),
        created_at: row.get("created_at"),
        ttl: row.get("ttl"),
        query_text: row.get("query_text"),
        answer_text: row.get("answer_text"),
        sources,
    })
}
