//! In-memory [`VectorStore`] and [`QueryStore`] implementations.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! Similarity search is brute-force cosine similarity over all stored
//! vectors of the tenant.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, QueryRecord};

use super::{rank_top_k, ModelKey, QueryStore, ScoredChunk, VectorStore};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("store lock poisoned"))
}

struct StoredChunk {
    chunk: Chunk,
    key: ModelKey,
    vector: Vec<f32>,
}

/// In-memory vector store. Chunks keep insertion order per tenant.
#[derive(Default)]
pub struct InMemoryVectorStore {
    tenants: RwLock<HashMap<String, Vec<StoredChunk>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn existing_ids(&self, tenant: &str, key: &ModelKey) -> Result<HashSet<String>> {
        let tenants = read(&self.tenants)?;
        Ok(tenants
            .get(tenant)
            .map(|rows| {
                rows.iter()
                    .filter(|r| &r.key == key)
                    .map(|r| r.chunk.id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert(
        &self,
        tenant: &str,
        key: &ModelKey,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<usize> {
        if chunks.len() != vectors.len() {
            bail!(
                "chunk/vector count mismatch: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            );
        }

        let mut tenants = write(&self.tenants)?;
        let rows = tenants.entry(tenant.to_string()).or_default();
        let mut positions: HashMap<String, usize> = rows
            .iter()
            .enumerate()
            .map(|(i, r)| (r.chunk.id.clone(), i))
            .collect();

        let mut written = 0;
        for (chunk, vector) in chunks.iter().zip(vectors) {
            match positions.get(&chunk.id) {
                Some(&i) if &rows[i].key == key => {}
                Some(&i) => {
                    rows[i].key = key.clone();
                    rows[i].vector = vector.clone();
                    written += 1;
                }
                None => {
                    positions.insert(chunk.id.clone(), rows.len());
                    rows.push(StoredChunk {
                        chunk: chunk.clone(),
                        key: key.clone(),
                        vector: vector.clone(),
                    });
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn similarity_search(
        &self,
        tenant: &str,
        key: &ModelKey,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let tenants = read(&self.tenants)?;
        let Some(rows) = tenants.get(tenant) else {
            return Ok(Vec::new());
        };

        let scored = rows
            .iter()
            .filter(|r| &r.key == key)
            .map(|r| ScoredChunk {
                chunk: r.chunk.clone(),
                score: cosine_similarity(query_vec, &r.vector) as f64,
            })
            .collect();

        Ok(rank_top_k(scored, k))
    }

    async fn count(&self, tenant: &str) -> Result<usize> {
        let tenants = read(&self.tenants)?;
        Ok(tenants.get(tenant).map(Vec::len).unwrap_or(0))
    }

    async fn clear(&self, tenant: &str) -> Result<usize> {
        let mut tenants = write(&self.tenants)?;
        Ok(tenants.remove(tenant).map(|rows| rows.len()).unwrap_or(0))
    }
}

#[derive(Default)]
struct QueryRows {
    /// `query_id` -> (insertion sequence, record). The sequence is kept
    /// when a record is replaced.
    by_id: HashMap<String, (u64, QueryRecord)>,
    next_seq: u64,
}

/// In-memory query record store keyed by `query_id`.
#[derive(Default)]
pub struct InMemoryQueryStore {
    records: RwLock<QueryRows>,
}

impl InMemoryQueryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueryStore for InMemoryQueryStore {
    async fn put(&self, record: &QueryRecord) -> Result<()> {
        let mut rows = write(&self.records)?;
        let QueryRows { by_id, next_seq } = &mut *rows;
        match by_id.get_mut(&record.query_id) {
            Some((_, stored)) => *stored = record.clone(),
            None => {
                by_id.insert(record.query_id.clone(), (*next_seq, record.clone()));
                *next_seq += 1;
            }
        }
        Ok(())
    }

    async fn get(&self, user_id: &str, query_id: &str) -> Result<Option<QueryRecord>> {
        let now = Utc::now().timestamp();
        let rows = read(&self.records)?;
        Ok(rows
            .by_id
            .get(query_id)
            .map(|(_, r)| r)
            .filter(|r| r.user_id == user_id && !r.is_expired(now))
            .cloned())
    }

    async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<QueryRecord>> {
        let now = Utc::now().timestamp();
        let rows = read(&self.records)?;
        let mut matching: Vec<&(u64, QueryRecord)> = rows
            .by_id
            .values()
            .filter(|(_, r)| r.user_id == user_id && !r.is_expired(now))
            .collect();
        matching.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| seq_b.cmp(seq_a))
        });
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let mut rows = write(&self.records)?;
        let before = rows.by_id.len();
        rows.by_id.retain(|_, (_, r)| !r.is_expired(now));
        Ok(before - rows.by_id.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::assign_chunk_ids;
    use crate::models::PageRecord;

    fn chunks(texts: &[&str]) -> Vec<Chunk> {
        let pages: Vec<PageRecord> = texts
            .iter()
            .map(|t| PageRecord::new("doc.pdf", 1, *t))
            .collect();
        assign_chunk_ids(&pages, 64)
    }

    fn key(dims: usize) -> ModelKey {
        ModelKey::new("test-model", dims)
    }

    #[tokio::test]
    async fn test_upsert_skips_existing_ids() {
        let store = InMemoryVectorStore::new();
        let c = chunks(&["a", "b"]);
        let v = vec![vec![1.0, 0.0], vec![0.0, 1.0]];

        assert_eq!(store.upsert("t", &key(2), &c, &v).await.unwrap(), 2);
        assert_eq!(store.upsert("t", &key(2), &c, &v).await.unwrap(), 0);
        assert_eq!(store.count("t").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let store = InMemoryVectorStore::new();
        let c = chunks(&["a"]);
        store.upsert("alice", &key(1), &c, &[vec![1.0]]).await.unwrap();

        assert!(store.existing_ids("bob", &key(1)).await.unwrap().is_empty());
        assert_eq!(store.existing_ids("alice", &key(1)).await.unwrap().len(), 1);
        assert!(store
            .similarity_search("bob", &key(1), &[1.0], 5)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_similarity_search_ranks() {
        let store = InMemoryVectorStore::new();
        let c = chunks(&["x", "y", "z"]);
        let v = vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]];
        store.upsert("t", &key(2), &c, &v).await.unwrap();

        let results = store.similarity_search("t", &key(2), &[1.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.text, "y");
        assert_eq!(results[1].chunk.text, "z");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn test_new_model_replaces_stale_vectors() {
        let store = InMemoryVectorStore::new();
        let c = chunks(&["a", "b"]);
        let old_key = ModelKey::new("small", 2);
        let new_key = ModelKey::new("large", 3);
        store
            .upsert("t", &old_key, &c, &[vec![1.0, 0.0], vec![0.0, 1.0]])
            .await
            .unwrap();

        assert!(store.existing_ids("t", &new_key).await.unwrap().is_empty());
        assert!(store
            .similarity_search("t", &new_key, &[1.0, 0.0, 0.0], 5)
            .await
            .unwrap()
            .is_empty());

        let v3 = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]];
        assert_eq!(store.upsert("t", &new_key, &c, &v3).await.unwrap(), 2);
        assert_eq!(store.upsert("t", &new_key, &c, &v3).await.unwrap(), 0);
        assert_eq!(store.count("t").await.unwrap(), 2);
        assert!(store.existing_ids("t", &old_key).await.unwrap().is_empty());

        let results = store
            .similarity_search("t", &new_key, &[1.0, 0.0, 0.0], 1)
            .await
            .unwrap();
        assert_eq!(results[0].chunk.text, "a");
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_mismatched_vectors_rejected() {
        let store = InMemoryVectorStore::new();
        let c = chunks(&["a", "b"]);
        assert!(store.upsert("t", &key(1), &c, &[vec![1.0]]).await.is_err());
    }

    #[tokio::test]
    async fn test_clear() {
        let store = InMemoryVectorStore::new();
        let c = chunks(&["a", "b"]);
        store
            .upsert("t", &key(1), &c, &[vec![1.0], vec![1.0]])
            .await
            .unwrap();
        assert_eq!(store.clear("t").await.unwrap(), 2);
        assert_eq!(store.count("t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_query_list_newest_first_and_limited() {
        let store = InMemoryQueryStore::new();
        for i in 0..5 {
            let mut r = QueryRecord::new("alice", format!("q{}", i), 3600);
            r.created_at += i;
            store.put(&r).await.unwrap();
        }
        store
            .put(&QueryRecord::new("bob", "other", 3600))
            .await
            .unwrap();

        let listed = store.list("alice", 3).await.unwrap();
        let texts: Vec<&str> = listed.iter().map(|r| r.query_text.as_str()).collect();
        assert_eq!(texts, vec!["q4", "q3", "q2"]);
    }

    #[tokio::test]
    async fn test_same_second_records_list_latest_insert_first() {
        let store = InMemoryQueryStore::new();
        for round in 0..50 {
            let first = QueryRecord::new("alice", format!("first {}", round), 3600);
            let mut second = QueryRecord::new("alice", format!("second {}", round), 3600);
            second.created_at = first.created_at;
            store.put(&first).await.unwrap();
            store.put(&second).await.unwrap();

            let newest = store.list("alice", 1).await.unwrap();
            assert_eq!(newest[0].query_id, second.query_id);
        }
    }

    #[tokio::test]
    async fn test_replacing_record_keeps_its_position() {
        let store = InMemoryQueryStore::new();
        let mut older = QueryRecord::new("alice", "older", 3600);
        let mut newer = QueryRecord::new("alice", "newer", 3600);
        newer.created_at = older.created_at;
        store.put(&older).await.unwrap();
        store.put(&newer).await.unwrap();

        older.complete("done", vec![]);
        store.put(&older).await.unwrap();

        let listed = store.list("alice", 10).await.unwrap();
        let texts: Vec<&str> = listed.iter().map(|r| r.query_text.as_str()).collect();
        assert_eq!(texts, vec!["newer", "older"]);
        assert!(listed[1].is_complete());
    }

    #[tokio::test]
    async fn test_query_get_scoped_to_user() {
        let store = InMemoryQueryStore::new();
        let r = QueryRecord::new("alice", "q", 3600);
        store.put(&r).await.unwrap();

        assert!(store.get("alice", &r.query_id).await.unwrap().is_some());
        assert!(store.get("bob", &r.query_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_records_hidden_and_purged() {
        let store = InMemoryQueryStore::new();
        let mut old = QueryRecord::new("alice", "old", 3600);
        old.ttl = old.created_at - 1;
        store.put(&old).await.unwrap();
        store
            .put(&QueryRecord::new("alice", "fresh", 3600))
            .await
            .unwrap();

        assert!(store.get("alice", &old.query_id).await.unwrap().is_none());
        assert_eq!(store.list("alice", 10).await.unwrap().len(), 1);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }
}
