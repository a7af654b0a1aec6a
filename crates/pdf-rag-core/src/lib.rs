//! # PDF RAG Core
//!
//! Shared logic for PDF RAG: data models, the recursive text splitter,
//! content-addressed chunk identity, store traits, embedding and LLM
//! provider traits, idempotent ingestion and the retrieval/answer pipeline.
//!
//! This crate contains no tokio runtime, sqlx, HTTP, or filesystem I/O.
//! Concrete stores and providers live in the `pdf-rag` app crate; the
//! in-memory store in [`store::memory`] backs tests and embedded use.

pub mod chunk;
pub mod embedding;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod query;
pub mod store;
