//! # PDF RAG
//!
//! Question answering over per-user PDF collections.
//!
//! Each user's PDFs are split into overlapping chunks with content-addressed
//! ids (`source:page:index:hash`), embedded, and stored in SQLite. Ingest is
//! idempotent: chunks whose id is already stored are never re-embedded.
//! Questions retrieve the closest chunks, are answered by an LLM from that
//! context only, and are kept as query records with a TTL.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────┐
//! │ PDFs (+S3)  │──▶│ Split + Id + Add │──▶│  SQLite  │
//! └─────────────┘   └──────────────────┘   └────┬─────┘
//!                                               │
//!                       ┌───────────────────────┤
//!                       ▼                       ▼
//!                  ┌──────────┐          ┌────────────┐
//!                  │   CLI    │          │ HTTP + wkr │
//!                  │  (rag)   │          │  (axum)    │
//!                  └──────────┘          └────────────┘
//! ```
//!
//! The storage-independent algorithms (chunking, ids, ingest, query
//! answering, store traits) live in the `pdf-rag-core` crate; this crate
//! adds configuration, SQLite stores, model providers, PDF loading, S3
//! mirroring, the HTTP server and the CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite vector and query stores |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | LLM providers |
//! | [`remote`] | Shared HTTP retry helpers |
//! | [`extract`] | PDF text extraction |
//! | [`loader`] | Per-user document directories |
//! | [`s3`] | S3 mirroring |
//! | [`pipeline`] | Ingest and query services |
//! | [`worker`] | Inline / background query dispatch |
//! | [`server`] | HTTP API |

pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod llm;
pub mod loader;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod remote;
pub mod s3;
pub mod server;
pub mod sqlite_store;
pub mod worker;
