//! SQLite pool for the chunk index and the query history.
//!
//! One database file holds both stores (schema in [`crate::migrate`]):
//!
//! - `chunks`: one row per `(tenant, id)`. The vector is a little-endian
//!   `f32` blob tagged with the `(model, dims)` that produced it; search and
//!   the ingest dedup set only see rows of the active embedding model.
//! - `queries`: one row per query record. `seq` grows with every insert and
//!   breaks ties between records created in the same second.
//!
//! The pool runs in WAL mode so the HTTP handlers, query workers and the
//! purge loop can read while an ingest writes. Writers that hit a lock wait
//! up to [`BUSY_TIMEOUT`] before failing.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::time::Duration;

use crate::config::Config;

pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 5;

/// Open the pool at `config.db.path`, creating the file and its parent
/// directory.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))
}
