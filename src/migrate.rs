use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema on a fresh connection. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create tables and indexes on an open pool (`CREATE ... IF NOT EXISTS`).
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // Embedded chunks, keyed by content-addressed id within a tenant.
    // (model, dims) names the embedding space of `embedding`.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            tenant TEXT NOT NULL,
            id TEXT NOT NULL,
            source TEXT NOT NULL,
            page INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (tenant, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Chunk tables from before vectors were tagged get an empty model, which
    // never matches a provider, so the next ingest re-embeds them.
    let columns: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info('chunks')")
        .fetch_all(pool)
        .await?;
    if !columns.iter().any(|c| c == "model") {
        sqlx::query("ALTER TABLE chunks ADD COLUMN model TEXT NOT NULL DEFAULT ''")
            .execute(pool)
            .await?;
    }

    // Query history. `seq` orders records created within the same second.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            query_id TEXT NOT NULL UNIQUE,
            user_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            ttl INTEGER NOT NULL,
            query_text TEXT NOT NULL,
            answer_text TEXT,
            sources_json TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(tenant, source)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_model ON chunks(tenant, model, dims)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queries_user_created ON queries(user_id, created_at DESC, seq DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_queries_ttl ON queries(ttl)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        run_migrations(&config).await.unwrap();
        run_migrations(&config).await.unwrap();
    }

    #[tokio::test]
    async fn test_untagged_chunks_get_empty_model() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&test_config(tmp.path())).await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE chunks (
                tenant TEXT NOT NULL, id TEXT NOT NULL, source TEXT NOT NULL,
                page INTEGER NOT NULL, chunk_index INTEGER NOT NULL, text TEXT NOT NULL,
                hash TEXT NOT NULL, embedding BLOB NOT NULL, dims INTEGER NOT NULL,
                created_at INTEGER NOT NULL, PRIMARY KEY (tenant, id)
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO chunks VALUES ('alice', 'a.pdf:1:0:ff', 'a.pdf', 1, 0, 'x', 'ff', x'0000803f', 1, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();

        let model: String = sqlx::query_scalar("SELECT model FROM chunks WHERE tenant = 'alice'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(model, "");
    }
}
