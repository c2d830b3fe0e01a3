use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database file and the queue schema. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the training queue table and its indexes if they are missing.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS train_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user TEXT NOT NULL,
            age_days INTEGER,
            status TEXT NOT NULL DEFAULT 'not_started',
            insert_time INTEGER NOT NULL,
            heartbeat_at INTEGER,
            reported INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // dequeue() scans waiting jobs oldest first
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_train_queue_status_time \
         ON train_queue(status, insert_time)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_train_queue_unreported ON train_queue(reported, status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
