use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table on an already-open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // One row per environment, created lazily
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_environments (
            environment_type TEXT PRIMARY KEY,
            index_status TEXT NOT NULL DEFAULT 'INACTIVE',
            primary_index_name TEXT,
            autocomplete_index_name TEXT,
            synonym_set_name TEXT,
            version TEXT,
            document_count INTEGER NOT NULL DEFAULT 0,
            indexed_document_count INTEGER NOT NULL DEFAULT 0,
            total_document_count INTEGER NOT NULL DEFAULT 0,
            last_indexed_at INTEGER,
            index_date INTEGER,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only audit log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deployment_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            deployment_type TEXT NOT NULL,
            environment_type TEXT,
            status TEXT NOT NULL,
            version TEXT,
            description TEXT,
            document_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            details_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            completed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS build_tasks (
            id TEXT PRIMARY KEY,
            environment_type TEXT NOT NULL,
            version TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            message TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            result_json TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Durable mutual-exclusion flag: exactly one row, holder NULL when free
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indexing_guard (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            holder TEXT,
            purpose TEXT,
            environment_type TEXT,
            acquired_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("INSERT OR IGNORE INTO indexing_guard (id) VALUES (1)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dictionary_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(kind, content)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dictionary_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            environment_type TEXT NOT NULL,
            version TEXT NOT NULL,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Catalog source table read by full builds
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            brand TEXT,
            category TEXT,
            description TEXT,
            price REAL,
            keywords TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1,
            updated_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_history_type_created ON deployment_history(deployment_type, created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_env ON dictionary_snapshots(environment_type, version)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON build_tasks(status)")
        .execute(pool)
        .await?;

    Ok(())
}
