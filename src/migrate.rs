//! Idempotent schema migrations.
//!
//! | Table | Holds |
//! |-------|-------|
//! | `entities` | Every stored entity as JSON, keyed by `(kind, name)`, with a version for optimistic transactions |
//! | `tasks` | Unacknowledged work queue tasks, FIFO per queue, with an optional lease deadline |
//! | `cache` | Best-effort cache entries with optional expiry |

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

pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            body TEXT NOT NULL,
            version INTEGER NOT NULL,
            PRIMARY KEY (kind, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            path TEXT NOT NULL,
            payload BLOB NOT NULL,
            params_json TEXT NOT NULL DEFAULT '{}',
            retry_count INTEGER NOT NULL DEFAULT 0,
            enqueued_at INTEGER NOT NULL,
            leased_until INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before leases existed.
    let lease_columns: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('tasks') WHERE name = 'leased_until'",
    )
    .fetch_one(pool)
    .await?;
    if lease_columns == 0 {
        sqlx::query("ALTER TABLE tasks ADD COLUMN leased_until INTEGER")
            .execute(pool)
            .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache (
            key TEXT PRIMARY KEY,
            value BLOB NOT NULL,
            expires_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_queue ON tasks(queue, id)")
        .execute(pool)
        .await?;

    Ok(())
}
