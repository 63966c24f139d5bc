//! SQLite-backed [`WorkQueue`].
//!
//! Tasks are rows in the `tasks` table, delivered FIFO per queue. `pop`
//! stamps the row with a lease deadline instead of removing it; `ack`
//! deletes it. A row whose deadline has passed is claimable again, and the
//! claim that picks it up bumps its `retry_count`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use autotown_core::queue::{Lease, QueueError, QueueStats, Task, WorkQueue, DEFAULT_LEASE, MAX_BATCH};

#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    lease: Duration,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Unacknowledged task count per queue name.
    pub async fn depths(&self) -> Result<Vec<(String, i64)>, QueueError> {
        let rows = sqlx::query("SELECT queue, COUNT(*) AS n FROM tasks GROUP BY queue ORDER BY queue")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<String, _>("queue"), row.get::<i64, _>("n")))
            .collect())
    }
}

fn backend(e: sqlx::Error) -> QueueError {
    QueueError::Backend(e.to_string())
}

async fn insert<'e, E>(executor: E, queue: &str, task: &Task) -> Result<(), QueueError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let params = serde_json::to_string(&task.params).map_err(|e| QueueError::Backend(e.to_string()))?;
    sqlx::query(
        "INSERT INTO tasks (queue, path, payload, params_json, retry_count, enqueued_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(queue)
    .bind(&task.path)
    .bind(&task.payload)
    .bind(params)
    .bind(i64::from(task.retry_count))
    .bind(chrono::Utc::now().timestamp())
    .execute(executor)
    .await
    .map_err(backend)?;
    Ok(())
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    async fn enqueue(&self, queue: &str, task: Task) -> Result<(), QueueError> {
        insert(&self.pool, queue, &task).await
    }

    async fn enqueue_multi(&self, queue: &str, tasks: Vec<Task>) -> Result<(), QueueError> {
        if tasks.len() > MAX_BATCH {
            return Err(QueueError::TooManyTasks { count: tasks.len() });
        }
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for task in &tasks {
            insert(&mut *tx, queue, task).await?;
        }
        tx.commit().await.map_err(backend)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let tasks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(QueueStats {
            tasks: usize::try_from(tasks).unwrap_or(0),
        })
    }

    async fn pop(&self, queue: &str) -> Result<Option<Lease>, QueueError> {
        let now = chrono::Utc::now().timestamp_millis();
        let lease_ms = i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX);
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET leased_until = ?,
                retry_count = retry_count + CASE WHEN leased_until IS NULL THEN 0 ELSE 1 END
            WHERE id = (
                SELECT id FROM tasks
                WHERE queue = ? AND (leased_until IS NULL OR leased_until <= ?)
                ORDER BY id LIMIT 1
            )
            RETURNING id, path, payload, params_json, retry_count
            "#,
        )
        .bind(now.saturating_add(lease_ms))
        .bind(queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let params_json: String = row.get("params_json");
        let params: BTreeMap<String, String> = serde_json::from_str(&params_json)
            .map_err(|e| QueueError::Backend(format!("bad task params: {e}")))?;
        let retry_count: i64 = row.get("retry_count");
        Ok(Some(Lease {
            id: row.get("id"),
            task: Task {
                path: row.get("path"),
                payload: row.get("payload"),
                params,
                retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
            },
        }))
    }

    async fn ack(&self, queue: &str, id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM tasks WHERE id = ? AND queue = ?")
            .bind(id)
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
