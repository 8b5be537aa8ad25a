//! Persistent build task records.
//!
//! A task is created RUNNING in the same transaction that registers a
//! build and is the handle callers poll. Progress never moves backwards and
//! a terminal task ignores further updates.

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use index_release_core::models::{BuildTask, EnvironmentType};

use crate::db::{from_ts, now_ts};
use crate::error::{ReleaseError, Result};

#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_in(
        conn: &mut SqliteConnection,
        id: &str,
        env: EnvironmentType,
        version: &str,
        message: &str,
    ) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO build_tasks (id, environment_type, version, progress, message, status, created_at, updated_at)
            VALUES (?, ?, ?, 0, ?, 'RUNNING', ?, ?)
            "#,
        )
        .bind(id)
        .bind(env.as_str())
        .bind(version)
        .bind(message)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<BuildTask> {
        let row = sqlx::query(
            "SELECT id, environment_type, version, progress, message, status, result_json, \
             created_at, updated_at FROM build_tasks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ReleaseError::NotFound(format!("task {}", id)))?;
        row_to_task(&row)
    }

    /// Record progress. Lower percentages than the stored one are ignored.
    pub async fn update_progress(&self, id: &str, percent: u8, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE build_tasks SET progress = MAX(progress, ?), message = ?, updated_at = ?
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(percent.min(100) as i64)
        .bind(message)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete(&self, id: &str, result: &Value) -> Result<()> {
        self.finish(id, "COMPLETED", 100, "completed", Some(result.to_string()))
            .await
    }

    pub async fn fail(&self, id: &str, message: &str) -> Result<()> {
        self.finish(id, "FAILED", 0, message, None).await
    }

    async fn finish(
        &self,
        id: &str,
        status: &str,
        progress: i64,
        message: &str,
        result_json: Option<String>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE build_tasks SET
                status = ?,
                progress = MAX(progress, ?),
                message = ?,
                result_json = ?,
                updated_at = ?
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(status)
        .bind(progress)
        .bind(message)
        .bind(result_json)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReleaseError::validation(format!(
                "task {} is not running",
                id
            )));
        }
        Ok(())
    }

    /// Fail every task still RUNNING. Used by crash recovery.
    pub async fn fail_running(&self, message: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE build_tasks SET status = 'FAILED', message = ?, updated_at = ? WHERE status = 'RUNNING'",
        )
        .bind(message)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_task(row: &SqliteRow) -> Result<BuildTask> {
    let env: String = row.get("environment_type");
    let status: String = row.get("status");
    let progress: i64 = row.get("progress");
    let result_json: Option<String> = row.get("result_json");
    let created_at: i64 = row.get("created_at");
    let updated_at: i64 = row.get("updated_at");

    Ok(BuildTask {
        id: row.get("id"),
        environment_type: env.parse()?,
        version: row.get("version"),
        progress_percent: progress.clamp(0, 100) as u8,
        message: row.get("message"),
        status: status.parse()?,
        result: result_json.and_then(|j| serde_json::from_str(&j).ok()),
        created_at: from_ts(created_at),
        updated_at: from_ts(updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use index_release_core::models::TaskStatus;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store_with_task() -> TaskStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        TaskStore::create_in(&mut conn, "t1", EnvironmentType::Staging, "v1", "queued")
            .await
            .unwrap();
        drop(conn);
        TaskStore::new(pool)
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let store = store_with_task().await;
        store.update_progress("t1", 40, "loading").await.unwrap();
        store.update_progress("t1", 35, "late update").await.unwrap();

        let task = store.get("t1").await.unwrap();
        assert_eq!(task.progress_percent, 40);
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn terminal_task_ignores_updates() {
        let store = store_with_task().await;
        store
            .complete("t1", &serde_json::json!({"documents": 3}))
            .await
            .unwrap();
        store.update_progress("t1", 50, "stray").await.unwrap();
        assert!(store.fail("t1", "too late").await.unwrap_err().is_validation());

        let task = store.get("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress_percent, 100);
        assert_eq!(task.message, "completed");
        assert_eq!(task.result.unwrap()["documents"], 3);
    }

    #[tokio::test]
    async fn recovery_fails_running_tasks() {
        let store = store_with_task().await;
        assert_eq!(store.fail_running("process restarted").await.unwrap(), 1);
        let task = store.get("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.message, "process restarted");
    }
}
