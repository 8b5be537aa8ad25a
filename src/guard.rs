//! Single-holder indexing guard.
//!
//! At most one build or promotion may run at a time. The durable half is a
//! one-row table claimed with a compare-and-set `UPDATE`, taken inside the
//! registering transaction so the claim commits or rolls back together with
//! the rest of the registration. The process-local flag rejects a second
//! request from the same process before it opens a transaction.
//!
//! A crashed process leaves the row held; [`IndexingGuard::force_release`]
//! is the recovery path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};

use index_release_core::models::EnvironmentType;

use crate::db::{from_ts, now_ts};
use crate::error::{ReleaseError, Result};

/// Who currently holds the guard.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GuardHolder {
    pub holder: String,
    pub purpose: String,
    pub environment_type: Option<EnvironmentType>,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
pub struct IndexingGuard {
    pool: SqlitePool,
    local: Arc<AtomicBool>,
}

impl IndexingGuard {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            local: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim the process-local flag. Fails if this process already runs
    /// a guarded operation.
    pub fn enter_local(&self) -> Result<LocalPermit> {
        if self
            .local
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ReleaseError::ConcurrentBuild {
                holder: "this process".to_string(),
            });
        }
        Ok(LocalPermit {
            flag: Arc::clone(&self.local),
        })
    }

    /// True while this process holds a local permit.
    pub fn is_held_locally(&self) -> bool {
        self.local.load(Ordering::Acquire)
    }

    /// Claim the durable row within `conn`'s transaction.
    pub async fn acquire_in(
        conn: &mut SqliteConnection,
        holder: &str,
        purpose: &str,
        env: Option<EnvironmentType>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE indexing_guard SET holder = ?, purpose = ?, environment_type = ?, acquired_at = ?
            WHERE id = 1 AND holder IS NULL
            "#,
        )
        .bind(holder)
        .bind(purpose)
        .bind(env.map(|e| e.as_str()))
        .bind(now_ts())
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            let current = sqlx::query_scalar::<_, Option<String>>(
                "SELECT holder FROM indexing_guard WHERE id = 1",
            )
            .fetch_optional(&mut *conn)
            .await?
            .flatten();
            return Err(ReleaseError::ConcurrentBuild {
                holder: current.unwrap_or_else(|| "unknown".to_string()),
            });
        }
        Ok(())
    }

    pub async fn current(&self) -> Result<Option<GuardHolder>> {
        let row = sqlx::query(
            "SELECT holder, purpose, environment_type, acquired_at FROM indexing_guard \
             WHERE id = 1 AND holder IS NOT NULL",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let env: Option<String> = row.get("environment_type");
        let acquired_at: Option<i64> = row.get("acquired_at");
        let purpose: Option<String> = row.get("purpose");
        Ok(Some(GuardHolder {
            holder: row.get("holder"),
            purpose: purpose.unwrap_or_default(),
            environment_type: env.map(|e| e.parse()).transpose()?,
            acquired_at: from_ts(acquired_at.unwrap_or_default()),
        }))
    }

    /// Release the row if `holder` still owns it. Returns false otherwise.
    pub async fn release(&self, holder: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE indexing_guard SET holder = NULL, purpose = NULL, environment_type = NULL, acquired_at = NULL
            WHERE id = 1 AND holder = ?
            "#,
        )
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Clear the row regardless of holder. Returns the previous holder.
    pub async fn force_release(&self) -> Result<Option<String>> {
        let previous = self.current().await?.map(|h| h.holder);
        sqlx::query(
            "UPDATE indexing_guard SET holder = NULL, purpose = NULL, environment_type = NULL, \
             acquired_at = NULL WHERE id = 1",
        )
        .execute(&self.pool)
        .await?;
        Ok(previous)
    }
}

/// Process-local claim; dropping it frees the local flag.
#[derive(Debug)]
pub struct LocalPermit {
    flag: Arc<AtomicBool>,
}

impl Drop for LocalPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn guard() -> IndexingGuard {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        IndexingGuard::new(pool)
    }

    async fn acquire(guard: &IndexingGuard, holder: &str) -> Result<()> {
        let mut conn = guard.pool.acquire().await?;
        IndexingGuard::acquire_in(&mut conn, holder, "build", Some(EnvironmentType::Staging)).await
    }

    #[tokio::test]
    async fn second_holder_is_rejected() {
        let guard = guard().await;
        acquire(&guard, "task-a").await.unwrap();

        match acquire(&guard, "task-b").await.unwrap_err() {
            ReleaseError::ConcurrentBuild { holder } => assert_eq!(holder, "task-a"),
            other => panic!("unexpected error: {other}"),
        }

        let current = guard.current().await.unwrap().unwrap();
        assert_eq!(current.holder, "task-a");
        assert_eq!(current.environment_type, Some(EnvironmentType::Staging));
    }

    #[tokio::test]
    async fn release_requires_matching_holder() {
        let guard = guard().await;
        acquire(&guard, "task-a").await.unwrap();
        assert!(!guard.release("task-b").await.unwrap());
        assert!(guard.release("task-a").await.unwrap());
        assert!(guard.current().await.unwrap().is_none());
        acquire(&guard, "task-b").await.unwrap();
    }

    #[tokio::test]
    async fn force_release_returns_previous_holder() {
        let guard = guard().await;
        acquire(&guard, "crashed").await.unwrap();
        assert_eq!(
            guard.force_release().await.unwrap().as_deref(),
            Some("crashed")
        );
        assert!(guard.force_release().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_permit_is_exclusive_until_dropped() {
        let guard = guard().await;
        let permit = guard.enter_local().unwrap();
        assert!(guard.is_held_locally());
        assert!(guard.enter_local().unwrap_err().is_validation());
        drop(permit);
        assert!(!guard.is_held_locally());
        assert!(guard.enter_local().is_ok());
    }
}
