//! Append-only deployment audit log.
//!
//! A row is inserted as IN_PROGRESS before an operation causes any side
//! effect, so a crash always leaves a discoverable trail. Completion moves
//! it to exactly one terminal status; the `status = 'IN_PROGRESS'` guard on
//! every completion makes a second completion a validation error rather
//! than an overwrite.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};

use index_release_core::models::{
    DeploymentHistory, DeploymentStatus, DeploymentType, EnvironmentType,
};

use crate::db::{from_ts, now_ts};
use crate::error::{ReleaseError, Result};

/// Fields supplied when an operation starts.
#[derive(Debug, Clone)]
pub struct NewHistory {
    pub deployment_type: DeploymentType,
    pub environment_type: Option<EnvironmentType>,
    pub version: Option<String>,
    pub description: Option<String>,
}

/// Filter for [`HistoryStore::list`]; unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryFilter {
    pub deployment_type: Option<DeploymentType>,
    pub status: Option<DeploymentStatus>,
    pub environment_type: Option<EnvironmentType>,
    pub version: Option<String>,
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
        }
    }
}

impl Page {
    pub const MAX_PER_PAGE: u32 = 200;

    fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            per_page: self.per_page.clamp(1, Self::MAX_PER_PAGE),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub items: Vec<DeploymentHistory>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

const SELECT_COLUMNS: &str = "SELECT id, deployment_type, environment_type, status, version, \
     description, document_count, error_message, details_json, created_at, completed_at \
     FROM deployment_history";

#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert an IN_PROGRESS row and return its id.
    pub async fn begin(&self, new: &NewHistory) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        Self::begin_in(&mut conn, new).await
    }

    /// Transaction-scoped variant of [`begin`](Self::begin).
    pub async fn begin_in(conn: &mut SqliteConnection, new: &NewHistory) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO deployment_history
                (deployment_type, environment_type, status, version, description, created_at)
            VALUES (?, ?, 'IN_PROGRESS', ?, ?, ?)
            "#,
        )
        .bind(new.deployment_type.as_str())
        .bind(new.environment_type.map(|e| e.as_str()))
        .bind(&new.version)
        .bind(&new.description)
        .bind(now_ts())
        .execute(&mut *conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn succeed(&self, id: i64, document_count: u64, details: Option<Value>) -> Result<()> {
        self.complete(id, DeploymentStatus::Success, document_count, details, None)
            .await
    }

    pub async fn fail(&self, id: i64, message: &str) -> Result<()> {
        self.complete(id, DeploymentStatus::Failed, 0, None, Some(message))
            .await
    }

    /// Move an IN_PROGRESS row to a terminal status.
    pub async fn complete(
        &self,
        id: i64,
        status: DeploymentStatus,
        document_count: u64,
        details: Option<Value>,
        error_message: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(ReleaseError::validation(
                "history rows can only complete to a terminal status",
            ));
        }
        let details_json = details
            .map(|d| d.to_string())
            .unwrap_or_else(|| "{}".to_string());

        let result = sqlx::query(
            r#"
            UPDATE deployment_history SET
                status = ?,
                document_count = ?,
                details_json = ?,
                error_message = ?,
                completed_at = ?
            WHERE id = ? AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(status.as_str())
        .bind(document_count as i64)
        .bind(details_json)
        .bind(error_message)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReleaseError::validation(format!(
                "history row {} is not in progress",
                id
            )));
        }
        Ok(())
    }

    /// Fail every row still IN_PROGRESS. Used by crash recovery.
    pub async fn fail_all_in_progress(&self, message: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE deployment_history SET status = 'FAILED', error_message = ?, completed_at = ?
            WHERE status = 'IN_PROGRESS'
            "#,
        )
        .bind(message)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get(&self, id: i64) -> Result<DeploymentHistory> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ReleaseError::NotFound(format!("history row {}", id)))?;
        row_to_history(&row)
    }

    /// Newest first.
    pub async fn list(&self, filter: &HistoryFilter, page: Page) -> Result<HistoryPage> {
        let page = page.normalized();

        let mut count_query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM deployment_history");
        push_filter(&mut count_query, filter);
        let total: i64 = count_query
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_COLUMNS);
        push_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(page.per_page as i64)
            .push(" OFFSET ")
            .push_bind(((page.page - 1) as i64) * page.per_page as i64);

        let rows = query.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(row_to_history)
            .collect::<Result<Vec<_>>>()?;

        Ok(HistoryPage {
            items,
            total,
            page: page.page,
            per_page: page.per_page,
        })
    }
}

fn push_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &HistoryFilter) {
    let mut first = true;
    let mut clause = |query: &mut QueryBuilder<'_, Sqlite>, column: &str| {
        query.push(if first { " WHERE " } else { " AND " });
        query.push(column);
        query.push(" = ");
        first = false;
    };

    if let Some(t) = filter.deployment_type {
        clause(query, "deployment_type");
        query.push_bind(t.as_str());
    }
    if let Some(s) = filter.status {
        clause(query, "status");
        query.push_bind(s.as_str());
    }
    if let Some(e) = filter.environment_type {
        clause(query, "environment_type");
        query.push_bind(e.as_str());
    }
    if let Some(v) = &filter.version {
        clause(query, "version");
        query.push_bind(v.clone());
    }
}

fn row_to_history(row: &SqliteRow) -> Result<DeploymentHistory> {
    let deployment_type: String = row.get("deployment_type");
    let environment_type: Option<String> = row.get("environment_type");
    let status: String = row.get("status");
    let details_json: String = row.get("details_json");
    let created_at: i64 = row.get("created_at");
    let completed_at: Option<i64> = row.get("completed_at");

    Ok(DeploymentHistory {
        id: row.get("id"),
        deployment_type: deployment_type.parse()?,
        environment_type: environment_type.map(|e| e.parse()).transpose()?,
        status: status.parse()?,
        version: row.get("version"),
        description: row.get("description"),
        document_count: row.get("document_count"),
        error_message: row.get("error_message"),
        details: serde_json::from_str(&details_json).unwrap_or(serde_json::json!({})),
        created_at: from_ts(created_at),
        completed_at: completed_at.map(from_ts),
    })
}
