//! Persistent state of the two deployment environments.
//!
//! Rows are created lazily as INACTIVE the first time an environment is
//! referenced and are never deleted. Callers cannot write arbitrary
//! columns: every mutation is one of the named transitions below, and each
//! transition's `WHERE` clause encodes the state it is allowed to start
//! from, so a stale caller gets a validation error instead of clobbering a
//! newer state.
//!
//! | Transition | From | To |
//! |------------|------|----|
//! | [`prepare_in`](EnvironmentStore::prepare_in) | any non-building | INDEXING (new names, version) |
//! | [`update_progress`](EnvironmentStore::update_progress) | INDEXING (same version) | INDEXING |
//! | [`activate`](EnvironmentStore::activate) | INDEXING (same version) | ACTIVE |
//! | [`fail_indexing`](EnvironmentStore::fail_indexing) | building (same version) | FAILED, names cleared |
//! | [`adopt`](EnvironmentStore::adopt) | any non-building | ACTIVE (copied from another row) |
//! | [`reset`](EnvironmentStore::reset) | any non-building | INACTIVE, names cleared |

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use index_release_core::models::{EnvironmentType, IndexEnvironment, IndexNames, IndexStatus};

use crate::db::{from_ts, now_ts};
use crate::error::{ReleaseError, Result};

const SELECT_COLUMNS: &str = "SELECT environment_type, index_status, primary_index_name, \
     autocomplete_index_name, synonym_set_name, version, document_count, \
     indexed_document_count, total_document_count, last_indexed_at, index_date, updated_at \
     FROM index_environments";

const NOT_BUILDING: &str = "index_status NOT IN ('PREPARING', 'INDEXING')";

#[derive(Clone)]
pub struct EnvironmentStore {
    pool: SqlitePool,
}

impl EnvironmentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Current row for `env`, creating it if this is the first reference.
    pub async fn get(&self, env: EnvironmentType) -> Result<IndexEnvironment> {
        let mut conn = self.pool.acquire().await?;
        Self::load_in(&mut conn, env).await
    }

    /// Both environments, staging first.
    pub async fn list(&self) -> Result<Vec<IndexEnvironment>> {
        let mut conn = self.pool.acquire().await?;
        let mut out = Vec::with_capacity(EnvironmentType::ALL.len());
        for env in EnvironmentType::ALL {
            out.push(Self::load_in(&mut conn, *env).await?);
        }
        Ok(out)
    }

    /// Transaction-scoped read with lazy creation.
    pub async fn load_in(conn: &mut SqliteConnection, env: EnvironmentType) -> Result<IndexEnvironment> {
        sqlx::query(
            "INSERT OR IGNORE INTO index_environments (environment_type, index_status, updated_at) \
             VALUES (?, 'INACTIVE', ?)",
        )
        .bind(env.as_str())
        .bind(now_ts())
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query(&format!("{} WHERE environment_type = ?", SELECT_COLUMNS))
            .bind(env.as_str())
            .fetch_one(&mut *conn)
            .await?;
        row_to_environment(&row)
    }

    /// Bind a new build's names and version and mark the row INDEXING.
    pub async fn prepare_in(
        conn: &mut SqliteConnection,
        env: EnvironmentType,
        names: &IndexNames,
        version: &str,
    ) -> Result<()> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE index_environments SET
                index_status = 'INDEXING',
                primary_index_name = ?,
                autocomplete_index_name = ?,
                synonym_set_name = ?,
                version = ?,
                indexed_document_count = 0,
                total_document_count = 0,
                updated_at = ?
            WHERE environment_type = ? AND {}
            "#,
            NOT_BUILDING
        ))
        .bind(&names.primary)
        .bind(&names.autocomplete)
        .bind(&names.synonym_set)
        .bind(version)
        .bind(now_ts())
        .bind(env.as_str())
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReleaseError::validation(format!(
                "{} environment is already building",
                env
            )));
        }
        Ok(())
    }

    pub async fn update_progress(
        &self,
        env: EnvironmentType,
        version: &str,
        indexed: u64,
        total: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE index_environments SET
                indexed_document_count = ?,
                total_document_count = ?,
                updated_at = ?
            WHERE environment_type = ? AND version = ? AND index_status = 'INDEXING'
            "#,
        )
        .bind(indexed as i64)
        .bind(total as i64)
        .bind(now_ts())
        .bind(env.as_str())
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark the build of `version` complete.
    pub async fn activate(
        &self,
        env: EnvironmentType,
        version: &str,
        document_count: u64,
    ) -> Result<IndexEnvironment> {
        let now = now_ts();
        let result = sqlx::query(
            r#"
            UPDATE index_environments SET
                index_status = 'ACTIVE',
                document_count = ?,
                indexed_document_count = ?,
                total_document_count = ?,
                last_indexed_at = ?,
                index_date = ?,
                updated_at = ?
            WHERE environment_type = ? AND version = ? AND index_status = 'INDEXING'
              AND primary_index_name IS NOT NULL AND autocomplete_index_name IS NOT NULL
            "#,
        )
        .bind(document_count as i64)
        .bind(document_count as i64)
        .bind(document_count as i64)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(env.as_str())
        .bind(version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReleaseError::validation(format!(
                "{} environment is not indexing version {}",
                env, version
            )));
        }
        self.get(env).await
    }

    /// Mark the build of `version` failed. Physical names are cleared so the
    /// half-built resources become visible to reconciliation; the version is
    /// kept to correlate with history. Returns false if the row had already
    /// moved on.
    pub async fn fail_indexing(&self, env: EnvironmentType, version: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE index_environments SET
                index_status = 'FAILED',
                primary_index_name = NULL,
                autocomplete_index_name = NULL,
                synonym_set_name = NULL,
                document_count = 0,
                updated_at = ?
            WHERE environment_type = ? AND version = ? AND NOT ({})
            "#,
            NOT_BUILDING
        ))
        .bind(now_ts())
        .bind(env.as_str())
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fail every row still marked as building. Used by crash recovery.
    pub async fn fail_all_building(&self) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE index_environments SET
                index_status = 'FAILED',
                primary_index_name = NULL,
                autocomplete_index_name = NULL,
                synonym_set_name = NULL,
                document_count = 0,
                updated_at = ?
            WHERE NOT ({})
            "#,
            NOT_BUILDING
        ))
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Make `target` serve exactly what `source` describes.
    pub async fn adopt(
        &self,
        target: EnvironmentType,
        source: &IndexEnvironment,
    ) -> Result<IndexEnvironment> {
        let (primary, autocomplete, version) = match (
            &source.primary_index_name,
            &source.autocomplete_index_name,
            &source.version,
        ) {
            (Some(p), Some(a), Some(v)) => (p, a, v),
            _ => {
                return Err(ReleaseError::validation(format!(
                    "{} environment has no complete index to adopt",
                    source.environment_type
                )))
            }
        };

        let now = now_ts();
        let result = sqlx::query(&format!(
            r#"
            UPDATE index_environments SET
                index_status = 'ACTIVE',
                primary_index_name = ?,
                autocomplete_index_name = ?,
                synonym_set_name = ?,
                version = ?,
                document_count = ?,
                indexed_document_count = ?,
                total_document_count = ?,
                last_indexed_at = ?,
                index_date = ?,
                updated_at = ?
            WHERE environment_type = ? AND {}
            "#,
            NOT_BUILDING
        ))
        .bind(primary)
        .bind(autocomplete)
        .bind(&source.synonym_set_name)
        .bind(version)
        .bind(source.document_count)
        .bind(source.document_count)
        .bind(source.document_count)
        .bind(source.last_indexed_at.map(|t| t.timestamp()))
        .bind(now)
        .bind(now)
        .bind(target.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReleaseError::validation(format!(
                "{} environment is building and cannot adopt a new index",
                target
            )));
        }
        self.get(target).await
    }

    /// Return `env` to INACTIVE with every name cleared.
    pub async fn reset(&self, env: EnvironmentType) -> Result<IndexEnvironment> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE index_environments SET
                index_status = 'INACTIVE',
                primary_index_name = NULL,
                autocomplete_index_name = NULL,
                synonym_set_name = NULL,
                version = NULL,
                document_count = 0,
                indexed_document_count = 0,
                total_document_count = 0,
                index_date = NULL,
                updated_at = ?
            WHERE environment_type = ? AND {}
            "#,
            NOT_BUILDING
        ))
        .bind(now_ts())
        .bind(env.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either missing (nothing to reset) or building.
            let current = self.get(env).await?;
            if current.index_status.is_building() {
                return Err(ReleaseError::validation(format!(
                    "{} environment is building and cannot be reset",
                    env
                )));
            }
            return Ok(current);
        }
        self.get(env).await
    }
}

fn row_to_environment(row: &SqliteRow) -> Result<IndexEnvironment> {
    let env: String = row.get("environment_type");
    let status: String = row.get("index_status");
    let last_indexed_at: Option<i64> = row.get("last_indexed_at");
    let index_date: Option<i64> = row.get("index_date");
    let updated_at: i64 = row.get("updated_at");

    Ok(IndexEnvironment {
        environment_type: env.parse()?,
        index_status: status.parse::<IndexStatus>()?,
        primary_index_name: row.get("primary_index_name"),
        autocomplete_index_name: row.get("autocomplete_index_name"),
        synonym_set_name: row.get("synonym_set_name"),
        version: row.get("version"),
        document_count: row.get("document_count"),
        indexed_document_count: row.get("indexed_document_count"),
        total_document_count: row.get("total_document_count"),
        last_indexed_at: last_indexed_at.map(from_ts),
        index_date: index_date.map(from_ts),
        updated_at: from_ts(updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> EnvironmentStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        EnvironmentStore::new(pool)
    }

    fn names(v: &str) -> IndexNames {
        IndexNames {
            primary: format!("p-{}", v),
            autocomplete: format!("a-{}", v),
            synonym_set: Some(format!("s-{}", v)),
        }
    }

    async fn prepare(store: &EnvironmentStore, env: EnvironmentType, v: &str) -> Result<()> {
        let mut conn = store.pool.acquire().await?;
        EnvironmentStore::prepare_in(&mut conn, env, &names(v), v).await
    }

    #[tokio::test]
    async fn rows_are_created_lazily_as_inactive() {
        let store = store().await;
        let envs = store.list().await.unwrap();
        assert_eq!(envs.len(), 2);
        assert_eq!(envs[0].environment_type, EnvironmentType::Staging);
        assert!(envs
            .iter()
            .all(|e| e.index_status == IndexStatus::Inactive && e.primary_index_name.is_none()));
    }

    #[tokio::test]
    async fn prepare_then_activate() {
        let store = store().await;
        prepare(&store, EnvironmentType::Staging, "v1").await.unwrap();

        let building = store.get(EnvironmentType::Staging).await.unwrap();
        assert_eq!(building.index_status, IndexStatus::Indexing);

        // A second prepare is refused while building.
        assert!(prepare(&store, EnvironmentType::Staging, "v2")
            .await
            .unwrap_err()
            .is_validation());

        let active = store
            .activate(EnvironmentType::Staging, "v1", 42)
            .await
            .unwrap();
        assert_eq!(active.index_status, IndexStatus::Active);
        assert_eq!(active.document_count, 42);
        assert_eq!(active.primary_index_name.as_deref(), Some("p-v1"));
        assert!(active.index_date.is_some());
    }

    #[tokio::test]
    async fn activate_rejects_stale_version() {
        let store = store().await;
        prepare(&store, EnvironmentType::Staging, "v2").await.unwrap();
        assert!(store
            .activate(EnvironmentType::Staging, "v1", 1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn fail_clears_names_and_keeps_version() {
        let store = store().await;
        prepare(&store, EnvironmentType::Production, "v1").await.unwrap();
        assert!(store
            .fail_indexing(EnvironmentType::Production, "v1")
            .await
            .unwrap());

        let env = store.get(EnvironmentType::Production).await.unwrap();
        assert_eq!(env.index_status, IndexStatus::Failed);
        assert_eq!(env.version.as_deref(), Some("v1"));
        assert!(env.index_names().is_none());

        let reset = store.reset(EnvironmentType::Production).await.unwrap();
        assert_eq!(reset.index_status, IndexStatus::Inactive);
        assert!(reset.version.is_none());
    }

    #[tokio::test]
    async fn adopt_copies_staging() {
        let store = store().await;
        prepare(&store, EnvironmentType::Staging, "v1").await.unwrap();
        let staging = store
            .activate(EnvironmentType::Staging, "v1", 500)
            .await
            .unwrap();

        let prod = store
            .adopt(EnvironmentType::Production, &staging)
            .await
            .unwrap();
        assert_eq!(prod.index_status, IndexStatus::Active);
        assert_eq!(prod.primary_index_name, staging.primary_index_name);
        assert_eq!(prod.synonym_set_name, staging.synonym_set_name);
        assert_eq!(prod.document_count, 500);
    }

    #[tokio::test]
    async fn reset_refuses_building_row() {
        let store = store().await;
        prepare(&store, EnvironmentType::Staging, "v1").await.unwrap();
        assert!(store
            .reset(EnvironmentType::Staging)
            .await
            .unwrap_err()
            .is_validation());
        assert_eq!(store.fail_all_building().await.unwrap(), 1);
    }
}
