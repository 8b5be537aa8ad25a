//! Editable dictionary rows and their version-bound snapshots.
//!
//! Operators edit `dictionary_entries` at any time. A build freezes the
//! current entries into `dictionary_snapshots` for its environment and
//! version, so later edits never leak into an index that is already built.
//! Promotion copies the staging snapshot into the production scope.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use index_release_core::engine::SynonymRule;
use index_release_core::models::{DictionaryKind, EnvironmentType};

use crate::channel::DictionaryArtifact;
use crate::db::now_ts;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DictionaryEntry {
    pub id: i64,
    pub kind: DictionaryKind,
    pub content: String,
}

#[derive(Clone)]
pub struct DictionaryStore {
    pool: SqlitePool,
}

impl DictionaryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert an entry; an identical entry is kept and its timestamp bumped.
    pub async fn add_entry(&self, kind: DictionaryKind, content: &str) -> Result<DictionaryEntry> {
        let content = content.trim();
        if content.is_empty() {
            return Err(crate::error::ReleaseError::validation(
                "dictionary entry must not be empty",
            ));
        }
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO dictionary_entries (kind, content, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(kind, content) DO UPDATE SET updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(kind.as_str())
        .bind(content)
        .bind(now_ts())
        .fetch_one(&self.pool)
        .await?;

        Ok(DictionaryEntry {
            id,
            kind,
            content: content.to_string(),
        })
    }

    pub async fn list_entries(&self, kind: Option<DictionaryKind>) -> Result<Vec<DictionaryEntry>> {
        let rows = match kind {
            Some(k) => {
                sqlx::query("SELECT id, kind, content FROM dictionary_entries WHERE kind = ? ORDER BY id")
                    .bind(k.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT id, kind, content FROM dictionary_entries ORDER BY kind, id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter()
            .map(|row| -> Result<DictionaryEntry> {
                let kind: String = row.get("kind");
                Ok(DictionaryEntry {
                    id: row.get("id"),
                    kind: kind.parse()?,
                    content: row.get("content"),
                })
            })
            .collect()
    }
}

/// Frozen dictionary content for one environment and version.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DictionarySnapshot {
    pub version: Option<String>,
    pub synonyms: Vec<String>,
    pub user_words: Vec<String>,
    pub stopwords: Vec<String>,
}

impl DictionarySnapshot {
    /// Synonym rows as engine rules, ids stable within the snapshot.
    pub fn synonym_rules(&self) -> Vec<SynonymRule> {
        self.synonyms
            .iter()
            .enumerate()
            .map(|(i, s)| SynonymRule {
                id: format!("rule-{}", i + 1),
                synonyms: s.clone(),
            })
            .collect()
    }

    pub fn render_user_dictionary(&self) -> String {
        render_lines(&self.user_words)
    }

    pub fn render_stopwords(&self) -> String {
        render_lines(&self.stopwords)
    }

    pub fn is_empty(&self) -> bool {
        self.synonyms.is_empty() && self.user_words.is_empty() && self.stopwords.is_empty()
    }

    /// Files for the search nodes, keyed by build version so a promoted
    /// index keeps reading the files it was built with.
    pub fn artifacts(&self, target_path: &str, version: &str) -> Vec<DictionaryArtifact> {
        let dir = format!("{}/{}", target_path.trim_end_matches('/'), version);
        vec![
            DictionaryArtifact {
                path: format!("{}/user_dictionary.txt", dir),
                content: self.render_user_dictionary(),
            },
            DictionaryArtifact {
                path: format!("{}/stopwords.txt", dir),
                content: self.render_stopwords(),
            },
        ]
    }
}

fn render_lines(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[derive(Clone)]
pub struct DictionarySnapshotter {
    pool: SqlitePool,
}

impl DictionarySnapshotter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Replace `env`'s snapshot with the current editable entries.
    pub async fn snapshot(&self, env: EnvironmentType, version: &str) -> Result<DictionarySnapshot> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM dictionary_snapshots WHERE environment_type = ?")
            .bind(env.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO dictionary_snapshots (environment_type, version, kind, content, created_at)
            SELECT ?, ?, kind, content, ? FROM dictionary_entries ORDER BY id
            "#,
        )
        .bind(env.as_str())
        .bind(version)
        .bind(now_ts())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.load(env).await
    }

    pub async fn load(&self, env: EnvironmentType) -> Result<DictionarySnapshot> {
        let rows = sqlx::query(
            "SELECT version, kind, content FROM dictionary_snapshots WHERE environment_type = ? ORDER BY id",
        )
        .bind(env.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = DictionarySnapshot::default();
        for row in &rows {
            let kind: String = row.get("kind");
            let content: String = row.get("content");
            if snapshot.version.is_none() {
                snapshot.version = Some(row.get("version"));
            }
            match kind.parse::<DictionaryKind>()? {
                DictionaryKind::Synonym => snapshot.synonyms.push(content),
                DictionaryKind::UserWord => snapshot.user_words.push(content),
                DictionaryKind::Stopword => snapshot.stopwords.push(content),
            }
        }
        Ok(snapshot)
    }

    /// Make `to`'s snapshot an exact copy of `from`'s. `from` is untouched.
    pub async fn copy_scope(&self, from: EnvironmentType, to: EnvironmentType) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM dictionary_snapshots WHERE environment_type = ?")
            .bind(to.as_str())
            .execute(&mut *tx)
            .await?;
        let copied = sqlx::query(
            r#"
            INSERT INTO dictionary_snapshots (environment_type, version, kind, content, created_at)
            SELECT ?, version, kind, content, ? FROM dictionary_snapshots
            WHERE environment_type = ? ORDER BY id
            "#,
        )
        .bind(to.as_str())
        .bind(now_ts())
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(copied)
    }

    pub async fn clear_scope(&self, env: EnvironmentType) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dictionary_snapshots WHERE environment_type = ?")
            .bind(env.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
