//! Search engine abstraction.
//!
//! The [`SearchEngine`] trait covers exactly the engine operations the
//! index lifecycle needs: physical index management, bulk loading, alias
//! resolution and atomic multi-action alias updates, and named synonym
//! sets. Query and ranking behavior is deliberately absent.
//!
//! Implementations must be `Send + Sync`; they are shared behind `Arc`
//! between request handlers and background build workers.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`create_index`](SearchEngine::create_index) | Create a physical index with mappings/settings |
//! | [`delete_index`](SearchEngine::delete_index) | Drop a physical index |
//! | [`bulk_write`](SearchEngine::bulk_write) | Index a batch of documents |
//! | [`alias_targets`](SearchEngine::alias_targets) | Indices an alias currently resolves to |
//! | [`update_aliases`](SearchEngine::update_aliases) | Apply add/remove actions atomically |
//! | [`put_synonym_set`](SearchEngine::put_synonym_set) | Create or replace a synonym set |

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Errors surfaced by a search engine backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The engine could not be reached or the response was unreadable.
    #[error("transport error: {0}")]
    Transport(String),
    /// The engine answered but refused the request.
    #[error("engine rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The addressed index, alias, or synonym set does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Mappings and settings for a physical index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub settings: Value,
    pub mappings: Value,
}

/// One action of a multi-action alias update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AliasAction {
    Add { index: String, alias: String },
    Remove { index: String, alias: String },
}

impl AliasAction {
    pub fn alias(&self) -> &str {
        match self {
            AliasAction::Add { alias, .. } | AliasAction::Remove { alias, .. } => alias,
        }
    }

    pub fn index(&self) -> &str {
        match self {
            AliasAction::Add { index, .. } | AliasAction::Remove { index, .. } => index,
        }
    }
}

/// A document to write in a bulk request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDocument {
    pub id: String,
    pub source: Value,
}

/// Result of a bulk request; item-level failures do not fail the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub written: usize,
    /// `"<doc id>: <reason>"` for each rejected item.
    pub failures: Vec<String>,
}

/// A single synonym rule inside a synonym set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynonymRule {
    pub id: String,
    pub synonyms: String,
}

/// Abstract search engine backend.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Create a physical index. Fails if it already exists.
    async fn create_index(&self, name: &str, definition: &IndexDefinition) -> EngineResult<()>;

    /// Delete a physical index. Returns [`EngineError::NotFound`] if absent.
    async fn delete_index(&self, name: &str) -> EngineResult<()>;

    /// Names of all user-visible physical indices.
    async fn list_indices(&self) -> EngineResult<Vec<String>>;

    /// Index a batch of documents.
    async fn bulk_write(&self, index: &str, documents: &[BulkDocument])
        -> EngineResult<BulkSummary>;

    /// Toggle periodic refresh (disabled during bulk loads).
    async fn set_refresh_enabled(&self, index: &str, enabled: bool) -> EngineResult<()>;

    /// Make all written documents visible to readers.
    async fn refresh(&self, index: &str) -> EngineResult<()>;

    /// Number of searchable documents in an index.
    async fn count(&self, index: &str) -> EngineResult<u64>;

    /// Indices the alias resolves to; empty if the alias does not exist.
    async fn alias_targets(&self, alias: &str) -> EngineResult<Vec<String>>;

    /// Every alias and the indices it resolves to.
    async fn list_aliases(&self) -> EngineResult<BTreeMap<String, Vec<String>>>;

    /// Apply all actions as one atomic operation: either every action is
    /// applied or none is.
    async fn update_aliases(&self, actions: &[AliasAction]) -> EngineResult<()>;

    /// Create or replace a named synonym set.
    async fn put_synonym_set(&self, name: &str, rules: &[SynonymRule]) -> EngineResult<()>;

    /// Delete a named synonym set.
    async fn delete_synonym_set(&self, name: &str) -> EngineResult<()>;

    /// Names of all synonym sets.
    async fn list_synonym_sets(&self) -> EngineResult<Vec<String>>;

    /// Reload updateable search analyzers so new dictionary files apply.
    async fn reload_search_analyzers(&self, index: &str) -> EngineResult<()>;
}
