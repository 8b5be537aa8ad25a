//! Core data models for the index lifecycle.
//!
//! These types describe the two deployment environments, the append-only
//! deployment history, build tasks, and the catalog records that flow
//! through the indexing pipeline. Status enums are stored in SQL as their
//! upper-case names (`"STAGING"`, `"IN_PROGRESS"`, ...) and parse
//! case-insensitively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a status or type string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! str_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let upper = s.trim().to_ascii_uppercase().replace('-', "_");
                match upper.as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ParseEnumError {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

str_enum! {
    /// One of the two blue-green deployment environments.
    EnvironmentType, "environment type" {
        Staging => "STAGING",
        Production => "PRODUCTION",
    }
}

str_enum! {
    /// Lifecycle status of an environment's index.
    IndexStatus, "index status" {
        /// No index bound; names are cleared.
        Inactive => "INACTIVE",
        /// Reserved for a build that has registered but not started loading.
        Preparing => "PREPARING",
        /// A build is running for this environment.
        Indexing => "INDEXING",
        /// Names and version point at a complete index.
        Active => "ACTIVE",
        /// The last build failed; requires a reset or a new build.
        Failed => "FAILED",
    }
}

str_enum! {
    /// Kind of operation recorded in deployment history.
    DeploymentType, "deployment type" {
        Indexing => "INDEXING",
        Deployment => "DEPLOYMENT",
        Cleanup => "CLEANUP",
    }
}

str_enum! {
    /// Outcome of a deployment history row.
    DeploymentStatus, "deployment status" {
        InProgress => "IN_PROGRESS",
        Success => "SUCCESS",
        Failed => "FAILED",
        Partial => "PARTIAL",
    }
}

str_enum! {
    /// Status of a background build task.
    TaskStatus, "task status" {
        Running => "RUNNING",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
}

str_enum! {
    /// Kind of an editable dictionary row.
    DictionaryKind, "dictionary kind" {
        Synonym => "SYNONYM",
        UserWord => "USER_WORD",
        Stopword => "STOPWORD",
    }
}

impl IndexStatus {
    /// True while a build owns the environment row.
    pub fn is_building(&self) -> bool {
        matches!(self, IndexStatus::Preparing | IndexStatus::Indexing)
    }
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::InProgress)
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// The physical resources that make up one index version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexNames {
    /// Primary product index.
    pub primary: String,
    /// Edge-ngram autocomplete index.
    pub autocomplete: String,
    /// Synonym rule set referenced by the primary index's search analyzer.
    pub synonym_set: Option<String>,
}

impl IndexNames {
    /// Physical index names (primary first).
    pub fn indices(&self) -> [&str; 2] {
        [&self.primary, &self.autocomplete]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.primary == name
            || self.autocomplete == name
            || self.synonym_set.as_deref() == Some(name)
    }
}

/// Persisted state of one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEnvironment {
    pub environment_type: EnvironmentType,
    pub index_status: IndexStatus,
    pub primary_index_name: Option<String>,
    pub autocomplete_index_name: Option<String>,
    pub synonym_set_name: Option<String>,
    pub version: Option<String>,
    pub document_count: i64,
    pub indexed_document_count: i64,
    pub total_document_count: i64,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub index_date: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl IndexEnvironment {
    /// A fresh, never-built environment.
    pub fn inactive(environment_type: EnvironmentType, now: DateTime<Utc>) -> Self {
        Self {
            environment_type,
            index_status: IndexStatus::Inactive,
            primary_index_name: None,
            autocomplete_index_name: None,
            synonym_set_name: None,
            version: None,
            document_count: 0,
            indexed_document_count: 0,
            total_document_count: 0,
            last_indexed_at: None,
            index_date: None,
            updated_at: now,
        }
    }

    /// Index names currently bound to this environment, if both physical
    /// indices are recorded.
    pub fn index_names(&self) -> Option<IndexNames> {
        match (&self.primary_index_name, &self.autocomplete_index_name) {
            (Some(primary), Some(autocomplete)) => Some(IndexNames {
                primary: primary.clone(),
                autocomplete: autocomplete.clone(),
                synonym_set: self.synonym_set_name.clone(),
            }),
            _ => None,
        }
    }

    /// Whether this environment references the given index or synonym set.
    pub fn references(&self, name: &str) -> bool {
        self.primary_index_name.as_deref() == Some(name)
            || self.autocomplete_index_name.as_deref() == Some(name)
            || self.synonym_set_name.as_deref() == Some(name)
    }
}

/// One row of the append-only deployment audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentHistory {
    pub id: i64,
    pub deployment_type: DeploymentType,
    pub environment_type: Option<EnvironmentType>,
    pub status: DeploymentStatus,
    pub version: Option<String>,
    pub description: Option<String>,
    pub document_count: i64,
    pub error_message: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A background build as seen by pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTask {
    pub id: String,
    pub environment_type: EnvironmentType,
    pub version: String,
    pub progress_percent: u8,
    pub message: String,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A product record read from the source catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: String,
    pub name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub keywords: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CatalogRecord {
    /// Minimal record, mostly useful for tests and fixtures.
    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            brand: None,
            category: None,
            description: None,
            price: None,
            keywords: Vec::new(),
            updated_at: None,
        }
    }
}
