//! Error taxonomy for lifecycle operations.
//!
//! | Variant | Meaning | Side effects before failure |
//! |---------|---------|-----------------------------|
//! | [`Validation`](ReleaseError::Validation), [`ConcurrentBuild`](ReleaseError::ConcurrentBuild) | precondition unmet | none |
//! | [`Stage`](ReleaseError::Stage) | a pipeline stage failed | recorded as FAILED |
//! | [`AliasUpdate`](ReleaseError::AliasUpdate) | cutover call failed | alias untouched |
//! | [`Transport`](ReleaseError::Transport) | engine/channel unreachable | depends on caller |
//!
//! Best-effort cleanup never produces one of these; see
//! [`CleanupOutcome`](crate::builder::CleanupOutcome).

use index_release_core::engine::EngineError;
use index_release_core::models::ParseEnumError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("a build is already running ({holder})")]
    ConcurrentBuild { holder: String },

    #[error("stage '{stage}' failed: {message}")]
    Stage { stage: &'static str, message: String },

    #[error("alias update failed: {0}")]
    AliasUpdate(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ReleaseError>;

impl ReleaseError {
    /// True for errors raised before any side effect; safe to retry once
    /// the precondition clears.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ReleaseError::Validation(_) | ReleaseError::ConcurrentBuild { .. }
        )
    }

    /// Machine-readable code used by the HTTP layer.
    pub fn code(&self) -> &'static str {
        match self {
            ReleaseError::Validation(_) => "validation_failed",
            ReleaseError::ConcurrentBuild { .. } => "build_in_progress",
            ReleaseError::Stage { .. } => "stage_failed",
            ReleaseError::AliasUpdate(_) => "alias_update_failed",
            ReleaseError::Transport(_) => "transport",
            ReleaseError::NotFound(_) => "not_found",
            ReleaseError::Database(_) | ReleaseError::Internal(_) => "internal",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ReleaseError::Validation(message.into())
    }
}

impl From<EngineError> for ReleaseError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(what) => ReleaseError::NotFound(what),
            other => ReleaseError::Transport(other.to_string()),
        }
    }
}

impl From<ParseEnumError> for ReleaseError {
    fn from(err: ParseEnumError) -> Self {
        ReleaseError::Internal(err.into())
    }
}

/// Wraps any error as a [`ReleaseError::Stage`] for the named pipeline stage.
pub trait StageExt<T> {
    fn stage(self, stage: &'static str) -> Result<T>;
}

impl<T, E: std::fmt::Display> StageExt<T> for std::result::Result<T, E> {
    fn stage(self, stage: &'static str) -> Result<T> {
        self.map_err(|e| ReleaseError::Stage {
            stage,
            message: e.to_string(),
        })
    }
}
