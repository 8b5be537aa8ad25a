//! Public facade over the lifecycle operations.
//!
//! The CLI and the HTTP server both go through [`ReleaseService`]; neither
//! touches the orchestrators or stores directly.

use std::sync::Arc;

use anyhow::Context as _;

use index_release_core::models::{
    BuildTask, DeploymentHistory, DictionaryKind, EnvironmentType, IndexEnvironment, IndexStatus,
};

use crate::catalog_sql::SqlCatalogSource;
use crate::channel::create_channel;
use crate::config::Config;
use crate::context::{ReleaseContext, ReleaseSettings};
use crate::dictionary::DictionaryEntry;
use crate::embedding::create_provider;
use crate::engine_http::HttpSearchEngine;
use crate::error::{ReleaseError, Result};
use crate::guard::GuardHolder;
use crate::history::{HistoryFilter, HistoryPage, Page};
use crate::indexing::{BuildHandle, IndexingOrchestrator, RecoveryReport};
use crate::promotion::{DeploymentOutcome, PromotionOrchestrator};
use crate::reconcile::{DeletionReport, OrphanReport, ReconciliationSweeper};
use crate::version::ClockVersionGenerator;

#[derive(Clone)]
pub struct ReleaseService {
    ctx: ReleaseContext,
    indexing: IndexingOrchestrator,
    promotion: PromotionOrchestrator,
    sweeper: ReconciliationSweeper,
}

impl ReleaseService {
    /// Wire the production collaborators from configuration.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = crate::db::connect(config)
            .await
            .context("failed to open database")?;
        crate::migrate::migrate_pool(&pool).await?;

        let engine = HttpSearchEngine::new(&config.engine).context("invalid [engine] settings")?;
        let embedder = create_provider(&config.embedding)?;
        let channel = create_channel(&config.dictionary)?;
        let catalog = SqlCatalogSource::new(pool.clone());

        let ctx = ReleaseContext::new(
            pool,
            Arc::new(engine),
            Arc::new(catalog),
            embedder,
            channel,
            Arc::new(ClockVersionGenerator::new()),
            ReleaseSettings::from_config(config),
        );
        Ok(Self::new(ctx))
    }

    pub fn new(ctx: ReleaseContext) -> Self {
        Self {
            indexing: IndexingOrchestrator::new(ctx.clone()),
            promotion: PromotionOrchestrator::new(ctx.clone()),
            sweeper: ReconciliationSweeper::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &ReleaseContext {
        &self.ctx
    }

    pub async fn start_build(
        &self,
        environment: EnvironmentType,
        description: Option<String>,
    ) -> Result<BuildHandle> {
        self.indexing.start_build(environment, description).await
    }

    pub async fn build_status(&self, task_id: &str) -> Result<BuildTask> {
        self.indexing.build_status(task_id).await
    }

    pub async fn promote(&self, description: Option<String>) -> Result<DeploymentOutcome> {
        self.promotion.promote(description).await
    }

    pub async fn find_orphans(&self) -> Result<OrphanReport> {
        self.sweeper.find_orphans().await
    }

    pub async fn delete_orphans(&self, confirm: bool) -> Result<DeletionReport> {
        self.sweeper.delete_orphans(confirm).await
    }

    pub async fn list_environments(&self) -> Result<Vec<IndexEnvironment>> {
        self.ctx.environments.list().await
    }

    pub async fn list_history(&self, filter: &HistoryFilter, page: Page) -> Result<HistoryPage> {
        self.ctx.history.list(filter, page).await
    }

    pub async fn get_history(&self, id: i64) -> Result<DeploymentHistory> {
        self.ctx.history.get(id).await
    }

    /// Return an environment to INACTIVE.
    ///
    /// Refused while the environment is building, and for an ACTIVE
    /// production row: the live aliases still point at its indices.
    pub async fn reset_environment(&self, environment: EnvironmentType) -> Result<IndexEnvironment> {
        let current = self.ctx.environments.get(environment).await?;
        if current.index_status.is_building() {
            return Err(ReleaseError::validation(format!(
                "{} environment is building and cannot be reset",
                environment
            )));
        }
        if environment == EnvironmentType::Production && current.index_status == IndexStatus::Active {
            return Err(ReleaseError::validation(
                "production is serving traffic; promote a replacement instead of resetting it",
            ));
        }

        let reset = self.ctx.environments.reset(environment).await?;
        self.ctx.snapshotter.clear_scope(environment).await?;
        tracing::info!(environment = %environment, previous = %current.index_status, "environment reset");
        Ok(reset)
    }

    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.indexing.recover().await
    }

    pub async fn add_dictionary_entry(&self, kind: DictionaryKind, content: &str) -> Result<DictionaryEntry> {
        self.ctx.dictionary.add_entry(kind, content).await
    }

    pub async fn list_dictionary_entries(&self, kind: Option<DictionaryKind>) -> Result<Vec<DictionaryEntry>> {
        self.ctx.dictionary.list_entries(kind).await
    }

    pub async fn guard_status(&self) -> Result<Option<GuardHolder>> {
        self.ctx.guard.current().await
    }
}
