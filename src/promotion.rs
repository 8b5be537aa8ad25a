//! Staging → production cutover.
//!
//! Promotion holds the same guard as builds, so it never overlaps a build
//! or another promotion. Validation and the IN_PROGRESS history row share
//! one transaction: a refused promotion leaves no trace.
//!
//! Order of effects after registration:
//!
//! 1. copy the staging dictionary snapshot into the production scope
//! 2. repoint both aliases in one atomic request
//! 3. production adopts staging's names, version and count
//! 4. staging resets to INACTIVE and its snapshot is cleared
//! 5. history → SUCCESS
//! 6. delete the superseded production resources, best-effort
//!
//! A failure in 1–4 marks the history row FAILED and is returned. The
//! superseded resources are only deleted once nothing points at them.

use serde::Serialize;

use index_release_core::models::{
    DeploymentType, EnvironmentType, IndexEnvironment, IndexNames, IndexStatus,
};

use crate::builder::CleanupOutcome;
use crate::context::ReleaseContext;
use crate::environment::EnvironmentStore;
use crate::error::{ReleaseError, Result};
use crate::guard::IndexingGuard;
use crate::history::{HistoryStore, NewHistory};

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentOutcome {
    pub history_id: i64,
    pub version: String,
    pub document_count: i64,
    pub production: IndexNames,
    /// Indices the aliases pointed at before the cutover.
    pub removed_alias_targets: Vec<String>,
    pub cleanup: CleanupOutcome,
}

struct Registered {
    holder: String,
    history_id: i64,
    staging: IndexEnvironment,
    staging_names: IndexNames,
    version: String,
    previous_production: Option<IndexNames>,
}

#[derive(Clone)]
pub struct PromotionOrchestrator {
    ctx: ReleaseContext,
}

impl PromotionOrchestrator {
    pub fn new(ctx: ReleaseContext) -> Self {
        Self { ctx }
    }

    pub async fn promote(&self, description: Option<String>) -> Result<DeploymentOutcome> {
        let _permit = self.ctx.guard.enter_local()?;
        let reg = self.register(description).await?;

        tracing::info!(
            version = %reg.version,
            primary = %reg.staging_names.primary,
            "promotion started"
        );

        let result = self.cut_over(&reg).await;
        if let Err(e) = &result {
            tracing::error!(version = %reg.version, error = %e, "promotion failed");
            if let Err(he) = self.ctx.history.fail(reg.history_id, &e.to_string()).await {
                tracing::error!(history_id = reg.history_id, error = %he, "failed to record promotion failure");
            }
        }

        if let Err(e) = self.ctx.guard.release(&reg.holder).await {
            tracing::error!(holder = %reg.holder, error = %e, "failed to release indexing guard");
        }
        result
    }

    async fn register(&self, description: Option<String>) -> Result<Registered> {
        let holder = format!("promotion-{}", uuid::Uuid::new_v4());

        let mut tx = self.ctx.pool.begin().await?;
        IndexingGuard::acquire_in(&mut tx, &holder, "promotion", Some(EnvironmentType::Production))
            .await?;

        let staging = EnvironmentStore::load_in(&mut tx, EnvironmentType::Staging).await?;
        let production = EnvironmentStore::load_in(&mut tx, EnvironmentType::Production).await?;

        if staging.index_status != IndexStatus::Active {
            return Err(ReleaseError::validation(format!(
                "staging must be ACTIVE to promote (currently {})",
                staging.index_status
            )));
        }
        let (Some(staging_names), Some(version)) = (staging.index_names(), staging.version.clone())
        else {
            return Err(ReleaseError::validation(
                "staging is ACTIVE but has no complete index to promote",
            ));
        };
        if production.index_status.is_building() {
            return Err(ReleaseError::validation("production is being built"));
        }

        let history_id = HistoryStore::begin_in(
            &mut tx,
            &NewHistory {
                deployment_type: DeploymentType::Deployment,
                environment_type: Some(EnvironmentType::Production),
                version: Some(version.clone()),
                description,
            },
        )
        .await?;
        tx.commit().await?;

        Ok(Registered {
            holder,
            history_id,
            staging,
            staging_names,
            version,
            previous_production: production.index_names(),
        })
    }

    async fn cut_over(&self, reg: &Registered) -> Result<DeploymentOutcome> {
        let ctx = &self.ctx;

        ctx.snapshotter
            .copy_scope(EnvironmentType::Staging, EnvironmentType::Production)
            .await?;

        let targets = ctx.alias_targets(&reg.staging_names.primary, &reg.staging_names.autocomplete);
        let repoint = ctx.aliases.repoint_all(&targets).await?;

        let production = ctx
            .environments
            .adopt(EnvironmentType::Production, &reg.staging)
            .await?;
        ctx.environments.reset(EnvironmentType::Staging).await?;
        ctx.snapshotter.clear_scope(EnvironmentType::Staging).await?;

        let removed_alias_targets = repoint.removed_indices();
        let details = serde_json::json!({
            "production": reg.staging_names,
            "removed_alias_targets": removed_alias_targets,
            "previous_production": reg.previous_production,
        });
        if let Err(e) = ctx
            .history
            .succeed(reg.history_id, production.document_count.max(0) as u64, Some(details))
            .await
        {
            tracing::error!(history_id = reg.history_id, error = %e, "failed to record promotion success");
        }

        let cleanup = self
            .delete_superseded(reg.previous_production.as_ref(), &removed_alias_targets, &reg.staging_names)
            .await;
        cleanup.log("promotion");

        tracing::info!(
            version = %reg.version,
            documents = production.document_count,
            "promotion complete"
        );

        Ok(DeploymentOutcome {
            history_id: reg.history_id,
            version: reg.version.clone(),
            document_count: production.document_count,
            production: reg.staging_names.clone(),
            removed_alias_targets,
            cleanup,
        })
    }

    /// Old production resources, minus anything still referenced.
    async fn delete_superseded(
        &self,
        previous: Option<&IndexNames>,
        removed: &[String],
        current: &IndexNames,
    ) -> CleanupOutcome {
        let mut indices: Vec<String> = removed.to_vec();
        let mut sets: Vec<String> = Vec::new();
        if let Some(previous) = previous {
            indices.extend(previous.indices().into_iter().map(str::to_string));
            sets.extend(previous.synonym_set.clone());
        }
        indices.sort();
        indices.dedup();

        let protected = match self.ctx.protected_names(None).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "skipping superseded index cleanup");
                return CleanupOutcome::default();
            }
        };
        let keep = |name: &str| protected.contains(name) || current.contains(name);
        indices.retain(|i| !keep(i.as_str()));
        sets.retain(|s| !keep(s.as_str()));
        self.ctx.builder.delete_resources(&indices, &sets).await
    }
}
