//! Orphan detection and cleanup.
//!
//! A managed index (name starts with a configured prefix) is orphaned when
//! no environment row references it and no alias targets it. A managed
//! synonym set is orphaned when no environment row references it and no
//! aliased index was built with it. Anything outside the managed prefixes
//! is never touched.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::json;

use index_release_core::models::{DeploymentStatus, DeploymentType};

use crate::context::ReleaseContext;
use crate::error::Result;
use crate::history::NewHistory;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct OrphanReport {
    pub orphan_indices: Vec<String>,
    pub orphan_synonym_sets: Vec<String>,
}

impl OrphanReport {
    pub fn is_empty(&self) -> bool {
        self.orphan_indices.is_empty() && self.orphan_synonym_sets.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DeletionReport {
    /// CLEANUP history row, when anything was attempted.
    pub history_id: Option<i64>,
    pub status: Option<DeploymentStatus>,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct ReconciliationSweeper {
    ctx: ReleaseContext,
}

impl ReconciliationSweeper {
    pub fn new(ctx: ReleaseContext) -> Self {
        Self { ctx }
    }

    pub async fn find_orphans(&self) -> Result<OrphanReport> {
        let ctx = &self.ctx;
        let indices = ctx.engine.list_indices().await?;
        let sets = ctx.engine.list_synonym_sets().await?;
        let aliased: HashSet<String> = ctx
            .engine
            .list_aliases()
            .await?
            .into_values()
            .flatten()
            .collect();
        let in_use_sets: HashSet<String> = aliased
            .iter()
            .filter_map(|index| ctx.builder.synonym_set_for(index))
            .collect();
        let environments = ctx.environments.list().await?;
        let referenced = |name: &str| environments.iter().any(|e| e.references(name));

        let orphan_indices = indices
            .into_iter()
            .filter(|n| ctx.builder.is_managed_index(n))
            .filter(|n| !referenced(n.as_str()) && !aliased.contains(n))
            .collect();
        let orphan_synonym_sets = sets
            .into_iter()
            .filter(|n| ctx.builder.is_managed_synonym_set(n))
            .filter(|n| !referenced(n.as_str()) && !in_use_sets.contains(n))
            .collect();

        Ok(OrphanReport {
            orphan_indices,
            orphan_synonym_sets,
        })
    }

    /// Delete every orphan. Without `confirm` nothing happens.
    pub async fn delete_orphans(&self, confirm: bool) -> Result<DeletionReport> {
        if !confirm {
            return Ok(DeletionReport::default());
        }

        let orphans = self.find_orphans().await?;
        if orphans.is_empty() {
            tracing::info!("no orphans to delete");
            return Ok(DeletionReport::default());
        }

        let history_id = self
            .ctx
            .history
            .begin(&NewHistory {
                deployment_type: DeploymentType::Cleanup,
                environment_type: None,
                version: None,
                description: Some(format!(
                    "orphan cleanup: {} index(es), {} synonym set(s)",
                    orphans.orphan_indices.len(),
                    orphans.orphan_synonym_sets.len()
                )),
            })
            .await?;

        let outcome = self
            .ctx
            .builder
            .delete_resources(&orphans.orphan_indices, &orphans.orphan_synonym_sets)
            .await;
        outcome.log("orphan cleanup");

        let status = cleanup_status(outcome.deleted.len(), outcome.failed.len());
        let details = json!({
            "deleted": outcome.deleted,
            "failed": outcome
                .failed
                .iter()
                .map(|(name, reason)| json!({ "name": name, "error": reason }))
                .collect::<Vec<_>>(),
        });
        let error_message = (!outcome.failed.is_empty())
            .then(|| format!("{} deletion(s) failed", outcome.failed.len()));

        self.ctx
            .history
            .complete(
                history_id,
                status,
                outcome.deleted.len() as u64,
                Some(details),
                error_message.as_deref(),
            )
            .await?;

        Ok(DeletionReport {
            history_id: Some(history_id),
            status: Some(status),
            deleted: outcome.deleted,
            failed: outcome.failed,
        })
    }
}

fn cleanup_status(deleted: usize, failed: usize) -> DeploymentStatus {
    match (deleted, failed) {
        (_, 0) => DeploymentStatus::Success,
        (0, _) => DeploymentStatus::Failed,
        _ => DeploymentStatus::Partial,
    }
}
