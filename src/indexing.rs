//! Build pipeline for one environment.
//!
//! [`IndexingOrchestrator::start_build`] does all of its bookkeeping in one
//! short transaction and returns immediately; the pipeline itself runs on a
//! spawned task.
//!
//! # Registration (one transaction)
//!
//! 1. Claim the durable guard (first statement, so SQLite takes the write
//!    lock before anything is read).
//! 2. Move the environment to INDEXING with the new version's names.
//! 3. Insert the IN_PROGRESS history row and the RUNNING task.
//!
//! # Stages
//!
//! | Stage | Progress |
//! |-------|----------|
//! | remove stale indices (staging) | 0% |
//! | snapshot dictionaries | 10% |
//! | create synonym set + indices | 20% |
//! | load documents | configured band, default 30–90% |
//! | push dictionaries, reload analyzers | 95% |
//! | cut over aliases (production), activate | 100% |
//!
//! Any failure, including a panic in the pipeline, fails the task, the
//! environment and the history row, and deletes the new physical resources
//! unless the aliases already point at them. The guard is always released.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;

use index_release_core::models::{BuildTask, DeploymentType, EnvironmentType, IndexNames};

use crate::builder::CleanupOutcome;
use crate::context::ReleaseContext;
use crate::environment::EnvironmentStore;
use crate::error::{ReleaseError, Result};
use crate::guard::{IndexingGuard, LocalPermit};
use crate::history::{HistoryStore, NewHistory};
use crate::progress::{ProgressSink, TaskProgressSink};
use crate::task::TaskStore;

const INTERRUPTED: &str = "interrupted: process stopped before the operation finished";

/// What a finished build produced. Stored as the task's result payload.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub environment: EnvironmentType,
    pub version: String,
    pub document_count: u64,
    pub names: IndexNames,
    /// True when the build moved the live aliases (production builds).
    pub cut_over: bool,
    pub cleanup: CleanupOutcome,
}

/// Returned by [`IndexingOrchestrator::start_build`].
#[derive(Debug)]
pub struct BuildHandle {
    pub task_id: String,
    pub version: String,
    pub history_id: i64,
    pub environment: EnvironmentType,
    join: JoinHandle<Result<BuildSummary>>,
}

impl BuildHandle {
    /// Wait for the pipeline to finish.
    pub async fn wait(self) -> Result<BuildSummary> {
        self.join
            .await
            .map_err(|e| ReleaseError::Internal(anyhow::anyhow!("build supervisor failed: {}", e)))?
    }
}

/// Crash-recovery result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub tasks_failed: u64,
    pub history_failed: u64,
    pub environments_failed: u64,
    pub released_holder: Option<String>,
}

#[derive(Debug, Clone)]
struct BuildJob {
    task_id: String,
    history_id: i64,
    environment: EnvironmentType,
    version: String,
    names: IndexNames,
    previous: Option<IndexNames>,
}

#[derive(Clone)]
pub struct IndexingOrchestrator {
    ctx: ReleaseContext,
}

impl IndexingOrchestrator {
    pub fn new(ctx: ReleaseContext) -> Self {
        Self { ctx }
    }

    /// Register a build and spawn its pipeline.
    ///
    /// Fails with [`ReleaseError::ConcurrentBuild`] while any build or
    /// promotion holds the guard, in this process or another.
    pub async fn start_build(
        &self,
        environment: EnvironmentType,
        description: Option<String>,
    ) -> Result<BuildHandle> {
        let permit = self.ctx.guard.enter_local()?;
        let job = self.register(environment, description).await?;

        tracing::info!(
            task_id = %job.task_id,
            environment = %job.environment,
            version = %job.version,
            "build registered"
        );

        let handle = BuildHandle {
            task_id: job.task_id.clone(),
            version: job.version.clone(),
            history_id: job.history_id,
            environment,
            join: tokio::spawn(supervise(self.ctx.clone(), job, permit)),
        };
        Ok(handle)
    }

    async fn register(
        &self,
        environment: EnvironmentType,
        description: Option<String>,
    ) -> Result<BuildJob> {
        let version = self.ctx.versions.next_version();
        let names = self.ctx.builder.index_names(&version);
        let task_id = uuid::Uuid::new_v4().to_string();

        let mut tx = self.ctx.pool.begin().await?;
        IndexingGuard::acquire_in(&mut tx, &task_id, "build", Some(environment)).await?;
        let previous = EnvironmentStore::load_in(&mut tx, environment)
            .await?
            .index_names();
        EnvironmentStore::prepare_in(&mut tx, environment, &names, &version).await?;
        let history_id = HistoryStore::begin_in(
            &mut tx,
            &NewHistory {
                deployment_type: DeploymentType::Indexing,
                environment_type: Some(environment),
                version: Some(version.clone()),
                description,
            },
        )
        .await?;
        TaskStore::create_in(&mut tx, &task_id, environment, &version, "queued").await?;
        tx.commit().await?;

        Ok(BuildJob {
            task_id,
            history_id,
            environment,
            version,
            names,
            previous,
        })
    }

    pub async fn build_status(&self, task_id: &str) -> Result<BuildTask> {
        self.ctx.tasks.get(task_id).await
    }

    /// Fail whatever a dead process left running and release the guard.
    ///
    /// Refuses while this process itself runs a guarded operation.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        if self.ctx.guard.is_held_locally() {
            return Err(ReleaseError::validation(
                "an operation is running in this process; recovery would corrupt it",
            ));
        }
        let report = RecoveryReport {
            tasks_failed: self.ctx.tasks.fail_running(INTERRUPTED).await?,
            history_failed: self.ctx.history.fail_all_in_progress(INTERRUPTED).await?,
            environments_failed: self.ctx.environments.fail_all_building().await?,
            released_holder: self.ctx.guard.force_release().await?,
        };
        tracing::warn!(
            tasks = report.tasks_failed,
            history = report.history_failed,
            environments = report.environments_failed,
            holder = ?report.released_holder,
            "recovered interrupted operations"
        );
        Ok(report)
    }
}

/// Run the pipeline on its own task so a panic surfaces as a `JoinError`,
/// then record the outcome.
async fn supervise(ctx: ReleaseContext, job: BuildJob, permit: LocalPermit) -> Result<BuildSummary> {
    let sink = Arc::new(TaskProgressSink::new(
        ctx.tasks.clone(),
        ctx.environments.clone(),
        job.task_id.clone(),
        job.environment,
        job.version.clone(),
        ctx.settings.band,
    ));
    let cut_over = Arc::new(AtomicBool::new(false));

    let pipeline = tokio::spawn({
        let ctx = ctx.clone();
        let job = job.clone();
        let sink = Arc::clone(&sink);
        let cut_over = Arc::clone(&cut_over);
        async move { run_pipeline(&ctx, &job, sink.as_ref(), &cut_over).await }
    });

    let result = match pipeline.await {
        Ok(result) => result,
        Err(e) => Err(ReleaseError::Stage {
            stage: "pipeline",
            message: if e.is_panic() {
                "pipeline panicked".to_string()
            } else {
                format!("pipeline aborted: {}", e)
            },
        }),
    };

    match &result {
        Ok(summary) => record_success(&ctx, &job, summary).await,
        Err(e) => record_failure(&ctx, &job, e, cut_over.load(Ordering::Acquire)).await,
    }

    match ctx.guard.release(&job.task_id).await {
        Ok(true) => {}
        Ok(false) => tracing::warn!(task_id = %job.task_id, "guard was no longer held by this build"),
        Err(e) => tracing::error!(task_id = %job.task_id, error = %e, "failed to release indexing guard"),
    }
    drop(permit);
    result
}

async fn run_pipeline(
    ctx: &ReleaseContext,
    job: &BuildJob,
    sink: &dyn ProgressSink,
    cut_over: &AtomicBool,
) -> Result<BuildSummary> {
    let env = job.environment;
    let mut cleanup = CleanupOutcome::default();

    // Stale names from a previous staging build. Production's previous
    // names are live until the cutover and are handled after it.
    sink.stage(0, "removing stale indices").await;
    if env == EnvironmentType::Staging {
        if let Some(previous) = &job.previous {
            cleanup.merge(remove_unprotected(ctx, env, previous, Some(&job.names)).await);
        }
    }

    sink.stage(10, "snapshotting dictionaries").await;
    let snapshot = ctx
        .snapshotter
        .snapshot(env, &job.version)
        .await
        .map_err(|e| in_stage("snapshot_dictionaries", e))?;

    sink.stage(20, "creating indices").await;
    let synonym_set = job.names.synonym_set.as_deref();
    if let Some(set) = synonym_set {
        ctx.builder
            .create_synonym_set(set, &snapshot.synonym_rules())
            .await
            .map_err(|e| in_stage("create_indices", e))?;
    }
    let names = ctx
        .builder
        .create_physical_indices(&job.version, synonym_set)
        .await
        .map_err(|e| in_stage("create_indices", e))?;

    let document_count = ctx
        .builder
        .load_documents(&names, sink)
        .await
        .map_err(|e| in_stage("load_documents", e))?;

    sink.stage(95, "deploying dictionaries").await;
    let artifacts = snapshot.artifacts(&ctx.settings.dictionary_target_path, &job.version);
    let outcome = ctx
        .channel
        .push(&artifacts)
        .await
        .map_err(|e| stage_error("deploy_dictionaries", e))?;
    if !outcome.success {
        return Err(stage_error("deploy_dictionaries", outcome.output));
    }
    ctx.builder
        .reload_analyzers(&names)
        .await
        .map_err(|e| in_stage("deploy_dictionaries", e))?;

    let mut moved = false;
    if env == EnvironmentType::Production {
        sink.stage(98, "switching aliases").await;
        let targets = ctx.alias_targets(&names.primary, &names.autocomplete);
        let repoint = match ctx.aliases.repoint_all(&targets).await {
            Ok(repoint) => repoint,
            Err(e) => {
                if aliases_reached(ctx, &names).await {
                    cut_over.store(true, Ordering::Release);
                }
                return Err(e);
            }
        };
        cut_over.store(true, Ordering::Release);
        moved = true;

        let mut stale_indices: Vec<String> = repoint.removed_indices();
        let mut stale_sets: Vec<String> = stale_indices
            .iter()
            .filter_map(|index| ctx.builder.synonym_set_for(index))
            .collect();
        if let Some(previous) = &job.previous {
            stale_indices.extend(previous.indices().into_iter().map(str::to_string));
            stale_sets.extend(previous.synonym_set.clone());
        }
        stale_indices.sort();
        stale_indices.dedup();
        stale_sets.sort();
        stale_sets.dedup();
        match ctx.protected_names(Some(env)).await {
            Ok(protected) => {
                let keep = |name: &str| protected.contains(name) || names.contains(name);
                stale_indices.retain(|i| !keep(i.as_str()));
                stale_sets.retain(|s| !keep(s.as_str()));
                cleanup.merge(ctx.builder.delete_resources(&stale_indices, &stale_sets).await);
            }
            Err(e) => {
                tracing::warn!(environment = %env, error = %e, "skipping superseded index cleanup");
            }
        }
    }

    sink.stage(100, "finalizing").await;
    ctx.environments
        .activate(env, &job.version, document_count)
        .await
        .map_err(|e| in_stage("finalize", e))?;
    cleanup.log("build");

    Ok(BuildSummary {
        environment: env,
        version: job.version.clone(),
        document_count,
        names,
        cut_over: moved,
        cleanup,
    })
}

/// After a failed alias call, whether the engine applied it anyway. An
/// unreadable alias counts as applied so the new indices are kept.
async fn aliases_reached(ctx: &ReleaseContext, names: &IndexNames) -> bool {
    match ctx.engine.alias_targets(&ctx.settings.primary_alias).await {
        Ok(targets) => targets.iter().any(|t| t == &names.primary),
        Err(e) => {
            tracing::warn!(index = %names.primary, error = %e, "cannot read alias after failed switch");
            true
        }
    }
}

/// Delete `doomed` except anything another environment or a live alias
/// still needs, and anything in `current`. If the protection set cannot be
/// computed nothing is deleted.
async fn remove_unprotected(
    ctx: &ReleaseContext,
    env: EnvironmentType,
    doomed: &IndexNames,
    current: Option<&IndexNames>,
) -> CleanupOutcome {
    let protected: HashSet<String> = match ctx.protected_names(Some(env)).await {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(environment = %env, error = %e, "skipping index cleanup");
            return CleanupOutcome::default();
        }
    };
    let keep = |name: &str| protected.contains(name) || current.is_some_and(|c| c.contains(name));
    let indices: Vec<String> = doomed
        .indices()
        .into_iter()
        .filter(|n| !keep(*n))
        .map(str::to_string)
        .collect();
    let sets: Vec<String> = doomed
        .synonym_set
        .iter()
        .filter(|n| !keep(n.as_str()))
        .cloned()
        .collect();
    ctx.builder.delete_resources(&indices, &sets).await
}

async fn record_success(ctx: &ReleaseContext, job: &BuildJob, summary: &BuildSummary) {
    let details = serde_json::to_value(summary).unwrap_or_default();
    if let Err(e) = ctx
        .history
        .succeed(job.history_id, summary.document_count, Some(details.clone()))
        .await
    {
        tracing::error!(history_id = job.history_id, error = %e, "failed to record build success");
    }
    if let Err(e) = ctx.tasks.complete(&job.task_id, &details).await {
        tracing::error!(task_id = %job.task_id, error = %e, "failed to complete task");
    }
    tracing::info!(
        task_id = %job.task_id,
        environment = %job.environment,
        version = %job.version,
        documents = summary.document_count,
        "build succeeded"
    );
}

async fn record_failure(ctx: &ReleaseContext, job: &BuildJob, error: &ReleaseError, cut_over: bool) {
    let message = error.to_string();
    tracing::error!(
        task_id = %job.task_id,
        environment = %job.environment,
        version = %job.version,
        error = %message,
        "build failed"
    );

    if let Err(e) = ctx.tasks.fail(&job.task_id, &message).await {
        tracing::error!(task_id = %job.task_id, error = %e, "failed to mark task failed");
    }
    match ctx.environments.fail_indexing(job.environment, &job.version).await {
        Ok(true) => {}
        Ok(false) => tracing::warn!(environment = %job.environment, "environment had already left the build state"),
        Err(e) => tracing::error!(environment = %job.environment, error = %e, "failed to mark environment failed"),
    }
    if let Err(e) = ctx.history.fail(job.history_id, &message).await {
        tracing::error!(history_id = job.history_id, error = %e, "failed to record build failure");
    }

    if cut_over {
        tracing::warn!(
            version = %job.version,
            "aliases already point at the new indices; leaving them in place"
        );
    } else {
        remove_unprotected(ctx, job.environment, &job.names, None)
            .await
            .log("failed build");
    }
}

/// Tag an error with the stage it happened in. Errors that already carry a
/// stage, and alias failures, pass through.
fn in_stage(stage: &'static str, error: ReleaseError) -> ReleaseError {
    match error {
        e @ (ReleaseError::Stage { .. } | ReleaseError::AliasUpdate(_)) => e,
        other => ReleaseError::Stage {
            stage,
            message: other.to_string(),
        },
    }
}

fn stage_error(stage: &'static str, message: impl std::fmt::Display) -> ReleaseError {
    ReleaseError::Stage {
        stage,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_stage_keeps_existing_stage() {
        let original = ReleaseError::Stage {
            stage: "load_documents",
            message: "bulk rejected".into(),
        };
        match in_stage("finalize", original) {
            ReleaseError::Stage { stage, .. } => assert_eq!(stage, "load_documents"),
            other => panic!("unexpected: {other}"),
        }
        match in_stage("finalize", ReleaseError::Transport("down".into())) {
            ReleaseError::Stage { stage, message } => {
                assert_eq!(stage, "finalize");
                assert!(message.contains("down"));
            }
            other => panic!("unexpected: {other}"),
        }
    }
}
