mod common;

use common::{Harness, AUTOCOMPLETE_ALIAS, PRIMARY_ALIAS};

use index_release::error::ReleaseError;
use index_release::history::{HistoryFilter, Page};
use index_release::indexing::BuildSummary;
use index_release_core::catalog::InMemoryCatalog;
use index_release_core::engine::memory::EngineOp;
use index_release_core::models::{
    DeploymentStatus, DeploymentType, DictionaryKind, EnvironmentType, IndexStatus,
};

async fn build(h: &Harness, env: EnvironmentType) -> BuildSummary {
    h.service
        .start_build(env, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap()
}

async fn deployments(h: &Harness) -> Vec<index_release_core::models::DeploymentHistory> {
    let filter = HistoryFilter {
        deployment_type: Some(DeploymentType::Deployment),
        ..Default::default()
    };
    h.service
        .list_history(&filter, Page::default())
        .await
        .unwrap()
        .items
}

#[tokio::test]
async fn promotion_swaps_staging_into_production() {
    let h = Harness::new(InMemoryCatalog::generated(500)).await;
    h.service
        .add_dictionary_entry(DictionaryKind::Stopword, "the")
        .await
        .unwrap();
    let v0 = build(&h, EnvironmentType::Production).await;
    let v1 = build(&h, EnvironmentType::Staging).await;

    let outcome = h.service.promote(Some("release".into())).await.unwrap();
    assert_eq!(outcome.version, v1.version);
    assert_eq!(outcome.document_count, 500);
    assert_eq!(outcome.production, v1.names);
    assert!(outcome.removed_alias_targets.contains(&v0.names.primary));

    let ctx = h.service.context();
    let production = ctx.environments.get(EnvironmentType::Production).await.unwrap();
    assert_eq!(production.index_status, IndexStatus::Active);
    assert_eq!(production.primary_index_name.as_deref(), Some(v1.names.primary.as_str()));
    assert_eq!(
        production.autocomplete_index_name.as_deref(),
        Some(v1.names.autocomplete.as_str())
    );
    assert_eq!(production.version.as_deref(), Some(v1.version.as_str()));
    assert_eq!(production.document_count, 500);

    let staging = ctx.environments.get(EnvironmentType::Staging).await.unwrap();
    assert_eq!(staging.index_status, IndexStatus::Inactive);
    assert!(staging.primary_index_name.is_none());
    assert!(staging.autocomplete_index_name.is_none());
    assert!(staging.version.is_none());

    assert_eq!(h.engine.resolve_alias(PRIMARY_ALIAS), vec![v1.names.primary.clone()]);
    assert_eq!(
        h.engine.resolve_alias(AUTOCOMPLETE_ALIAS),
        vec![v1.names.autocomplete.clone()]
    );
    assert!(!h.engine.has_index(&v0.names.primary));
    assert!(!h.engine.has_index(&v0.names.autocomplete));
    assert!(!h.engine.has_synonym_set(v0.names.synonym_set.as_deref().unwrap()));
    assert!(outcome.cleanup.is_clean());

    // The dictionary snapshot the index was built with follows it.
    let snapshot = ctx.snapshotter.load(EnvironmentType::Production).await.unwrap();
    assert_eq!(snapshot.version.as_deref(), Some(v1.version.as_str()));
    assert_eq!(snapshot.stopwords, vec!["the".to_string()]);
    assert!(ctx.snapshotter.load(EnvironmentType::Staging).await.unwrap().is_empty());

    let rows = deployments(&h).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, DeploymentStatus::Success);
    assert_eq!(rows[0].document_count, 500);
    assert_eq!(rows[0].environment_type, Some(EnvironmentType::Production));
    assert!(h.service.guard_status().await.unwrap().is_none());
}

#[tokio::test]
async fn first_promotion_creates_the_aliases() {
    let h = Harness::new(InMemoryCatalog::generated(3)).await;
    let v1 = build(&h, EnvironmentType::Staging).await;

    let outcome = h.service.promote(None).await.unwrap();
    assert!(outcome.removed_alias_targets.is_empty());
    assert_eq!(h.engine.resolve_alias(PRIMARY_ALIAS), vec![v1.names.primary.clone()]);
    assert!(h.engine.has_index(&v1.names.primary));
}

#[tokio::test]
async fn promotion_requires_an_active_staging_index() {
    let h = Harness::new(InMemoryCatalog::generated(3)).await;
    let before = h.service.list_environments().await.unwrap();

    let err = h.service.promote(None).await.unwrap_err();
    assert!(matches!(err, ReleaseError::Validation(_)));

    let all = h
        .service
        .list_history(&HistoryFilter::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(all.total, 0);
    assert_eq!(h.service.list_environments().await.unwrap(), before);
    assert!(h.service.guard_status().await.unwrap().is_none());

    // A failed staging build is not promotable either.
    h.engine.fail_on(EngineOp::BulkWrite);
    assert!(h
        .service
        .start_build(EnvironmentType::Staging, None)
        .await
        .unwrap()
        .wait()
        .await
        .is_err());
    let err = h.service.promote(None).await.unwrap_err();
    assert!(err.is_validation());
    assert!(deployments(&h).await.is_empty());
}

#[tokio::test]
async fn promotion_is_rejected_while_a_build_runs() {
    let h = Harness::new(InMemoryCatalog::generated(3)).await;
    build(&h, EnvironmentType::Staging).await;

    let running = h
        .service
        .start_build(EnvironmentType::Production, None)
        .await
        .unwrap();
    let err = h.service.promote(None).await.unwrap_err();
    assert!(matches!(err, ReleaseError::ConcurrentBuild { .. }));
    running.wait().await.unwrap();
    assert!(deployments(&h).await.is_empty());
}

#[tokio::test]
async fn alias_fault_after_the_switch_still_leaves_one_target() {
    let h = Harness::new(InMemoryCatalog::generated(10)).await;
    let v0 = build(&h, EnvironmentType::Production).await;
    let v1 = build(&h, EnvironmentType::Staging).await;

    h.engine.fail_after(EngineOp::UpdateAliases);
    let err = h.service.promote(None).await.unwrap_err();
    assert!(matches!(err, ReleaseError::AliasUpdate(_)));

    // The engine applied the request atomically before reporting the error.
    assert_eq!(h.engine.resolve_alias(PRIMARY_ALIAS), vec![v1.names.primary.clone()]);
    let rows = deployments(&h).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, DeploymentStatus::Failed);
    assert!(h.service.guard_status().await.unwrap().is_none());

    // Nothing was adopted, so a retry completes the promotion.
    let production = h
        .service
        .context()
        .environments
        .get(EnvironmentType::Production)
        .await
        .unwrap();
    assert_eq!(production.version.as_deref(), Some(v0.version.as_str()));

    h.engine.clear_faults();
    let outcome = h.service.promote(None).await.unwrap();
    assert_eq!(outcome.version, v1.version);
    assert_eq!(h.engine.resolve_alias(PRIMARY_ALIAS), vec![v1.names.primary.clone()]);
    assert!(!h.engine.has_index(&v0.names.primary));

    let rows = deployments(&h).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].status, DeploymentStatus::Success);
}

#[tokio::test]
async fn alias_rejection_leaves_production_untouched() {
    let h = Harness::new(InMemoryCatalog::generated(10)).await;
    let v0 = build(&h, EnvironmentType::Production).await;
    build(&h, EnvironmentType::Staging).await;

    h.engine.fail_on(EngineOp::UpdateAliases);
    let err = h.service.promote(None).await.unwrap_err();
    assert_eq!(err.code(), "alias_update_failed");

    assert_eq!(h.engine.resolve_alias(PRIMARY_ALIAS), vec![v0.names.primary.clone()]);
    assert!(h.engine.has_index(&v0.names.primary));
    let staging = h
        .service
        .context()
        .environments
        .get(EnvironmentType::Staging)
        .await
        .unwrap();
    assert_eq!(staging.index_status, IndexStatus::Active);
}
