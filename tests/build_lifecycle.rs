mod common;

use common::{Harness, RecordingChannel, AUTOCOMPLETE_ALIAS, PRIMARY_ALIAS};

use index_release::error::ReleaseError;
use index_release::history::{HistoryFilter, Page};
use index_release_core::catalog::InMemoryCatalog;
use index_release_core::engine::memory::EngineOp;
use index_release_core::models::{
    DeploymentStatus, DeploymentType, DictionaryKind, EnvironmentType, IndexStatus, TaskStatus,
};

async fn indexing_history(h: &Harness) -> Vec<index_release_core::models::DeploymentHistory> {
    let filter = HistoryFilter {
        deployment_type: Some(DeploymentType::Indexing),
        ..Default::default()
    };
    h.service
        .list_history(&filter, Page::default())
        .await
        .unwrap()
        .items
}

#[tokio::test]
async fn empty_catalog_build_activates_staging() {
    let h = Harness::new(InMemoryCatalog::default()).await;

    let handle = h
        .service
        .start_build(EnvironmentType::Staging, Some("first".into()))
        .await
        .unwrap();
    assert_eq!(handle.version, "v20240101120000");
    let task_id = handle.task_id.clone();
    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.document_count, 0);
    assert!(!summary.cut_over);

    let staging = h
        .service
        .list_environments()
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.environment_type == EnvironmentType::Staging)
        .unwrap();
    assert_eq!(staging.index_status, IndexStatus::Active);
    assert_eq!(staging.version.as_deref(), Some("v20240101120000"));
    assert_eq!(staging.document_count, 0);
    assert_eq!(
        staging.primary_index_name.as_deref(),
        Some("products-idx-v20240101120000")
    );
    assert_eq!(
        staging.autocomplete_index_name.as_deref(),
        Some("products-ac-v20240101120000")
    );

    let history = indexing_history(&h).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, DeploymentStatus::Success);
    assert_eq!(history[0].version.as_deref(), Some("v20240101120000"));
    assert_eq!(history[0].description.as_deref(), Some("first"));

    let task = h.service.build_status(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress_percent, 100);

    // Staging builds never touch the live aliases.
    assert!(h.engine.resolve_alias(PRIMARY_ALIAS).is_empty());
    assert!(h.service.guard_status().await.unwrap().is_none());
}

#[tokio::test]
async fn build_loads_every_record_into_both_indices() {
    let h = Harness::new(InMemoryCatalog::generated(250)).await;
    h.service
        .add_dictionary_entry(DictionaryKind::Synonym, "tv, television")
        .await
        .unwrap();
    h.service
        .add_dictionary_entry(DictionaryKind::UserWord, "smartwatch")
        .await
        .unwrap();

    let summary = h
        .service
        .start_build(EnvironmentType::Staging, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(summary.document_count, 250);
    assert_eq!(h.engine.documents(&summary.names.primary).len(), 250);
    assert_eq!(h.engine.documents(&summary.names.autocomplete).len(), 250);
    for index in summary.names.indices() {
        assert_eq!(h.engine.refresh_enabled(index), Some(true));
    }

    let set = summary.names.synonym_set.clone().unwrap();
    let rules = h.engine.synonym_rules(&set).unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].synonyms, "tv, television");

    let pushes = h.channel.pushes.lock().unwrap().clone();
    assert_eq!(pushes.len(), 1);
    assert_eq!(
        pushes[0][0].path,
        format!("analysis/{}/user_dictionary.txt", summary.version)
    );
    assert_eq!(pushes[0][0].content, "smartwatch\n");
    assert!(h
        .engine
        .analyzer_reloads()
        .contains(&summary.names.primary));

    let staging = h.service.context().environments.get(EnvironmentType::Staging).await.unwrap();
    assert_eq!(staging.document_count, 250);
    assert_eq!(staging.indexed_document_count, 250);
}

#[tokio::test]
async fn second_build_is_rejected_while_one_runs() {
    let h = Harness::new(InMemoryCatalog::generated(20)).await;

    let first = h
        .service
        .start_build(EnvironmentType::Staging, None)
        .await
        .unwrap();

    // Same process.
    let err = h
        .service
        .start_build(EnvironmentType::Production, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ReleaseError::ConcurrentBuild { .. }));
    assert!(err.is_validation());

    // Another process sharing the database.
    let other = h.second_process(InMemoryCatalog::generated(20));
    let err = other
        .start_build(EnvironmentType::Staging, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ReleaseError::ConcurrentBuild { ref holder } if holder == &first.task_id));

    first.wait().await.unwrap();
    assert_eq!(indexing_history(&h).await.len(), 1);

    // Guard released: the next build goes through.
    h.service
        .start_build(EnvironmentType::Staging, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
}

async fn assert_failed_build(h: &Harness, expected_stage: &str) {
    let handle = h
        .service
        .start_build(EnvironmentType::Staging, None)
        .await
        .unwrap();
    let names = h
        .service
        .context()
        .builder
        .index_names(&handle.version);
    let task_id = handle.task_id.clone();

    match handle.wait().await {
        Err(ReleaseError::Stage { stage, .. }) => assert_eq!(stage, expected_stage),
        other => panic!("expected {} failure, got {:?}", expected_stage, other.map(|s| s.version)),
    }

    let staging = h.service.context().environments.get(EnvironmentType::Staging).await.unwrap();
    assert!(matches!(
        staging.index_status,
        IndexStatus::Failed | IndexStatus::Inactive
    ));
    assert!(staging.primary_index_name.is_none());

    let history = indexing_history(h).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, DeploymentStatus::Failed);
    assert!(history[0].error_message.as_deref().unwrap().contains(expected_stage));

    let task = h.service.build_status(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    assert!(!h.engine.has_index(&names.primary));
    assert!(!h.engine.has_index(&names.autocomplete));
    assert!(!h.engine.has_synonym_set(names.synonym_set.as_deref().unwrap()));
    assert!(h.service.guard_status().await.unwrap().is_none());
}

#[tokio::test]
async fn failure_at_any_stage_leaves_one_failed_row() {
    let cases = [
        (EngineOp::PutSynonymSet, "create_indices"),
        (EngineOp::CreateIndex, "create_indices"),
        (EngineOp::BulkWrite, "load_documents"),
        (EngineOp::ReloadAnalyzers, "deploy_dictionaries"),
    ];
    for (op, stage) in cases {
        let h = Harness::new(InMemoryCatalog::generated(30)).await;
        h.engine.fail_on(op);
        assert_failed_build(&h, stage).await;
    }
}

#[tokio::test]
async fn catalog_read_failure_fails_the_load() {
    let h = Harness::new(InMemoryCatalog::generated(300).failing_from(100)).await;
    assert_failed_build(&h, "load_documents").await;
}

#[tokio::test]
async fn rejected_dictionary_push_fails_the_build() {
    let channel = RecordingChannel {
        reject: true,
        ..Default::default()
    };
    let h = Harness::with_channel(InMemoryCatalog::generated(5), channel).await;
    assert_failed_build(&h, "deploy_dictionaries").await;
}

#[tokio::test]
async fn failed_environment_can_be_rebuilt() {
    let h = Harness::new(InMemoryCatalog::generated(5)).await;
    h.engine.fail_on(EngineOp::BulkWrite);
    assert_failed_build(&h, "load_documents").await;

    h.engine.clear_faults();
    let summary = h
        .service
        .start_build(EnvironmentType::Staging, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(summary.document_count, 5);
    let staging = h.service.context().environments.get(EnvironmentType::Staging).await.unwrap();
    assert_eq!(staging.index_status, IndexStatus::Active);
}

#[tokio::test]
async fn rebuilding_staging_removes_its_previous_indices() {
    let h = Harness::new(InMemoryCatalog::generated(3)).await;
    let first = h
        .service
        .start_build(EnvironmentType::Staging, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let second = h
        .service
        .start_build(EnvironmentType::Staging, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_ne!(first.version, second.version);
    assert!(!h.engine.has_index(&first.names.primary));
    assert!(!h.engine.has_synonym_set(first.names.synonym_set.as_deref().unwrap()));
    assert!(h.engine.has_index(&second.names.primary));
    assert!(second.cleanup.deleted.contains(&first.names.primary));
}

#[tokio::test]
async fn production_build_moves_the_aliases() {
    let h = Harness::new(InMemoryCatalog::generated(4)).await;

    let v1 = h
        .service
        .start_build(EnvironmentType::Production, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(v1.cut_over);
    assert_eq!(h.engine.resolve_alias(PRIMARY_ALIAS), vec![v1.names.primary.clone()]);
    assert_eq!(
        h.engine.resolve_alias(AUTOCOMPLETE_ALIAS),
        vec![v1.names.autocomplete.clone()]
    );

    let v2 = h
        .service
        .start_build(EnvironmentType::Production, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(h.engine.resolve_alias(PRIMARY_ALIAS), vec![v2.names.primary.clone()]);
    assert!(!h.engine.has_index(&v1.names.primary));
    assert!(!h.engine.has_index(&v1.names.autocomplete));

    // Every observed alias state had exactly one target.
    for table in h.engine.alias_observations() {
        assert_eq!(table.get(PRIMARY_ALIAS).map(Vec::len), Some(1));
    }
}

#[tokio::test]
async fn staging_build_keeps_indices_production_serves() {
    let h = Harness::new(InMemoryCatalog::generated(2)).await;
    let prod = h
        .service
        .start_build(EnvironmentType::Production, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    h.service
        .start_build(EnvironmentType::Staging, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(h.engine.has_index(&prod.names.primary));
    assert_eq!(h.engine.resolve_alias(PRIMARY_ALIAS), vec![prod.names.primary]);
}

#[tokio::test]
async fn reset_returns_staging_to_inactive_but_not_live_production() {
    let h = Harness::new(InMemoryCatalog::generated(2)).await;
    for env in [EnvironmentType::Staging, EnvironmentType::Production] {
        h.service
            .start_build(env, None)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
    }

    let staging = h
        .service
        .reset_environment(EnvironmentType::Staging)
        .await
        .unwrap();
    assert_eq!(staging.index_status, IndexStatus::Inactive);
    assert!(staging.version.is_none());

    let err = h
        .service
        .reset_environment(EnvironmentType::Production)
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn snapshot_failure_fails_the_build() {
    let h = Harness::new(InMemoryCatalog::generated(5)).await;
    sqlx::query("DROP TABLE dictionary_snapshots")
        .execute(&h.pool)
        .await
        .unwrap();
    assert_failed_build(&h, "snapshot_dictionaries").await;
}

/// Make every INDEXING → ACTIVE transition fail inside SQLite.
async fn block_activation(h: &Harness) {
    sqlx::query(
        r#"
        CREATE TRIGGER block_activation BEFORE UPDATE ON index_environments
        WHEN NEW.index_status = 'ACTIVE' AND OLD.index_status = 'INDEXING'
        BEGIN SELECT RAISE(ABORT, 'activation blocked'); END
        "#,
    )
    .execute(&h.pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn finalize_failure_fails_the_build() {
    let h = Harness::new(InMemoryCatalog::generated(5)).await;
    block_activation(&h).await;
    assert_failed_build(&h, "finalize").await;
}

async fn indexing_statuses_for(h: &Harness, version: &str) -> Vec<DeploymentStatus> {
    indexing_history(h)
        .await
        .into_iter()
        .filter(|row| row.version.as_deref() == Some(version))
        .map(|row| row.status)
        .collect()
}

/// Both aliases resolve to exactly one index, and that index exists.
fn assert_aliases_serve(h: &Harness, primary: &str, autocomplete: &str) {
    for (alias, expected) in [(PRIMARY_ALIAS, primary), (AUTOCOMPLETE_ALIAS, autocomplete)] {
        let live = h.engine.resolve_alias(alias);
        assert_eq!(live, vec![expected.to_string()], "alias {}", alias);
        assert!(h.engine.has_index(&live[0]), "{} points at a missing index", alias);
    }
}

async fn assert_production_failed(h: &Harness) {
    let production = h
        .service
        .context()
        .environments
        .get(EnvironmentType::Production)
        .await
        .unwrap();
    assert_eq!(production.index_status, IndexStatus::Failed);
    assert!(h.service.guard_status().await.unwrap().is_none());
}

#[tokio::test]
async fn rejected_alias_switch_keeps_serving_the_old_production_index() {
    let h = Harness::new(InMemoryCatalog::generated(4)).await;
    let v0 = h
        .service
        .start_build(EnvironmentType::Production, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    h.engine.fail_on(EngineOp::UpdateAliases);
    let handle = h
        .service
        .start_build(EnvironmentType::Production, None)
        .await
        .unwrap();
    let v1 = h.service.context().builder.index_names(&handle.version);
    let version = handle.version.clone();
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, ReleaseError::AliasUpdate(_)));

    assert_aliases_serve(&h, &v0.names.primary, &v0.names.autocomplete);
    assert!(h.engine.has_synonym_set(v0.names.synonym_set.as_deref().unwrap()));
    assert!(!h.engine.has_index(&v1.primary));
    assert!(!h.engine.has_index(&v1.autocomplete));
    assert!(!h.engine.has_synonym_set(v1.synonym_set.as_deref().unwrap()));
    assert_eq!(
        indexing_statuses_for(&h, &version).await,
        vec![DeploymentStatus::Failed]
    );
    assert_production_failed(&h).await;
}

#[tokio::test]
async fn alias_fault_after_the_switch_keeps_the_new_indices_live() {
    let h = Harness::new(InMemoryCatalog::generated(4)).await;
    let v0 = h
        .service
        .start_build(EnvironmentType::Production, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    h.engine.fail_after(EngineOp::UpdateAliases);
    let handle = h
        .service
        .start_build(EnvironmentType::Production, None)
        .await
        .unwrap();
    let v1 = h.service.context().builder.index_names(&handle.version);
    let version = handle.version.clone();
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, ReleaseError::AliasUpdate(_)));

    assert_aliases_serve(&h, &v1.primary, &v1.autocomplete);
    assert!(h.engine.has_synonym_set(v1.synonym_set.as_deref().unwrap()));
    assert_eq!(
        indexing_statuses_for(&h, &version).await,
        vec![DeploymentStatus::Failed]
    );
    assert_production_failed(&h).await;

    // The superseded indices are left for the orphan sweep.
    let orphans = h.service.find_orphans().await.unwrap();
    assert!(orphans.orphan_indices.contains(&v0.names.primary));
    assert!(!orphans.orphan_indices.contains(&v1.primary));
    assert!(!orphans
        .orphan_synonym_sets
        .contains(v1.synonym_set.as_ref().unwrap()));

    // The next production build replaces what the aliases serve.
    h.engine.clear_faults();
    let v2 = h
        .service
        .start_build(EnvironmentType::Production, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_aliases_serve(&h, &v2.names.primary, &v2.names.autocomplete);
    assert!(!h.engine.has_index(&v1.primary));
    assert!(!h.engine.has_synonym_set(v1.synonym_set.as_deref().unwrap()));
}

#[tokio::test]
async fn finalize_failure_after_the_switch_keeps_the_new_indices_live() {
    let h = Harness::new(InMemoryCatalog::generated(4)).await;
    h.service
        .start_build(EnvironmentType::Production, None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    block_activation(&h).await;
    let handle = h
        .service
        .start_build(EnvironmentType::Production, None)
        .await
        .unwrap();
    let v1 = h.service.context().builder.index_names(&handle.version);
    let version = handle.version.clone();
    match handle.wait().await {
        Err(ReleaseError::Stage { stage, .. }) => assert_eq!(stage, "finalize"),
        other => panic!("expected finalize failure, got {:?}", other.map(|s| s.version)),
    }

    assert_aliases_serve(&h, &v1.primary, &v1.autocomplete);
    assert_eq!(
        indexing_statuses_for(&h, &version).await,
        vec![DeploymentStatus::Failed]
    );
    assert_production_failed(&h).await;
}
