//! Physical index construction and bulk loading.
//!
//! Each build version gets its own primary index, autocomplete index and
//! synonym set, named `<prefix>-<version>`. The builder never touches
//! aliases; it only creates, fills and deletes physical resources.
//!
//! # Loading
//!
//! The catalog is paged with the configured batch size. Every page becomes
//! one spawned batch task that embeds (through a per-build
//! [`EmbeddingCache`]), converts and bulk-writes its records. A semaphore
//! caps batches in flight; the caller's task collects results in completion
//! order and reports running totals to the [`ProgressSink`]. Refresh is off
//! for the whole load and is re-enabled, followed by an explicit refresh,
//! only after every batch has succeeded.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use index_release_core::catalog::CatalogSource;
use index_release_core::engine::{
    BulkDocument, EngineError, IndexDefinition, SearchEngine, SynonymRule,
};
use index_release_core::models::{CatalogRecord, IndexNames};

use crate::config::Config;
use crate::embedding::{EmbeddingCache, EmbeddingProvider};
use crate::error::{ReleaseError, Result, StageExt};
use crate::progress::ProgressSink;

/// Which record text is embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedField {
    Name,
    NameDescription,
}

impl EmbedField {
    pub fn parse(s: &str) -> Self {
        match s {
            "name_description" => EmbedField::NameDescription,
            _ => EmbedField::Name,
        }
    }

    pub fn text(&self, record: &CatalogRecord) -> String {
        match (self, &record.description) {
            (EmbedField::NameDescription, Some(desc)) if !desc.trim().is_empty() => {
                format!("{}\n{}", record.name, desc.trim())
            }
            _ => record.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub primary_prefix: String,
    pub autocomplete_prefix: String,
    pub synonym_prefix: String,
    pub batch_size: usize,
    pub max_in_flight: usize,
    pub embed_field: EmbedField,
    pub embedding_batch_size: usize,
}

impl BuildSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            primary_prefix: config.engine.primary_prefix.clone(),
            autocomplete_prefix: config.engine.autocomplete_prefix.clone(),
            synonym_prefix: config.engine.synonym_prefix.clone(),
            batch_size: config.indexing.batch_size,
            max_in_flight: config.indexing.max_in_flight,
            embed_field: EmbedField::parse(&config.indexing.embed_field),
            embedding_batch_size: config.embedding.batch_size,
        }
    }
}

/// Result of a best-effort deletion. Never escalated; callers log it.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CleanupOutcome {
    pub deleted: Vec<String>,
    /// `(name, reason)` for each resource that could not be deleted.
    pub failed: Vec<(String, String)>,
}

impl CleanupOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, other: CleanupOutcome) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }

    pub fn log(&self, context: &str) {
        if !self.deleted.is_empty() {
            tracing::info!(deleted = ?self.deleted, "{}: cleanup deleted resources", context);
        }
        for (name, reason) in &self.failed {
            tracing::warn!(resource = %name, reason = %reason, "{}: cleanup failed", context);
        }
    }
}

#[derive(Clone)]
pub struct IndexBuilder {
    engine: Arc<dyn SearchEngine>,
    catalog: Arc<dyn CatalogSource>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: BuildSettings,
}

impl IndexBuilder {
    pub fn new(
        engine: Arc<dyn SearchEngine>,
        catalog: Arc<dyn CatalogSource>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: BuildSettings,
    ) -> Self {
        Self {
            engine,
            catalog,
            embedder,
            settings,
        }
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Physical names for `version`.
    pub fn index_names(&self, version: &str) -> IndexNames {
        IndexNames {
            primary: format!("{}-{}", self.settings.primary_prefix, version),
            autocomplete: format!("{}-{}", self.settings.autocomplete_prefix, version),
            synonym_set: Some(format!("{}-{}", self.settings.synonym_prefix, version)),
        }
    }

    /// True if `name` was produced by this builder's naming scheme.
    pub fn is_managed_index(&self, name: &str) -> bool {
        name.starts_with(&format!("{}-", self.settings.primary_prefix))
            || name.starts_with(&format!("{}-", self.settings.autocomplete_prefix))
    }

    /// The synonym set a managed index was built with, derived from the
    /// version suffix both names share.
    pub fn synonym_set_for(&self, index: &str) -> Option<String> {
        let s = &self.settings;
        [&s.primary_prefix, &s.autocomplete_prefix]
            .into_iter()
            .find_map(|prefix| index.strip_prefix(prefix.as_str())?.strip_prefix('-'))
            .filter(|version| !version.is_empty())
            .map(|version| format!("{}-{}", s.synonym_prefix, version))
    }

    pub fn is_managed_synonym_set(&self, name: &str) -> bool {
        name.starts_with(&format!("{}-", self.settings.synonym_prefix))
    }

    pub async fn create_synonym_set(&self, name: &str, rules: &[SynonymRule]) -> Result<()> {
        self.engine
            .put_synonym_set(name, rules)
            .await
            .stage("create_indices")?;
        tracing::info!(synonym_set = %name, rules = rules.len(), "created synonym set");
        Ok(())
    }

    /// Create the primary and autocomplete indices for `version`.
    pub async fn create_physical_indices(
        &self,
        version: &str,
        synonym_set: Option<&str>,
    ) -> Result<IndexNames> {
        let mut names = self.index_names(version);
        names.synonym_set = synonym_set.map(str::to_string);

        let dims = if self.embedder.is_enabled() {
            self.embedder.dims()
        } else {
            0
        };
        self.engine
            .create_index(&names.primary, &primary_definition(synonym_set, dims))
            .await
            .stage("create_indices")?;
        self.engine
            .create_index(&names.autocomplete, &autocomplete_definition())
            .await
            .stage("create_indices")?;

        tracing::info!(primary = %names.primary, autocomplete = %names.autocomplete, "created physical indices");
        Ok(names)
    }

    /// Load every catalog record into `names`. Returns the document count.
    pub async fn load_documents(&self, names: &IndexNames, sink: &dyn ProgressSink) -> Result<u64> {
        let total = self.catalog.total().await.stage("load_documents")?;
        for index in names.indices() {
            self.engine
                .set_refresh_enabled(index, false)
                .await
                .stage("load_documents")?;
        }

        let cache = Arc::new(EmbeddingCache::new(
            Arc::clone(&self.embedder),
            self.settings.embedding_batch_size,
        ));
        let semaphore = Arc::new(Semaphore::new(self.settings.max_in_flight.max(1)));
        let mut batches: JoinSet<Result<u64>> = JoinSet::new();
        let mut indexed: u64 = 0;
        let mut offset: u64 = 0;
        let batch_size = self.settings.batch_size.max(1);

        sink.documents(0, total).await;

        let load = async {
            loop {
                let records = self
                    .catalog
                    .fetch(offset, batch_size)
                    .await
                    .stage("load_documents")?;
                if records.is_empty() {
                    break;
                }
                offset += records.len() as u64;
                let last_page = records.len() < batch_size;

                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|e| ReleaseError::Internal(e.into()))?;

                while let Some(joined) = batches.try_join_next() {
                    indexed += collect_batch(joined)?;
                    sink.documents(indexed, total.max(indexed)).await;
                }

                let engine = Arc::clone(&self.engine);
                let cache = Arc::clone(&cache);
                let names = names.clone();
                let embed_field = self.settings.embed_field;
                batches.spawn(async move {
                    let _permit = permit;
                    write_batch(engine.as_ref(), &cache, &names, embed_field, records).await
                });

                if last_page {
                    break;
                }
            }

            while let Some(joined) = batches.join_next().await {
                indexed += collect_batch(joined)?;
                sink.documents(indexed, total.max(indexed)).await;
            }
            Ok::<(), ReleaseError>(())
        };

        if let Err(e) = load.await {
            batches.abort_all();
            return Err(e);
        }

        for index in names.indices() {
            self.engine
                .set_refresh_enabled(index, true)
                .await
                .stage("load_documents")?;
            self.engine.refresh(index).await.stage("load_documents")?;
        }

        let searchable = self
            .engine
            .count(&names.primary)
            .await
            .stage("load_documents")?;
        if searchable != indexed {
            tracing::warn!(
                index = %names.primary,
                indexed,
                searchable,
                "engine document count differs from rows written"
            );
        }

        let (hits, misses) = cache.stats();
        tracing::info!(
            index = %names.primary,
            documents = indexed,
            embedding_cache_hits = hits,
            embedding_cache_misses = misses,
            "document load complete"
        );
        Ok(indexed)
    }

    /// Ask the engine to reload analyzers that read updateable resources.
    pub async fn reload_analyzers(&self, names: &IndexNames) -> Result<()> {
        for index in names.indices() {
            self.engine
                .reload_search_analyzers(index)
                .await
                .stage("deploy_dictionaries")?;
        }
        Ok(())
    }

    /// Delete both indices of `names`, then its synonym set. Never fails.
    pub async fn delete_indices(&self, names: &IndexNames) -> CleanupOutcome {
        let indices: Vec<String> = names.indices().iter().map(|s| s.to_string()).collect();
        let synonym_sets: Vec<String> = names.synonym_set.iter().cloned().collect();
        self.delete_resources(&indices, &synonym_sets).await
    }

    /// Best-effort deletion of arbitrary indices and synonym sets. A
    /// resource that is already gone counts as deleted. Synonym sets go
    /// last because the engine refuses to drop a set an index still uses.
    pub async fn delete_resources(&self, indices: &[String], synonym_sets: &[String]) -> CleanupOutcome {
        let mut outcome = CleanupOutcome::default();
        for index in indices {
            record(&mut outcome, index, self.engine.delete_index(index).await);
        }
        for set in synonym_sets {
            record(&mut outcome, set, self.engine.delete_synonym_set(set).await);
        }
        outcome
    }
}

fn record(outcome: &mut CleanupOutcome, name: &str, result: std::result::Result<(), EngineError>) {
    match result {
        Ok(()) | Err(EngineError::NotFound(_)) => outcome.deleted.push(name.to_string()),
        Err(e) => outcome.failed.push((name.to_string(), e.to_string())),
    }
}

fn collect_batch(
    joined: std::result::Result<Result<u64>, tokio::task::JoinError>,
) -> Result<u64> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(ReleaseError::Stage {
            stage: "load_documents",
            message: format!("batch task aborted: {}", e),
        }),
    }
}

async fn write_batch(
    engine: &dyn SearchEngine,
    cache: &EmbeddingCache,
    names: &IndexNames,
    embed_field: EmbedField,
    records: Vec<CatalogRecord>,
) -> Result<u64> {
    let vectors = if cache.is_enabled() {
        let texts: Vec<String> = records.iter().map(|r| embed_field.text(r)).collect();
        Some(cache.embed_all(&texts).await.stage("load_documents")?)
    } else {
        None
    };

    let primary: Vec<BulkDocument> = records
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let vector = vectors.as_ref().map(|v| v[i].as_slice());
            primary_document(r, vector)
        })
        .collect();
    let suggestions: Vec<BulkDocument> = records.iter().map(autocomplete_document).collect();

    for (index, docs) in [(&names.primary, &primary), (&names.autocomplete, &suggestions)] {
        let summary = engine.bulk_write(index, docs).await.stage("load_documents")?;
        if let Some(first) = summary.failures.first() {
            return Err(ReleaseError::Stage {
                stage: "load_documents",
                message: format!(
                    "bulk write to {} rejected {} document(s), first: {}",
                    index,
                    summary.failures.len(),
                    first
                ),
            });
        }
    }
    Ok(records.len() as u64)
}

/// Primary search document.
pub fn primary_document(record: &CatalogRecord, vector: Option<&[f32]>) -> BulkDocument {
    let mut source = json!({
        "id": record.id,
        "name": record.name,
        "brand": record.brand,
        "category": record.category,
        "description": record.description,
        "price": record.price,
        "keywords": record.keywords,
        "updated_at": record.updated_at.map(|t| t.to_rfc3339()),
    });
    if let (Some(vector), Some(obj)) = (vector, source.as_object_mut()) {
        obj.insert("embedding".to_string(), json!(vector));
    }
    BulkDocument {
        id: record.id.clone(),
        source,
    }
}

/// Autocomplete suggestion document.
pub fn autocomplete_document(record: &CatalogRecord) -> BulkDocument {
    let mut inputs = vec![record.name.clone()];
    if let Some(brand) = &record.brand {
        if !brand.trim().is_empty() {
            inputs.push(format!("{} {}", brand.trim(), record.name));
        }
    }
    BulkDocument {
        id: record.id.clone(),
        source: json!({
            "id": record.id,
            "suggest": inputs,
            "category": record.category,
        }),
    }
}

fn primary_definition(synonym_set: Option<&str>, dims: usize) -> IndexDefinition {
    let mut search_filters = vec!["lowercase"];
    let mut filters = serde_json::Map::new();
    if let Some(set) = synonym_set {
        filters.insert(
            "product_synonyms".to_string(),
            json!({ "type": "synonym_graph", "synonyms_set": set, "updateable": true }),
        );
        search_filters.push("product_synonyms");
    }

    let mut properties = json!({
        "id": { "type": "keyword" },
        "name": { "type": "text", "analyzer": "product_index", "search_analyzer": "product_search" },
        "brand": { "type": "keyword" },
        "category": { "type": "keyword" },
        "description": { "type": "text", "analyzer": "product_index", "search_analyzer": "product_search" },
        "price": { "type": "float" },
        "keywords": { "type": "keyword" },
        "updated_at": { "type": "date" }
    });
    if dims > 0 {
        if let Some(obj) = properties.as_object_mut() {
            obj.insert(
                "embedding".to_string(),
                json!({ "type": "dense_vector", "dims": dims, "index": true, "similarity": "cosine" }),
            );
        }
    }

    IndexDefinition {
        settings: json!({
            "index": { "number_of_shards": 1, "refresh_interval": "1s" },
            "analysis": {
                "filter": Value::Object(filters),
                "analyzer": {
                    "product_index": { "type": "custom", "tokenizer": "standard", "filter": ["lowercase"] },
                    "product_search": { "type": "custom", "tokenizer": "standard", "filter": search_filters }
                }
            }
        }),
        mappings: json!({ "dynamic": "strict", "properties": properties }),
    }
}

fn autocomplete_definition() -> IndexDefinition {
    IndexDefinition {
        settings: json!({
            "index": { "number_of_shards": 1, "refresh_interval": "1s" },
            "analysis": {
                "tokenizer": {
                    "autocomplete_edge": {
                        "type": "edge_ngram",
                        "min_gram": 1,
                        "max_gram": 20,
                        "token_chars": ["letter", "digit"]
                    }
                },
                "analyzer": {
                    "autocomplete_index": { "type": "custom", "tokenizer": "autocomplete_edge", "filter": ["lowercase"] },
                    "autocomplete_search": { "type": "custom", "tokenizer": "standard", "filter": ["lowercase"] }
                }
            }
        }),
        mappings: json!({
            "dynamic": "strict",
            "properties": {
                "id": { "type": "keyword" },
                "suggest": { "type": "text", "analyzer": "autocomplete_index", "search_analyzer": "autocomplete_search" },
                "category": { "type": "keyword" }
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledProvider;
    use crate::progress::NoProgress;
    use index_release_core::catalog::InMemoryCatalog;
    use index_release_core::engine::memory::{EngineOp, InMemorySearchEngine};

    fn settings() -> BuildSettings {
        BuildSettings {
            primary_prefix: "products-idx".into(),
            autocomplete_prefix: "products-ac".into(),
            synonym_prefix: "products-syn".into(),
            batch_size: 3,
            max_in_flight: 2,
            embed_field: EmbedField::Name,
            embedding_batch_size: 8,
        }
    }

    fn builder(engine: Arc<InMemorySearchEngine>, catalog: InMemoryCatalog) -> IndexBuilder {
        IndexBuilder::new(engine, Arc::new(catalog), Arc::new(DisabledProvider), settings())
    }

    #[test]
    fn names_carry_version() {
        let b = builder(
            Arc::new(InMemorySearchEngine::default()),
            InMemoryCatalog::generated(0),
        );
        let names = b.index_names("v20240101120000");
        assert_eq!(names.primary, "products-idx-v20240101120000");
        assert_eq!(names.autocomplete, "products-ac-v20240101120000");
        assert_eq!(names.synonym_set.as_deref(), Some("products-syn-v20240101120000"));
        assert!(b.is_managed_index(&names.autocomplete));
        assert!(!b.is_managed_index("products"));
        assert!(b.is_managed_synonym_set("products-syn-v1"));
    }

    #[test]
    fn synonym_set_follows_index_version() {
        let b = builder(
            Arc::new(InMemorySearchEngine::default()),
            InMemoryCatalog::generated(0),
        );
        assert_eq!(
            b.synonym_set_for("products-idx-v20240101120000").as_deref(),
            Some("products-syn-v20240101120000")
        );
        assert_eq!(
            b.synonym_set_for("products-ac-v1").as_deref(),
            Some("products-syn-v1")
        );
        assert_eq!(b.synonym_set_for("products-idx-"), None);
        assert_eq!(b.synonym_set_for("customers-v1"), None);
    }

    #[test]
    fn documents_have_expected_shape() {
        let mut record = CatalogRecord::named("p1", "Desk Lamp");
        record.brand = Some("Lumo".into());
        record.description = Some("  warm light ".into());

        let primary = primary_document(&record, Some(&[0.5, 0.25]));
        assert_eq!(primary.id, "p1");
        assert_eq!(primary.source["embedding"], json!([0.5, 0.25]));
        assert!(primary_document(&record, None).source.get("embedding").is_none());

        let suggestion = autocomplete_document(&record);
        assert_eq!(suggestion.source["suggest"], json!(["Desk Lamp", "Lumo Desk Lamp"]));

        assert_eq!(EmbedField::NameDescription.text(&record), "Desk Lamp\nwarm light");
        assert_eq!(EmbedField::Name.text(&record), "Desk Lamp");
    }

    #[test]
    fn primary_definition_references_synonym_set() {
        let def = primary_definition(Some("products-syn-v1"), 3);
        assert_eq!(
            def.settings["analysis"]["filter"]["product_synonyms"]["synonyms_set"],
            "products-syn-v1"
        );
        assert_eq!(def.mappings["properties"]["embedding"]["dims"], 3);
        let bare = primary_definition(None, 0);
        assert!(bare.mappings["properties"].get("embedding").is_none());
    }

    #[tokio::test]
    async fn loads_every_record_and_restores_refresh() {
        let engine = Arc::new(InMemorySearchEngine::default());
        let b = builder(engine.clone(), InMemoryCatalog::generated(10));

        let names = b.create_physical_indices("v1", None).await.unwrap();
        let count = b.load_documents(&names, &NoProgress).await.unwrap();

        assert_eq!(count, 10);
        assert_eq!(engine.documents(&names.primary).len(), 10);
        assert_eq!(engine.documents(&names.autocomplete).len(), 10);
        assert_eq!(engine.refresh_enabled(&names.primary), Some(true));
    }

    #[tokio::test]
    async fn catalog_failure_fails_the_load() {
        let engine = Arc::new(InMemorySearchEngine::default());
        let b = builder(engine.clone(), InMemoryCatalog::generated(10).failing_from(6));

        let names = b.create_physical_indices("v1", None).await.unwrap();
        let err = b.load_documents(&names, &NoProgress).await.unwrap_err();
        assert!(matches!(err, ReleaseError::Stage { stage: "load_documents", .. }));
        assert_eq!(engine.refresh_enabled(&names.primary), Some(false));
    }

    #[tokio::test]
    async fn cleanup_reports_failures_without_raising() {
        let engine = Arc::new(InMemorySearchEngine::default());
        engine.seed_index("products-idx-v1");
        engine.fail_on_target(EngineOp::DeleteIndex, "products-idx-v1");
        let b = builder(engine.clone(), InMemoryCatalog::generated(0));

        let outcome = b
            .delete_resources(
                &["products-idx-v1".to_string(), "products-ac-v1".to_string()],
                &[],
            )
            .await;
        assert_eq!(outcome.deleted, vec!["products-ac-v1".to_string()]);
        assert_eq!(outcome.failed.len(), 1);
        assert!(!outcome.is_clean());
    }
}
