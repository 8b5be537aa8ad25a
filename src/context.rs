//! Shared wiring for the orchestrators.
//!
//! [`ReleaseContext`] bundles the stores and external collaborators every
//! lifecycle operation needs. It is cheap to clone; the background build
//! pipeline takes its own clone.

use std::sync::Arc;

use sqlx::SqlitePool;

use index_release_core::catalog::CatalogSource;
use index_release_core::engine::SearchEngine;
use index_release_core::models::EnvironmentType;

use crate::alias::AliasSwitcher;
use crate::builder::{BuildSettings, IndexBuilder};
use crate::channel::DictionaryChannel;
use crate::config::Config;
use crate::dictionary::{DictionarySnapshotter, DictionaryStore};
use crate::embedding::EmbeddingProvider;
use crate::environment::EnvironmentStore;
use crate::guard::IndexingGuard;
use crate::history::HistoryStore;
use crate::progress::ProgressBand;
use crate::task::TaskStore;
use crate::version::VersionGenerator;

#[derive(Debug, Clone)]
pub struct ReleaseSettings {
    pub primary_alias: String,
    pub autocomplete_alias: String,
    pub band: ProgressBand,
    pub dictionary_target_path: String,
    pub build: BuildSettings,
}

impl ReleaseSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            primary_alias: config.engine.primary_alias.clone(),
            autocomplete_alias: config.engine.autocomplete_alias.clone(),
            band: ProgressBand::new(config.indexing.progress_start, config.indexing.progress_end),
            dictionary_target_path: config.dictionary.target_path.clone(),
            build: BuildSettings::from_config(config),
        }
    }
}

#[derive(Clone)]
pub struct ReleaseContext {
    pub pool: SqlitePool,
    pub engine: Arc<dyn SearchEngine>,
    pub environments: EnvironmentStore,
    pub history: HistoryStore,
    pub tasks: TaskStore,
    pub guard: IndexingGuard,
    pub dictionary: DictionaryStore,
    pub snapshotter: DictionarySnapshotter,
    pub channel: Arc<dyn DictionaryChannel>,
    pub builder: IndexBuilder,
    pub aliases: AliasSwitcher,
    pub versions: Arc<dyn VersionGenerator>,
    pub settings: Arc<ReleaseSettings>,
}

impl ReleaseContext {
    pub fn new(
        pool: SqlitePool,
        engine: Arc<dyn SearchEngine>,
        catalog: Arc<dyn CatalogSource>,
        embedder: Arc<dyn EmbeddingProvider>,
        channel: Arc<dyn DictionaryChannel>,
        versions: Arc<dyn VersionGenerator>,
        settings: ReleaseSettings,
    ) -> Self {
        let builder = IndexBuilder::new(
            Arc::clone(&engine),
            catalog,
            embedder,
            settings.build.clone(),
        );
        Self {
            environments: EnvironmentStore::new(pool.clone()),
            history: HistoryStore::new(pool.clone()),
            tasks: TaskStore::new(pool.clone()),
            guard: IndexingGuard::new(pool.clone()),
            dictionary: DictionaryStore::new(pool.clone()),
            snapshotter: DictionarySnapshotter::new(pool.clone()),
            aliases: AliasSwitcher::new(Arc::clone(&engine)),
            pool,
            engine,
            channel,
            builder,
            versions,
            settings: Arc::new(settings),
        }
    }

    /// Alias → physical index pairs for an environment's names.
    pub fn alias_targets<'a>(&'a self, primary: &'a str, autocomplete: &'a str) -> [(&'a str, &'a str); 2] {
        [
            (self.settings.primary_alias.as_str(), primary),
            (self.settings.autocomplete_alias.as_str(), autocomplete),
        ]
    }

    /// Every index and synonym set name that must survive cleanup on
    /// behalf of an environment other than `except`: names held by that
    /// row, whatever the live aliases point at, and the synonym sets those
    /// aliased indices were built with.
    pub async fn protected_names(
        &self,
        except: Option<EnvironmentType>,
    ) -> crate::error::Result<std::collections::HashSet<String>> {
        let mut protected = std::collections::HashSet::new();
        for env in self.environments.list().await? {
            if Some(env.environment_type) == except {
                continue;
            }
            protected.extend(env.primary_index_name);
            protected.extend(env.autocomplete_index_name);
            protected.extend(env.synonym_set_name);
        }
        for target in self.engine.list_aliases().await?.into_values().flatten() {
            protected.extend(self.builder.synonym_set_for(&target));
            protected.insert(target);
        }
        Ok(protected)
    }
}
