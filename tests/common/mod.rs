#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tempfile::TempDir;

use index_release::builder::{BuildSettings, EmbedField};
use index_release::channel::{ChannelOutcome, DictionaryArtifact, DictionaryChannel};
use index_release::context::{ReleaseContext, ReleaseSettings};
use index_release::embedding::DisabledProvider;
use index_release::migrate::migrate_pool;
use index_release::progress::ProgressBand;
use index_release::service::ReleaseService;
use index_release::version::ClockVersionGenerator;
use index_release_core::catalog::InMemoryCatalog;
use index_release_core::engine::memory::InMemorySearchEngine;

pub const PRIMARY_ALIAS: &str = "products";
pub const AUTOCOMPLETE_ALIAS: &str = "products-autocomplete";

/// Records pushes; optionally reports every push as failed.
#[derive(Default)]
pub struct RecordingChannel {
    pub pushes: Mutex<Vec<Vec<DictionaryArtifact>>>,
    pub reject: bool,
}

#[async_trait]
impl DictionaryChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn push(&self, artifacts: &[DictionaryArtifact]) -> Result<ChannelOutcome> {
        self.pushes.lock().unwrap().push(artifacts.to_vec());
        Ok(ChannelOutcome {
            success: !self.reject,
            output: if self.reject {
                "node-2: permission denied".to_string()
            } else {
                "ok".to_string()
            },
        })
    }
}

pub struct Harness {
    _dir: TempDir,
    pub pool: SqlitePool,
    pub engine: Arc<InMemorySearchEngine>,
    pub channel: Arc<RecordingChannel>,
    pub service: ReleaseService,
}

impl Harness {
    pub async fn new(catalog: InMemoryCatalog) -> Self {
        Self::with_channel(catalog, RecordingChannel::default()).await
    }

    pub async fn with_channel(catalog: InMemoryCatalog, channel: RecordingChannel) -> Self {
        let dir = TempDir::new().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("ixr.sqlite"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();

        let engine = Arc::new(InMemorySearchEngine::new());
        let channel = Arc::new(channel);
        let ctx = ReleaseContext::new(
            pool.clone(),
            engine.clone(),
            Arc::new(catalog),
            Arc::new(DisabledProvider),
            channel.clone(),
            Arc::new(ClockVersionGenerator::with_clock(|| {
                Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
            })),
            settings(),
        );

        Self {
            _dir: dir,
            pool,
            engine,
            channel,
            service: ReleaseService::new(ctx),
        }
    }

    /// A second service over the same database and engine, as another
    /// process would see them.
    pub fn second_process(&self, catalog: InMemoryCatalog) -> ReleaseService {
        let ctx = ReleaseContext::new(
            self.pool.clone(),
            self.engine.clone(),
            Arc::new(catalog),
            Arc::new(DisabledProvider),
            self.channel.clone(),
            Arc::new(ClockVersionGenerator::new()),
            settings(),
        );
        ReleaseService::new(ctx)
    }
}

pub fn settings() -> ReleaseSettings {
    ReleaseSettings {
        primary_alias: PRIMARY_ALIAS.to_string(),
        autocomplete_alias: AUTOCOMPLETE_ALIAS.to_string(),
        band: ProgressBand::new(30, 90),
        dictionary_target_path: "analysis".to_string(),
        build: BuildSettings {
            primary_prefix: "products-idx".to_string(),
            autocomplete_prefix: "products-ac".to_string(),
            synonym_prefix: "products-syn".to_string(),
            batch_size: 100,
            max_in_flight: 2,
            embed_field: EmbedField::Name,
            embedding_batch_size: 16,
        },
    }
}
