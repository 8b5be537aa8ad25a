use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub engine: EngineConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub dictionary: DictionaryConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Base URL of the search engine REST API.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Name of the environment variable holding the engine password.
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default = "default_primary_alias")]
    pub primary_alias: String,
    #[serde(default = "default_autocomplete_alias")]
    pub autocomplete_alias: String,
    #[serde(default = "default_primary_prefix")]
    pub primary_prefix: String,
    #[serde(default = "default_autocomplete_prefix")]
    pub autocomplete_prefix: String,
    #[serde(default = "default_synonym_prefix")]
    pub synonym_prefix: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_primary_alias() -> String {
    "products".to_string()
}
fn default_autocomplete_alias() -> String {
    "products-autocomplete".to_string()
}
fn default_primary_prefix() -> String {
    "products-idx".to_string()
}
fn default_autocomplete_prefix() -> String {
    "products-ac".to_string()
}
fn default_synonym_prefix() -> String {
    "products-syn".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_index_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_progress_start")]
    pub progress_start: u8,
    #[serde(default = "default_progress_end")]
    pub progress_end: u8,
    /// Which text is embedded per record: `name` or `name_description`.
    #[serde(default = "default_embed_field")]
    pub embed_field: String,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_index_batch_size(),
            max_in_flight: default_max_in_flight(),
            progress_start: default_progress_start(),
            progress_end: default_progress_end(),
            embed_field: default_embed_field(),
        }
    }
}

fn default_index_batch_size() -> usize {
    500
}
fn default_max_in_flight() -> usize {
    4
}
fn default_progress_start() -> u8 {
    30
}
fn default_progress_end() -> u8 {
    90
}
fn default_embed_field() -> String {
    "name".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DictionaryConfig {
    /// `disabled` or `http`.
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Directory on the search nodes where dictionary files are placed.
    #[serde(default = "default_target_path")]
    pub target_path: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for DictionaryConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            endpoint: None,
            target_path: default_target_path(),
            max_attempts: default_max_attempts(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_channel() -> String {
    "disabled".to_string()
}
fn default_target_path() -> String {
    "analysis".to_string()
}
fn default_max_attempts() -> u32 {
    30
}
fn default_poll_interval_secs() -> u64 {
    2
}

impl DictionaryConfig {
    pub fn is_enabled(&self) -> bool {
        self.channel != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let indexing = &config.indexing;
    if indexing.batch_size == 0 {
        bail!("indexing.batch_size must be > 0");
    }
    if indexing.max_in_flight == 0 {
        bail!("indexing.max_in_flight must be > 0");
    }
    if indexing.progress_start >= indexing.progress_end || indexing.progress_end > 100 {
        bail!("indexing progress band must satisfy 0 <= progress_start < progress_end <= 100");
    }
    match indexing.embed_field.as_str() {
        "name" | "name_description" => {}
        other => bail!(
            "Unknown indexing.embed_field: '{}'. Must be name or name_description.",
            other
        ),
    }

    let engine = &config.engine;
    if engine.primary_alias == engine.autocomplete_alias {
        bail!("engine.primary_alias and engine.autocomplete_alias must differ");
    }
    let prefixes = [
        &engine.primary_prefix,
        &engine.autocomplete_prefix,
        &engine.synonym_prefix,
    ];
    for (i, a) in prefixes.iter().enumerate() {
        if a.is_empty() {
            bail!("engine index prefixes must not be empty");
        }
        for b in prefixes.iter().skip(i + 1) {
            if a == b {
                bail!("engine prefixes must be distinct (found '{}' twice)", a);
            }
        }
    }

    // Embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    // Dictionary channel
    match config.dictionary.channel.as_str() {
        "disabled" => {}
        "http" => {
            if config.dictionary.endpoint.is_none() {
                bail!("dictionary.endpoint must be set when channel is 'http'");
            }
            if config.dictionary.max_attempts == 0 {
                bail!("dictionary.max_attempts must be > 0");
            }
        }
        other => bail!(
            "Unknown dictionary channel: '{}'. Must be disabled or http.",
            other
        ),
    }

    Ok(())
}
