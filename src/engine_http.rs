//! Elasticsearch-compatible REST implementation of [`SearchEngine`].
//!
//! Uses `reqwest` with optional basic auth. The password is read from the
//! environment variable named in `[engine] password_env` so it never lands
//! in the config file.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use index_release_core::engine::{
    AliasAction, BulkDocument, BulkSummary, EngineError, EngineResult, IndexDefinition,
    SearchEngine, SynonymRule,
};

use crate::config::EngineConfig;

pub struct HttpSearchEngine {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpSearchEngine {
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let password = match &config.password_env {
            Some(var) => Some(
                std::env::var(var)
                    .map_err(|_| anyhow::anyhow!("{} environment variable not set", var))?,
            ),
            None => None,
        };
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path.trim_start_matches('/')));
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    /// Send and return the parsed JSON body, mapping non-2xx to errors.
    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> EngineResult<Value> {
        let resp = builder
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if status == StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            return Err(EngineError::Rejected {
                status: status.as_u16(),
                message: error_reason(&body),
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| EngineError::Transport(e.to_string()))
    }
}

/// Best human-readable reason from an engine error body.
fn error_reason(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/reason")
                .and_then(|r| r.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(500).collect())
}

/// NDJSON body for `_bulk`: one action line and one source line per document.
pub fn bulk_body(index: &str, documents: &[BulkDocument]) -> String {
    let mut body = String::new();
    for doc in documents {
        body.push_str(&json!({ "index": { "_index": index, "_id": doc.id } }).to_string());
        body.push('\n');
        body.push_str(&doc.source.to_string());
        body.push('\n');
    }
    body
}

/// Summarize a `_bulk` response; item errors are collected, not raised.
pub fn parse_bulk_response(response: &Value) -> BulkSummary {
    let mut summary = BulkSummary::default();
    let items = response
        .get("items")
        .and_then(|i| i.as_array())
        .cloned()
        .unwrap_or_default();
    for item in items {
        let Some(result) = item.as_object().and_then(|o| o.values().next()) else {
            continue;
        };
        let id = result.get("_id").and_then(|v| v.as_str()).unwrap_or("?");
        match result.get("error") {
            Some(err) if !err.is_null() => {
                let reason = err
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("unknown error");
                summary.failures.push(format!("{}: {}", id, reason));
            }
            _ => summary.written += 1,
        }
    }
    summary
}

/// Index names from `_cat/indices?format=json`.
fn parse_cat_indices(response: &Value) -> Vec<String> {
    let mut names: Vec<String> = response
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|r| r.get("index").and_then(|i| i.as_str()))
                .filter(|name| !name.starts_with('.'))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// `{ "<index>": { "aliases": { "<alias>": {} } } }` inverted to alias → indices.
pub fn parse_alias_map(response: &Value) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(indices) = response.as_object() {
        for (index, body) in indices {
            if let Some(aliases) = body.get("aliases").and_then(|a| a.as_object()) {
                for alias in aliases.keys() {
                    map.entry(alias.clone()).or_default().push(index.clone());
                }
            }
        }
    }
    for targets in map.values_mut() {
        targets.sort();
    }
    map
}

#[async_trait]
impl SearchEngine for HttpSearchEngine {
    async fn create_index(&self, name: &str, definition: &IndexDefinition) -> EngineResult<()> {
        let body = json!({
            "settings": definition.settings,
            "mappings": definition.mappings,
        });
        self.send(self.request(Method::PUT, name).json(&body), name)
            .await?;
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> EngineResult<()> {
        self.send(self.request(Method::DELETE, name), name).await?;
        Ok(())
    }

    async fn list_indices(&self) -> EngineResult<Vec<String>> {
        let resp = self
            .send(
                self.request(Method::GET, "_cat/indices?format=json&h=index"),
                "_cat/indices",
            )
            .await?;
        Ok(parse_cat_indices(&resp))
    }

    async fn bulk_write(&self, index: &str, documents: &[BulkDocument]) -> EngineResult<BulkSummary> {
        if documents.is_empty() {
            return Ok(BulkSummary::default());
        }
        let resp = self
            .send(
                self.request(Method::POST, "_bulk")
                    .header("Content-Type", "application/x-ndjson")
                    .body(bulk_body(index, documents)),
                index,
            )
            .await?;
        Ok(parse_bulk_response(&resp))
    }

    async fn set_refresh_enabled(&self, index: &str, enabled: bool) -> EngineResult<()> {
        let interval = if enabled { "1s" } else { "-1" };
        let body = json!({ "index": { "refresh_interval": interval } });
        self.send(
            self.request(Method::PUT, &format!("{}/_settings", index))
                .json(&body),
            index,
        )
        .await?;
        Ok(())
    }

    async fn refresh(&self, index: &str) -> EngineResult<()> {
        self.send(
            self.request(Method::POST, &format!("{}/_refresh", index)),
            index,
        )
        .await?;
        Ok(())
    }

    async fn count(&self, index: &str) -> EngineResult<u64> {
        let resp = self
            .send(
                self.request(Method::GET, &format!("{}/_count", index)),
                index,
            )
            .await?;
        resp.get("count")
            .and_then(|c| c.as_u64())
            .ok_or_else(|| EngineError::Transport("count response missing 'count'".into()))
    }

    async fn alias_targets(&self, alias: &str) -> EngineResult<Vec<String>> {
        match self
            .send(
                self.request(Method::GET, &format!("_alias/{}", alias)),
                alias,
            )
            .await
        {
            Ok(resp) => Ok(parse_alias_map(&resp).remove(alias).unwrap_or_default()),
            Err(EngineError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn list_aliases(&self) -> EngineResult<BTreeMap<String, Vec<String>>> {
        let resp = self
            .send(self.request(Method::GET, "_aliases"), "_aliases")
            .await?;
        Ok(parse_alias_map(&resp))
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> EngineResult<()> {
        let body = json!({ "actions": actions });
        let resp = self
            .send(self.request(Method::POST, "_aliases").json(&body), "_aliases")
            .await?;
        if resp.get("acknowledged").and_then(|a| a.as_bool()) == Some(false) {
            return Err(EngineError::Rejected {
                status: 200,
                message: "alias update not acknowledged".into(),
            });
        }
        Ok(())
    }

    async fn put_synonym_set(&self, name: &str, rules: &[SynonymRule]) -> EngineResult<()> {
        let body = json!({ "synonyms_set": rules });
        self.send(
            self.request(Method::PUT, &format!("_synonyms/{}", name))
                .json(&body),
            name,
        )
        .await?;
        Ok(())
    }

    async fn delete_synonym_set(&self, name: &str) -> EngineResult<()> {
        self.send(
            self.request(Method::DELETE, &format!("_synonyms/{}", name)),
            name,
        )
        .await?;
        Ok(())
    }

    async fn list_synonym_sets(&self) -> EngineResult<Vec<String>> {
        let resp = self
            .send(self.request(Method::GET, "_synonyms?size=1000"), "_synonyms")
            .await?;
        let mut names: Vec<String> = resp
            .get("results")
            .and_then(|r| r.as_array())
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| r.get("synonyms_set").and_then(|s| s.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn reload_search_analyzers(&self, index: &str) -> EngineResult<()> {
        self.send(
            self.request(Method::POST, &format!("{}/_reload_search_analyzers", index)),
            index,
        )
        .await?;
        Ok(())
    }
}
