//! In-memory [`SearchEngine`] implementation for tests and dry runs.
//!
//! State lives behind a `std::sync::Mutex`. Alias updates are validated in
//! full before any action is applied, matching the all-or-nothing contract
//! of the real `_aliases` endpoint. Every alias update appends the
//! resulting alias table to an observation log so tests can assert what a
//! reader could have seen between calls.
//!
//! Faults can be injected per operation (optionally scoped to one target
//! name), either failing before the operation runs or after it has been
//! applied.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    AliasAction, BulkDocument, BulkSummary, EngineError, EngineResult, IndexDefinition,
    SearchEngine, SynonymRule,
};

/// Engine operations that can carry an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOp {
    CreateIndex,
    DeleteIndex,
    ListIndices,
    BulkWrite,
    SetRefresh,
    Refresh,
    AliasTargets,
    ListAliases,
    UpdateAliases,
    PutSynonymSet,
    DeleteSynonymSet,
    ListSynonymSets,
    ReloadAnalyzers,
}

/// When an injected fault fires relative to the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTiming {
    /// The operation is rejected and has no effect.
    Before,
    /// The operation takes effect, then the caller sees an error.
    After,
}

#[derive(Debug, Clone)]
struct Fault {
    op: EngineOp,
    target: Option<String>,
    timing: FaultTiming,
}

#[derive(Debug, Clone)]
struct MemIndex {
    definition: IndexDefinition,
    documents: BTreeMap<String, Value>,
    refresh_enabled: bool,
}

#[derive(Default)]
struct State {
    indices: BTreeMap<String, MemIndex>,
    aliases: BTreeMap<String, BTreeSet<String>>,
    synonym_sets: BTreeMap<String, Vec<SynonymRule>>,
    analyzer_reloads: Vec<String>,
    alias_observations: Vec<BTreeMap<String, Vec<String>>>,
    bulk_calls: usize,
}

/// In-memory engine for testing.
#[derive(Default)]
pub struct InMemorySearchEngine {
    state: Mutex<State>,
    faults: Mutex<Vec<Fault>>,
}

impl InMemorySearchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call of `op` before it takes effect.
    pub fn fail_on(&self, op: EngineOp) {
        self.push_fault(op, None, FaultTiming::Before);
    }

    /// Fail calls of `op` addressing `target` (index, alias, or set name).
    pub fn fail_on_target(&self, op: EngineOp, target: &str) {
        self.push_fault(op, Some(target.to_string()), FaultTiming::Before);
    }

    /// Apply `op` normally, then report an error to the caller.
    pub fn fail_after(&self, op: EngineOp) {
        self.push_fault(op, None, FaultTiming::After);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults(&self) -> MutexGuard<'_, Vec<Fault>> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn clear_faults(&self) {
        self.faults().clear();
    }

    fn push_fault(&self, op: EngineOp, target: Option<String>, timing: FaultTiming) {
        self.faults().push(Fault { op, target, timing });
    }

    fn fault_for(&self, op: EngineOp, target: Option<&str>, timing: FaultTiming) -> EngineResult<()> {
        let faults = self.faults();
        let hit = faults.iter().any(|f| {
            f.op == op
                && f.timing == timing
                && match (&f.target, target) {
                    (None, _) => true,
                    (Some(want), Some(got)) => want == got,
                    (Some(_), None) => false,
                }
        });
        if hit {
            Err(EngineError::Transport(format!(
                "injected fault on {:?}{}",
                op,
                target.map(|t| format!(" ({})", t)).unwrap_or_default()
            )))
        } else {
            Ok(())
        }
    }

    fn before(&self, op: EngineOp, target: Option<&str>) -> EngineResult<()> {
        self.fault_for(op, target, FaultTiming::Before)
    }

    fn after(&self, op: EngineOp, target: Option<&str>) -> EngineResult<()> {
        self.fault_for(op, target, FaultTiming::After)
    }

    // ── Fixtures and inspection ───────────────────────────────────────

    /// Create an empty index without going through the trait.
    pub fn seed_index(&self, name: &str) {
        self.state().indices.insert(
            name.to_string(),
            MemIndex {
                definition: IndexDefinition {
                    settings: Value::Null,
                    mappings: Value::Null,
                },
                documents: BTreeMap::new(),
                refresh_enabled: true,
            },
        );
    }

    /// Point `alias` at `index` without going through the trait.
    pub fn seed_alias(&self, alias: &str, index: &str) {
        self.state()
            .aliases
            .entry(alias.to_string())
            .or_default()
            .insert(index.to_string());
    }

    pub fn seed_synonym_set(&self, name: &str) {
        self.state()
            .synonym_sets
            .insert(name.to_string(), Vec::new());
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.state().indices.contains_key(name)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.state().indices.keys().cloned().collect()
    }

    pub fn has_synonym_set(&self, name: &str) -> bool {
        self.state().synonym_sets.contains_key(name)
    }

    pub fn synonym_rules(&self, name: &str) -> Option<Vec<SynonymRule>> {
        self.state().synonym_sets.get(name).cloned()
    }

    pub fn documents(&self, index: &str) -> Vec<Value> {
        self.state()
            .indices
            .get(index)
            .map(|i| i.documents.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn definition(&self, index: &str) -> Option<IndexDefinition> {
        self.state()
            .indices
            .get(index)
            .map(|i| i.definition.clone())
    }

    pub fn refresh_enabled(&self, index: &str) -> Option<bool> {
        self.state()
            .indices
            .get(index)
            .map(|i| i.refresh_enabled)
    }

    pub fn resolve_alias(&self, alias: &str) -> Vec<String> {
        self.state()
            .aliases
            .get(alias)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Alias table after each successful `update_aliases` call, in order.
    pub fn alias_observations(&self) -> Vec<BTreeMap<String, Vec<String>>> {
        self.state().alias_observations.clone()
    }

    pub fn analyzer_reloads(&self) -> Vec<String> {
        self.state().analyzer_reloads.clone()
    }

    pub fn bulk_calls(&self) -> usize {
        self.state().bulk_calls
    }
}

fn alias_table(aliases: &BTreeMap<String, BTreeSet<String>>) -> BTreeMap<String, Vec<String>> {
    aliases
        .iter()
        .filter(|(_, targets)| !targets.is_empty())
        .map(|(alias, targets)| (alias.clone(), targets.iter().cloned().collect()))
        .collect()
}

#[async_trait]
impl SearchEngine for InMemorySearchEngine {
    async fn create_index(&self, name: &str, definition: &IndexDefinition) -> EngineResult<()> {
        self.before(EngineOp::CreateIndex, Some(name))?;
        {
            let mut state = self.state();
            if state.indices.contains_key(name) {
                return Err(EngineError::Rejected {
                    status: 400,
                    message: format!("resource_already_exists_exception: {}", name),
                });
            }
            state.indices.insert(
                name.to_string(),
                MemIndex {
                    definition: definition.clone(),
                    documents: BTreeMap::new(),
                    refresh_enabled: true,
                },
            );
        }
        self.after(EngineOp::CreateIndex, Some(name))
    }

    async fn delete_index(&self, name: &str) -> EngineResult<()> {
        self.before(EngineOp::DeleteIndex, Some(name))?;
        {
            let mut state = self.state();
            if state.indices.remove(name).is_none() {
                return Err(EngineError::NotFound(name.to_string()));
            }
            for targets in state.aliases.values_mut() {
                targets.remove(name);
            }
        }
        self.after(EngineOp::DeleteIndex, Some(name))
    }

    async fn list_indices(&self) -> EngineResult<Vec<String>> {
        self.before(EngineOp::ListIndices, None)?;
        Ok(self.index_names())
    }

    async fn bulk_write(
        &self,
        index: &str,
        documents: &[BulkDocument],
    ) -> EngineResult<BulkSummary> {
        self.before(EngineOp::BulkWrite, Some(index))?;
        let summary = {
            let mut state = self.state();
            state.bulk_calls += 1;
            let target = state
                .indices
                .get_mut(index)
                .ok_or_else(|| EngineError::NotFound(index.to_string()))?;
            for doc in documents {
                target.documents.insert(doc.id.clone(), doc.source.clone());
            }
            BulkSummary {
                written: documents.len(),
                failures: Vec::new(),
            }
        };
        self.after(EngineOp::BulkWrite, Some(index))?;
        Ok(summary)
    }

    async fn set_refresh_enabled(&self, index: &str, enabled: bool) -> EngineResult<()> {
        self.before(EngineOp::SetRefresh, Some(index))?;
        {
            let mut state = self.state();
            let target = state
                .indices
                .get_mut(index)
                .ok_or_else(|| EngineError::NotFound(index.to_string()))?;
            target.refresh_enabled = enabled;
        }
        self.after(EngineOp::SetRefresh, Some(index))
    }

    async fn refresh(&self, index: &str) -> EngineResult<()> {
        self.before(EngineOp::Refresh, Some(index))?;
        if !self.has_index(index) {
            return Err(EngineError::NotFound(index.to_string()));
        }
        self.after(EngineOp::Refresh, Some(index))
    }

    async fn count(&self, index: &str) -> EngineResult<u64> {
        let state = self.state();
        state
            .indices
            .get(index)
            .map(|i| i.documents.len() as u64)
            .ok_or_else(|| EngineError::NotFound(index.to_string()))
    }

    async fn alias_targets(&self, alias: &str) -> EngineResult<Vec<String>> {
        self.before(EngineOp::AliasTargets, Some(alias))?;
        Ok(self.resolve_alias(alias))
    }

    async fn list_aliases(&self) -> EngineResult<BTreeMap<String, Vec<String>>> {
        self.before(EngineOp::ListAliases, None)?;
        Ok(alias_table(&self.state().aliases))
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> EngineResult<()> {
        for action in actions {
            self.before(EngineOp::UpdateAliases, Some(action.alias()))?;
        }
        {
            let mut state = self.state();

            // Validate everything first so a bad action leaves no trace.
            for action in actions {
                match action {
                    AliasAction::Add { index, .. } => {
                        if !state.indices.contains_key(index) {
                            return Err(EngineError::NotFound(index.clone()));
                        }
                    }
                    AliasAction::Remove { index, alias } => {
                        let present = state
                            .aliases
                            .get(alias)
                            .map(|t| t.contains(index))
                            .unwrap_or(false);
                        if !present {
                            return Err(EngineError::NotFound(format!(
                                "alias [{}] on index [{}]",
                                alias, index
                            )));
                        }
                    }
                }
            }

            for action in actions {
                match action {
                    AliasAction::Add { index, alias } => {
                        state
                            .aliases
                            .entry(alias.clone())
                            .or_default()
                            .insert(index.clone());
                    }
                    AliasAction::Remove { index, alias } => {
                        if let Some(targets) = state.aliases.get_mut(alias) {
                            targets.remove(index);
                        }
                    }
                }
            }

            let observed = alias_table(&state.aliases);
            state.alias_observations.push(observed);
        }
        for action in actions {
            self.after(EngineOp::UpdateAliases, Some(action.alias()))?;
        }
        Ok(())
    }

    async fn put_synonym_set(&self, name: &str, rules: &[SynonymRule]) -> EngineResult<()> {
        self.before(EngineOp::PutSynonymSet, Some(name))?;
        self.state()
            .synonym_sets
            .insert(name.to_string(), rules.to_vec());
        self.after(EngineOp::PutSynonymSet, Some(name))
    }

    async fn delete_synonym_set(&self, name: &str) -> EngineResult<()> {
        self.before(EngineOp::DeleteSynonymSet, Some(name))?;
        {
            let mut state = self.state();
            if state.synonym_sets.remove(name).is_none() {
                return Err(EngineError::NotFound(name.to_string()));
            }
        }
        self.after(EngineOp::DeleteSynonymSet, Some(name))
    }

    async fn list_synonym_sets(&self) -> EngineResult<Vec<String>> {
        self.before(EngineOp::ListSynonymSets, None)?;
        Ok(self.state()
            .synonym_sets
            .keys()
            .cloned()
            .collect())
    }

    async fn reload_search_analyzers(&self, index: &str) -> EngineResult<()> {
        self.before(EngineOp::ReloadAnalyzers, Some(index))?;
        {
            let mut state = self.state();
            if !state.indices.contains_key(index) {
                return Err(EngineError::NotFound(index.to_string()));
            }
            state.analyzer_reloads.push(index.to_string());
        }
        self.after(EngineOp::ReloadAnalyzers, Some(index))
    }
}
