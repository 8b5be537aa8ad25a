//! Atomic alias cutover.
//!
//! A repoint reads the alias's current targets and submits one
//! multi-action request: a `remove` for every target other than the new
//! index plus one `add`. The engine applies the whole request atomically,
//! so readers of the alias see either the old set or the new index, never
//! an empty alias.

use std::sync::Arc;

use serde::Serialize;

use index_release_core::engine::{AliasAction, SearchEngine};

use crate::error::{ReleaseError, Result};

/// Targets removed from one alias by a cutover.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RepointOutcome {
    /// `(alias, removed index)` pairs in request order.
    pub removed: Vec<(String, String)>,
}

impl RepointOutcome {
    pub fn removed_indices(&self) -> Vec<String> {
        self.removed.iter().map(|(_, index)| index.clone()).collect()
    }
}

/// Actions that move `alias` from `current` to exactly `new_index`.
pub fn plan_repoint(alias: &str, new_index: &str, current: &[String]) -> Vec<AliasAction> {
    let mut actions: Vec<AliasAction> = current
        .iter()
        .filter(|index| index.as_str() != new_index)
        .map(|index| AliasAction::Remove {
            index: index.clone(),
            alias: alias.to_string(),
        })
        .collect();
    actions.push(AliasAction::Add {
        index: new_index.to_string(),
        alias: alias.to_string(),
    });
    actions
}

#[derive(Clone)]
pub struct AliasSwitcher {
    engine: Arc<dyn SearchEngine>,
}

impl AliasSwitcher {
    pub fn new(engine: Arc<dyn SearchEngine>) -> Self {
        Self { engine }
    }

    /// Point `alias` at `new_index` alone. Returns the removed targets.
    pub async fn repoint(&self, alias: &str, new_index: &str) -> Result<Vec<String>> {
        let outcome = self.repoint_all(&[(alias, new_index)]).await?;
        Ok(outcome.removed_indices())
    }

    /// Repoint several aliases in a single atomic request.
    pub async fn repoint_all(&self, targets: &[(&str, &str)]) -> Result<RepointOutcome> {
        let mut actions = Vec::new();
        for (alias, new_index) in targets {
            let current = self
                .engine
                .alias_targets(alias)
                .await
                .map_err(|e| ReleaseError::AliasUpdate(format!("reading alias {}: {}", alias, e)))?;
            actions.extend(plan_repoint(alias, new_index, &current));
        }

        let removed: Vec<(String, String)> = actions
            .iter()
            .filter_map(|a| match a {
                AliasAction::Remove { index, alias } => Some((alias.clone(), index.clone())),
                AliasAction::Add { .. } => None,
            })
            .collect();

        self.engine
            .update_aliases(&actions)
            .await
            .map_err(|e| ReleaseError::AliasUpdate(e.to_string()))?;

        for (alias, new_index) in targets {
            tracing::info!(alias = %alias, index = %new_index, "alias repointed");
        }
        Ok(RepointOutcome { removed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use index_release_core::engine::memory::{EngineOp, InMemorySearchEngine};

    #[test]
    fn plan_removes_everything_but_new_index() {
        let current = vec!["p-v0".to_string(), "p-v1".to_string(), "p-old".to_string()];
        let actions = plan_repoint("products", "p-v1", &current);
        assert_eq!(
            actions,
            vec![
                AliasAction::Remove {
                    index: "p-v0".into(),
                    alias: "products".into()
                },
                AliasAction::Remove {
                    index: "p-old".into(),
                    alias: "products".into()
                },
                AliasAction::Add {
                    index: "p-v1".into(),
                    alias: "products".into()
                },
            ]
        );
    }

    #[test]
    fn plan_for_missing_alias_only_adds() {
        let actions = plan_repoint("products", "p-v1", &[]);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], AliasAction::Add { .. }));
    }

    #[tokio::test]
    async fn repoint_all_is_one_call() {
        let engine = Arc::new(InMemorySearchEngine::default());
        for index in ["p-v0", "p-v1", "a-v0", "a-v1"] {
            engine.seed_index(index);
        }
        engine.seed_alias("products", "p-v0");
        engine.seed_alias("products-autocomplete", "a-v0");

        let switcher = AliasSwitcher::new(engine.clone());
        let outcome = switcher
            .repoint_all(&[("products", "p-v1"), ("products-autocomplete", "a-v1")])
            .await
            .unwrap();

        assert_eq!(outcome.removed_indices(), vec!["p-v0".to_string(), "a-v0".to_string()]);
        assert_eq!(engine.resolve_alias("products"), vec!["p-v1".to_string()]);
        assert_eq!(engine.alias_observations().len(), 1);
    }

    #[tokio::test]
    async fn failed_call_leaves_alias_and_maps_error() {
        let engine = Arc::new(InMemorySearchEngine::default());
        engine.seed_index("p-v0");
        engine.seed_index("p-v1");
        engine.seed_alias("products", "p-v0");
        engine.fail_on(EngineOp::UpdateAliases);

        let err = AliasSwitcher::new(engine.clone())
            .repoint("products", "p-v1")
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::AliasUpdate(_)));
        assert_eq!(engine.resolve_alias("products"), vec!["p-v0".to_string()]);
    }
}
