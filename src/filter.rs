//! Ordered filter chain deciding whether an article is eligible for delivery.
//!
//! The chain is held as an immutable snapshot (`Arc<Vec<Stage>>`). Readers
//! clone the `Arc` and evaluate without holding any lock; writers build a new
//! vector and swap it in, so an evaluation never sees a half-updated chain.

use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::expr::{Condition, ExprError};
use crate::model::{Article, FilterDef};
use crate::plugin::{FilterProvider, PluginError, PluginRegistry};
use crate::storage::Database;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Invalid condition: {0}")]
    Compile(#[from] ExprError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error("Filter {0} not found")]
    NotFound(i64),
    #[error("Database error: {0}")]
    Database(String),
}

/// One compiled stage of the chain.
#[derive(Clone)]
pub struct Stage {
    def: FilterDef,
    condition: Condition,
    /// `None` when a stored definition no longer builds; such stages are skipped
    provider: Option<Arc<dyn FilterProvider>>,
}

impl Stage {
    fn build(registry: &PluginRegistry, def: FilterDef) -> Result<Self, FilterError> {
        let condition = Condition::compile(&def.condition)?;
        let provider = registry.build_filter(&def)?;
        Ok(Self {
            def,
            condition,
            provider: Some(provider),
        })
    }

    fn active(&self) -> bool {
        self.def.enabled && self.provider.is_some()
    }

    fn matches(&self, article: &Article) -> bool {
        self.condition.matches(article)
            && self.provider.as_ref().is_some_and(|p| p.matches(article))
    }

    pub fn def(&self) -> &FilterDef {
        &self.def
    }
}

pub struct FilterChain {
    db: Database,
    registry: Arc<PluginRegistry>,
    stages: RwLock<Arc<Vec<Stage>>>,
    /// Serializes writers across the storage round-trip
    write: tokio::sync::Mutex<()>,
}

impl FilterChain {
    /// Build the chain from stored definitions.
    ///
    /// A definition that fails to compile or build is logged and kept as a
    /// disabled stage.
    pub async fn load(db: Database, registry: Arc<PluginRegistry>) -> Result<Self, FilterError> {
        let defs = db
            .list_filters()
            .await
            .map_err(|e| FilterError::Database(e.to_string()))?;

        let mut stages = Vec::with_capacity(defs.len());
        for def in defs {
            match Stage::build(&registry, def.clone()) {
                Ok(stage) => stages.push(stage),
                Err(e) => {
                    tracing::warn!(filter_id = def.id, alias = %def.alias, error = %e, "Filter disabled: definition does not build");
                    stages.push(Stage {
                        def: FilterDef { enabled: false, ..def },
                        condition: Condition::always(),
                        provider: None,
                    });
                }
            }
        }

        Ok(Self {
            db,
            registry,
            stages: RwLock::new(Arc::new(stages)),
            write: tokio::sync::Mutex::new(()),
        })
    }

    fn snapshot(&self) -> Arc<Vec<Stage>> {
        match self.stages.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap(&self, stages: Vec<Stage>) {
        let mut guard = match self.stages.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(stages);
    }

    /// True when every enabled stage accepts the article. Stops at the first
    /// stage that rejects it; an empty chain accepts everything.
    pub fn evaluate(&self, article: &Article) -> bool {
        let stages = self.snapshot();
        stages
            .iter()
            .filter(|s| s.active())
            .all(|s| s.matches(article))
    }

    pub async fn add(&self, def: FilterDef) -> Result<FilterDef, FilterError> {
        let _guard = self.write.lock().await;
        let mut stage = Stage::build(&self.registry, def)?;
        let id = self
            .db
            .insert_filter(&stage.def)
            .await
            .map_err(|e| FilterError::Database(e.to_string()))?;
        stage.def.id = id;
        let def = stage.def.clone();

        let mut stages = self.snapshot().as_ref().clone();
        stages.push(stage);
        self.swap(stages);

        tracing::info!(filter_id = id, alias = %def.alias, plugin = %def.plugin, "Filter added");
        Ok(def)
    }

    /// Replace a stage in place (its position in the chain is kept).
    pub async fn update(&self, def: FilterDef) -> Result<FilterDef, FilterError> {
        let _guard = self.write.lock().await;
        let id = def.id;
        let mut stages = self.snapshot().as_ref().clone();
        let index = stages
            .iter()
            .position(|s| s.def.id == id)
            .ok_or(FilterError::NotFound(id))?;

        let stage = Stage::build(&self.registry, def)?;
        let updated = self
            .db
            .update_filter(&stage.def)
            .await
            .map_err(|e| FilterError::Database(e.to_string()))?;
        if !updated {
            return Err(FilterError::NotFound(id));
        }

        let def = stage.def.clone();
        stages[index] = stage;
        self.swap(stages);
        Ok(def)
    }

    pub async fn remove(&self, id: i64) -> Result<(), FilterError> {
        let _guard = self.write.lock().await;
        let mut stages = self.snapshot().as_ref().clone();
        let before = stages.len();
        stages.retain(|s| s.def.id != id);
        if stages.len() == before {
            return Err(FilterError::NotFound(id));
        }

        self.db
            .delete_filter(id)
            .await
            .map_err(|e| FilterError::Database(e.to_string()))?;
        self.swap(stages);
        tracing::info!(filter_id = id, "Filter removed");
        Ok(())
    }

    /// Stage definitions in evaluation order
    pub fn list(&self) -> Vec<FilterDef> {
        self.snapshot().iter().map(|s| s.def.clone()).collect()
    }

    pub fn get(&self, id: i64) -> Option<FilterDef> {
        self.snapshot()
            .iter()
            .find(|s| s.def.id == id)
            .map(|s| s.def.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PluginKind, PluginSpec};
    use crate::plugin::FilterPlugin;
    use crate::util::NetworkPolicy;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Filter that counts how often it is consulted
    struct CountingPlugin {
        calls: Arc<AtomicUsize>,
    }

    struct CountingFilter {
        def: FilterDef,
        calls: Arc<AtomicUsize>,
    }

    impl FilterPlugin for CountingPlugin {
        fn spec(&self) -> PluginSpec {
            PluginSpec {
                name: "counting",
                desc: "test",
                kind: PluginKind::Filter,
                props: vec![],
            }
        }

        fn build(&self, def: &FilterDef) -> Result<Arc<dyn FilterProvider>, PluginError> {
            Ok(Arc::new(CountingFilter {
                def: def.clone(),
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    impl FilterProvider for CountingFilter {
        fn matches(&self, _article: &Article) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn def(&self) -> &FilterDef {
            &self.def
        }
    }

    fn article(title: &str) -> Article {
        Article {
            fingerprint: "fp".into(),
            title: title.into(),
            link: None,
            summary: None,
            author: None,
            published: None,
            tags: vec![],
            feed_id: 1,
            feed_title: "Feed".into(),
        }
    }

    async fn chain_with_counter() -> (FilterChain, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry =
            PluginRegistry::with_builtins(&[], reqwest::Client::new(), NetworkPolicy::PublicOnly);
        registry
            .register_filter(Arc::new(CountingPlugin {
                calls: Arc::clone(&calls),
            }))
            .unwrap();
        let db = Database::open(":memory:").await.unwrap();
        let chain = FilterChain::load(db, Arc::new(registry)).await.unwrap();
        (chain, calls)
    }

    #[tokio::test]
    async fn test_empty_chain_accepts() {
        let (chain, _) = chain_with_counter().await;
        assert!(chain.evaluate(&article("anything")));
    }

    #[tokio::test]
    async fn test_short_circuit_on_first_rejection() {
        let (chain, calls) = chain_with_counter().await;
        chain
            .add(FilterDef::new("gate", "condition").with_condition(r#"title contains "Rust""#))
            .await
            .unwrap();
        chain.add(FilterDef::new("count", "counting")).await.unwrap();

        assert!(!chain.evaluate(&article("Go news")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(chain.evaluate(&article("Rust news")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_true_false_true_chain_rejects_without_reaching_third_stage() {
        let (chain, calls) = chain_with_counter().await;
        chain
            .add(FilterDef::new("yes", "condition").with_condition("true"))
            .await
            .unwrap();
        chain
            .add(FilterDef::new("no", "condition").with_condition("false"))
            .await
            .unwrap();
        chain.add(FilterDef::new("count", "counting")).await.unwrap();

        for title in ["a", "Rust", ""] {
            assert!(!chain.evaluate(&article(title)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_stage_skipped() {
        let (chain, _) = chain_with_counter().await;
        let mut def = chain
            .add(FilterDef::new("block", "condition").with_condition("false"))
            .await
            .unwrap();
        assert!(!chain.evaluate(&article("x")));

        def.enabled = false;
        chain.update(def).await.unwrap();
        assert!(chain.evaluate(&article("x")));
    }

    #[tokio::test]
    async fn test_compile_error_leaves_chain_unchanged() {
        let (chain, _) = chain_with_counter().await;
        let def = chain
            .add(FilterDef::new("gate", "condition").with_condition("true"))
            .await
            .unwrap();

        let err = chain
            .add(FilterDef::new("bad", "condition").with_condition("title =="))
            .await
            .unwrap_err();
        assert!(matches!(err, FilterError::Compile(_)));

        let broken = FilterDef {
            condition: "(".into(),
            ..def.clone()
        };
        assert!(matches!(
            chain.update(broken).await,
            Err(FilterError::Compile(_))
        ));
        assert_eq!(chain.list(), vec![def]);
    }

    #[tokio::test]
    async fn test_unknown_plugin_rejected() {
        let (chain, _) = chain_with_counter().await;
        let err = chain.add(FilterDef::new("x", "nope")).await.unwrap_err();
        assert!(matches!(err, FilterError::Plugin(PluginError::UnknownPlugin(_))));
        assert!(chain.list().is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_get() {
        let (chain, _) = chain_with_counter().await;
        let a = chain.add(FilterDef::new("a", "condition")).await.unwrap();
        let b = chain.add(FilterDef::new("b", "condition")).await.unwrap();
        assert_eq!(chain.get(b.id).map(|d| d.alias), Some("b".to_string()));

        chain.remove(a.id).await.unwrap();
        assert!(matches!(chain.remove(a.id).await, Err(FilterError::NotFound(_))));
        assert_eq!(chain.list().len(), 1);
    }

    #[tokio::test]
    async fn test_load_from_storage_keeps_order() {
        let db = Database::open(":memory:").await.unwrap();
        db.insert_filter(&FilterDef::new("first", "condition")).await.unwrap();
        db.insert_filter(&FilterDef::new("broken", "interest")).await.unwrap();
        let registry =
            PluginRegistry::with_builtins(&[], reqwest::Client::new(), NetworkPolicy::PublicOnly);

        let chain = FilterChain::load(db, Arc::new(registry)).await.unwrap();
        let aliases: Vec<_> = chain.list().into_iter().map(|d| (d.alias, d.enabled)).collect();
        assert_eq!(
            aliases,
            vec![("first".to_string(), true), ("broken".to_string(), false)]
        );
        assert!(chain.evaluate(&article("x")));
    }
}
