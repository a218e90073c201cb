//! Composition root wiring storage, plugins and the pipeline managers.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;

use crate::aggregator::AggregatorManager;
use crate::cache::DedupCache;
use crate::config::Config;
use crate::filter::FilterChain;
use crate::model::PluginSpec;
use crate::output::OutputManager;
use crate::plugin::PluginRegistry;
use crate::storage::Database;
use crate::util::build_http_client;

/// How many seed entries were inserted; already-present ones are skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub feeds: usize,
    pub outputs: usize,
    pub filters: usize,
}

/// The running daemon's object graph. Admin operations go straight to the
/// managers it exposes.
pub struct Service {
    pub db: Database,
    pub registry: Arc<PluginRegistry>,
    pub cache: Arc<DedupCache>,
    pub filters: Arc<FilterChain>,
    pub outputs: Arc<OutputManager>,
    pub aggregator: AggregatorManager,
}

impl Service {
    /// Build the service with the built-in plugins selected by the config.
    pub async fn from_config(config: &Config, db: Database) -> Result<Self> {
        let client = build_http_client().context("Failed to build HTTP client")?;
        let registry =
            PluginRegistry::with_builtins(&config.plugins, client.clone(), config.network_policy());
        Self::new(config, db, registry, client).await
    }

    pub async fn new(
        config: &Config,
        db: Database,
        registry: PluginRegistry,
        client: reqwest::Client,
    ) -> Result<Self> {
        let registry = Arc::new(registry);
        let cache = Arc::new(DedupCache::new(db.clone(), config.cache_retention()));
        let filters = Arc::new(
            FilterChain::load(db.clone(), Arc::clone(&registry))
                .await
                .context("Failed to load filters")?,
        );
        let outputs = Arc::new(
            OutputManager::load(db.clone(), Arc::clone(&registry), config.send_timeout())
                .await
                .context("Failed to load outputs")?,
        );
        let aggregator = AggregatorManager::new(
            db.clone(),
            Arc::clone(&cache),
            Arc::clone(&filters),
            Arc::clone(&outputs),
            client,
            config.aggregator_settings()?,
        );

        Ok(Self {
            db,
            registry,
            cache,
            filters,
            outputs,
            aggregator,
        })
    }

    /// Insert the config's `[[feeds]]`, `[[outputs]]` and `[[filters]]` that
    /// are not stored yet (matched by URL for feeds, alias otherwise).
    ///
    /// Invalid entries are logged and skipped.
    pub async fn seed(&self, config: &Config) -> Result<SeedSummary> {
        let mut summary = SeedSummary::default();

        let known_feeds: HashSet<String> = self
            .aggregator
            .list_feeds()
            .await?
            .into_iter()
            .map(|f| f.xml_url)
            .collect();
        for feed in &config.feeds {
            if known_feeds.contains(&feed.xml_url) {
                continue;
            }
            match self.aggregator.add_feed(feed.clone()).await {
                Ok(_) => summary.feeds += 1,
                Err(e) => tracing::warn!(url = %feed.xml_url, error = %e, "Skipping configured feed"),
            }
        }

        let known_outputs: HashSet<String> = self
            .outputs
            .list_outputs()
            .await
            .into_iter()
            .map(|o| o.alias)
            .collect();
        for seed in &config.outputs {
            if known_outputs.contains(&seed.alias) {
                continue;
            }
            match self.outputs.add_output(seed.to_def()).await {
                Ok(_) => summary.outputs += 1,
                Err(e) => tracing::warn!(alias = %seed.alias, error = %e, "Skipping configured output"),
            }
        }

        let known_filters: HashSet<String> =
            self.filters.list().into_iter().map(|f| f.alias).collect();
        for seed in &config.filters {
            if known_filters.contains(&seed.alias) {
                continue;
            }
            match self.filters.add(seed.to_def()).await {
                Ok(_) => summary.filters += 1,
                Err(e) => tracing::warn!(alias = %seed.alias, error = %e, "Skipping configured filter"),
            }
        }

        if summary != SeedSummary::default() {
            tracing::info!(
                feeds = summary.feeds,
                outputs = summary.outputs,
                filters = summary.filters,
                "Seeded definitions from config"
            );
        }
        Ok(summary)
    }

    /// Forget every recorded fingerprint.
    pub async fn clear_cache(&self) -> Result<u64> {
        self.cache.clear().await
    }

    pub fn output_plugins(&self) -> Vec<PluginSpec> {
        self.registry.output_specs()
    }

    pub fn filter_plugins(&self) -> Vec<PluginSpec> {
        self.registry.filter_specs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"
allow_private_networks = true

[[feeds]]
title = "Example"
xml_url = "http://example.com/feed.xml"
enabled = false

[[feeds]]
title = "x"
xml_url = "http://example.com/too-short-title.xml"

[[outputs]]
alias = "console"
plugin = "stdout"

[[outputs]]
alias = "broken"
plugin = "no-such-plugin"

[[filters]]
alias = "rust"
plugin = "condition"
condition = 'title contains "Rust"'
"#;

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let config = Config::parse(CONFIG).unwrap();
        let db = Database::open(":memory:").await.unwrap();
        let service = Service::from_config(&config, db).await.unwrap();

        let first = service.seed(&config).await.unwrap();
        assert_eq!(
            first,
            SeedSummary {
                feeds: 1,
                outputs: 1,
                filters: 1
            }
        );
        assert_eq!(service.seed(&config).await.unwrap(), SeedSummary::default());

        assert_eq!(service.aggregator.list_feeds().await.unwrap().len(), 1);
        assert_eq!(service.outputs.list_outputs().await.len(), 1);
        assert_eq!(service.filters.list()[0].alias, "rust");
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let config = Config::default();
        let db = Database::open(":memory:").await.unwrap();
        let service = Service::from_config(&config, db).await.unwrap();

        service.cache.record("a", 100).await.unwrap();
        service.cache.record("b", 100).await.unwrap();
        assert_eq!(service.clear_cache().await.unwrap(), 2);
        assert_eq!(service.db.cache_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_plugin_listing_respects_selection() {
        let config = Config::parse("plugins = [\"stdout\", \"interest\"]").unwrap();
        let db = Database::open(":memory:").await.unwrap();
        let service = Service::from_config(&config, db).await.unwrap();

        let outputs: Vec<_> = service.output_plugins().iter().map(|s| s.name).collect();
        let filters: Vec<_> = service.filter_plugins().iter().map(|s| s.name).collect();
        assert_eq!(outputs, vec!["stdout"]);
        assert_eq!(filters, vec!["interest"]);
    }
}
