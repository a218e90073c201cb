use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{push, AggregatorError, AggregatorSettings, AggregatorState};
use crate::cache::DedupCache;
use crate::feed::{fetch_feed, FetchError, ParsedFeed};
use crate::filter::FilterChain;
use crate::model::{FeedSource, NewFeed};
use crate::output::OutputManager;
use crate::storage::Database;
use crate::util::{validate_url, NetworkPolicy};

/// Upper bound on the share of the shutdown deadline left for cancelled work
const ABORT_GRACE: Duration = Duration::from_secs(1);
const MIN_PERIOD: Duration = Duration::from_secs(1);
const MIN_TITLE_CHARS: usize = 2;
const MIN_URL_CHARS: usize = 5;

/// What happened to the entries of one fetched or pushed document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub received: usize,
    /// Entries not seen within the retention window
    pub new: usize,
    /// New entries that passed the filter chain and matched a destination
    pub forwarded: usize,
}

struct FeedLoop {
    token: CancellationToken,
    /// Shared by every loop generation of a feed so polls never overlap
    poll_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Tokens and tasks of one Running period.
pub(super) struct RunContext {
    stop: CancellationToken,
    pub(super) abort: CancellationToken,
    pub(super) tracker: TaskTracker,
    loops: HashMap<i64, FeedLoop>,
}

impl RunContext {
    fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            tracker: TaskTracker::new(),
            loops: HashMap::new(),
        }
    }
}

pub(super) struct Lifecycle {
    pub(super) state: AggregatorState,
    pub(super) run: Option<RunContext>,
}

pub(super) struct Inner {
    pub(super) db: Database,
    pub(super) cache: Arc<DedupCache>,
    pub(super) filters: Arc<FilterChain>,
    pub(super) outputs: Arc<OutputManager>,
    pub(super) client: reqwest::Client,
    pub(super) settings: AggregatorSettings,
    lifecycle: Mutex<Lifecycle>,
}

/// Schedules feed polling and routes new entries to the outputs.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct AggregatorManager {
    pub(super) inner: Arc<Inner>,
}

impl AggregatorManager {
    pub fn new(
        db: Database,
        cache: Arc<DedupCache>,
        filters: Arc<FilterChain>,
        outputs: Arc<OutputManager>,
        client: reqwest::Client,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                cache,
                filters,
                outputs,
                client,
                settings,
                lifecycle: Mutex::new(Lifecycle {
                    state: AggregatorState::Stopped,
                    run: None,
                }),
            }),
        }
    }

    pub(super) fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        match self.inner.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.lifecycle().state
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.inner.settings
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start one poll loop per enabled feed plus the cache pruner.
    pub async fn start(&self) -> Result<(), AggregatorError> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != AggregatorState::Stopped {
                return Err(AggregatorError::InvalidState(lifecycle.state));
            }
            lifecycle.state = AggregatorState::Running;
            lifecycle.run = Some(RunContext::new());
        }

        let feeds = match self.inner.db.list_enabled_feeds().await {
            Ok(feeds) => feeds,
            Err(e) => {
                let mut lifecycle = self.lifecycle();
                lifecycle.state = AggregatorState::Stopped;
                lifecycle.run = None;
                return Err(AggregatorError::Database(e.to_string()));
            }
        };

        let mut lifecycle = self.lifecycle();
        let state = lifecycle.state;
        let Some(run) = lifecycle.run.as_mut() else {
            return Err(AggregatorError::InvalidState(state));
        };
        for feed in &feeds {
            self.spawn_loop(run, feed);
        }
        self.spawn_pruner(run);

        tracing::info!(feeds = feeds.len(), "Aggregator started");
        Ok(())
    }

    /// Stop scheduling, wait for in-flight work, then cancel what is left.
    ///
    /// The manager is Stopped when this returns, whether or not the deadline
    /// was met.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), AggregatorError> {
        let run = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != AggregatorState::Running {
                return Err(AggregatorError::InvalidState(lifecycle.state));
            }
            lifecycle.state = AggregatorState::Draining;
            lifecycle.run.take()
        };
        let Some(run) = run else {
            self.set_state(AggregatorState::Stopped);
            return Ok(());
        };

        tracing::info!(deadline_ms = deadline.as_millis() as u64, "Aggregator draining");
        run.stop.cancel();
        run.tracker.close();

        // The tail of the deadline is kept back for cancelled work to wind down
        let started = Instant::now();
        let grace = (deadline / 5).min(ABORT_GRACE);
        let drain_budget = deadline - grace;
        let drained = tokio::time::timeout(drain_budget, run.tracker.wait()).await.is_ok()
            && self
                .inner
                .outputs
                .drain(drain_budget.saturating_sub(started.elapsed()))
                .await;

        if drained {
            self.set_state(AggregatorState::Stopped);
            tracing::info!("Aggregator stopped");
            return Ok(());
        }

        tracing::warn!("Shutdown deadline exceeded, cancelling in-flight work");
        run.abort.cancel();
        self.inner.outputs.abort_in_flight();
        let remaining = || deadline.saturating_sub(started.elapsed());
        if tokio::time::timeout(remaining(), run.tracker.wait()).await.is_err() {
            tracing::warn!("Poll tasks did not observe cancellation in time");
        }
        if !self.inner.outputs.drain(remaining()).await {
            tracing::warn!("Deliveries did not observe cancellation in time");
        }
        self.set_state(AggregatorState::Stopped);
        Err(AggregatorError::ShutdownTimeout(deadline))
    }

    fn set_state(&self, state: AggregatorState) {
        self.lifecycle().state = state;
    }

    fn spawn_loop(&self, run: &mut RunContext, feed: &FeedSource) {
        let poll_lock = match run.loops.remove(&feed.id) {
            Some(previous) => {
                previous.token.cancel();
                previous.poll_lock
            }
            None => Arc::new(tokio::sync::Mutex::new(())),
        };
        let token = run.stop.child_token();
        run.loops.insert(
            feed.id,
            FeedLoop {
                token: token.clone(),
                poll_lock: Arc::clone(&poll_lock),
            },
        );

        let period = feed.delay(self.inner.settings.default_delay).max(MIN_PERIOD);
        let manager = self.clone();
        let abort = run.abort.clone();
        run.tracker
            .spawn(manager.feed_loop(feed.id, period, token, abort, poll_lock));
    }

    fn stop_loop(&self, feed_id: i64) {
        let mut lifecycle = self.lifecycle();
        if let Some(run) = lifecycle.run.as_mut() {
            if let Some(feed_loop) = run.loops.remove(&feed_id) {
                feed_loop.token.cancel();
            }
        }
    }

    /// Start, restart or stop the loop of a feed whose definition changed.
    fn reschedule(&self, feed: &FeedSource) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != AggregatorState::Running {
            return;
        }
        let Some(run) = lifecycle.run.as_mut() else {
            return;
        };
        if feed.enabled {
            self.spawn_loop(run, feed);
        } else if let Some(feed_loop) = run.loops.remove(&feed.id) {
            feed_loop.token.cancel();
        }
    }

    fn spawn_pruner(&self, run: &RunContext) {
        let cache = Arc::clone(&self.inner.cache);
        let stop = run.stop.clone();
        let period = self.inner.settings.prune_interval.max(MIN_PERIOD);
        run.tracker.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if let Err(e) = cache.prune(Utc::now().timestamp()).await {
                    tracing::warn!(error = %e, "Cache prune failed");
                }
            }
        });
    }

    async fn feed_loop(
        self,
        feed_id: i64,
        period: Duration,
        token: CancellationToken,
        abort: CancellationToken,
        poll_lock: Arc<tokio::sync::Mutex<()>>,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(feed_id = feed_id, period_secs = period.as_secs(), "Poll loop started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            let _polling = tokio::select! {
                _ = token.cancelled() => break,
                guard = poll_lock.lock() => guard,
            };

            // Re-read every cycle so edits and push state take effect
            let feed = match self.inner.db.get_feed(feed_id).await {
                Ok(Some(feed)) if feed.enabled => feed,
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!(feed_id = feed_id, error = %e, "Could not load feed");
                    continue;
                }
            };
            let lease = self.inner.settings.push_lease.as_secs() as i64;
            if push::push_covers(&feed, Utc::now().timestamp(), lease) {
                tracing::debug!(feed_id = feed_id, "Push subscription active, poll skipped");
                continue;
            }

            tokio::select! {
                _ = abort.cancelled() => break,
                _ = self.poll_feed(&feed) => {}
            }
        }

        tracing::debug!(feed_id = feed_id, "Poll loop stopped");
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Fetch a feed once and route its new entries.
    ///
    /// Fetch failures are recorded on the feed and returned; they never stop
    /// the feed's poll loop.
    pub async fn poll_feed(&self, feed: &FeedSource) -> Result<IngestSummary, FetchError> {
        let settings = &self.inner.settings;
        let fetched = match validate_url(&feed.xml_url, settings.network_policy) {
            Ok(url) => {
                fetch_feed(
                    &self.inner.client,
                    url.as_str(),
                    feed.timeout(settings.default_timeout),
                )
                .await
            }
            Err(e) => Err(FetchError::InvalidUrl(e.to_string())),
        };

        let now = Utc::now().timestamp();
        let parsed = match fetched {
            Ok(parsed) => parsed,
            Err(e) => {
                match self.inner.db.record_fetch_failure(feed.id, now, &e.to_string()).await {
                    Ok(count) => tracing::warn!(
                        feed_id = feed.id,
                        url = %feed.xml_url,
                        error = %e,
                        consecutive_errors = count,
                        "Feed fetch failed"
                    ),
                    Err(db_err) => tracing::warn!(
                        feed_id = feed.id,
                        error = %e,
                        db_error = %db_err,
                        "Feed fetch failed and could not be recorded"
                    ),
                }
                return Err(e);
            }
        };

        let hub_url = parsed.hub_url.clone();
        let summary = self.ingest(feed, parsed).await;
        if let Err(e) = self
            .inner
            .db
            .record_fetch_success(feed.id, now, summary.new as u64)
            .await
        {
            tracing::warn!(feed_id = feed.id, error = %e, "Could not record fetch result");
        }
        tracing::debug!(
            feed_id = feed.id,
            received = summary.received,
            new = summary.new,
            forwarded = summary.forwarded,
            "Feed polled"
        );

        if let Some(hub_url) = hub_url {
            self.maybe_subscribe(feed, &hub_url, now).await;
        }
        Ok(summary)
    }

    /// Dedup, filter and dispatch every entry of a document.
    pub(super) async fn ingest(&self, feed: &FeedSource, parsed: ParsedFeed) -> IngestSummary {
        let now = Utc::now().timestamp();
        let mut summary = IngestSummary {
            received: parsed.entries.len(),
            ..IngestSummary::default()
        };

        for entry in parsed.entries {
            let article = entry.into_article(feed);
            match self.inner.cache.check_and_record(&article.fingerprint, now).await {
                Ok(true) => summary.new += 1,
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(
                        feed_id = feed.id,
                        fingerprint = %article.fingerprint,
                        error = %e,
                        "Dedup check failed, entry skipped"
                    );
                    continue;
                }
            }

            if !self.inner.filters.evaluate(&article) {
                tracing::debug!(feed_id = feed.id, title = %article.title, "Article filtered out");
                continue;
            }

            let report = self.inner.outputs.dispatch(&article).await;
            if report.matched() > 0 {
                summary.forwarded += 1;
            }
        }

        summary
    }

    // ========================================================================
    // Feed registration
    // ========================================================================

    pub async fn add_feed(&self, feed: NewFeed) -> Result<FeedSource, AggregatorError> {
        validate_feed(&feed.title, &feed.xml_url, self.inner.settings.network_policy)?;
        let id = self
            .inner
            .db
            .insert_feed(&feed)
            .await
            .map_err(|e| AggregatorError::Database(e.to_string()))?;
        let stored = self.get_feed(id).await?;

        self.reschedule(&stored);
        tracing::info!(feed_id = id, url = %stored.xml_url, "Feed added");
        Ok(stored)
    }

    /// Replace the editable fields of a feed; a running loop is restarted.
    pub async fn update_feed(&self, feed: FeedSource) -> Result<FeedSource, AggregatorError> {
        validate_feed(&feed.title, &feed.xml_url, self.inner.settings.network_policy)?;
        let updated = self
            .inner
            .db
            .update_feed(&feed)
            .await
            .map_err(|e| AggregatorError::Database(e.to_string()))?;
        if !updated {
            return Err(AggregatorError::FeedNotFound(feed.id));
        }
        let stored = self.get_feed(feed.id).await?;

        self.reschedule(&stored);
        Ok(stored)
    }

    /// Stop polling a feed, drop its push subscription and delete it.
    pub async fn remove_feed(&self, feed_id: i64) -> Result<(), AggregatorError> {
        let feed = self.get_feed(feed_id).await?;
        self.stop_loop(feed_id);
        self.unsubscribe(&feed).await;

        self.inner
            .db
            .delete_feed(feed_id)
            .await
            .map_err(|e| AggregatorError::Database(e.to_string()))?;
        tracing::info!(feed_id = feed_id, "Feed removed");
        Ok(())
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<FeedSource, AggregatorError> {
        self.inner
            .db
            .get_feed(feed_id)
            .await
            .map_err(|e| AggregatorError::Database(e.to_string()))?
            .ok_or(AggregatorError::FeedNotFound(feed_id))
    }

    pub async fn list_feeds(&self) -> Result<Vec<FeedSource>, AggregatorError> {
        self.inner
            .db
            .list_feeds()
            .await
            .map_err(|e| AggregatorError::Database(e.to_string()))
    }
}

/// Minimum sanity for a feed definition: a short title and a fetchable URL.
fn validate_feed(title: &str, xml_url: &str, policy: NetworkPolicy) -> Result<(), AggregatorError> {
    if title.trim().chars().count() < MIN_TITLE_CHARS {
        return Err(AggregatorError::InvalidFeed(format!(
            "title must be at least {MIN_TITLE_CHARS} characters"
        )));
    }
    if xml_url.trim().chars().count() < MIN_URL_CHARS {
        return Err(AggregatorError::InvalidFeed(format!(
            "URL must be at least {MIN_URL_CHARS} characters"
        )));
    }
    validate_url(xml_url, policy).map_err(|e| AggregatorError::InvalidFeed(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginRegistry;
    use pretty_assertions::assert_eq;

    async fn manager() -> AggregatorManager {
        let db = Database::open(":memory:").await.unwrap();
        let registry = Arc::new(PluginRegistry::with_builtins(
            &[],
            reqwest::Client::new(),
            NetworkPolicy::AllowPrivate,
        ));
        let cache = Arc::new(DedupCache::new(db.clone(), Duration::from_secs(3600)));
        let filters = Arc::new(FilterChain::load(db.clone(), Arc::clone(&registry)).await.unwrap());
        let outputs = Arc::new(
            OutputManager::load(db.clone(), registry, Duration::from_secs(1))
                .await
                .unwrap(),
        );
        AggregatorManager::new(
            db,
            cache,
            filters,
            outputs,
            reqwest::Client::new(),
            AggregatorSettings {
                network_policy: NetworkPolicy::AllowPrivate,
                ..AggregatorSettings::default()
            },
        )
    }

    fn new_feed(title: &str, url: &str) -> NewFeed {
        NewFeed {
            title: title.into(),
            xml_url: url.into(),
            enabled: false,
            ..NewFeed::default()
        }
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let manager = manager().await;
        assert_eq!(manager.state(), AggregatorState::Stopped);
        assert!(matches!(
            manager.shutdown(Duration::from_secs(1)).await,
            Err(AggregatorError::InvalidState(AggregatorState::Stopped))
        ));

        manager.start().await.unwrap();
        assert_eq!(manager.state(), AggregatorState::Running);
        assert!(matches!(
            manager.start().await,
            Err(AggregatorError::InvalidState(AggregatorState::Running))
        ));

        manager.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(manager.state(), AggregatorState::Stopped);

        // A stopped manager can be started again
        manager.start().await.unwrap();
        manager.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_feed_validation() {
        let manager = manager().await;
        for (title, url) in [
            ("x", "http://example.com/feed"),
            ("  x  ", "http://example.com/feed"),
            ("Feed", "h:/"),
            ("Feed", "ftp://example.com/feed"),
            ("Feed", "not a url"),
        ] {
            assert!(
                matches!(
                    manager.add_feed(new_feed(title, url)).await,
                    Err(AggregatorError::InvalidFeed(_))
                ),
                "{title:?} {url:?} should be rejected"
            );
        }
        assert!(manager.list_feeds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_feed_crud() {
        let manager = manager().await;
        let feed = manager
            .add_feed(new_feed("Blog", "http://example.com/feed.xml"))
            .await
            .unwrap();
        assert_eq!(manager.get_feed(feed.id).await.unwrap().title, "Blog");

        let renamed = manager
            .update_feed(FeedSource {
                title: "Renamed".into(),
                ..feed.clone()
            })
            .await
            .unwrap();
        assert_eq!(renamed.title, "Renamed");

        manager.remove_feed(feed.id).await.unwrap();
        assert!(matches!(
            manager.get_feed(feed.id).await,
            Err(AggregatorError::FeedNotFound(_))
        ));
        assert!(matches!(
            manager.remove_feed(feed.id).await,
            Err(AggregatorError::FeedNotFound(_))
        ));
        assert!(matches!(
            manager.update_feed(feed).await,
            Err(AggregatorError::FeedNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_failure_recorded() {
        let manager = manager().await;
        let feed = manager
            .add_feed(new_feed("Broken", "http://127.0.0.1:9/feed.xml"))
            .await
            .unwrap();

        assert!(manager.poll_feed(&feed).await.is_err());
        assert!(manager.poll_feed(&feed).await.is_err());

        let stored = manager.get_feed(feed.id).await.unwrap();
        assert_eq!(stored.error_count, 2);
        assert!(stored.last_error.is_some());
        assert!(stored.last_checked_at.is_some());
    }
}
