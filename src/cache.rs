//! Time-bounded record of article fingerprints already processed.
//!
//! The persistent record lives in the `cache` table; the decision whether an
//! article is new is one atomic upsert there. A small in-memory LRU remembers
//! recent sightings so re-polling an unchanged feed does not hit SQLite for
//! every entry.

use anyhow::Result;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use crate::storage::Database;

const FRONT_CACHE_SIZE: usize = 4096;

pub struct DedupCache {
    db: Database,
    retention: Duration,
    /// fingerprint -> last recorded unix timestamp
    recent: Mutex<LruCache<String, i64>>,
}

impl DedupCache {
    pub fn new(db: Database, retention: Duration) -> Self {
        let capacity = NonZeroUsize::new(FRONT_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            db,
            retention,
            recent: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn cutoff(&self, now: i64) -> i64 {
        now.saturating_sub(self.retention.as_secs() as i64)
    }

    fn recent_at(&self, fingerprint: &str) -> Option<i64> {
        let mut recent = match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        recent.get(fingerprint).copied()
    }

    fn remember(&self, fingerprint: &str, at: i64) {
        let mut recent = match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        recent.put(fingerprint.to_string(), at);
    }

    fn forget_all(&self) {
        let mut recent = match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        recent.clear();
    }

    /// True if the fingerprint was recorded within the retention window.
    pub async fn seen(&self, fingerprint: &str, now: i64) -> Result<bool> {
        let cutoff = self.cutoff(now);
        if matches!(self.recent_at(fingerprint), Some(at) if at >= cutoff) {
            return Ok(true);
        }
        Ok(matches!(self.db.cache_seen_at(fingerprint).await?, Some(at) if at >= cutoff))
    }

    /// Record a sighting unconditionally.
    pub async fn record(&self, fingerprint: &str, at: i64) -> Result<()> {
        self.db.cache_record(fingerprint, at).await?;
        self.remember(fingerprint, at);
        Ok(())
    }

    /// Record the fingerprint unless it was seen within the window.
    ///
    /// Returns true exactly when this call is the first sighting in the
    /// window; concurrent callers with the same fingerprint cannot both get
    /// `true`.
    pub async fn check_and_record(&self, fingerprint: &str, now: i64) -> Result<bool> {
        let cutoff = self.cutoff(now);
        if matches!(self.recent_at(fingerprint), Some(at) if at >= cutoff) {
            return Ok(false);
        }

        if self.db.cache_check_and_record(fingerprint, now, cutoff).await? {
            self.remember(fingerprint, now);
            return Ok(true);
        }

        if let Some(at) = self.db.cache_seen_at(fingerprint).await? {
            self.remember(fingerprint, at);
        }
        Ok(false)
    }

    /// Delete entries older than the retention. Returns how many were removed.
    pub async fn prune(&self, now: i64) -> Result<u64> {
        let removed = self.db.cache_prune(self.cutoff(now)).await?;
        if removed > 0 {
            tracing::debug!(removed = removed, "Pruned dedup cache");
        }
        Ok(removed)
    }

    /// Forget everything; every article will be treated as new.
    pub async fn clear(&self) -> Result<u64> {
        let removed = self.db.cache_clear().await?;
        self.forget_all();
        tracing::info!(removed = removed, "Dedup cache cleared");
        Ok(removed)
    }
}
