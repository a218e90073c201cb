use anyhow::Result;

use super::schema::Database;
use super::types::{FeedRow, FEED_COLUMNS};
use crate::model::{FeedSource, NewFeed};

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Insert a feed, or update the title/options of the feed with the same URL.
    ///
    /// Returns the feed ID (same ID on conflict).
    pub async fn insert_feed(&self, feed: &NewFeed) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (title, xml_url, html_url, delay_secs, timeout_secs, enabled, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(xml_url) DO UPDATE SET
                title = excluded.title,
                html_url = excluded.html_url,
                delay_secs = excluded.delay_secs,
                timeout_secs = excluded.timeout_secs,
                enabled = excluded.enabled
            RETURNING id
        "#,
        )
        .bind(&feed.title)
        .bind(&feed.xml_url)
        .bind(&feed.html_url)
        .bind(feed.delay_secs.map(|d| d as i64))
        .bind(feed.timeout_secs.map(|t| t as i64))
        .bind(feed.enabled)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<FeedSource>> {
        let row = sqlx::query_as::<_, FeedRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"
        ))
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FeedRow::into_feed))
    }

    /// All feeds ordered by ID
    pub async fn list_feeds(&self) -> Result<Vec<FeedSource>> {
        let rows = sqlx::query_as::<_, FeedRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedRow::into_feed).collect())
    }

    pub async fn list_enabled_feeds(&self) -> Result<Vec<FeedSource>> {
        let rows = sqlx::query_as::<_, FeedRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE enabled = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedRow::into_feed).collect())
    }

    /// Update the user-editable attributes of a feed.
    ///
    /// Returns false if the feed does not exist.
    pub async fn update_feed(&self, feed: &FeedSource) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE feeds SET
                title = ?, xml_url = ?, html_url = ?, delay_secs = ?, timeout_secs = ?, enabled = ?
            WHERE id = ?
        "#,
        )
        .bind(&feed.title)
        .bind(&feed.xml_url)
        .bind(&feed.html_url)
        .bind(feed.delay_secs.map(|d| d as i64))
        .bind(feed.timeout_secs.map(|t| t as i64))
        .bind(feed.enabled)
        .bind(feed.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_feed(&self, feed_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Fetch Bookkeeping
    // ========================================================================

    /// Record a successful fetch: clears the error state and adds to the
    /// processed-items counter in one statement.
    pub async fn record_fetch_success(&self, feed_id: i64, at: i64, new_items: u64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE feeds SET
                last_checked_at = ?,
                error_count = 0,
                last_error = NULL,
                items_processed = items_processed + ?
            WHERE id = ?
        "#,
        )
        .bind(at)
        .bind(new_items as i64)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed fetch. Returns the new consecutive error count.
    pub async fn record_fetch_failure(&self, feed_id: i64, at: i64, error: &str) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE feeds SET
                last_checked_at = ?,
                error_count = error_count + 1,
                last_error = ?
            WHERE id = ?
            RETURNING error_count
        "#,
        )
        .bind(at)
        .bind(error)
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(c,)| c).unwrap_or(0))
    }

    /// Add pushed items to the processed counter without touching fetch state.
    pub async fn add_items_processed(&self, feed_id: i64, items: u64) -> Result<()> {
        sqlx::query("UPDATE feeds SET items_processed = items_processed + ? WHERE id = ?")
            .bind(items as i64)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Push Subscription State
    // ========================================================================

    /// Store the hub and secret of a pending subscription (expiry cleared
    /// until the hub verifies it).
    pub async fn set_push_pending(&self, feed_id: i64, hub_url: &str, secret: &str) -> Result<()> {
        sqlx::query(
            "UPDATE feeds SET hub_url = ?, push_secret = ?, push_expires_at = NULL WHERE id = ?",
        )
        .bind(hub_url)
        .bind(secret)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set (or clear) the lease expiry of a verified subscription.
    pub async fn set_push_expiry(&self, feed_id: i64, expires_at: Option<i64>) -> Result<()> {
        sqlx::query("UPDATE feeds SET push_expires_at = ? WHERE id = ?")
            .bind(expires_at)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Forget all push state for a feed (after unsubscribe).
    pub async fn clear_push_state(&self, feed_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE feeds SET hub_url = NULL, push_secret = NULL, push_expires_at = NULL WHERE id = ?",
        )
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
