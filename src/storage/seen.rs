use anyhow::Result;

use super::schema::Database;

impl Database {
    // ========================================================================
    // Dedup Cache Operations
    // ========================================================================

    /// Atomically record a fingerprint unless it was seen at or after `cutoff`.
    ///
    /// Returns true when this call recorded the fingerprint (first sighting, or
    /// the previous sighting had aged out). The decision is made by a single
    /// upsert, so concurrent callers for the same fingerprint get exactly one
    /// `true`.
    pub async fn cache_check_and_record(&self, fingerprint: &str, now: i64, cutoff: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO cache (fingerprint, seen_at) VALUES (?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET seen_at = excluded.seen_at
            WHERE cache.seen_at < ?
        "#,
        )
        .bind(fingerprint)
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// When the fingerprint was last recorded, if it is in the cache at all.
    pub async fn cache_seen_at(&self, fingerprint: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT seen_at FROM cache WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(at,)| at))
    }

    /// Record (or refresh) a fingerprint unconditionally.
    pub async fn cache_record(&self, fingerprint: &str, at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache (fingerprint, seen_at) VALUES (?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET seen_at = excluded.seen_at
        "#,
        )
        .bind(fingerprint)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete entries recorded before `cutoff`. Returns the number removed.
    pub async fn cache_prune(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache WHERE seen_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn cache_clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn cache_len(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}
