use thiserror::Error;

use crate::model::{FeedSource, FilterDef, OutputDef, Props};

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another daemon has locked the database
    #[error("Another instance of feedrelay appears to be running. Please stop it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for feed queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedRow {
    pub id: i64,
    pub title: String,
    pub xml_url: String,
    pub html_url: Option<String>,
    pub delay_secs: Option<i64>,
    pub timeout_secs: Option<i64>,
    pub enabled: bool,
    pub hub_url: Option<String>,
    pub push_secret: Option<String>,
    pub push_expires_at: Option<i64>,
    pub last_checked_at: Option<i64>,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub items_processed: i64,
}

impl FeedRow {
    pub(crate) fn into_feed(self) -> FeedSource {
        FeedSource {
            id: self.id,
            title: self.title,
            xml_url: self.xml_url,
            html_url: self.html_url,
            delay_secs: self.delay_secs.map(|d| d.max(0) as u64),
            timeout_secs: self.timeout_secs.map(|t| t.max(0) as u64),
            enabled: self.enabled,
            hub_url: self.hub_url,
            push_secret: self.push_secret,
            push_expires_at: self.push_expires_at,
            last_checked_at: self.last_checked_at,
            error_count: self.error_count,
            last_error: self.last_error,
            items_processed: self.items_processed,
        }
    }
}

pub(crate) const FEED_COLUMNS: &str = "id, title, xml_url, html_url, delay_secs, timeout_secs, \
     enabled, hub_url, push_secret, push_expires_at, last_checked_at, error_count, \
     last_error, items_processed";

/// Internal row type for output queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct OutputRow {
    pub id: i64,
    pub alias: String,
    pub plugin: String,
    pub condition: String,
    pub props: String,
    pub enabled: bool,
    pub success_count: i64,
    pub error_count: i64,
}

impl OutputRow {
    pub(crate) fn into_def(self) -> OutputDef {
        let props = parse_props(self.id, &self.props);
        OutputDef {
            id: self.id,
            alias: self.alias,
            plugin: self.plugin,
            condition: self.condition,
            props,
            enabled: self.enabled,
            success_count: self.success_count.max(0) as u64,
            error_count: self.error_count.max(0) as u64,
        }
    }
}

/// Internal row type for filter queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FilterRow {
    pub id: i64,
    pub alias: String,
    pub plugin: String,
    pub condition: String,
    pub props: String,
    pub enabled: bool,
}

impl FilterRow {
    pub(crate) fn into_def(self) -> FilterDef {
        let props = parse_props(self.id, &self.props);
        FilterDef {
            id: self.id,
            alias: self.alias,
            plugin: self.plugin,
            condition: self.condition,
            props,
            enabled: self.enabled,
        }
    }
}

fn parse_props(id: i64, raw: &str) -> Props {
    Props::from_json(raw).unwrap_or_else(|e| {
        tracing::warn!(id = id, error = %e, "Corrupt props column, using empty props");
        Props::new()
    })
}
