//! Domain types shared by the ingestion pipeline.
//!
//! Definitions (`FeedSource`, `OutputDef`, `FilterDef`) are the persisted shape
//! of the configuration; `Article` is the unit that flows through the pipeline.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ============================================================================
// Article
// ============================================================================

/// A single entry retrieved from a feed source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    /// Stable identifier used for deduplication (source GUID or content hash)
    pub fingerprint: String,
    pub title: String,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub feed_id: i64,
    pub feed_title: String,
}

impl Article {
    /// Text value of a named field, `None` if the field name is unknown.
    ///
    /// Absent optional fields read as the empty string.
    pub fn field(&self, name: &str) -> Option<String> {
        let value = match name {
            "title" => self.title.clone(),
            "link" => self.link.clone().unwrap_or_default(),
            "summary" => self.summary.clone().unwrap_or_default(),
            "author" => self.author.clone().unwrap_or_default(),
            "feed" => self.feed_title.clone(),
            "fingerprint" => self.fingerprint.clone(),
            "published" => self
                .published
                .map(|p| p.to_rfc3339())
                .unwrap_or_default(),
            "tags" => self.tags.join(","),
            _ => return None,
        };
        Some(value)
    }
}

// ============================================================================
// Feed sources
// ============================================================================

/// A pollable or push-subscribable origin of articles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedSource {
    pub id: i64,
    pub title: String,
    pub xml_url: String,
    pub html_url: Option<String>,
    /// Poll delay override; the configured default applies when unset
    pub delay_secs: Option<u64>,
    /// Fetch timeout override; the configured default applies when unset
    pub timeout_secs: Option<u64>,
    pub enabled: bool,
    pub hub_url: Option<String>,
    pub push_secret: Option<String>,
    pub push_expires_at: Option<i64>,
    pub last_checked_at: Option<i64>,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub items_processed: i64,
}

impl FeedSource {
    pub fn delay(&self, default: Duration) -> Duration {
        self.delay_secs
            .filter(|d| *d > 0)
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs
            .filter(|t| *t > 0)
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// True while a push subscription lease is active at `now` (unix seconds).
    pub fn push_active(&self, now: i64) -> bool {
        matches!(self.push_expires_at, Some(expires) if expires > now)
    }
}

/// Input for creating a feed source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NewFeed {
    pub title: String,
    pub xml_url: String,
    pub html_url: Option<String>,
    pub delay_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub enabled: bool,
}

impl Default for NewFeed {
    fn default() -> Self {
        Self {
            title: String::new(),
            xml_url: String::new(),
            html_url: None,
            delay_secs: None,
            timeout_secs: None,
            enabled: true,
        }
    }
}

// ============================================================================
// Output and filter definitions
// ============================================================================

/// Provider-specific property bag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Props(BTreeMap<String, String>);

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blank value of a property
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw).map(Self)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Props {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Persisted destination configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
    pub id: i64,
    pub alias: String,
    /// Name of the output plugin that builds this destination
    pub plugin: String,
    /// Routing condition; empty matches everything
    pub condition: String,
    pub props: Props,
    pub enabled: bool,
    pub success_count: u64,
    pub error_count: u64,
}

impl OutputDef {
    /// A new, unsaved definition (id 0, zeroed counters).
    pub fn new(alias: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self {
            id: 0,
            alias: alias.into(),
            plugin: plugin.into(),
            condition: String::new(),
            props: Props::new(),
            enabled: true,
            success_count: 0,
            error_count: 0,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key, value);
        self
    }
}

/// Persisted filter stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterDef {
    pub id: i64,
    pub alias: String,
    pub plugin: String,
    pub condition: String,
    pub props: Props,
    pub enabled: bool,
}

impl FilterDef {
    pub fn new(alias: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self {
            id: 0,
            alias: alias.into(),
            plugin: plugin.into(),
            condition: String::new(),
            props: Props::new(),
            enabled: true,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key, value);
        self
    }
}

// ============================================================================
// Plugin specifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Output,
    Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropType {
    Text,
    Password,
    Textarea,
    Url,
    Number,
}

/// Descriptor of one configurable property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropSpec {
    pub name: &'static str,
    pub desc: &'static str,
    pub kind: PropType,
    pub required: bool,
}

/// Self-description of a provider: the contract its props must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSpec {
    pub name: &'static str,
    pub desc: &'static str,
    pub kind: PluginKind,
    pub props: Vec<PropSpec>,
}

impl PluginSpec {
    pub fn prop(&self, name: &str) -> Option<&PropSpec> {
        self.props.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article() -> Article {
        Article {
            fingerprint: "fp".into(),
            title: "Title".into(),
            link: None,
            summary: Some("Sum".into()),
            author: None,
            published: None,
            tags: vec!["a".into(), "b".into()],
            feed_id: 1,
            feed_title: "Feed".into(),
        }
    }

    #[test]
    fn test_field_lookup() {
        let a = article();
        assert_eq!(a.field("title").as_deref(), Some("Title"));
        assert_eq!(a.field("link").as_deref(), Some(""));
        assert_eq!(a.field("tags").as_deref(), Some("a,b"));
        assert_eq!(a.field("feed").as_deref(), Some("Feed"));
        assert!(a.field("nope").is_none());
    }

    #[test]
    fn test_props_blank_values_are_absent() {
        let props: Props = [("a", "1"), ("b", "  ")].into_iter().collect();
        assert_eq!(props.get("a"), Some("1"));
        assert_eq!(props.get("b"), None);
        assert_eq!(props.get("c"), None);
    }

    #[test]
    fn test_props_json_round_trip() {
        let props: Props = [("url", "https://x")].into_iter().collect();
        let parsed = Props::from_json(&props.to_json()).unwrap();
        assert_eq!(parsed, props);
    }

    #[test]
    fn test_feed_overrides() {
        let mut feed = FeedSource {
            id: 1,
            title: "t".into(),
            xml_url: "https://x".into(),
            html_url: None,
            delay_secs: None,
            timeout_secs: Some(3),
            enabled: true,
            hub_url: None,
            push_secret: None,
            push_expires_at: Some(100),
            last_checked_at: None,
            error_count: 0,
            last_error: None,
            items_processed: 0,
        };
        assert_eq!(feed.delay(Duration::from_secs(60)), Duration::from_secs(60));
        assert_eq!(feed.timeout(Duration::from_secs(5)), Duration::from_secs(3));
        assert!(feed.push_active(99));
        assert!(!feed.push_active(100));
        feed.push_expires_at = None;
        assert!(!feed.push_active(0));
    }
}
