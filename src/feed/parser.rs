use chrono::{DateTime, Utc};
use feed_rs::parser;
use sha2::{Digest, Sha256};

use crate::model::{Article, FeedSource};

/// A fetched (or pushed) document reduced to what the pipeline needs.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub entries: Vec<ParsedEntry>,
    /// WebSub hub advertised with `rel="hub"`
    pub hub_url: Option<String>,
    /// Canonical topic URL advertised with `rel="self"`
    pub self_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub fingerprint: String,
    pub title: String,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

impl ParsedEntry {
    /// Convert into an article of `feed`. The fingerprint is scoped to the
    /// feed URL so sources reusing simple GUIDs do not collide.
    pub fn into_article(self, feed: &FeedSource) -> Article {
        Article {
            fingerprint: scoped_fingerprint(&feed.xml_url, &self.fingerprint),
            title: self.title,
            link: self.link,
            summary: self.summary,
            author: self.author,
            published: self.published,
            tags: self.tags,
            feed_id: feed.id,
            feed_title: feed.title.clone(),
        }
    }
}

pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, parser::ParseFeedError> {
    let feed = parser::parse(bytes)?;

    let link_with_rel = |rel: &str| {
        feed.links
            .iter()
            .find(|l| l.rel.as_deref() == Some(rel))
            .map(|l| l.href.clone())
    };
    let hub_url = link_with_rel("hub");
    let self_url = link_with_rel("self");

    let entries = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry
                .links
                .iter()
                .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
                .or_else(|| entry.links.first())
                .map(|l| l.href.clone());
            let published = entry.published.or(entry.updated);
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body));
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());
            let author = entry
                .authors
                .first()
                .map(|p| p.name.trim().to_string())
                .filter(|n| !n.is_empty());
            let tags = entry
                .categories
                .into_iter()
                .map(|c| c.label.unwrap_or(c.term))
                .filter(|t| !t.trim().is_empty())
                .collect();

            let existing_id = if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };
            let fingerprint = fingerprint(existing_id, link.as_deref(), &title, published);

            ParsedEntry {
                fingerprint,
                title,
                link,
                summary,
                author,
                published,
                tags,
            }
        })
        .collect();

    Ok(ParsedFeed {
        title: feed.title.map(|t| t.content),
        entries,
        hub_url,
        self_url,
    })
}

/// Source GUID when present, otherwise a content hash of link, title and date.
pub fn fingerprint(
    existing: Option<&str>,
    link: Option<&str>,
    title: &str,
    published: Option<DateTime<Utc>>,
) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        link.unwrap_or(""),
        title,
        published.map(|p| p.to_rfc3339()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

/// Dedup key for an entry fingerprint within the feed at `feed_url`.
pub fn scoped_fingerprint(feed_url: &str, fingerprint: &str) -> String {
    let hash = Sha256::digest(format!("{}|{}", feed_url.trim(), fingerprint).as_bytes());
    format!("{:x}", hash)
}
