//! WebSub (PubSubHubbub) subscriber side.
//!
//! Subscriptions are requested when a polled feed advertises a hub. The hub
//! then calls back on `<public>/v1/pshb/<feed id>`: a GET to verify intent,
//! followed by signed POSTs carrying new content.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use sha2::Sha256;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;
use uuid::Uuid;

use super::manager::IngestSummary;
use super::{AggregatorManager, AggregatorState};
use crate::feed::parse_feed;
use crate::model::FeedSource;
use crate::util::validate_url;

/// Renew this long (at least) before a lease runs out
const MIN_RENEW_MARGIN_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("Push callbacks are not accepted while {0}")]
    NotAccepting(AggregatorState),
    #[error("Feed {0} not found")]
    FeedNotFound(i64),
    #[error("Feed {0} has no push subscription")]
    NotSubscribed(i64),
    #[error("Unsupported hub.mode: {0}")]
    InvalidMode(String),
    #[error("Missing hub.challenge")]
    MissingChallenge,
    #[error("Topic does not match the subscribed feed")]
    TopicMismatch,
    #[error("Missing or invalid signature")]
    InvalidSignature,
    #[error("Invalid push payload: {0}")]
    Parse(String),
    #[error("Invalid hub URL: {0}")]
    InvalidHub(String),
    #[error("Hub rejected the request with status {0}")]
    HubRejected(u16),
    #[error("Hub request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Database error: {0}")]
    Database(String),
}

impl PushError {
    /// HTTP status answered to the hub.
    pub fn status_code(&self) -> u16 {
        match self {
            PushError::NotAccepting(_) => 503,
            PushError::FeedNotFound(_) | PushError::NotSubscribed(_) | PushError::TopicMismatch => 404,
            PushError::InvalidMode(_) | PushError::MissingChallenge | PushError::Parse(_) => 400,
            PushError::InvalidSignature => 403,
            PushError::InvalidHub(_) | PushError::HubRejected(_) | PushError::Network(_) => 502,
            PushError::Database(_) => 500,
        }
    }
}

/// Query parameters of a hub verification request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifyRequest {
    #[serde(rename = "hub.mode")]
    pub mode: String,
    #[serde(rename = "hub.topic", default)]
    pub topic: String,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
    #[serde(rename = "hub.lease_seconds")]
    pub lease_seconds: Option<u64>,
    #[serde(rename = "hub.reason")]
    pub reason: Option<String>,
}

impl AggregatorManager {
    // ========================================================================
    // Subscription requests
    // ========================================================================

    /// Subscribe to `hub_url` for this feed unless a subscription to that hub
    /// is pending or has a comfortable lease left.
    pub(super) async fn maybe_subscribe(&self, feed: &FeedSource, hub_url: &str, now: i64) {
        let Some(public_url) = self.inner.settings.public_url.as_ref() else {
            return;
        };
        let lease = self.inner.settings.push_lease.as_secs() as i64;
        if !needs_subscription(feed, hub_url, now, lease) {
            return;
        }

        if let Err(e) = self.subscribe(feed, hub_url, public_url).await {
            tracing::warn!(feed_id = feed.id, hub = %hub_url, error = %e, "Push subscription request failed");
            if let Err(e) = self.inner.db.clear_push_state(feed.id).await {
                tracing::warn!(feed_id = feed.id, error = %e, "Could not clear push state");
            }
        }
    }

    async fn subscribe(&self, feed: &FeedSource, hub_url: &str, public_url: &Url) -> Result<(), PushError> {
        let settings = &self.inner.settings;
        let hub = validate_url(hub_url, settings.network_policy)
            .map_err(|e| PushError::InvalidHub(e.to_string()))?;
        // Renewals keep the secret so pushes signed before re-verification still pass
        let secret = match (feed.hub_url.as_deref(), feed.push_secret.as_ref()) {
            (Some(current), Some(secret)) if current == hub_url => secret.clone(),
            _ => Uuid::new_v4().simple().to_string(),
        };
        let callback = callback_url(public_url, feed.id);
        let lease = settings.push_lease.as_secs().to_string();

        // Stored first: the hub may verify before it answers this request
        self.inner
            .db
            .set_push_pending(feed.id, hub_url, &secret)
            .await
            .map_err(|e| PushError::Database(e.to_string()))?;

        let response = self
            .inner
            .client
            .post(hub)
            .timeout(feed.timeout(settings.default_timeout))
            .form(&[
                ("hub.mode", "subscribe"),
                ("hub.topic", feed.xml_url.as_str()),
                ("hub.callback", callback.as_str()),
                ("hub.secret", secret.as_str()),
                ("hub.lease_seconds", lease.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PushError::HubRejected(response.status().as_u16()));
        }

        tracing::info!(feed_id = feed.id, hub = %hub_url, "Push subscription requested");
        Ok(())
    }

    /// Best-effort unsubscribe used when a feed is removed.
    pub(super) async fn unsubscribe(&self, feed: &FeedSource) {
        let (Some(hub_url), Some(public_url)) =
            (feed.hub_url.as_deref(), self.inner.settings.public_url.as_ref())
        else {
            return;
        };
        let hub = match validate_url(hub_url, self.inner.settings.network_policy) {
            Ok(hub) => hub,
            Err(e) => {
                tracing::debug!(feed_id = feed.id, error = %e, "Skipping unsubscribe");
                return;
            }
        };

        let callback = callback_url(public_url, feed.id);
        let result = self
            .inner
            .client
            .post(hub)
            .timeout(feed.timeout(self.inner.settings.default_timeout))
            .form(&[
                ("hub.mode", "unsubscribe"),
                ("hub.topic", feed.xml_url.as_str()),
                ("hub.callback", callback.as_str()),
            ])
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                tracing::info!(feed_id = feed.id, hub = %hub_url, "Push unsubscribe requested");
            }
            Ok(response) => {
                tracing::warn!(feed_id = feed.id, status = response.status().as_u16(), "Hub refused unsubscribe");
            }
            Err(e) => tracing::warn!(feed_id = feed.id, error = %e, "Push unsubscribe failed"),
        }
    }

    // ========================================================================
    // Hub callbacks
    // ========================================================================

    fn accepting(&self) -> Result<(TaskTracker, CancellationToken), PushError> {
        let lifecycle = self.lifecycle();
        match (&lifecycle.state, lifecycle.run.as_ref()) {
            (AggregatorState::Running, Some(run)) => Ok((run.tracker.clone(), run.abort.clone())),
            (state, _) => Err(PushError::NotAccepting(*state)),
        }
    }

    async fn load_feed(&self, feed_id: i64) -> Result<Option<FeedSource>, PushError> {
        self.inner
            .db
            .get_feed(feed_id)
            .await
            .map_err(|e| PushError::Database(e.to_string()))
    }

    /// Answer a hub verification request. Returns the body to respond with.
    pub async fn verify_subscription(
        &self,
        feed_id: i64,
        request: &VerifyRequest,
    ) -> Result<String, PushError> {
        self.accepting()?;
        let feed = self.load_feed(feed_id).await?;

        if request.mode == "denied" {
            tracing::warn!(
                feed_id = feed_id,
                reason = request.reason.as_deref().unwrap_or(""),
                "Hub denied push subscription"
            );
            if feed.is_some() {
                self.inner
                    .db
                    .clear_push_state(feed_id)
                    .await
                    .map_err(|e| PushError::Database(e.to_string()))?;
            }
            return Ok(String::new());
        }

        let challenge = request.challenge.clone().ok_or(PushError::MissingChallenge)?;
        let feed = match (feed, request.mode.as_str()) {
            (Some(feed), _) => feed,
            // Unsubscribing a feed that was already removed
            (None, "unsubscribe") => return Ok(challenge),
            (None, _) => return Err(PushError::FeedNotFound(feed_id)),
        };
        if request.topic != feed.xml_url {
            tracing::warn!(feed_id = feed_id, topic = %request.topic, "Verification for unexpected topic");
            return Err(PushError::TopicMismatch);
        }

        match request.mode.as_str() {
            "subscribe" => {
                if feed.push_secret.is_none() {
                    return Err(PushError::NotSubscribed(feed_id));
                }
                let lease = request
                    .lease_seconds
                    .unwrap_or(self.inner.settings.push_lease.as_secs());
                let expires_at = Utc::now().timestamp().saturating_add(lease as i64);
                self.inner
                    .db
                    .set_push_expiry(feed_id, Some(expires_at))
                    .await
                    .map_err(|e| PushError::Database(e.to_string()))?;
                tracing::info!(feed_id = feed_id, lease_secs = lease, "Push subscription verified");
            }
            "unsubscribe" => {
                self.inner
                    .db
                    .clear_push_state(feed_id)
                    .await
                    .map_err(|e| PushError::Database(e.to_string()))?;
                tracing::info!(feed_id = feed_id, "Push subscription ended");
            }
            other => return Err(PushError::InvalidMode(other.to_string())),
        }
        Ok(challenge)
    }

    /// Accept pushed content for a feed.
    ///
    /// The body must carry a valid `X-Hub-Signature` for the feed's secret;
    /// its entries are then processed exactly like a poll result.
    pub async fn receive_push(
        &self,
        feed_id: i64,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<IngestSummary, PushError> {
        let (tracker, abort) = self.accepting()?;
        tokio::select! {
            _ = abort.cancelled() => Err(PushError::NotAccepting(AggregatorState::Draining)),
            result = tracker.track_future(self.process_push(feed_id, signature, body)) => result,
        }
    }

    async fn process_push(
        &self,
        feed_id: i64,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<IngestSummary, PushError> {
        let feed = self
            .load_feed(feed_id)
            .await?
            .ok_or(PushError::FeedNotFound(feed_id))?;
        let secret = feed
            .push_secret
            .as_deref()
            .ok_or(PushError::NotSubscribed(feed_id))?;
        let signature = signature.ok_or(PushError::InvalidSignature)?;
        if let Err(e) = verify_signature(secret.as_bytes(), signature, body) {
            tracing::warn!(feed_id = feed_id, "Push content with bad signature ignored");
            return Err(e);
        }
        if !feed.enabled {
            tracing::debug!(feed_id = feed_id, "Push for disabled feed ignored");
            return Ok(IngestSummary::default());
        }

        let parsed = parse_feed(body).map_err(|e| PushError::Parse(e.to_string()))?;
        let summary = self.ingest(&feed, parsed).await;
        if let Err(e) = self
            .inner
            .db
            .add_items_processed(feed_id, summary.new as u64)
            .await
        {
            tracing::warn!(feed_id = feed_id, error = %e, "Could not record pushed items");
        }
        tracing::debug!(
            feed_id = feed_id,
            received = summary.received,
            new = summary.new,
            forwarded = summary.forwarded,
            "Push content processed"
        );
        Ok(summary)
    }
}

pub(crate) fn callback_url(public_url: &Url, feed_id: i64) -> String {
    format!("{}/v1/pshb/{}", public_url.as_str().trim_end_matches('/'), feed_id)
}

/// Seconds before lease expiry at which the subscription is renewed.
fn renew_margin(lease: i64) -> i64 {
    (lease / 10).max(MIN_RENEW_MARGIN_SECS)
}

/// True while a verified lease makes polling unnecessary: it is active at
/// `now` and not yet within the renewal margin.
pub(super) fn push_covers(feed: &FeedSource, now: i64, lease: i64) -> bool {
    match feed.push_expires_at {
        Some(expires_at) => feed.push_active(now) && expires_at - now > renew_margin(lease),
        None => false,
    }
}

fn needs_subscription(feed: &FeedSource, hub_url: &str, now: i64, lease: i64) -> bool {
    if feed.hub_url.as_deref() != Some(hub_url) || feed.push_secret.is_none() {
        return true;
    }
    match feed.push_expires_at {
        Some(expires_at) => expires_at - now <= renew_margin(lease),
        // Waiting for the hub to verify
        None => false,
    }
}

/// Check a `sha1=<hex>` or `sha256=<hex>` HMAC signature of `body`.
fn verify_signature(secret: &[u8], header: &str, body: &[u8]) -> Result<(), PushError> {
    let (method, hex) = header
        .trim()
        .split_once('=')
        .ok_or(PushError::InvalidSignature)?;
    let expected = decode_hex(hex).ok_or(PushError::InvalidSignature)?;

    let valid = match method.to_ascii_lowercase().as_str() {
        "sha1" => {
            let mut mac = Hmac::<Sha1>::new_from_slice(secret).map_err(|_| PushError::InvalidSignature)?;
            mac.update(body);
            mac.verify_slice(&expected).is_ok()
        }
        "sha256" => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(secret).map_err(|_| PushError::InvalidSignature)?;
            mac.update(body);
            mac.verify_slice(&expected).is_ok()
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(PushError::InvalidSignature)
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign_sha256(secret: &[u8], body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(body);
        let hex: String = mac
            .finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        format!("sha256={hex}")
    }

    fn feed() -> FeedSource {
        FeedSource {
            id: 7,
            title: "Feed".into(),
            xml_url: "https://example.com/feed".into(),
            html_url: None,
            delay_secs: None,
            timeout_secs: None,
            enabled: true,
            hub_url: None,
            push_secret: None,
            push_expires_at: None,
            last_checked_at: None,
            error_count: 0,
            last_error: None,
            items_processed: 0,
        }
    }

    #[test]
    fn test_signature_sha256() {
        let header = sign_sha256(b"secret", b"<feed/>");
        assert!(verify_signature(b"secret", &header, b"<feed/>").is_ok());
        assert!(verify_signature(b"other", &header, b"<feed/>").is_err());
        assert!(verify_signature(b"secret", &header, b"<feed>tampered</feed>").is_err());
    }

    #[test]
    fn test_signature_sha1() {
        let mut mac = Hmac::<Sha1>::new_from_slice(b"secret").unwrap();
        mac.update(b"body");
        let hex: String = mac
            .finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect();
        assert!(verify_signature(b"secret", &format!("SHA1={hex}"), b"body").is_ok());
    }

    #[test]
    fn test_signature_malformed() {
        for header in ["", "sha256", "sha256=zz", "sha256=abc", "md5=00", "sha256="] {
            assert!(
                verify_signature(b"secret", header, b"body").is_err(),
                "{header:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_callback_url() {
        let public = Url::parse("https://relay.example.com/").unwrap();
        assert_eq!(callback_url(&public, 42), "https://relay.example.com/v1/pshb/42");
        let nested = Url::parse("https://example.com/relay").unwrap();
        assert_eq!(callback_url(&nested, 1), "https://example.com/relay/v1/pshb/1");
    }

    #[test]
    fn test_needs_subscription() {
        let hub = "https://hub.example.com/";
        let now = 1_000_000;
        let lease = 86_400;
        assert!(needs_subscription(&feed(), hub, now, lease));

        let pending = FeedSource {
            hub_url: Some(hub.into()),
            push_secret: Some("s".into()),
            ..feed()
        };
        assert!(!needs_subscription(&pending, hub, now, lease));
        assert!(needs_subscription(&pending, "https://other-hub.example.com/", now, lease));

        let active = FeedSource {
            push_expires_at: Some(now + lease),
            ..pending.clone()
        };
        assert!(!needs_subscription(&active, hub, now, lease));

        let expiring = FeedSource {
            push_expires_at: Some(now + 100),
            ..pending
        };
        assert!(needs_subscription(&expiring, hub, now, lease));
    }

    #[test]
    fn test_push_covers_until_renewal_margin() {
        let now = 1_000_000;
        let lease = 86_400;
        let leased = |left: i64| FeedSource {
            hub_url: Some("https://hub.example.com/".into()),
            push_secret: Some("s".into()),
            push_expires_at: Some(now + left),
            ..feed()
        };

        assert!(push_covers(&leased(lease), now, lease));
        assert!(push_covers(&leased(renew_margin(lease) + 1), now, lease));
        // Inside the margin the loop polls again so the lease gets renewed
        assert!(!push_covers(&leased(renew_margin(lease)), now, lease));
        assert!(!push_covers(&leased(30), now, lease));
        assert!(!push_covers(&leased(-5), now, lease));
        assert!(!push_covers(&feed(), now, lease));
        assert_eq!(renew_margin(300), MIN_RENEW_MARGIN_SECS);
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(PushError::NotAccepting(AggregatorState::Draining).status_code(), 503);
        assert_eq!(PushError::InvalidSignature.status_code(), 403);
        assert_eq!(PushError::TopicMismatch.status_code(), 404);
        assert_eq!(PushError::MissingChallenge.status_code(), 400);
    }
}
