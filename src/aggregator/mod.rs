//! Feed scheduling and push ingestion.
//!
//! The [`AggregatorManager`] runs one sequential poll loop per enabled feed,
//! answers push-hub callbacks, and feeds every new entry through
//! dedup → filter chain → output dispatch.

mod manager;
mod push;

pub use manager::{AggregatorManager, IngestSummary};
pub use push::{PushError, VerifyRequest};

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::util::NetworkPolicy;

/// Lifecycle of the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Stopped,
    Running,
    Draining,
}

impl fmt::Display for AggregatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregatorState::Stopped => "stopped",
            AggregatorState::Running => "running",
            AggregatorState::Draining => "draining",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("Operation not allowed while {0}")]
    InvalidState(AggregatorState),
    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
    #[error("Feed {0} not found")]
    FeedNotFound(i64),
    #[error("Invalid feed: {0}")]
    InvalidFeed(String),
    #[error("Database error: {0}")]
    Database(String),
}

/// Scheduling defaults and push settings.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub default_delay: Duration,
    pub default_timeout: Duration,
    /// Externally reachable base URL; push subscriptions need one
    pub public_url: Option<Url>,
    pub push_lease: Duration,
    pub prune_interval: Duration,
    pub network_policy: NetworkPolicy,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            default_delay: Duration::from_secs(60),
            default_timeout: Duration::from_secs(5),
            public_url: None,
            push_lease: Duration::from_secs(86_400),
            prune_interval: Duration::from_secs(3600),
            network_policy: NetworkPolicy::PublicOnly,
        }
    }
}
