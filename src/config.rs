//! Configuration file parser for `feedrelay.toml`.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos.
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::aggregator::AggregatorSettings;
use crate::model::{FilterDef, NewFeed, OutputDef, Props};
use crate::util::NetworkPolicy;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level daemon configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// The Debug impl masks output props, which routinely carry tokens.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP endpoint binds to.
    pub listen_addr: String,

    /// Externally reachable base URL. Push subscriptions are only requested
    /// (and the callback endpoint only mounted) when this is set.
    pub public_url: Option<String>,

    pub database_path: String,

    /// Default tracing filter when `RUST_LOG` is not set.
    pub log_level: String,

    /// Default poll period for feeds without their own delay.
    pub poll_delay_secs: u64,

    /// Default fetch timeout for feeds without their own timeout.
    pub fetch_timeout_secs: u64,

    /// Upper bound on a single delivery to an output.
    pub send_timeout_secs: u64,

    /// How long a seen article fingerprint suppresses re-delivery.
    pub cache_retention_hours: u64,

    pub shutdown_timeout_secs: u64,

    /// Lease requested from push hubs.
    pub push_lease_secs: u64,

    /// Allow feeds, hubs and outputs on loopback or private addresses.
    pub allow_private_networks: bool,

    /// Built-in plugins to register; empty registers all of them.
    pub plugins: Vec<String>,

    pub feeds: Vec<NewFeed>,
    pub outputs: Vec<OutputSeed>,
    pub filters: Vec<FilterSeed>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            public_url: None,
            database_path: "feedrelay.db".to_string(),
            log_level: "info".to_string(),
            poll_delay_secs: 60,
            fetch_timeout_secs: 5,
            send_timeout_secs: 30,
            cache_retention_hours: 72,
            shutdown_timeout_secs: 10,
            push_lease_secs: 86_400,
            allow_private_networks: false,
            plugins: Vec::new(),
            feeds: Vec::new(),
            outputs: Vec::new(),
            filters: Vec::new(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("listen_addr", &self.listen_addr)
            .field("public_url", &self.public_url)
            .field("database_path", &self.database_path)
            .field("log_level", &self.log_level)
            .field("poll_delay_secs", &self.poll_delay_secs)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("send_timeout_secs", &self.send_timeout_secs)
            .field("cache_retention_hours", &self.cache_retention_hours)
            .field("shutdown_timeout_secs", &self.shutdown_timeout_secs)
            .field("push_lease_secs", &self.push_lease_secs)
            .field("allow_private_networks", &self.allow_private_networks)
            .field("plugins", &self.plugins)
            .field("feeds", &self.feeds)
            .field("outputs", &self.outputs)
            .field("filters", &self.filters)
            .finish()
    }
}

/// `[[outputs]]` entry seeded into storage on first start.
#[derive(Clone, Deserialize)]
pub struct OutputSeed {
    pub alias: String,
    pub plugin: String,
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub props: Props,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl OutputSeed {
    pub fn to_def(&self) -> OutputDef {
        OutputDef {
            condition: self.condition.clone(),
            props: self.props.clone(),
            enabled: self.enabled,
            ..OutputDef::new(&self.alias, &self.plugin)
        }
    }
}

impl fmt::Debug for OutputSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let props: Vec<(&str, &str)> = self.props.keys().map(|k| (k, "[REDACTED]")).collect();
        f.debug_struct("OutputSeed")
            .field("alias", &self.alias)
            .field("plugin", &self.plugin)
            .field("condition", &self.condition)
            .field("props", &props)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// `[[filters]]` entry seeded into storage on first start.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterSeed {
    pub alias: String,
    pub plugin: String,
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub props: Props,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl FilterSeed {
    pub fn to_def(&self) -> FilterDef {
        FilterDef {
            condition: self.condition.clone(),
            props: self.props.clone(),
            enabled: self.enabled,
            ..FilterDef::new(&self.alias, &self.plugin)
        }
    }
}

fn enabled_by_default() -> bool {
    true
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 15] = [
        "listen_addr",
        "public_url",
        "database_path",
        "log_level",
        "poll_delay_secs",
        "fetch_timeout_secs",
        "send_timeout_secs",
        "cache_retention_hours",
        "shutdown_timeout_secs",
        "push_lease_secs",
        "allow_private_networks",
        "plugins",
        "feeds",
        "outputs",
        "filters",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check size before reading to avoid slurping a huge file
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        let config = Self::parse(&content)?;
        tracing::info!(
            path = %path.display(),
            feeds = config.feeds.len(),
            outputs = config.outputs.len(),
            filters = config.filters.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_socket()?;
        self.public_url()?;
        for (key, value) in [
            ("poll_delay_secs", self.poll_delay_secs),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
            ("send_timeout_secs", self.send_timeout_secs),
            ("cache_retention_hours", self.cache_retention_hours),
            ("push_lease_secs", self.push_lease_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be greater than 0")));
            }
        }
        Ok(())
    }

    pub fn listen_socket(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("listen_addr {:?}: {e}", self.listen_addr)))
    }

    pub fn public_url(&self) -> Result<Option<Url>, ConfigError> {
        let Some(raw) = self.public_url.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let url =
            Url::parse(raw).map_err(|e| ConfigError::Invalid(format!("public_url {raw:?}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "public_url must be http or https, got {}",
                url.scheme()
            )));
        }
        Ok(Some(url))
    }

    pub fn network_policy(&self) -> NetworkPolicy {
        NetworkPolicy::from_allow_private(self.allow_private_networks)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn cache_retention(&self) -> Duration {
        Duration::from_secs(self.cache_retention_hours.saturating_mul(3600))
    }

    pub fn aggregator_settings(&self) -> Result<AggregatorSettings, ConfigError> {
        Ok(AggregatorSettings {
            default_delay: Duration::from_secs(self.poll_delay_secs),
            default_timeout: Duration::from_secs(self.fetch_timeout_secs),
            public_url: self.public_url()?,
            push_lease: Duration::from_secs(self.push_lease_secs),
            network_policy: self.network_policy(),
            ..AggregatorSettings::default()
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
