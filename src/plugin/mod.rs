//! Statically linked provider plugins.
//!
//! A plugin is a factory keyed by name: it describes its configurable props
//! with a [`PluginSpec`] and builds a provider from a stored definition. The
//! [`PluginRegistry`] is populated once at startup and then shared read-only.

mod filters;
mod stdout;
mod timeline;
mod webhook;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::format::{FormatError, Formatter};
use crate::model::{Article, FilterDef, OutputDef, PluginSpec, PropSpec, PropType, Props};
use crate::util::NetworkPolicy;

pub use filters::{AgeFilterPlugin, ConditionFilterPlugin, InterestFilterPlugin};
pub use stdout::StdoutPlugin;
pub use timeline::{TimelineApiError, TimelinePlugin, DUPLICATE_STATUS_CODE};
pub use webhook::WebhookPlugin;

// ============================================================================
// Errors
// ============================================================================

/// Configuration-time errors: raised while registering plugins or building
/// providers from definitions.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PluginError {
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),
    #[error("Plugin already registered: {0}")]
    Duplicate(String),
    #[error("Missing required property: {0}")]
    MissingProperty(String),
    #[error("Invalid property '{name}': {reason}")]
    InvalidProperty { name: String, reason: String },
}

impl PluginError {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        PluginError::InvalidProperty {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Runtime delivery errors returned by [`OutputProvider::send`].
#[derive(Debug, Error)]
pub enum SendError {
    /// The destination already holds this content; not a failure
    #[error("Duplicate submission rejected by destination")]
    DuplicateSubmission,
    #[error("Format error: {0}")]
    Format(#[from] FormatError),
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("{0}")]
    Api(TimelineApiError),
    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Provider Contracts
// ============================================================================

/// A live delivery destination built from an [`OutputDef`].
#[async_trait]
pub trait OutputProvider: Send + Sync {
    async fn send(&self, article: &Article) -> Result<(), SendError>;

    /// Definition this provider was built from
    fn def(&self) -> &OutputDef;
}

pub trait OutputPlugin: Send + Sync {
    fn spec(&self) -> PluginSpec;

    /// Build a provider. Props have already been validated against `spec()`.
    fn build(&self, def: &OutputDef) -> Result<Arc<dyn OutputProvider>, PluginError>;
}

/// A filter stage predicate built from a [`FilterDef`].
pub trait FilterProvider: Send + Sync {
    fn matches(&self, article: &Article) -> bool;

    fn def(&self) -> &FilterDef;
}

pub trait FilterPlugin: Send + Sync {
    fn spec(&self) -> PluginSpec;

    fn build(&self, def: &FilterDef) -> Result<Arc<dyn FilterProvider>, PluginError>;
}

// ============================================================================
// Registry
// ============================================================================

pub const BUILTIN_OUTPUTS: [&str; 3] = ["stdout", "http", "timeline"];
pub const BUILTIN_FILTERS: [&str; 3] = ["condition", "interest", "age"];

#[derive(Default, Clone)]
pub struct PluginRegistry {
    outputs: BTreeMap<String, Arc<dyn OutputPlugin>>,
    filters: BTreeMap<String, Arc<dyn FilterPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in plugins named in `enabled` (all of them when
    /// `enabled` is empty). HTTP-based outputs share `client` and check their
    /// target URLs against `policy`.
    pub fn with_builtins(enabled: &[String], client: reqwest::Client, policy: NetworkPolicy) -> Self {
        let wanted = |name: &str| enabled.is_empty() || enabled.iter().any(|e| e == name);

        for name in enabled {
            if !BUILTIN_OUTPUTS.contains(&name.as_str()) && !BUILTIN_FILTERS.contains(&name.as_str())
            {
                tracing::warn!(plugin = %name, "Unknown built-in plugin in configuration, ignoring");
            }
        }

        let mut registry = Self::new();
        let outputs: [Arc<dyn OutputPlugin>; 3] = [
            Arc::new(StdoutPlugin),
            Arc::new(WebhookPlugin::new(client.clone(), policy)),
            Arc::new(TimelinePlugin::new(client, policy)),
        ];
        for plugin in outputs {
            if wanted(plugin.spec().name) {
                registry.outputs.insert(plugin.spec().name.to_string(), plugin);
            }
        }
        let filters: [Arc<dyn FilterPlugin>; 3] = [
            Arc::new(ConditionFilterPlugin),
            Arc::new(InterestFilterPlugin),
            Arc::new(AgeFilterPlugin),
        ];
        for plugin in filters {
            if wanted(plugin.spec().name) {
                registry.filters.insert(plugin.spec().name.to_string(), plugin);
            }
        }
        registry
    }

    pub fn register_output(&mut self, plugin: Arc<dyn OutputPlugin>) -> Result<(), PluginError> {
        let name = plugin.spec().name.to_string();
        if self.outputs.contains_key(&name) {
            return Err(PluginError::Duplicate(name));
        }
        self.outputs.insert(name, plugin);
        Ok(())
    }

    pub fn register_filter(&mut self, plugin: Arc<dyn FilterPlugin>) -> Result<(), PluginError> {
        let name = plugin.spec().name.to_string();
        if self.filters.contains_key(&name) {
            return Err(PluginError::Duplicate(name));
        }
        self.filters.insert(name, plugin);
        Ok(())
    }

    /// Output plugin specs ordered by name
    pub fn output_specs(&self) -> Vec<PluginSpec> {
        self.outputs.values().map(|p| p.spec()).collect()
    }

    pub fn filter_specs(&self) -> Vec<PluginSpec> {
        self.filters.values().map(|p| p.spec()).collect()
    }

    pub fn build_output(&self, def: &OutputDef) -> Result<Arc<dyn OutputProvider>, PluginError> {
        let plugin = self
            .outputs
            .get(&def.plugin)
            .ok_or_else(|| PluginError::UnknownPlugin(def.plugin.clone()))?;
        validate_props(&plugin.spec(), &def.props)?;
        plugin.build(def)
    }

    pub fn build_filter(&self, def: &FilterDef) -> Result<Arc<dyn FilterProvider>, PluginError> {
        let plugin = self
            .filters
            .get(&def.plugin)
            .ok_or_else(|| PluginError::UnknownPlugin(def.plugin.clone()))?;
        validate_props(&plugin.spec(), &def.props)?;
        plugin.build(def)
    }
}

/// Check props against a spec: required props present and non-blank, typed
/// props parseable. Undeclared props are ignored.
pub fn validate_props(spec: &PluginSpec, props: &Props) -> Result<(), PluginError> {
    for prop in &spec.props {
        let Some(value) = props.get(prop.name) else {
            if prop.required {
                return Err(PluginError::MissingProperty(prop.name.to_string()));
            }
            continue;
        };
        match prop.kind {
            PropType::Url => {
                let url = url::Url::parse(value).map_err(|e| PluginError::invalid(prop.name, e.to_string()))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(PluginError::invalid(
                        prop.name,
                        format!("unsupported scheme '{}'", url.scheme()),
                    ));
                }
            }
            PropType::Number => {
                value
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| PluginError::invalid(prop.name, format!("'{value}' is not a number")))?;
            }
            PropType::Text | PropType::Password | PropType::Textarea => {}
        }
    }
    Ok(())
}

// ============================================================================
// Shared helpers for output plugins
// ============================================================================

/// Optional message template accepted by every built-in output.
pub(crate) const FORMAT_PROP: PropSpec = PropSpec {
    name: "format",
    desc: "Message template, e.g. \"{title}\\n{link}\"",
    kind: PropType::Textarea,
    required: false,
};

pub(crate) fn build_formatter(props: &Props) -> Result<Formatter, PluginError> {
    Formatter::build(props.get(FORMAT_PROP.name))
        .map_err(|e| PluginError::invalid(FORMAT_PROP.name, e.to_string()))
}
