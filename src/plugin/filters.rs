use chrono::Utc;
use std::sync::Arc;

use super::{FilterPlugin, FilterProvider, PluginError};
use crate::model::{Article, FilterDef, PluginKind, PluginSpec, PropSpec, PropType};

// ============================================================================
// condition
// ============================================================================

/// Stage whose predicate is entirely its condition expression.
pub struct ConditionFilterPlugin;

impl FilterPlugin for ConditionFilterPlugin {
    fn spec(&self) -> PluginSpec {
        PluginSpec {
            name: "condition",
            desc: "Keep articles matching the stage condition",
            kind: PluginKind::Filter,
            props: vec![],
        }
    }

    fn build(&self, def: &FilterDef) -> Result<Arc<dyn FilterProvider>, PluginError> {
        Ok(Arc::new(ConditionFilter { def: def.clone() }))
    }
}

struct ConditionFilter {
    def: FilterDef,
}

impl FilterProvider for ConditionFilter {
    fn matches(&self, _article: &Article) -> bool {
        true
    }

    fn def(&self) -> &FilterDef {
        &self.def
    }
}

// ============================================================================
// interest
// ============================================================================

/// Keeps articles whose title or summary mentions one of the keywords.
pub struct InterestFilterPlugin;

impl FilterPlugin for InterestFilterPlugin {
    fn spec(&self) -> PluginSpec {
        PluginSpec {
            name: "interest",
            desc: "Keep articles mentioning any of the keywords",
            kind: PluginKind::Filter,
            props: vec![PropSpec {
                name: "keywords",
                desc: "Comma-separated keywords (case-insensitive)",
                kind: PropType::Text,
                required: true,
            }],
        }
    }

    fn build(&self, def: &FilterDef) -> Result<Arc<dyn FilterProvider>, PluginError> {
        let keywords: Vec<String> = def
            .props
            .get("keywords")
            .unwrap_or_default()
            .split(',')
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return Err(PluginError::MissingProperty("keywords".into()));
        }
        Ok(Arc::new(InterestFilter {
            def: def.clone(),
            keywords,
        }))
    }
}

struct InterestFilter {
    def: FilterDef,
    keywords: Vec<String>,
}

impl FilterProvider for InterestFilter {
    fn matches(&self, article: &Article) -> bool {
        let title = article.title.to_lowercase();
        let summary = article
            .summary
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_default();
        self.keywords
            .iter()
            .any(|k| title.contains(k.as_str()) || summary.contains(k.as_str()))
    }

    fn def(&self) -> &FilterDef {
        &self.def
    }
}

// ============================================================================
// age
// ============================================================================

/// Drops articles published longer ago than a limit.
pub struct AgeFilterPlugin;

impl FilterPlugin for AgeFilterPlugin {
    fn spec(&self) -> PluginSpec {
        PluginSpec {
            name: "age",
            desc: "Drop articles older than a maximum age",
            kind: PluginKind::Filter,
            props: vec![PropSpec {
                name: "maxAgeHours",
                desc: "Maximum article age in hours",
                kind: PropType::Number,
                required: true,
            }],
        }
    }

    fn build(&self, def: &FilterDef) -> Result<Arc<dyn FilterProvider>, PluginError> {
        let hours = def
            .props
            .get("maxAgeHours")
            .ok_or_else(|| PluginError::MissingProperty("maxAgeHours".into()))?
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|h| h.is_finite() && *h > 0.0)
            .ok_or_else(|| PluginError::invalid("maxAgeHours", "must be a positive number"))?;
        Ok(Arc::new(AgeFilter {
            def: def.clone(),
            max_age: chrono::Duration::seconds((hours * 3600.0) as i64),
        }))
    }
}

struct AgeFilter {
    def: FilterDef,
    max_age: chrono::Duration,
}

impl FilterProvider for AgeFilter {
    fn matches(&self, article: &Article) -> bool {
        match article.published {
            Some(published) => Utc::now() - published <= self.max_age,
            None => true,
        }
    }

    fn def(&self) -> &FilterDef {
        &self.def
    }
}
