//! FILENAME: core/rollup-engine/src/config.rs
//! Rollup configuration.
//!
//! Everything here deserializes from JSON with per-field defaults, so an
//! empty object `{}` yields the stock ad-spend/CRM setup.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::definition::{SortDirection, SortDirective, WeightMeasure};
use crate::error::RollupError;

/// Network names as they appear in ad-spend exports, mapped to the tracking
/// source the CRM records. Keys are lower-case.
static DEFAULT_NETWORK_SOURCES: Lazy<FxHashMap<String, String>> = Lazy::new(|| {
    [
        ("facebook", "facebook"),
        ("meta", "facebook"),
        ("instagram", "facebook"),
        ("google", "adwords"),
        ("google ads", "adwords"),
        ("youtube", "adwords"),
        ("tiktok", "tiktok"),
        ("snapchat", "snapchat"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
});

// ============================================================================
// MATCH RULES
// ============================================================================

/// How a value is brought into the shared join vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalizer {
    #[default]
    Verbatim,
    /// Network name → tracking source (via `network_sources`).
    Network,
    /// Any supported date convention → ISO date.
    Date,
}

/// One matchable dimension: the primary dimension name and the field that
/// carries the same information in the secondary dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRule {
    pub dimension: String,
    pub secondary_field: String,
    #[serde(default)]
    pub normalizer: Normalizer,
}

impl MatchRule {
    pub fn new(dimension: &str, secondary_field: &str, normalizer: Normalizer) -> Self {
        MatchRule {
            dimension: dimension.to_string(),
            secondary_field: secondary_field.to_string(),
            normalizer,
        }
    }
}

fn default_match_rules() -> Vec<MatchRule> {
    vec![
        MatchRule::new("network", "source", Normalizer::Network),
        MatchRule::new("campaign", "tracking_campaign", Normalizer::Verbatim),
        MatchRule::new("adset", "tracking_adset", Normalizer::Verbatim),
        MatchRule::new("ad", "tracking_ad", Normalizer::Verbatim),
        MatchRule::new("date", "created_at", Normalizer::Date),
    ]
}

// ============================================================================
// ROLLUP CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupConfig {
    /// Dimension whose levels always sort newest-first.
    #[serde(default = "default_date_dimension")]
    pub date_dimension: String,

    /// Label shown for missing dimension values.
    #[serde(default = "default_unknown_label")]
    pub unknown_label: String,

    /// Measure used to split ambiguous CRM matches.
    #[serde(default)]
    pub weight_measure: WeightMeasure,

    #[serde(default = "default_match_rules")]
    pub match_rules: Vec<MatchRule>,

    /// Extra network → source entries; merged over the built-in table.
    #[serde(default)]
    pub network_sources: FxHashMap<String, String>,

    /// Sort used when the UI has no sort column selected.
    #[serde(default = "default_sort")]
    pub default_sort: SortDirective,
}

fn default_date_dimension() -> String {
    "date".to_string()
}

fn default_unknown_label() -> String {
    "Unknown".to_string()
}

fn default_sort() -> SortDirective {
    SortDirective::metric("cost", SortDirection::Descending)
}

impl Default for RollupConfig {
    fn default() -> Self {
        RollupConfig {
            date_dimension: default_date_dimension(),
            unknown_label: default_unknown_label(),
            weight_measure: WeightMeasure::default(),
            match_rules: default_match_rules(),
            network_sources: FxHashMap::default(),
            default_sort: default_sort(),
        }
    }
}

impl RollupConfig {
    pub fn from_json(raw: &str) -> Result<Self, RollupError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn is_date_dimension(&self, dimension: &str) -> bool {
        self.date_dimension == dimension
    }

    pub fn rule_for(&self, dimension: &str) -> Option<&MatchRule> {
        self.match_rules.iter().find(|r| r.dimension == dimension)
    }

    /// Resolves a network name (or a CRM source) to its tracking source.
    /// Unlisted names are lower-cased.
    pub fn normalize_network(&self, raw: &str) -> String {
        let lowered = raw.trim().to_lowercase();
        self.network_sources
            .iter()
            .find(|(k, _)| k.to_lowercase() == lowered)
            .map(|(_, v)| v.clone())
            .or_else(|| DEFAULT_NETWORK_SOURCES.get(&lowered).cloned())
            .unwrap_or(lowered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::SortKey;

    #[test]
    fn test_empty_json_yields_defaults() {
        let config = RollupConfig::from_json("{}").unwrap();
        assert_eq!(config.date_dimension, "date");
        assert_eq!(config.unknown_label, "Unknown");
        assert_eq!(config.weight_measure, WeightMeasure::Impressions);
        assert_eq!(config.match_rules.len(), 5);
        assert_eq!(config.default_sort.key, SortKey::Metric("cost".into()));
    }

    #[test]
    fn test_partial_json_overrides() {
        let config = RollupConfig::from_json(
            r#"{"date_dimension":"day","weight_measure":"clicks","default_sort":{"key":"trials","direction":"Ascending"}}"#,
        )
        .unwrap();
        assert!(config.is_date_dimension("day"));
        assert_eq!(config.weight_measure, WeightMeasure::Clicks);
        assert_eq!(config.default_sort.key, SortKey::Metric("trials".into()));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        assert!(matches!(RollupConfig::from_json("{"), Err(RollupError::Config(_))));
    }

    #[test]
    fn test_network_normalization() {
        let mut config = RollupConfig::default();
        assert_eq!(config.normalize_network("Meta"), "facebook");
        assert_eq!(config.normalize_network(" Google Ads "), "adwords");
        assert_eq!(config.normalize_network("Bing"), "bing");

        config.network_sources.insert("Bing".to_string(), "microsoft".to_string());
        assert_eq!(config.normalize_network("bing"), "microsoft");
    }
}
