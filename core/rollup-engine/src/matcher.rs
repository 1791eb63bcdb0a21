//! FILENAME: core/rollup-engine/src/matcher.rs
//! Cross-Dataset Matcher - attaches CRM metrics onto ad-spend rows or tree
//! nodes without a shared primary key.
//!
//! Both sides are reduced to a composite join key built from the matchable
//! dimensions (network/source, campaign, ad set, ad, date), each normalized
//! into a shared vocabulary. Secondary rows are grouped by that key and
//! aggregated once.
//!
//! Exact mode: every active dimension is matchable, so a primary row and a
//! secondary group correspond 1:1 and the group's counts are copied.
//!
//! Proportional mode: some active dimension (e.g. a manually classified
//! product) has no secondary counterpart, so several primary rows can share
//! one join key. The group's counts are split by row weight / total weight
//! (impressions by default). Fractional counts are kept as-is; rounding only
//! happens at display time.

use rustc_hash::FxHashMap;

use crate::config::{MatchRule, Normalizer, RollupConfig};
use crate::definition::{parse_date, DimensionValue, FlatRecord};
use crate::key::key_segments;
use crate::metrics::{aggregate, CrmCounts};
use crate::tree::TreeNode;

/// Separates normalized values inside a join key; cannot occur in trimmed
/// dimension values coming from exports.
const JOIN_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Exact,
    Proportional,
}

// ============================================================================
// JOIN PLAN
// ============================================================================

/// The matchable subset of a dimension list, in dimension order.
struct JoinPlan<'c> {
    config: &'c RollupConfig,
    /// (position in the dimension list, rule)
    rules: Vec<(usize, &'c MatchRule)>,
    mode: MatchMode,
}

impl<'c> JoinPlan<'c> {
    fn new(config: &'c RollupConfig, dimensions: &[String]) -> Self {
        let rules: Vec<(usize, &MatchRule)> = dimensions
            .iter()
            .enumerate()
            .filter_map(|(pos, dim)| config.rule_for(dim).map(|rule| (pos, rule)))
            .collect();
        let mode = if rules.len() == dimensions.len() {
            MatchMode::Exact
        } else {
            MatchMode::Proportional
        };
        JoinPlan { config, rules, mode }
    }

    fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Brings one value into the shared vocabulary. Unknown or unparseable
    /// values cannot be joined.
    fn normalize(&self, rule: &MatchRule, value: &DimensionValue) -> Option<String> {
        let raw = value.as_known()?;
        match rule.normalizer {
            Normalizer::Verbatim => Some(raw.to_string()),
            Normalizer::Network => Some(self.config.normalize_network(raw)),
            Normalizer::Date => parse_date(raw).map(|d| d.format("%Y-%m-%d").to_string()),
        }
    }

    fn key_with<'v, F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(usize, &MatchRule) -> Option<&'v DimensionValue>,
    {
        let mut key = String::new();
        for (i, (pos, rule)) in self.rules.iter().enumerate() {
            if i > 0 {
                key.push(JOIN_SEPARATOR);
            }
            key.push_str(&self.normalize(rule, lookup(*pos, rule)?)?);
        }
        Some(key)
    }

    fn primary_key(&self, row: &FlatRecord) -> Option<String> {
        self.key_with(|_, rule| Some(row.dimension(&rule.dimension)))
    }

    fn secondary_key(&self, row: &FlatRecord) -> Option<String> {
        self.key_with(|_, rule| Some(row.dimension(&rule.secondary_field)))
    }

    /// Groups secondary rows by join key and aggregates each group once.
    fn index(&self, secondary: &[FlatRecord]) -> FxHashMap<String, CrmCounts> {
        let mut groups: FxHashMap<String, Vec<&FlatRecord>> = FxHashMap::default();
        let mut unkeyed = 0usize;
        for row in secondary {
            match self.secondary_key(row) {
                Some(key) => groups.entry(key).or_default().push(row),
                None => unkeyed += 1,
            }
        }
        if unkeyed > 0 {
            log_debug!("MATCH", "{} secondary rows have no join key", unkeyed);
        }
        groups
            .into_iter()
            .map(|(key, group)| (key, aggregate(group).crm))
            .collect()
    }
}

/// Computes the counts attached to each item given its join key and weight.
fn distribute(
    keys: &[Option<String>],
    weights: &[f64],
    index: &FxHashMap<String, CrmCounts>,
    mode: MatchMode,
) -> Vec<CrmCounts> {
    // (total weight, number of items) per join key
    let mut totals: FxHashMap<&str, (f64, usize)> = FxHashMap::default();
    for (key, weight) in keys.iter().zip(weights) {
        if let Some(key) = key {
            let entry = totals.entry(key.as_str()).or_insert((0.0, 0));
            entry.0 += weight;
            entry.1 += 1;
        }
    }

    if mode == MatchMode::Exact {
        let shared = totals
            .iter()
            .filter(|(key, (_, count))| *count > 1 && index.contains_key(**key))
            .count();
        if shared > 0 {
            log_warn!(
                "MATCH",
                "{} join keys are shared by several rows; splitting them proportionally",
                shared
            );
        }
    }

    keys.iter()
        .zip(weights)
        .map(|(key, weight)| {
            let Some(key) = key else {
                return CrmCounts::default();
            };
            let Some(counts) = index.get(key) else {
                return CrmCounts::default();
            };
            let (total, count) = totals.get(key.as_str()).copied().unwrap_or((0.0, 0));
            if mode == MatchMode::Exact && count == 1 {
                *counts
            } else if total > 0.0 {
                counts.scaled(weight / total)
            } else {
                CrmCounts::default()
            }
        })
        .collect()
}

// ============================================================================
// CROSS-DATASET MATCHER
// ============================================================================

pub struct CrossDatasetMatcher<'c> {
    plan: JoinPlan<'c>,
}

impl<'c> CrossDatasetMatcher<'c> {
    pub fn new(config: &'c RollupConfig, dimensions: &[String]) -> Self {
        CrossDatasetMatcher { plan: JoinPlan::new(config, dimensions) }
    }

    pub fn mode(&self) -> MatchMode {
        self.plan.mode
    }

    /// True when no active dimension can be joined; `attach` then returns
    /// its input unchanged.
    pub fn is_noop(&self) -> bool {
        self.plan.is_empty()
    }

    /// Returns new rows carrying the matched CRM counts under `attached`.
    /// Rows without a match carry zero counts.
    pub fn attach(&self, primary: &[FlatRecord], secondary: &[FlatRecord]) -> Vec<FlatRecord> {
        if self.is_noop() {
            log_debug!("MATCH", "no matchable dimensions, {} rows left as-is", primary.len());
            return primary.to_vec();
        }

        let index = self.plan.index(secondary);
        let weight_measure = self.plan.config.weight_measure;
        let keys: Vec<Option<String>> = primary.iter().map(|r| self.plan.primary_key(r)).collect();
        let weights: Vec<f64> = primary.iter().map(|r| r.weight(weight_measure)).collect();
        let shares = distribute(&keys, &weights, &index, self.plan.mode);

        let matched = shares.iter().filter(|c| !c.is_zero()).count();
        log_info!(
            "MATCH",
            "attached {} secondary groups onto {}/{} rows ({:?})",
            index.len(),
            matched,
            primary.len(),
            self.plan.mode
        );

        primary
            .iter()
            .zip(shares)
            .map(|(row, counts)| row.with_attached(counts))
            .collect()
    }
}

/// Attaches `secondary` onto flat `primary` rows for the active dimensions.
pub fn attach_secondary(
    primary: &[FlatRecord],
    secondary: &[FlatRecord],
    dimensions: &[String],
    config: &RollupConfig,
) -> Vec<FlatRecord> {
    CrossDatasetMatcher::new(config, dimensions).attach(primary, secondary)
}

// ============================================================================
// TREE ATTACHMENT
// ============================================================================

/// Attaches `secondary` onto an already-built tree. Each depth is matched on
/// its own path prefix; nodes at the same depth sharing a join key split the
/// group by their own weight. Attached counts are added to whatever CRM
/// counts the node already carries.
pub fn attach_to_tree(
    nodes: &[TreeNode],
    dimensions: &[String],
    secondary: &[FlatRecord],
    config: &RollupConfig,
) -> Vec<TreeNode> {
    let mut by_depth: Vec<Vec<&TreeNode>> = Vec::new();
    collect_by_depth(nodes, &mut by_depth);

    let mut attached: FxHashMap<&str, CrmCounts> = FxHashMap::default();
    for (depth, level) in by_depth.iter().enumerate() {
        if depth >= dimensions.len() {
            break;
        }
        let plan = JoinPlan::new(config, &dimensions[..=depth]);
        if plan.is_empty() {
            continue;
        }
        let index = plan.index(secondary);
        let keys: Vec<Option<String>> = level
            .iter()
            .map(|node| {
                let segments = key_segments(&node.key);
                plan.key_with(|pos, _| segments.get(pos))
            })
            .collect();
        let weights: Vec<f64> = level
            .iter()
            .map(|node| node.metrics.ad_totals().measure(config.weight_measure))
            .collect();
        for (node, counts) in level.iter().zip(distribute(&keys, &weights, &index, plan.mode)) {
            attached.insert(node.key.as_str(), counts);
        }
        log_debug!("MATCH", "depth {}: {} nodes against {} groups", depth, level.len(), index.len());
    }

    rebuild_with(nodes, &attached)
}

fn collect_by_depth<'t>(nodes: &'t [TreeNode], out: &mut Vec<Vec<&'t TreeNode>>) {
    for node in nodes {
        if out.len() <= node.depth {
            out.resize_with(node.depth + 1, Vec::new);
        }
        out[node.depth].push(node);
        if let Some(children) = &node.children {
            collect_by_depth(children, out);
        }
    }
}

fn rebuild_with(nodes: &[TreeNode], attached: &FxHashMap<&str, CrmCounts>) -> Vec<TreeNode> {
    nodes
        .iter()
        .map(|node| {
            let metrics = match attached.get(node.key.as_str()) {
                Some(extra) => {
                    let mut crm = node.metrics.crm;
                    crm.add(extra);
                    node.metrics.with_crm(crm)
                }
                None => node.metrics,
            };
            TreeNode {
                key: node.key.clone(),
                attribute: node.attribute.clone(),
                depth: node.depth,
                has_children: node.has_children,
                children: node.children.as_deref().map(|c| rebuild_with(c, attached)),
                metrics,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{AdMeasures, CrmFacts, Dimensions, RecordKind};
    use crate::tree::{build_tree, BuildMode};

    fn dims(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn ad(dimensions: Dimensions, impressions: f64) -> FlatRecord {
        FlatRecord::ad(dimensions, AdMeasures::new(impressions / 100.0, 0.0, impressions, 0.0))
    }

    /// `count` trial subscriptions tracked to `campaign` on `source`.
    fn trials(source: &str, campaign: &str, count: usize) -> Vec<FlatRecord> {
        (0..count)
            .map(|i| {
                FlatRecord::crm(
                    Dimensions::new()
                        .with("source", source)
                        .with("tracking_campaign", campaign)
                        .with("created_at", "2024-03-01T09:30:00Z"),
                    CrmFacts::new(&format!("{}-{}", campaign, i), RecordKind::Subscription).trial(),
                )
            })
            .collect()
    }

    #[test]
    fn test_exact_match_copies_group_metrics() {
        let config = RollupConfig::default();
        let d = dims(&["network", "campaign"]);
        let primary = vec![
            ad(Dimensions::new().with("network", "Meta").with("campaign", "c1"), 500.0),
            ad(Dimensions::new().with("network", "Google").with("campaign", "c2"), 200.0),
        ];
        let mut secondary = trials("facebook", "c1", 3);
        secondary.extend(trials("adwords", "c2", 1));

        let matcher = CrossDatasetMatcher::new(&config, &d);
        assert_eq!(matcher.mode(), MatchMode::Exact);
        let out = matcher.attach(&primary, &secondary);

        let expected = aggregate(&secondary[..3]).crm;
        assert_eq!(out[0].attached, Some(expected));
        assert_eq!(out[0].attached.unwrap().trials, 3.0);
        assert_eq!(out[1].attached.unwrap().trials, 1.0);
        // input untouched
        assert!(primary.iter().all(|r| r.attached.is_none()));
    }

    #[test]
    fn test_proportional_split_by_impressions() {
        let config = RollupConfig::default();
        let d = dims(&["country", "campaign"]);
        let primary = vec![
            ad(Dimensions::new().with("country", "NO").with("campaign", "c1"), 300.0),
            ad(Dimensions::new().with("country", "SE").with("campaign", "c1"), 100.0),
        ];
        let secondary = trials("facebook", "c1", 10);

        let matcher = CrossDatasetMatcher::new(&config, &d);
        assert_eq!(matcher.mode(), MatchMode::Proportional);
        let out = matcher.attach(&primary, &secondary);
        let a = out[0].attached.unwrap().trials;
        let b = out[1].attached.unwrap().trials;
        assert_eq!(a, 7.5);
        assert_eq!(b, 2.5);
        assert!((a + b - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_total_weight_distributes_nothing() {
        let config = RollupConfig::default();
        let d = dims(&["country", "campaign"]);
        let primary = vec![
            ad(Dimensions::new().with("country", "NO").with("campaign", "c1"), 0.0),
            ad(Dimensions::new().with("country", "SE").with("campaign", "c1"), 0.0),
        ];
        let out = attach_secondary(&primary, &trials("facebook", "c1", 4), &d, &config);
        assert!(out.iter().all(|r| r.attached.unwrap().is_zero()));
    }

    #[test]
    fn test_no_matchable_dimensions_is_noop() {
        let config = RollupConfig::default();
        let d = dims(&["country", "product"]);
        let primary = vec![ad(Dimensions::new().with("country", "NO"), 10.0)];
        let matcher = CrossDatasetMatcher::new(&config, &d);
        assert!(matcher.is_noop());
        let out = matcher.attach(&primary, &trials("facebook", "c1", 2));
        assert_eq!(out, primary);
    }

    #[test]
    fn test_unmatched_and_unknown_rows_get_zero_counts() {
        let config = RollupConfig::default();
        let d = dims(&["campaign"]);
        let primary = vec![
            ad(Dimensions::new().with("campaign", "c9"), 10.0),
            ad(Dimensions::new(), 10.0),
        ];
        let out = attach_secondary(&primary, &trials("facebook", "c1", 2), &d, &config);
        assert!(out.iter().all(|r| r.is_matched() && r.attached.unwrap().is_zero()));
    }

    #[test]
    fn test_exact_mode_duplicate_keys_are_split() {
        let config = RollupConfig::default();
        let d = dims(&["campaign"]);
        // Same campaign on two rows (e.g. two days folded away by the query)
        let primary = vec![
            ad(Dimensions::new().with("campaign", "c1"), 100.0),
            ad(Dimensions::new().with("campaign", "c1"), 300.0),
        ];
        let out = attach_secondary(&primary, &trials("facebook", "c1", 4), &d, &config);
        assert_eq!(out[0].attached.unwrap().trials, 1.0);
        assert_eq!(out[1].attached.unwrap().trials, 3.0);
    }

    #[test]
    fn test_date_and_network_normalization_join() {
        let config = RollupConfig::default();
        let d = dims(&["network", "date"]);
        let primary = vec![ad(
            Dimensions::new().with("network", "Instagram").with("date", "01.03.2024"),
            50.0,
        )];
        let out = attach_secondary(&primary, &trials("Facebook", "c1", 2), &d, &config);
        assert_eq!(out[0].attached.unwrap().trials, 2.0);
    }

    #[test]
    fn test_attach_to_tree_keeps_rollup_consistent() {
        let config = RollupConfig::default();
        let d = dims(&["campaign", "country"]);
        let rows = vec![
            ad(Dimensions::new().with("campaign", "c1").with("country", "NO"), 300.0),
            ad(Dimensions::new().with("campaign", "c1").with("country", "SE"), 100.0),
        ];
        let tree = build_tree(&rows, &d, BuildMode::Eager);
        let out = attach_to_tree(&tree, &d, &trials("facebook", "c1", 10), &config);

        assert_eq!(out[0].metrics.trials(), 10.0);
        let children = out[0].children.as_ref().unwrap();
        assert_eq!(children[0].metrics.trials(), 7.5);
        assert_eq!(children[1].metrics.trials(), 2.5);
        // ratios are re-derived from the new counts
        assert_eq!(children[0].metrics.cost_per_subscription, 3.0 / 7.5);
        // input untouched
        assert_eq!(tree[0].metrics.trials(), 0.0);
    }
}
