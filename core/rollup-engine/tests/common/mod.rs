//! FILENAME: tests/common/mod.rs
//! Fixtures and assertion helpers for rollup-engine integration tests.

#![allow(dead_code)]

use rollup_engine::{AdMeasures, CrmFacts, Dimensions, FlatRecord, RecordKind, TreeNode};

// ============================================================================
// FIXTURES
// ============================================================================

/// Ad-spend export: (network, campaign, country, date, cost, clicks, impressions).
pub struct AdSpendFixture;

impl AdSpendFixture {
    pub fn data() -> Vec<(&'static str, &'static str, &'static str, &'static str, f64, f64, f64)> {
        vec![
            ("Facebook", "spring", "NO", "2024-03-01", 120.0, 60.0, 3000.0),
            ("Facebook", "spring", "SE", "2024-03-01", 40.0, 20.0, 1000.0),
            ("Facebook", "spring", "NO", "2024-03-02", 80.0, 30.0, 2000.0),
            ("Google", "brand", "NO", "2024-03-01", 200.0, 100.0, 5000.0),
            ("Google", "brand", "DK", "2024-03-02", 50.0, 10.0, 0.0),
            ("TikTok", "teens", "SE", "2024-03-02", 10.0, 5.0, 800.0),
        ]
    }

    pub fn rows() -> Vec<FlatRecord> {
        Self::data()
            .into_iter()
            .map(|(network, campaign, country, date, cost, clicks, impressions)| {
                FlatRecord::ad(
                    Dimensions::new()
                        .with("network", network)
                        .with("campaign", campaign)
                        .with("country", country)
                        .with("date", date),
                    AdMeasures::new(cost, clicks, impressions, 0.0),
                )
            })
            .collect()
    }
}

/// CRM export in its own vocabulary: (source, tracking_campaign, created_at, customer, kind, trial).
pub struct CrmFixture;

impl CrmFixture {
    pub fn data() -> Vec<(&'static str, &'static str, &'static str, &'static str, RecordKind, bool)> {
        vec![
            ("facebook", "spring", "2024-03-01 10:00:00", "c1", RecordKind::Subscription, true),
            ("facebook", "spring", "2024-03-01 11:00:00", "c2", RecordKind::Subscription, true),
            ("facebook", "spring", "2024-03-01 12:00:00", "c3", RecordKind::Subscription, false),
            ("facebook", "spring", "2024-03-01 12:30:00", "c3", RecordKind::Upsell, false),
            ("facebook", "spring", "2024-03-02 09:00:00", "c4", RecordKind::Subscription, true),
            ("adwords", "brand", "2024-03-01 08:00:00", "c5", RecordKind::OneTimeSale, false),
            ("adwords", "brand", "2024-03-02 08:00:00", "c6", RecordKind::Subscription, true),
        ]
    }

    pub fn rows() -> Vec<FlatRecord> {
        Self::data()
            .into_iter()
            .map(|(source, campaign, created_at, customer, kind, trial)| {
                let mut facts = CrmFacts::new(customer, kind);
                if trial {
                    facts = facts.trial();
                }
                FlatRecord::crm(
                    Dimensions::new()
                        .with("source", source)
                        .with("tracking_campaign", campaign)
                        .with("created_at", created_at),
                    facts,
                )
            })
            .collect()
    }
}

pub fn dims(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// ASSERTION HELPERS
// ============================================================================

pub fn assert_close(actual: f64, expected: f64, what: &str) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "{} expected {} but got {}",
        what,
        expected,
        actual
    );
}

/// Walks every materialized node.
pub fn for_each_node(nodes: &[TreeNode], f: &mut dyn FnMut(&TreeNode)) {
    for node in nodes {
        f(node);
        if let Some(children) = &node.children {
            for_each_node(children, f);
        }
    }
}
