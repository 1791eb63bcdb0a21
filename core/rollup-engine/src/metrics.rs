//! FILENAME: core/rollup-engine/src/metrics.rs
//! Metrics Aggregator - reduces a row group into one metrics record.
//!
//! Single pass over the group:
//! - Ad measures are summed
//! - CRM rows fall into exactly one of subscription / upsell / one-time-sale
//! - Customers are counted through sets so repeat rows do not inflate them
//! - Attached (matched) CRM counts are summed like any other measure
//!
//! Ratios are derived after the pass and are 0 whenever the denominator is 0.
//! The aggregator is pure: unknown record kinds are skipped without logging.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::definition::{AdMeasures, CrmFacts, FlatRecord, Measures, RecordKind};

/// Every metric name accepted by `MetricsRecord::value`.
pub const METRIC_NAMES: &[&str] = &[
    "cost",
    "clicks",
    "impressions",
    "conversions",
    "customers",
    "new_customers",
    "subscriptions",
    "trials",
    "approved",
    "on_hold",
    "deleted",
    "upsells",
    "one_time_sales",
    "ctr",
    "cpc",
    "cpm",
    "conversion_rate",
    "approval_rate",
    "trial_rate",
    "upsell_rate",
    "cost_per_subscription",
];

// ============================================================================
// CRM COUNTS
// ============================================================================

/// CRM counts of a row group. Stored as f64 because matched counts may be
/// fractional after proportional distribution; rounding happens at display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CrmCounts {
    pub customers: f64,
    pub new_customers: f64,
    pub subscriptions: f64,
    pub trials: f64,
    pub approved: f64,
    pub on_hold: f64,
    pub deleted: f64,
    pub upsells: f64,
    pub one_time_sales: f64,
}

impl CrmCounts {
    pub fn add(&mut self, other: &CrmCounts) {
        self.customers += other.customers;
        self.new_customers += other.new_customers;
        self.subscriptions += other.subscriptions;
        self.trials += other.trials;
        self.approved += other.approved;
        self.on_hold += other.on_hold;
        self.deleted += other.deleted;
        self.upsells += other.upsells;
        self.one_time_sales += other.one_time_sales;
    }

    /// Every count multiplied by `factor` (proportional share).
    pub fn scaled(&self, factor: f64) -> CrmCounts {
        CrmCounts {
            customers: self.customers * factor,
            new_customers: self.new_customers * factor,
            subscriptions: self.subscriptions * factor,
            trials: self.trials * factor,
            approved: self.approved * factor,
            on_hold: self.on_hold * factor,
            deleted: self.deleted * factor,
            upsells: self.upsells * factor,
            one_time_sales: self.one_time_sales * factor,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == CrmCounts::default()
    }
}

// ============================================================================
// METRICS RECORD
// ============================================================================

/// Derived aggregate of one node's full row group.
/// Always produced whole by `aggregate` or `from_parts`, never patched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub cost: f64,
    pub clicks: f64,
    pub impressions: f64,
    pub conversions: f64,

    #[serde(flatten)]
    pub crm: CrmCounts,

    /// clicks / impressions
    pub ctr: f64,
    /// cost / clicks
    pub cpc: f64,
    /// cost per thousand impressions
    pub cpm: f64,
    /// conversions / clicks
    pub conversion_rate: f64,
    /// approved / subscriptions
    pub approval_rate: f64,
    /// trials / subscriptions
    pub trial_rate: f64,
    /// upsells / customers
    pub upsell_rate: f64,
    /// cost / subscriptions
    pub cost_per_subscription: f64,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

impl MetricsRecord {
    /// Builds a record from summed measures and counts, deriving every ratio.
    pub fn from_parts(ad: AdMeasures, crm: CrmCounts) -> Self {
        MetricsRecord {
            cost: ad.cost,
            clicks: ad.clicks,
            impressions: ad.impressions,
            conversions: ad.conversions,
            crm,
            ctr: ratio(ad.clicks, ad.impressions),
            cpc: ratio(ad.cost, ad.clicks),
            cpm: ratio(ad.cost * 1000.0, ad.impressions),
            conversion_rate: ratio(ad.conversions, ad.clicks),
            approval_rate: ratio(crm.approved, crm.subscriptions),
            trial_rate: ratio(crm.trials, crm.subscriptions),
            upsell_rate: ratio(crm.upsells, crm.customers),
            cost_per_subscription: ratio(ad.cost, crm.subscriptions),
        }
    }

    pub fn ad_totals(&self) -> AdMeasures {
        AdMeasures::new(self.cost, self.clicks, self.impressions, self.conversions)
    }

    /// Same ad totals with `crm` swapped in; ratios are re-derived.
    pub fn with_crm(&self, crm: CrmCounts) -> Self {
        MetricsRecord::from_parts(self.ad_totals(), crm)
    }

    pub fn subscriptions(&self) -> f64 {
        self.crm.subscriptions
    }

    pub fn trials(&self) -> f64 {
        self.crm.trials
    }

    /// Looks a metric up by its snake_case name.
    pub fn value(&self, name: &str) -> Option<f64> {
        let v = match name {
            "cost" => self.cost,
            "clicks" => self.clicks,
            "impressions" => self.impressions,
            "conversions" => self.conversions,
            "customers" => self.crm.customers,
            "new_customers" => self.crm.new_customers,
            "subscriptions" => self.crm.subscriptions,
            "trials" => self.crm.trials,
            "approved" => self.crm.approved,
            "on_hold" => self.crm.on_hold,
            "deleted" => self.crm.deleted,
            "upsells" => self.crm.upsells,
            "one_time_sales" => self.crm.one_time_sales,
            "ctr" => self.ctr,
            "cpc" => self.cpc,
            "cpm" => self.cpm,
            "conversion_rate" => self.conversion_rate,
            "approval_rate" => self.approval_rate,
            "trial_rate" => self.trial_rate,
            "upsell_rate" => self.upsell_rate,
            "cost_per_subscription" => self.cost_per_subscription,
            _ => return None,
        };
        Some(v)
    }

    /// Display copy: counts rounded to whole numbers, money and ratios to
    /// four decimals. Only for presentation; never feed it back into sums.
    pub fn rounded(&self) -> Self {
        let r4 = |v: f64| (v * 10_000.0).round() / 10_000.0;
        let c = &self.crm;
        MetricsRecord {
            cost: r4(self.cost),
            clicks: self.clicks.round(),
            impressions: self.impressions.round(),
            conversions: self.conversions.round(),
            crm: CrmCounts {
                customers: c.customers.round(),
                new_customers: c.new_customers.round(),
                subscriptions: c.subscriptions.round(),
                trials: c.trials.round(),
                approved: c.approved.round(),
                on_hold: c.on_hold.round(),
                deleted: c.deleted.round(),
                upsells: c.upsells.round(),
                one_time_sales: c.one_time_sales.round(),
            },
            ctr: r4(self.ctr),
            cpc: r4(self.cpc),
            cpm: r4(self.cpm),
            conversion_rate: r4(self.conversion_rate),
            approval_rate: r4(self.approval_rate),
            trial_rate: r4(self.trial_rate),
            upsell_rate: r4(self.upsell_rate),
            cost_per_subscription: r4(self.cost_per_subscription),
        }
    }
}

// ============================================================================
// ACCUMULATOR
// ============================================================================

/// Incremental state for one row group. Borrows customer ids from the rows.
#[derive(Debug, Default)]
pub struct MetricsAccumulator<'a> {
    ad: AdMeasures,
    counts: CrmCounts,
    attached: CrmCounts,
    customers: FxHashSet<&'a str>,
    new_customers: FxHashSet<&'a str>,
}

impl<'a> MetricsAccumulator<'a> {
    pub fn new() -> Self {
        MetricsAccumulator::default()
    }

    pub fn add(&mut self, record: &'a FlatRecord) {
        match &record.base {
            Measures::Ad(ad) => self.ad.add(ad),
            Measures::Crm(facts) => self.add_crm(facts),
        }
        if let Some(attached) = &record.attached {
            self.attached.add(attached);
        }
    }

    fn add_crm(&mut self, facts: &'a CrmFacts) {
        // Buckets are mutually exclusive: a row lands in exactly one of
        // subscriptions, upsells or one_time_sales.
        match facts.kind {
            RecordKind::Subscription if facts.is_upsell => self.counts.upsells += 1.0,
            RecordKind::Subscription => {
                self.counts.subscriptions += 1.0;
                if facts.is_trial {
                    self.counts.trials += 1.0;
                }
                if facts.is_approved {
                    self.counts.approved += 1.0;
                }
                if facts.is_on_hold {
                    self.counts.on_hold += 1.0;
                }
                if facts.is_deleted {
                    self.counts.deleted += 1.0;
                }
            }
            RecordKind::Upsell => self.counts.upsells += 1.0,
            RecordKind::OneTimeSale => self.counts.one_time_sales += 1.0,
            RecordKind::Other => return,
        }

        self.customers.insert(facts.customer_id.as_str());
        if facts.is_new_customer {
            self.new_customers.insert(facts.customer_id.as_str());
        }
    }

    pub fn finish(self) -> MetricsRecord {
        let mut crm = self.counts;
        crm.customers = self.customers.len() as f64;
        crm.new_customers = self.new_customers.len() as f64;
        crm.add(&self.attached);
        MetricsRecord::from_parts(self.ad, crm)
    }
}

/// Reduces a row group into one metrics record.
pub fn aggregate<'a, I>(group: I) -> MetricsRecord
where
    I: IntoIterator<Item = &'a FlatRecord>,
{
    let mut acc = MetricsAccumulator::new();
    for record in group {
        acc.add(record);
    }
    acc.finish()
}
