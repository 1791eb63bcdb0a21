//! FILENAME: core/rollup-engine/src/definition.rs
//! Rollup Definition - the record and request types shared by every stage.
//!
//! This module contains the types needed to DESCRIBE what flows through
//! the rollup. These structures are designed to be:
//! - Serializable (rows arrive as JSON from the query layer)
//! - Immutable once produced (stages build new records, never mutate)
//! - Explicit about missing data (`DimensionValue::Unknown` is its own variant)

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::metrics::CrmCounts;

// ============================================================================
// DIMENSIONS
// ============================================================================

/// One value of a categorical dimension.
///
/// A missing value is `Unknown`, never the string "Unknown", so a literal
/// "Unknown" in the data stays a distinct group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DimensionValue {
    Known(String),
    Unknown,
}

static UNKNOWN_VALUE: DimensionValue = DimensionValue::Unknown;

impl DimensionValue {
    /// Normalizes raw input: absent, empty or whitespace-only values become `Unknown`.
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(v) if !v.is_empty() => DimensionValue::Known(v.to_string()),
            _ => DimensionValue::Unknown,
        }
    }

    pub fn as_known(&self) -> Option<&str> {
        match self {
            DimensionValue::Known(v) => Some(v),
            DimensionValue::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, DimensionValue::Unknown)
    }

    /// Display label; `Unknown` renders as the configured sentinel label.
    pub fn label<'a>(&'a self, unknown_label: &'a str) -> &'a str {
        self.as_known().unwrap_or(unknown_label)
    }

    /// The segment this value contributes to a node key. `Unknown` is the
    /// empty segment, which normalization makes unreachable for known values.
    pub fn key_segment(&self) -> &str {
        self.as_known().unwrap_or("")
    }

    pub fn from_key_segment(segment: &str) -> Self {
        if segment.is_empty() {
            DimensionValue::Unknown
        } else {
            DimensionValue::Known(segment.to_string())
        }
    }
}

impl From<&str> for DimensionValue {
    fn from(raw: &str) -> Self {
        DimensionValue::from_raw(Some(raw))
    }
}

impl From<Option<&str>> for DimensionValue {
    fn from(raw: Option<&str>) -> Self {
        DimensionValue::from_raw(raw)
    }
}

/// Named dimension values carried by one record.
/// Records carry a handful of dimensions, so a linear scan over an inline
/// vector is cheaper than hashing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dimensions(SmallVec<[(String, DimensionValue); 8]>);

impl Dimensions {
    pub fn new() -> Self {
        Dimensions(SmallVec::new())
    }

    /// Builder-style insert of a raw (not yet normalized) value.
    pub fn with(mut self, name: &str, raw: &str) -> Self {
        self.set(name, DimensionValue::from_raw(Some(raw)));
        self
    }

    pub fn set(&mut self, name: &str, value: DimensionValue) {
        if let Some(slot) = self.0.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.0.push((name.to_string(), value));
        }
    }

    /// Returns the value for `name`; an absent dimension reads as `Unknown`.
    pub fn get(&self, name: &str) -> &DimensionValue {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .unwrap_or(&UNKNOWN_VALUE)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DimensionValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// MEASURES
// ============================================================================

/// CRM record discriminator. Kinds this build does not know deserialize as
/// `Other` and are ignored by aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RecordKind {
    Subscription,
    OneTimeSale,
    Upsell,
    Other,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Subscription => "subscription",
            RecordKind::OneTimeSale => "one_time_sale",
            RecordKind::Upsell => "upsell",
            RecordKind::Other => "other",
        }
    }
}

impl From<String> for RecordKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "subscription" => RecordKind::Subscription,
            "one_time_sale" => RecordKind::OneTimeSale,
            "upsell" => RecordKind::Upsell,
            _ => RecordKind::Other,
        }
    }
}

impl From<RecordKind> for String {
    fn from(kind: RecordKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Base measures of an ad-spend row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AdMeasures {
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub clicks: f64,
    #[serde(default)]
    pub impressions: f64,
    #[serde(default)]
    pub conversions: f64,
}

impl AdMeasures {
    pub fn new(cost: f64, clicks: f64, impressions: f64, conversions: f64) -> Self {
        AdMeasures { cost, clicks, impressions, conversions }
    }

    pub fn add(&mut self, other: &AdMeasures) {
        self.cost += other.cost;
        self.clicks += other.clicks;
        self.impressions += other.impressions;
        self.conversions += other.conversions;
    }

    pub fn measure(&self, measure: WeightMeasure) -> f64 {
        match measure {
            WeightMeasure::Impressions => self.impressions,
            WeightMeasure::Clicks => self.clicks,
            WeightMeasure::Cost => self.cost,
            WeightMeasure::Conversions => self.conversions,
        }
    }
}

/// Facts of one CRM subscription/order row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmFacts {
    pub customer_id: String,
    pub kind: RecordKind,
    /// A subscription sold on top of an existing one.
    #[serde(default)]
    pub is_upsell: bool,
    #[serde(default)]
    pub is_trial: bool,
    #[serde(default)]
    pub is_approved: bool,
    #[serde(default)]
    pub is_on_hold: bool,
    #[serde(default)]
    pub is_deleted: bool,
    /// First touch: the customer was registered by this record.
    #[serde(default)]
    pub is_new_customer: bool,
}

impl CrmFacts {
    pub fn new(customer_id: &str, kind: RecordKind) -> Self {
        CrmFacts {
            customer_id: customer_id.to_string(),
            kind,
            is_upsell: false,
            is_trial: false,
            is_approved: false,
            is_on_hold: false,
            is_deleted: false,
            is_new_customer: false,
        }
    }

    pub fn upsell(mut self) -> Self {
        self.is_upsell = true;
        self
    }

    pub fn trial(mut self) -> Self {
        self.is_trial = true;
        self
    }

    pub fn approved(mut self) -> Self {
        self.is_approved = true;
        self
    }

    pub fn on_hold(mut self) -> Self {
        self.is_on_hold = true;
        self
    }

    pub fn deleted(mut self) -> Self {
        self.is_deleted = true;
        self
    }

    pub fn new_customer(mut self) -> Self {
        self.is_new_customer = true;
        self
    }
}

/// Base measures of a record, tagged by the dataset it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Measures {
    Ad(AdMeasures),
    Crm(CrmFacts),
}

/// Measure used to weight proportional distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightMeasure {
    #[default]
    Impressions,
    Clicks,
    Cost,
    Conversions,
}

// ============================================================================
// FLAT RECORD
// ============================================================================

/// One observed event/transaction as returned by the query layer.
///
/// `attached` is `None` until the cross-dataset matcher has run; after that
/// it holds the (possibly fractional) CRM counts matched onto this row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatRecord {
    #[serde(default)]
    pub dimensions: Dimensions,
    pub base: Measures,
    #[serde(default)]
    pub attached: Option<CrmCounts>,
}

impl FlatRecord {
    pub fn ad(dimensions: Dimensions, measures: AdMeasures) -> Self {
        FlatRecord { dimensions, base: Measures::Ad(measures), attached: None }
    }

    pub fn crm(dimensions: Dimensions, facts: CrmFacts) -> Self {
        FlatRecord { dimensions, base: Measures::Crm(facts), attached: None }
    }

    pub fn dimension(&self, name: &str) -> &DimensionValue {
        self.dimensions.get(name)
    }

    /// Weight of this row for proportional distribution. CRM rows weigh nothing.
    pub fn weight(&self, measure: WeightMeasure) -> f64 {
        match &self.base {
            Measures::Ad(ad) => ad.measure(measure),
            Measures::Crm(_) => 0.0,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.attached.is_some()
    }

    /// Returns a copy of this row carrying `counts` as its attached metrics.
    pub fn with_attached(&self, counts: CrmCounts) -> FlatRecord {
        FlatRecord {
            dimensions: self.dimensions.clone(),
            base: self.base.clone(),
            attached: Some(counts),
        }
    }

    /// Whether this row lies on the path described by `filter`.
    pub fn matches_filter(&self, filter: &[(String, DimensionValue)]) -> bool {
        filter.iter().all(|(name, value)| self.dimension(name) == value)
    }
}

// ============================================================================
// SORTING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// Parses the UI surface ("ascend"/"descend") and the row-source form
    /// ("ASC"/"DESC"). Anything else, including null, is `None`.
    pub fn from_surface(raw: Option<&str>) -> Option<Self> {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("ascend") | Some("asc") | Some("ascending") => Some(SortDirection::Ascending),
            Some("descend") | Some("desc") | Some("descending") => Some(SortDirection::Descending),
            _ => None,
        }
    }

    pub fn as_surface(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "ascend",
            SortDirection::Descending => "descend",
        }
    }

    pub fn as_param(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

/// What a level is ordered by: a named metric or the `"date"` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SortKey {
    Metric(String),
    Date,
}

impl SortKey {
    pub const DATE_SENTINEL: &'static str = "date";

    pub fn parse(raw: &str) -> Self {
        if raw == Self::DATE_SENTINEL {
            SortKey::Date
        } else {
            SortKey::Metric(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SortKey::Metric(name) => name,
            SortKey::Date => Self::DATE_SENTINEL,
        }
    }
}

impl From<String> for SortKey {
    fn from(raw: String) -> Self {
        SortKey::parse(&raw)
    }
}

impl From<SortKey> for String {
    fn from(key: SortKey) -> Self {
        key.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortDirective {
    pub key: SortKey,
    pub direction: SortDirection,
}

/// Sort directive in the shape the row source expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortParam {
    pub by: String,
    pub direction: String,
}

impl SortDirective {
    pub fn new(key: SortKey, direction: SortDirection) -> Self {
        SortDirective { key, direction }
    }

    pub fn metric(name: &str, direction: SortDirection) -> Self {
        SortDirective { key: SortKey::Metric(name.to_string()), direction }
    }

    /// Builds a directive from the UI surface. A null column falls back to
    /// `fallback` entirely; a null direction keeps the fallback direction.
    pub fn from_surface(
        sort_by: Option<&str>,
        direction: Option<&str>,
        fallback: &SortDirective,
    ) -> Self {
        match sort_by.map(str::trim).filter(|s| !s.is_empty()) {
            None => fallback.clone(),
            Some(column) => SortDirective {
                key: SortKey::parse(column),
                direction: SortDirection::from_surface(direction).unwrap_or(fallback.direction),
            },
        }
    }

    pub fn as_param(&self) -> SortParam {
        SortParam {
            by: self.key.as_str().to_string(),
            direction: self.direction.as_param().to_string(),
        }
    }
}

// ============================================================================
// DATES
// ============================================================================

/// Inclusive ISO date pair bounding the rows a view loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    /// Builds a range; reversed bounds are swapped.
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        if from <= to {
            DateRange { from, to }
        } else {
            DateRange { from: to, to: from }
        }
    }

    /// The `days`-long window ending at `to` (inclusive).
    pub fn ending_at(to: NaiveDate, days: u32) -> Self {
        let span = chrono::Duration::days(i64::from(days.saturating_sub(1)));
        DateRange::new(to - span, to)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }

    pub fn to_iso_pair(&self) -> (String, String) {
        (self.from.format("%Y-%m-%d").to_string(), self.to.format("%Y-%m-%d").to_string())
    }

    pub fn parse(from: &str, to: &str) -> Option<Self> {
        Some(DateRange::new(parse_date(from)?, parse_date(to)?))
    }
}

/// Parses the date conventions seen in ad-spend and CRM exports: ISO dates,
/// RFC 3339 timestamps, "YYYY-MM-DD HH:MM:SS", "DD.MM.YYYY" and "YYYY/MM/DD".
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.date());
        }
    }
    for fmt in ["%d.%m.%Y", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(d);
        }
    }
    None
}
