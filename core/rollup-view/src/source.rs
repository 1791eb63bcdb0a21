//! FILENAME: core/rollup-view/src/source.rs
//! Collaborator traits and the node source the reconciler loads from.
//!
//! `RowSource` and `SecondarySource` are the external query layer. They hand
//! back flat rows. `NodeSource` is what the reconciler talks to: one tree
//! level at a time. `RollupSource` bridges the two by fetching rows,
//! attaching CRM metrics and building the requested level.
//!
//! CRM counts are split across every ad row of the date window, never just
//! the rows under one parent, so a child level sums to its parent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rollup_engine::{
    attach_secondary, build_level, key_depth, parent_filter, parse_date, DateRange,
    DimensionValue, FlatRecord, RollupConfig, RollupError, SortDirective, SortParam, TreeNode,
};
use rollup_engine::{log_debug, log_info, log_warn};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

// ============================================================================
// QUERY TYPES
// ============================================================================

/// The query a view is currently showing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewQuery {
    pub dimensions: Vec<String>,
    pub date_range: DateRange,
    pub sort: SortDirective,
}

/// Parameters of one row fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchParams {
    /// ISO `(from, to)` pair, inclusive.
    pub date_range: (String, String),
    pub dimensions: Vec<String>,
    /// Depth of the level being fetched; None for the roots.
    pub depth: Option<usize>,
    /// Ordered dimension → value pairs of the parent node's path.
    pub parent_filter: Vec<(String, DimensionValue)>,
    pub sort: SortParam,
}

impl FetchParams {
    pub fn for_roots(query: &ViewQuery) -> Self {
        FetchParams {
            date_range: query.date_range.to_iso_pair(),
            dimensions: query.dimensions.clone(),
            depth: None,
            parent_filter: Vec::new(),
            sort: query.sort.as_param(),
        }
    }

    pub fn for_children(query: &ViewQuery, parent_key: &str) -> Result<Self, RollupError> {
        Ok(FetchParams {
            date_range: query.date_range.to_iso_pair(),
            dimensions: query.dimensions.clone(),
            depth: Some(key_depth(parent_key) + 1),
            parent_filter: parent_filter(&query.dimensions, parent_key)?,
            sort: query.sort.as_param(),
        })
    }

    /// The date window as dates; malformed bounds yield None.
    pub fn range(&self) -> Option<DateRange> {
        DateRange::parse(&self.date_range.0, &self.date_range.1)
    }
}

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Primary (ad-spend) rows. Must be idempotent and side-effect free.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch_rows(&self, params: &FetchParams) -> Result<Vec<FlatRecord>, SourceError>;
}

/// Secondary (CRM) rows for a whole date window, in one call.
#[async_trait]
pub trait SecondarySource: Send + Sync {
    async fn fetch_secondary(&self, range: &DateRange) -> Result<Vec<FlatRecord>, SourceError>;
}

/// One tree level at a time, as the reconciler consumes it.
#[async_trait]
pub trait NodeSource: Send + Sync {
    async fn load_roots(&self, query: &ViewQuery) -> Result<Vec<TreeNode>, SourceError>;

    /// The complete child list of `parent_key`.
    async fn load_children(&self, query: &ViewQuery, parent_key: &str) -> Result<Vec<TreeNode>, SourceError>;
}

// ============================================================================
// ROLLUP SOURCE
// ============================================================================

/// Fetch rows → attach CRM metrics → build one level.
pub struct RollupSource {
    rows: Arc<dyn RowSource>,
    secondary: Option<Arc<dyn SecondarySource>>,
    config: RollupConfig,
    /// Attached rows of the last loaded window, keyed by range and dimensions.
    window_cache: Mutex<Option<(WindowKey, Arc<Vec<FlatRecord>>)>>,
}

type WindowKey = (DateRange, Vec<String>);

impl RollupSource {
    pub fn new(rows: Arc<dyn RowSource>, config: RollupConfig) -> Self {
        RollupSource {
            rows,
            secondary: None,
            config,
            window_cache: Mutex::new(None),
        }
    }

    pub fn with_secondary(mut self, secondary: Arc<dyn SecondarySource>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn config(&self) -> &RollupConfig {
        &self.config
    }

    /// Fetches the whole window, attaches CRM rows to it and caches the result.
    async fn load_window(
        &self,
        query: &ViewQuery,
        secondary: &dyn SecondarySource,
    ) -> Result<Arc<Vec<FlatRecord>>, SourceError> {
        let rows = self.rows.fetch_rows(&FetchParams::for_roots(query)).await?;
        let secondary_rows = secondary.fetch_secondary(&query.date_range).await?;
        let attached = Arc::new(attach_secondary(&rows, &secondary_rows, &query.dimensions, &self.config));
        log_debug!(
            "LOAD",
            "cached {} attached rows ({} secondary) for {:?}",
            attached.len(),
            secondary_rows.len(),
            query.date_range.to_iso_pair()
        );
        let mut cache = self.window_cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = Some(((query.date_range, query.dimensions.clone()), Arc::clone(&attached)));
        Ok(attached)
    }

    fn cached_window(&self, query: &ViewQuery) -> Option<Arc<Vec<FlatRecord>>> {
        let cache = self.window_cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.as_ref() {
            Some(((range, dims), rows)) if *range == query.date_range && *dims == query.dimensions => {
                Some(Arc::clone(rows))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl NodeSource for RollupSource {
    /// Always refetches, so a reload sees fresh rows.
    async fn load_roots(&self, query: &ViewQuery) -> Result<Vec<TreeNode>, SourceError> {
        let rows = match &self.secondary {
            Some(secondary) => self.load_window(query, secondary.as_ref()).await?,
            None => Arc::new(self.rows.fetch_rows(&FetchParams::for_roots(query)).await?),
        };
        Ok(build_level(&rows, &query.dimensions, None)?)
    }

    async fn load_children(&self, query: &ViewQuery, parent_key: &str) -> Result<Vec<TreeNode>, SourceError> {
        let params = FetchParams::for_children(query, parent_key)?;
        let rows = match &self.secondary {
            Some(secondary) => match self.cached_window(query) {
                Some(rows) => rows,
                None => self.load_window(query, secondary.as_ref()).await?,
            },
            // Without CRM rows nothing is split, so the filter can go to the source
            None => Arc::new(self.rows.fetch_rows(&params).await?),
        };
        Ok(build_level(&rows, &query.dimensions, Some(parent_key))?)
    }
}

// ============================================================================
// IN-MEMORY COLLABORATORS
// ============================================================================

/// Rows held in memory, filtered by date window and parent path.
/// Rows whose date cannot be read are kept regardless of the window.
pub struct MemoryRowSource {
    rows: Vec<FlatRecord>,
    date_dimension: String,
    calls: AtomicUsize,
}

impl MemoryRowSource {
    pub fn new(rows: Vec<FlatRecord>, date_dimension: &str) -> Self {
        MemoryRowSource {
            rows,
            date_dimension: date_dimension.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn in_window(row: &FlatRecord, field: &str, range: Option<&DateRange>) -> bool {
    match (range, row.dimension(field).as_known().and_then(parse_date)) {
        (Some(range), Some(date)) => range.contains(date),
        _ => true,
    }
}

#[async_trait]
impl RowSource for MemoryRowSource {
    async fn fetch_rows(&self, params: &FetchParams) -> Result<Vec<FlatRecord>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let range = params.range();
        if range.is_none() {
            log_warn!("LOAD", "unreadable date window {:?}, not filtering by date", params.date_range);
        }
        let rows: Vec<FlatRecord> = self
            .rows
            .iter()
            .filter(|r| in_window(r, &self.date_dimension, range.as_ref()))
            .filter(|r| r.matches_filter(&params.parent_filter))
            .cloned()
            .collect();
        log_info!(
            "LOAD",
            "fetch_rows depth={:?} filter={} -> {} rows",
            params.depth,
            params.parent_filter.len(),
            rows.len()
        );
        Ok(rows)
    }
}

/// CRM rows held in memory, filtered by their creation date.
pub struct MemorySecondarySource {
    rows: Vec<FlatRecord>,
    date_field: String,
    calls: AtomicUsize,
}

impl MemorySecondarySource {
    pub fn new(rows: Vec<FlatRecord>, date_field: &str) -> Self {
        MemorySecondarySource {
            rows,
            date_field: date_field.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecondarySource for MemorySecondarySource {
    async fn fetch_secondary(&self, range: &DateRange) -> Result<Vec<FlatRecord>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rows
            .iter()
            .filter(|r| in_window(r, &self.date_field, Some(range)))
            .cloned()
            .collect())
    }
}
