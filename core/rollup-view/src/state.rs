//! FILENAME: core/rollup-view/src/state.rs
//! Persisted view state: what survives navigation.
//!
//! The host keeps a flat string map (URL query parameters or a saved-view
//! blob). `PersistedView` is read from it once at mount and written back on
//! every committed change after initialization.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use rollup_engine::{
    decode_key_list, encode_key_list, DateRange, RollupConfig, SortDirective,
};
use rollup_engine::log_warn;
use serde::{Deserialize, Serialize};

use crate::error::{SourceError, ViewError};
use crate::source::ViewQuery;

// ============================================================================
// OPTIONS
// ============================================================================

/// Names of the parameters the view state is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParamNames {
    pub expanded: String,
    pub sort_by: String,
    pub sort_direction: String,
    pub dimensions: String,
    pub from: String,
    pub to: String,
}

impl Default for ParamNames {
    fn default() -> Self {
        ParamNames {
            expanded: "expanded".to_string(),
            sort_by: "sortBy".to_string(),
            sort_direction: "sortDirection".to_string(),
            dimensions: "dimensions".to_string(),
            from: "from".to_string(),
            to: "to".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ViewOptions {
    pub params: ParamNames,
    /// Dimension list used when none is persisted.
    pub default_dimensions: Vec<String>,
    /// Length of the default date window, ending today.
    pub default_window_days: u32,
}

impl Default for ViewOptions {
    fn default() -> Self {
        ViewOptions {
            params: ParamNames::default(),
            default_dimensions: vec!["network".to_string(), "campaign".to_string(), "date".to_string()],
            default_window_days: 30,
        }
    }
}

// ============================================================================
// STATE STORE
// ============================================================================

/// Durable string map owned by the host.
pub trait StateStore: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;

    /// Applies `params` in one write; `None` removes a parameter.
    fn write(&self, params: &[(String, Option<String>)]) -> Result<(), SourceError>;
}

/// State store backed by an in-memory map. Counts writes.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    params: Mutex<BTreeMap<String, String>>,
    writes: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        MemoryStateStore::default()
    }

    pub fn with_params(params: &[(&str, &str)]) -> Self {
        let store = MemoryStateStore::new();
        {
            let mut map = store.params.lock().unwrap_or_else(|e| e.into_inner());
            for (k, v) in params {
                map.insert(k.to_string(), v.to_string());
            }
        }
        store
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.params.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, name: &str) -> Option<String> {
        self.params
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn write(&self, params: &[(String, Option<String>)]) -> Result<(), SourceError> {
        let mut map = self.params.lock().unwrap_or_else(|e| e.into_inner());
        for (name, value) in params {
            match value {
                Some(v) => {
                    map.insert(name.clone(), v.clone());
                }
                None => {
                    map.remove(name);
                }
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// PERSISTED VIEW
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedView {
    pub expanded: Vec<String>,
    pub sort: SortDirective,
    pub dimensions: Vec<String>,
    pub date_range: DateRange,
}

impl PersistedView {
    pub fn from_query(query: &ViewQuery, expanded: &[String]) -> Self {
        PersistedView {
            expanded: expanded.to_vec(),
            sort: query.sort.clone(),
            dimensions: query.dimensions.clone(),
            date_range: query.date_range,
        }
    }

    pub fn query(&self) -> ViewQuery {
        ViewQuery {
            dimensions: self.dimensions.clone(),
            date_range: self.date_range,
            sort: self.sort.clone(),
        }
    }

    /// Reads the view from `store`. Missing or malformed parameters fall
    /// back to defaults; a malformed expanded list is treated as empty.
    pub fn read(store: &dyn StateStore, options: &ViewOptions, config: &RollupConfig) -> Self {
        Self::read_at(store, options, config, Utc::now().date_naive())
    }

    pub fn read_at(
        store: &dyn StateStore,
        options: &ViewOptions,
        config: &RollupConfig,
        today: NaiveDate,
    ) -> Self {
        let p = &options.params;

        let expanded = match store.get(&p.expanded) {
            Some(raw) => decode_key_list(&raw).unwrap_or_else(|e| {
                log_warn!("PERSIST", "ignoring unreadable expanded list: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        let sort_by = store.get(&p.sort_by);
        let sort_direction = store.get(&p.sort_direction);
        let sort = SortDirective::from_surface(
            sort_by.as_deref(),
            sort_direction.as_deref(),
            &config.default_sort,
        );

        let dimensions: Vec<String> = store
            .get(&p.dimensions)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let dimensions = if dimensions.is_empty() {
            options.default_dimensions.clone()
        } else {
            dimensions
        };

        let date_range = match (store.get(&p.from), store.get(&p.to)) {
            (Some(from), Some(to)) => DateRange::parse(&from, &to),
            _ => None,
        }
        .unwrap_or_else(|| DateRange::ending_at(today, options.default_window_days));

        PersistedView { expanded, sort, dimensions, date_range }
    }

    /// Parameter writes for this view. An empty expansion removes its parameter.
    pub fn to_params(&self, options: &ViewOptions) -> Vec<(String, Option<String>)> {
        let p = &options.params;
        let (from, to) = self.date_range.to_iso_pair();
        let expanded = if self.expanded.is_empty() {
            None
        } else {
            Some(encode_key_list(&self.expanded))
        };
        vec![
            (p.expanded.clone(), expanded),
            (p.sort_by.clone(), Some(self.sort.key.as_str().to_string())),
            (p.sort_direction.clone(), Some(self.sort.direction.as_surface().to_string())),
            (p.dimensions.clone(), Some(self.dimensions.join(","))),
            (p.from.clone(), Some(from)),
            (p.to.clone(), Some(to)),
        ]
    }

    /// Saved-view blob.
    pub fn to_json(&self) -> Result<String, ViewError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ViewError> {
        Ok(serde_json::from_str(raw)?)
    }
}
