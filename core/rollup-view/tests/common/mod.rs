//! FILENAME: tests/common/mod.rs
//! Stub node source and fixtures for rollup-view integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use rollup_engine::{
    build_tree, find_node, BuildMode, CrmFacts, DateRange, Dimensions, FlatRecord, RecordKind,
    RollupConfig, SortDirection, SortDirective, TreeNode,
};
use rollup_view::{
    ExpansionReconciler, MemoryStateStore, NodeSource, PersistedView, SourceError, ViewOptions,
    ViewQuery,
};
use rustc_hash::FxHashSet;
use tokio::sync::{Notify, Semaphore};

// ============================================================================
// FIXTURES
// ============================================================================

/// Subscription rows: (country, product, channel, customer).
pub fn subscription_rows() -> Vec<FlatRecord> {
    [
        ("NO", "A", "web", "c1"),
        ("NO", "A", "app", "c2"),
        ("NO", "B", "web", "c3"),
        ("SE", "A", "web", "c4"),
        ("DK", "C", "app", "c5"),
    ]
    .iter()
    .map(|(country, product, channel, customer)| {
        FlatRecord::crm(
            Dimensions::new()
                .with("country", country)
                .with("product", product)
                .with("channel", channel),
            CrmFacts::new(customer, RecordKind::Subscription),
        )
    })
    .collect()
}

pub fn dims() -> Vec<String> {
    vec!["country".to_string(), "product".to_string(), "channel".to_string()]
}

pub fn window() -> DateRange {
    DateRange::new(
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
    )
}

pub fn by_subscriptions() -> SortDirective {
    SortDirective::metric("subscriptions", SortDirection::Descending)
}

pub fn persisted(expanded: &[&str]) -> PersistedView {
    PersistedView::from_query(
        &ViewQuery { dimensions: dims(), date_range: window(), sort: by_subscriptions() },
        &expanded.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
    )
}

// ============================================================================
// STUB SOURCE
// ============================================================================

/// Serves levels of an eager tree built from fixed rows. Child fetches can be
/// made to fail per key or held behind a gate.
pub struct StubSource {
    rows: Vec<FlatRecord>,
    failing: Mutex<FxHashSet<String>>,
    fail_roots: AtomicBool,
    gate: Option<Arc<Semaphore>>,
    pub started: Notify,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubSource {
    pub fn new(rows: Vec<FlatRecord>) -> Self {
        StubSource {
            rows,
            failing: Mutex::new(FxHashSet::default()),
            fail_roots: AtomicBool::new(false),
            gate: None,
            started: Notify::new(),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Child fetches wait for a permit on `gate`.
    pub fn gated(rows: Vec<FlatRecord>, gate: Arc<Semaphore>) -> Self {
        StubSource { gate: Some(gate), ..StubSource::new(rows) }
    }

    pub fn fail_on(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_roots(&self, fail: bool) {
        self.fail_roots.store(fail, Ordering::SeqCst);
    }

    /// Keys whose children were requested, in request order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn tree(&self, query: &ViewQuery) -> Vec<TreeNode> {
        build_tree(&self.rows, &query.dimensions, BuildMode::Eager)
    }
}

/// Copies one level without its descendants.
fn strip(nodes: &[TreeNode]) -> Vec<TreeNode> {
    nodes
        .iter()
        .map(|n| TreeNode { children: None, ..n.clone() })
        .collect()
}

#[async_trait]
impl NodeSource for StubSource {
    async fn load_roots(&self, query: &ViewQuery) -> Result<Vec<TreeNode>, SourceError> {
        if self.fail_roots.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("roots offline".to_string()));
        }
        Ok(strip(&self.tree(query)))
    }

    async fn load_children(&self, query: &ViewQuery, parent_key: &str) -> Result<Vec<TreeNode>, SourceError> {
        self.calls.lock().unwrap().push(parent_key.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.started.notify_one();

        // Let sibling fetches start before this one settles
        tokio::task::yield_now().await;
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(parent_key) {
            return Err(SourceError::failed(format!("children of {} unavailable", parent_key)));
        }
        let tree = self.tree(query);
        match find_node(&tree, parent_key).and_then(|n| n.children.as_deref()) {
            Some(children) => Ok(strip(children)),
            None => Err(SourceError::failed(format!("no children under {}", parent_key))),
        }
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct Harness {
    pub source: Arc<StubSource>,
    pub state: Arc<MemoryStateStore>,
    pub view: Arc<ExpansionReconciler>,
}

impl Harness {
    pub fn new(source: StubSource) -> Self {
        let source = Arc::new(source);
        let state = Arc::new(MemoryStateStore::new());
        let view = Arc::new(ExpansionReconciler::new(
            source.clone(),
            state.clone(),
            ViewOptions::default(),
            RollupConfig::default(),
        ));
        Harness { source, state, view }
    }

    pub fn stub() -> Self {
        Harness::new(StubSource::new(subscription_rows()))
    }

    /// Mounted with no persisted expansion.
    pub async fn mounted() -> Self {
        let h = Harness::stub();
        h.view.mount_with(persisted(&[])).await.unwrap();
        h
    }

    pub fn node(&self, key: &str) -> Option<TreeNode> {
        find_node(&self.view.snapshot(), key).cloned()
    }
}
