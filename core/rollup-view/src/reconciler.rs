//! FILENAME: core/rollup-view/src/reconciler.rs
//! Expansion reconciler: loads tree levels on demand and restores the
//! persisted expansion after mount.
//!
//! All state changes go through the `ViewStore`; this type only awaits.
//! Restore walks persisted keys one depth level at a time. Within a level,
//! child fetches run concurrently and every result settles before the level
//! is merged in one commit. A failed fetch expands its node with no children
//! instead of failing the pass. The cancellation token stops in-flight work
//! on unmount; nothing is merged after it fires.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use rollup_engine::{key_depth, sort_tree, DateRange, RollupConfig, RollupError, SortDirective, TreeNode};
use rollup_engine::{log_debug, log_error, log_info, log_perf, log_warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{RestoreReport, SourceError, ViewError};
use crate::source::{NodeSource, ViewQuery};
use crate::state::{PersistedView, StateStore, ViewOptions};
use crate::store::{Action, Commit, FollowUp, Phase, ViewStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ToggleOutcome {
    Expanded,
    Collapsed,
    /// The node is a leaf.
    Ignored,
}

type LevelResults = Vec<(String, Result<Vec<TreeNode>, SourceError>)>;

pub struct ExpansionReconciler {
    source: Arc<dyn NodeSource>,
    store: ViewStore,
    state_store: Arc<dyn StateStore>,
    options: ViewOptions,
    config: RollupConfig,
    cancel: CancellationToken,
}

impl ExpansionReconciler {
    pub fn new(
        source: Arc<dyn NodeSource>,
        state_store: Arc<dyn StateStore>,
        options: ViewOptions,
        config: RollupConfig,
    ) -> Self {
        ExpansionReconciler {
            source,
            store: ViewStore::new(),
            state_store,
            options,
            config,
            cancel: CancellationToken::new(),
        }
    }

    // ========================================================================
    // MOUNT / LOAD
    // ========================================================================

    /// Reads the persisted view, loads the roots and restores the expansion.
    pub async fn mount(&self) -> Result<RestoreReport, ViewError> {
        let persisted = PersistedView::read(self.state_store.as_ref(), &self.options, &self.config);
        self.mount_with(persisted).await
    }

    pub async fn mount_with(&self, persisted: PersistedView) -> Result<RestoreReport, ViewError> {
        let query = persisted.query();
        log_info!(
            "LOAD",
            "mount dims={:?} range={:?} expanded={}",
            query.dimensions,
            query.date_range.to_iso_pair(),
            persisted.expanded.len()
        );
        self.store.dispatch(Action::Mount { query: query.clone() })?;
        self.load_roots(query, false).await?;

        if persisted.expanded.is_empty() {
            self.store.dispatch(Action::MarkInitialized)?;
            return Ok(RestoreReport::default());
        }
        self.restore(&persisted.expanded).await
    }

    /// Reloads the roots for the current query and re-materializes the
    /// expanded nodes.
    pub async fn reload(&self) -> Result<(), ViewError> {
        let query = self.current_query()?;
        self.load_roots(query, false).await
    }

    pub async fn set_dimensions(&self, dimensions: Vec<String>) -> Result<(), ViewError> {
        if dimensions.is_empty() {
            return Err(RollupError::EmptyDimensions.into());
        }
        let query = ViewQuery { dimensions, ..self.current_query()? };
        self.load_roots(query, true).await
    }

    pub async fn set_date_range(&self, date_range: DateRange) -> Result<(), ViewError> {
        let query = ViewQuery { date_range, ..self.current_query()? };
        self.load_roots(query, true).await
    }

    async fn load_roots(&self, query: ViewQuery, reset_expansion: bool) -> Result<(), ViewError> {
        self.store.dispatch(Action::BeginLoad)?;
        let start = Instant::now();

        let fetched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.source.load_roots(&query) => Some(result),
        };
        let roots = match fetched {
            None => {
                self.store.dispatch(Action::LoadFailed { message: ViewError::Cancelled.to_string() })?;
                return Err(ViewError::Cancelled);
            }
            Some(Err(e)) => {
                log_error!("LOAD", "root load failed: {}", e);
                self.store.dispatch(Action::LoadFailed { message: e.to_string() })?;
                return Err(e.into());
            }
            Some(Ok(roots)) => roots,
        };

        log_perf!(
            "LOAD",
            "load_roots: {} roots in {:.2}ms",
            roots.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        let commit = self.store.dispatch(Action::RootsLoaded { query, roots, reset_expansion })?;
        self.persist(&commit);

        if let FollowUp::Refresh(keys) = commit.follow_up {
            self.refresh(&keys).await?;
        }
        Ok(())
    }

    // ========================================================================
    // RESTORE
    // ========================================================================

    async fn restore(&self, keys: &[String]) -> Result<RestoreReport, ViewError> {
        self.store.dispatch(Action::BeginRestore)?;
        let start = Instant::now();
        let query = self.current_query()?;

        let report = match self.materialize(&query, keys).await {
            Ok(report) => report,
            Err(e) => {
                log_warn!("RESTORE", "restore stopped: {}", e);
                self.store.dispatch(Action::Abort)?;
                return Err(e);
            }
        };

        let commit = self.store.dispatch(Action::FinishRestore { expanded: report.restored.clone() })?;
        self.persist(&commit);
        log_perf!(
            "RESTORE",
            "restore: {} restored, {} dropped, {} failed over {} levels in {:.2}ms",
            report.restored.len(),
            report.dropped.len(),
            report.failed.len(),
            report.levels,
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(report)
    }

    /// Re-materializes `keys` after a reload. Keys gone from the new tree
    /// leave the expansion.
    async fn refresh(&self, keys: &[String]) -> Result<(), ViewError> {
        let query = self.current_query()?;
        match self.materialize(&query, keys).await {
            Ok(report) => {
                let commit = self.store.dispatch(Action::FinishExpand {
                    children: Vec::new(),
                    keys: report.restored,
                    replace: true,
                })?;
                self.persist(&commit);
                Ok(())
            }
            Err(e) => {
                self.store.dispatch(Action::Abort)?;
                Err(e)
            }
        }
    }

    /// Walks `keys` shallowest level first, fetching every node that has
    /// unfetched children and merging each level in one commit.
    async fn materialize(&self, query: &ViewQuery, keys: &[String]) -> Result<RestoreReport, ViewError> {
        let mut levels: BTreeMap<usize, Vec<&String>> = BTreeMap::new();
        for key in keys {
            levels.entry(key_depth(key)).or_default().push(key);
        }

        let mut report = RestoreReport::default();
        let mut found: Vec<&String> = Vec::new();

        for (depth, level_keys) in levels {
            if self.cancel.is_cancelled() {
                return Err(ViewError::Cancelled);
            }
            let level_start = Instant::now();

            let mut to_fetch: Vec<String> = Vec::new();
            self.store.read(|state| {
                for key in &level_keys {
                    match state.tree.get(key) {
                        Some(node) if node.has_children => {
                            found.push(*key);
                            if node.needs_fetch() {
                                to_fetch.push(key.to_string());
                            }
                        }
                        _ => report.dropped.push(key.to_string()),
                    }
                }
            });

            let results = self.fetch_level(query, &to_fetch).await?;
            let mut children = Vec::with_capacity(results.len());
            for (key, result) in results {
                match result {
                    Ok(nodes) => children.push((key, nodes)),
                    Err(e) => {
                        log_warn!("RESTORE", "children of '{}' failed: {}", key, e);
                        report.failed.push(key.clone());
                        children.push((key, Vec::new()));
                    }
                }
            }
            self.store.dispatch(Action::MergeLevel { children })?;
            report.levels += 1;

            log_perf!(
                "RESTORE",
                "level {}: {} keys, {} fetched in {:.2}ms",
                depth,
                level_keys.len(),
                to_fetch.len(),
                level_start.elapsed().as_secs_f64() * 1000.0
            );
        }

        // Persisted order, not level order
        report.restored = keys
            .iter()
            .filter(|k| found.contains(k))
            .cloned()
            .collect();
        if !report.dropped.is_empty() {
            log_debug!("RESTORE", "dropped stale keys: {:?}", report.dropped);
        }
        Ok(report)
    }

    /// Fetches the children of every key concurrently. All results settle
    /// before returning; the token aborts the whole level.
    async fn fetch_level(&self, query: &ViewQuery, keys: &[String]) -> Result<LevelResults, ViewError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let fetches = keys.iter().map(|key| async move {
            let result = self.source.load_children(query, key).await;
            (key.clone(), result)
        });
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ViewError::Cancelled),
            results = join_all(fetches) => Ok(results),
        }
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    /// Expands or collapses one node, fetching its children if needed.
    pub async fn toggle(&self, key: &str) -> Result<ToggleOutcome, ViewError> {
        let start = Instant::now();
        let commit = self.store.dispatch(Action::Toggle { key: key.to_string() })?;

        let outcome = match &commit.follow_up {
            FollowUp::Collapsed => ToggleOutcome::Collapsed,
            FollowUp::Ignored => ToggleOutcome::Ignored,
            FollowUp::FetchChildren(key) => {
                self.fetch_and_expand(key).await?;
                ToggleOutcome::Expanded
            }
            _ => ToggleOutcome::Expanded,
        };
        self.persist(&commit);

        log_perf!(
            "EXPAND",
            "toggle '{}' -> {:?} in {:.2}ms",
            key,
            outcome,
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(outcome)
    }

    async fn fetch_and_expand(&self, key: &str) -> Result<(), ViewError> {
        let query = self.current_query()?;
        let fetched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.source.load_children(&query, key) => Some(result),
        };
        match fetched {
            None => {
                self.store.dispatch(Action::Abort)?;
                Err(ViewError::Cancelled)
            }
            Some(Err(e)) => {
                log_error!("EXPAND", "children of '{}' failed: {}", key, e);
                self.store.dispatch(Action::ExpandFailed { message: e.to_string() })?;
                Err(e.into())
            }
            Some(Ok(children)) => {
                let commit = self.store.dispatch(Action::FinishExpand {
                    children: vec![(key.to_string(), children)],
                    keys: vec![key.to_string()],
                    replace: false,
                })?;
                self.persist(&commit);
                Ok(())
            }
        }
    }

    /// Expands every node above `levels`, fetching missing children level by
    /// level.
    pub async fn expand_to_depth(&self, levels: usize) -> Result<RestoreReport, ViewError> {
        self.store.dispatch(Action::BeginExpand)?;
        let query = self.current_query()?;
        let mut total = RestoreReport::default();

        for depth in 0..levels {
            let keys = self.store.read(|s| s.tree.keys_at_depth(depth));
            let report = match self.materialize(&query, &keys).await {
                Ok(report) => report,
                Err(e) => {
                    self.store.dispatch(Action::Abort)?;
                    return Err(e);
                }
            };
            // Leaves show up as dropped here; they are simply not expandable
            total.restored.extend(report.restored);
            total.failed.extend(report.failed);
            total.levels += report.levels;
        }

        let commit = self.store.dispatch(Action::FinishExpand {
            children: Vec::new(),
            keys: total.restored.clone(),
            replace: false,
        })?;
        self.persist(&commit);
        Ok(total)
    }

    pub fn collapse_all(&self) -> Result<(), ViewError> {
        let commit = self.store.dispatch(Action::CollapseAll)?;
        self.persist(&commit);
        Ok(())
    }

    /// Changes the sort. The tree is re-sorted on the next snapshot; nothing
    /// is refetched.
    pub fn set_sort(&self, sort: SortDirective) -> Result<(), ViewError> {
        let commit = self.store.dispatch(Action::SetSort { sort })?;
        self.persist(&commit);
        Ok(())
    }

    /// Stops in-flight and future fetches. Call on unmount.
    pub fn cancel(&self) {
        log_debug!("EXPAND", "cancellation requested");
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// The materialized tree, sorted for display.
    pub fn snapshot(&self) -> Vec<TreeNode> {
        self.store.read(|s| {
            let tree = s.tree.to_tree();
            match &s.query {
                Some(q) => sort_tree(&tree, &q.dimensions, &q.sort, &self.config.date_dimension),
                None => tree,
            }
        })
    }

    /// Keys of the rows a grid would show, in display order.
    pub fn visible_keys(&self) -> Vec<String> {
        let tree = self.snapshot();
        let expanded = self.expanded();
        let mut out = Vec::new();
        collect_visible(&tree, &expanded, &mut out);
        out
    }

    pub fn expanded(&self) -> Vec<String> {
        self.store.read(|s| s.expanded.clone())
    }

    pub fn phase(&self) -> Phase {
        self.store.read(|s| s.phase)
    }

    pub fn is_initialized(&self) -> bool {
        self.store.read(|s| s.initialized)
    }

    pub fn last_error(&self) -> Option<String> {
        self.store.read(|s| s.last_error.clone())
    }

    pub fn query(&self) -> Option<ViewQuery> {
        self.store.read(|s| s.query.clone())
    }

    fn current_query(&self) -> Result<ViewQuery, ViewError> {
        self.query().ok_or(ViewError::NotMounted)
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    fn persist(&self, commit: &Commit) {
        if !commit.persist {
            return;
        }
        let view = self.store.read(|s| {
            if matches!(s.phase, Phase::Uninitialized | Phase::Restoring) {
                return None;
            }
            s.query.as_ref().map(|q| PersistedView::from_query(q, &s.expanded))
        });
        let Some(view) = view else {
            return;
        };
        if let Err(e) = self.state_store.write(&view.to_params(&self.options)) {
            log_warn!("PERSIST", "state write failed: {}", e);
        }
    }
}

fn collect_visible(nodes: &[TreeNode], expanded: &[String], out: &mut Vec<String>) {
    for node in nodes {
        out.push(node.key.clone());
        if let Some(children) = &node.children {
            if expanded.contains(&node.key) {
                collect_visible(children, expanded, out);
            }
        }
    }
}
