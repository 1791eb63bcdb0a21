//! FILENAME: core/rollup-view/src/store.rs
//! View store: the single mutation entry point for view state.
//!
//! Every change goes through `ViewStore::dispatch`, which runs the reducer
//! under one mutex. The reducer owns the guard invariants:
//! - a restore runs at most once per view
//! - nothing expands, collapses or reloads while a restore or another
//!   expansion is in flight
//! - merges only land while a restore or expansion owns the tree
//!
//! The reducer never awaits. It answers with a `Commit` telling the async
//! shell whether to persist and what to do next.

use std::sync::Mutex;

use rollup_engine::{log_debug, log_warn};
use rollup_engine::{SortDirective, TreeNode};
use serde::Serialize;

use crate::arena::TreeArena;
use crate::error::ViewError;
use crate::source::ViewQuery;

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// No roots loaded or no persisted state read yet.
    Uninitialized,
    /// Roots are being fetched.
    Loading,
    /// The one-time restore from persisted keys is running.
    Restoring,
    Idle,
    /// Children of one node are being fetched. Collapsing needs no fetch and
    /// completes within a single dispatch, so it has no phase of its own.
    Expanding,
}

#[derive(Debug)]
pub struct ViewState {
    pub phase: Phase,
    pub query: Option<ViewQuery>,
    pub tree: TreeArena,
    /// Ordered set of expanded keys.
    pub expanded: Vec<String>,
    /// Set by the commit that first reaches Idle.
    pub initialized: bool,
    pub restore_started: bool,
    /// Last failure surfaced to the UI.
    pub last_error: Option<String>,
}

impl Default for ViewState {
    fn default() -> Self {
        ViewState {
            phase: Phase::Uninitialized,
            query: None,
            tree: TreeArena::new(),
            expanded: Vec::new(),
            initialized: false,
            restore_started: false,
            last_error: None,
        }
    }
}

// ============================================================================
// ACTIONS
// ============================================================================

#[derive(Debug)]
pub enum Action {
    Mount { query: ViewQuery },
    BeginLoad,
    RootsLoaded { query: ViewQuery, roots: Vec<TreeNode>, reset_expansion: bool },
    LoadFailed { message: String },
    /// Completes initialization when there is nothing to restore.
    MarkInitialized,
    BeginRestore,
    /// One depth level of fetched children, merged atomically.
    MergeLevel { children: Vec<(String, Vec<TreeNode>)> },
    FinishRestore { expanded: Vec<String> },
    Toggle { key: String },
    BeginExpand,
    FinishExpand { children: Vec<(String, Vec<TreeNode>)>, keys: Vec<String>, replace: bool },
    ExpandFailed { message: String },
    /// Cancels an in-flight restore or expansion.
    Abort,
    CollapseAll,
    SetSort { sort: SortDirective },
}

impl Action {
    fn category(&self) -> &'static str {
        match self {
            Action::Mount { .. }
            | Action::BeginLoad
            | Action::RootsLoaded { .. }
            | Action::LoadFailed { .. }
            | Action::MarkInitialized => "LOAD",
            Action::BeginRestore | Action::FinishRestore { .. } => "RESTORE",
            _ => "EXPAND",
        }
    }
}

/// What the async shell must do after a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    Nothing,
    Collapsed,
    Expanded,
    /// Toggle on a leaf.
    Ignored,
    /// Fetch the children of this key, then `FinishExpand` or `ExpandFailed`.
    FetchChildren(String),
    /// Roots were reloaded; re-materialize these expanded keys.
    Refresh(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub persist: bool,
    pub follow_up: FollowUp,
}

impl Commit {
    fn quiet() -> Self {
        Commit { persist: false, follow_up: FollowUp::Nothing }
    }

    fn persisted(follow_up: FollowUp) -> Self {
        Commit { persist: true, follow_up }
    }
}

// ============================================================================
// REDUCER
// ============================================================================

impl ViewState {
    /// Phase to return to once transient work ends.
    fn settled(&self) -> Phase {
        if self.initialized {
            Phase::Idle
        } else {
            Phase::Uninitialized
        }
    }

    fn require_idle(&self) -> Result<(), ViewError> {
        match self.phase {
            Phase::Idle => Ok(()),
            Phase::Uninitialized => Err(ViewError::NotMounted),
            other => Err(ViewError::Busy(other)),
        }
    }

    fn require_phase(&self, allowed: &[Phase]) -> Result<(), ViewError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(ViewError::Busy(self.phase))
        }
    }

    fn merge(&mut self, children: Vec<(String, Vec<TreeNode>)>) {
        for (key, nodes) in children {
            if let Err(e) = self.tree.set_children(&key, &nodes) {
                log_warn!("EXPAND", "merge skipped: {}", e);
            }
        }
    }

    fn add_expanded(&mut self, keys: Vec<String>) {
        for key in keys {
            if !self.expanded.contains(&key) {
                self.expanded.push(key);
            }
        }
    }

    fn reduce(&mut self, action: Action) -> Result<Commit, ViewError> {
        match action {
            Action::Mount { query } => {
                if self.initialized || self.phase != Phase::Uninitialized {
                    return Err(ViewError::Busy(self.phase));
                }
                self.query = Some(query);
                Ok(Commit::quiet())
            }

            Action::BeginLoad => {
                if self.query.is_none() {
                    return Err(ViewError::NotMounted);
                }
                self.require_phase(&[Phase::Uninitialized, Phase::Idle])?;
                self.phase = Phase::Loading;
                Ok(Commit::quiet())
            }

            Action::RootsLoaded { query, roots, reset_expansion } => {
                self.require_phase(&[Phase::Loading])?;
                let query_changed = self.query.as_ref() != Some(&query);
                self.tree = TreeArena::from_nodes(&roots);
                self.query = Some(query);
                self.last_error = None;
                if reset_expansion {
                    self.expanded.clear();
                }
                if !self.initialized {
                    self.phase = Phase::Uninitialized;
                    return Ok(Commit::quiet());
                }
                if !self.expanded.is_empty() {
                    self.phase = Phase::Expanding;
                    let keys = self.expanded.clone();
                    return Ok(Commit { persist: query_changed, follow_up: FollowUp::Refresh(keys) });
                }
                self.phase = Phase::Idle;
                Ok(Commit { persist: query_changed || reset_expansion, follow_up: FollowUp::Nothing })
            }

            Action::LoadFailed { message } => {
                self.require_phase(&[Phase::Loading])?;
                self.phase = self.settled();
                self.last_error = Some(message);
                Ok(Commit::quiet())
            }

            Action::MarkInitialized => {
                self.require_phase(&[Phase::Uninitialized])?;
                if self.query.is_none() {
                    return Err(ViewError::NotMounted);
                }
                self.initialized = true;
                self.phase = Phase::Idle;
                // The commit that completes initialization is never persisted
                Ok(Commit::quiet())
            }

            Action::BeginRestore => {
                if self.restore_started {
                    return Err(ViewError::Busy(self.phase));
                }
                self.require_phase(&[Phase::Uninitialized, Phase::Idle])?;
                if self.query.is_none() {
                    return Err(ViewError::NotMounted);
                }
                self.restore_started = true;
                self.phase = Phase::Restoring;
                Ok(Commit::quiet())
            }

            Action::MergeLevel { children } => {
                self.require_phase(&[Phase::Restoring, Phase::Expanding])?;
                self.merge(children);
                Ok(Commit::quiet())
            }

            Action::FinishRestore { expanded } => {
                self.require_phase(&[Phase::Restoring])?;
                let was_initialized = self.initialized;
                self.expanded = expanded;
                self.initialized = true;
                self.phase = Phase::Idle;
                Ok(Commit { persist: was_initialized, follow_up: FollowUp::Nothing })
            }

            Action::Toggle { key } => {
                self.require_idle()?;
                let node = self
                    .tree
                    .get(&key)
                    .ok_or_else(|| ViewError::UnknownNode(key.clone()))?;
                let (has_children, materialized) = (node.has_children, node.is_materialized());

                if let Some(pos) = self.expanded.iter().position(|k| *k == key) {
                    self.expanded.remove(pos);
                    return Ok(Commit::persisted(FollowUp::Collapsed));
                }
                if !has_children {
                    return Ok(Commit { persist: false, follow_up: FollowUp::Ignored });
                }
                if materialized {
                    self.expanded.push(key);
                    return Ok(Commit::persisted(FollowUp::Expanded));
                }
                self.phase = Phase::Expanding;
                Ok(Commit { persist: false, follow_up: FollowUp::FetchChildren(key) })
            }

            Action::BeginExpand => {
                self.require_idle()?;
                self.phase = Phase::Expanding;
                Ok(Commit::quiet())
            }

            Action::FinishExpand { children, keys, replace } => {
                self.require_phase(&[Phase::Expanding])?;
                self.merge(children);
                if replace {
                    self.expanded.clear();
                }
                self.add_expanded(keys);
                self.phase = Phase::Idle;
                Ok(Commit::persisted(FollowUp::Expanded))
            }

            Action::ExpandFailed { message } => {
                self.require_phase(&[Phase::Expanding])?;
                self.phase = Phase::Idle;
                self.last_error = Some(message);
                Ok(Commit::quiet())
            }

            Action::Abort => {
                match self.phase {
                    Phase::Restoring => {
                        // The view is usable with whatever levels merged so far
                        self.initialized = true;
                        self.phase = Phase::Idle;
                    }
                    Phase::Expanding => self.phase = Phase::Idle,
                    _ => {}
                }
                Ok(Commit::quiet())
            }

            Action::CollapseAll => {
                self.require_idle()?;
                let changed = !self.expanded.is_empty();
                self.expanded.clear();
                Ok(Commit { persist: changed, follow_up: FollowUp::Collapsed })
            }

            Action::SetSort { sort } => {
                self.require_idle()?;
                let query = self.query.as_mut().ok_or(ViewError::NotMounted)?;
                let changed = query.sort != sort;
                query.sort = sort;
                Ok(Commit { persist: changed, follow_up: FollowUp::Nothing })
            }
        }
    }
}

// ============================================================================
// STORE
// ============================================================================

#[derive(Debug, Default)]
pub struct ViewStore {
    state: Mutex<ViewState>,
}

impl ViewStore {
    pub fn new() -> Self {
        ViewStore::default()
    }

    pub fn dispatch(&self, action: Action) -> Result<Commit, ViewError> {
        let category = action.category();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = state.phase;
        let result = state.reduce(action);
        match &result {
            Ok(commit) => log_debug!(
                category,
                "{:?} -> {:?} persist={} follow_up={:?}",
                before,
                state.phase,
                commit.persist,
                commit.follow_up
            ),
            Err(e) => log_debug!(category, "rejected in {:?}: {}", before, e),
        }
        result
    }

    /// Runs `f` against the current state under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&ViewState) -> R) -> R {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rollup_engine::{build_tree, BuildMode, CrmFacts, DateRange, Dimensions, FlatRecord, RecordKind, SortDirection};

    fn query() -> ViewQuery {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        ViewQuery {
            dimensions: vec!["country".to_string(), "product".to_string()],
            date_range: DateRange::new(day, day),
            sort: SortDirective::metric("cost", SortDirection::Descending),
        }
    }

    fn roots(mode: BuildMode) -> Vec<TreeNode> {
        let rows: Vec<FlatRecord> = [("NO", "A"), ("NO", "B"), ("SE", "A")]
            .iter()
            .map(|(c, p)| {
                FlatRecord::crm(
                    Dimensions::new().with("country", c).with("product", p),
                    CrmFacts::new(c, RecordKind::Subscription),
                )
            })
            .collect();
        build_tree(&rows, &query().dimensions, mode)
    }

    /// A store that has loaded roots and finished initialization.
    fn idle_store(mode: BuildMode) -> ViewStore {
        let store = ViewStore::new();
        store.dispatch(Action::Mount { query: query() }).unwrap();
        store.dispatch(Action::BeginLoad).unwrap();
        store
            .dispatch(Action::RootsLoaded { query: query(), roots: roots(mode), reset_expansion: false })
            .unwrap();
        store.dispatch(Action::MarkInitialized).unwrap();
        store
    }

    #[test]
    fn test_actions_before_mount_are_rejected() {
        let store = ViewStore::new();
        assert!(matches!(store.dispatch(Action::BeginLoad), Err(ViewError::NotMounted)));
        assert!(matches!(
            store.dispatch(Action::Toggle { key: "NO".into() }),
            Err(ViewError::NotMounted)
        ));
    }

    #[test]
    fn test_initialization_commit_is_not_persisted() {
        let store = ViewStore::new();
        store.dispatch(Action::Mount { query: query() }).unwrap();
        store.dispatch(Action::BeginLoad).unwrap();
        let loaded = store
            .dispatch(Action::RootsLoaded { query: query(), roots: roots(BuildMode::Lazy), reset_expansion: false })
            .unwrap();
        assert!(!loaded.persist);
        assert!(!store.dispatch(Action::MarkInitialized).unwrap().persist);
        assert_eq!(store.read(|s| s.phase), Phase::Idle);
    }

    #[test]
    fn test_restore_runs_once_and_blocks_toggles() {
        let store = idle_store(BuildMode::Lazy);
        store.dispatch(Action::BeginRestore).unwrap();
        assert!(matches!(
            store.dispatch(Action::Toggle { key: "NO".into() }),
            Err(ViewError::Busy(Phase::Restoring))
        ));
        assert!(matches!(store.dispatch(Action::BeginLoad), Err(ViewError::Busy(Phase::Restoring))));
        store.dispatch(Action::FinishRestore { expanded: vec!["NO".into()] }).unwrap();
        assert!(matches!(store.dispatch(Action::BeginRestore), Err(ViewError::Busy(Phase::Idle))));
    }

    #[test]
    fn test_toggle_paths() {
        let store = idle_store(BuildMode::Eager);
        // materialized: no fetch
        let commit = store.dispatch(Action::Toggle { key: "NO".into() }).unwrap();
        assert_eq!(commit, Commit::persisted(FollowUp::Expanded));
        // leaf
        let commit = store.dispatch(Action::Toggle { key: "NO::A".into() }).unwrap();
        assert_eq!(commit.follow_up, FollowUp::Ignored);
        // collapse
        let commit = store.dispatch(Action::Toggle { key: "NO".into() }).unwrap();
        assert_eq!(commit.follow_up, FollowUp::Collapsed);
        assert!(store.read(|s| s.expanded.is_empty()));

        assert!(matches!(
            store.dispatch(Action::Toggle { key: "XX".into() }),
            Err(ViewError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_collapse_settles_in_one_dispatch() {
        let store = idle_store(BuildMode::Eager);
        store.dispatch(Action::Toggle { key: "NO".into() }).unwrap();

        let commit = store.dispatch(Action::Toggle { key: "NO".into() }).unwrap();
        assert_eq!(commit, Commit::persisted(FollowUp::Collapsed));
        assert_eq!(store.read(|s| s.phase), Phase::Idle);
        // The next click is accepted straight away
        let commit = store.dispatch(Action::Toggle { key: "SE".into() }).unwrap();
        assert_eq!(commit, Commit::persisted(FollowUp::Expanded));
        assert_eq!(store.read(|s| s.expanded.clone()), vec!["SE".to_string()]);
    }

    #[test]
    fn test_unmaterialized_toggle_holds_expanding_phase() {
        let store = idle_store(BuildMode::Lazy);
        let commit = store.dispatch(Action::Toggle { key: "SE".into() }).unwrap();
        assert_eq!(commit.follow_up, FollowUp::FetchChildren("SE".into()));
        assert!(matches!(
            store.dispatch(Action::Toggle { key: "NO".into() }),
            Err(ViewError::Busy(Phase::Expanding))
        ));
        store.dispatch(Action::ExpandFailed { message: "boom".into() }).unwrap();
        assert_eq!(store.read(|s| s.phase), Phase::Idle);
        assert!(store.read(|s| s.expanded.is_empty()));
        assert_eq!(store.read(|s| s.last_error.clone()).as_deref(), Some("boom"));
    }

    #[test]
    fn test_reload_with_expansion_requests_refresh() {
        let store = idle_store(BuildMode::Eager);
        store.dispatch(Action::Toggle { key: "NO".into() }).unwrap();
        store.dispatch(Action::BeginLoad).unwrap();
        let commit = store
            .dispatch(Action::RootsLoaded { query: query(), roots: roots(BuildMode::Lazy), reset_expansion: false })
            .unwrap();
        assert_eq!(commit.follow_up, FollowUp::Refresh(vec!["NO".into()]));
        assert!(!commit.persist);
        assert_eq!(store.read(|s| s.phase), Phase::Expanding);
    }

    #[test]
    fn test_sort_change_persists_only_when_changed() {
        let store = idle_store(BuildMode::Lazy);
        let same = store.dispatch(Action::SetSort { sort: query().sort }).unwrap();
        assert!(!same.persist);
        let changed = store
            .dispatch(Action::SetSort { sort: SortDirective::metric("trials", SortDirection::Ascending) })
            .unwrap();
        assert!(changed.persist);
    }
}
