//! FILENAME: core/rollup-view/src/lib.rs
//! View layer for rollup trees.
//!
//! Holds which nodes are expanded, loads tree levels lazily from a
//! `NodeSource`, and restores a persisted expansion after mount. The engine
//! does the grouping and arithmetic; this crate does the waiting.
//!
//! Layers:
//! - `source`: Collaborator traits, fetch parameters, the rows → level bridge
//! - `arena`: Materialized tree addressed by node key
//! - `store`: Reducer and guard invariants (single mutation entry point)
//! - `reconciler`: Async shell: mount, restore, toggle, cancellation
//! - `state`: Persisted view parameters and the host state store

pub mod arena;
pub mod error;
pub mod reconciler;
pub mod source;
pub mod state;
pub mod store;

pub use arena::{ArenaNode, TreeArena};
pub use error::{RestoreReport, SourceError, ViewError};
pub use reconciler::{ExpansionReconciler, ToggleOutcome};
pub use source::{
    FetchParams, MemoryRowSource, MemorySecondarySource, NodeSource, RollupSource, RowSource,
    SecondarySource, ViewQuery,
};
pub use state::{MemoryStateStore, ParamNames, PersistedView, StateStore, ViewOptions};
pub use store::{Action, Commit, FollowUp, Phase, ViewState, ViewStore};
