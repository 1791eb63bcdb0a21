//! FILENAME: core/rollup-engine/src/lib.rs
//! Rollup engine for Calcula's ad-spend and CRM reporting.
//!
//! This crate turns flat, transaction-level records into a hierarchical
//! rollup ("pivot tree") with derived metrics. It is synchronous and pure:
//! fetching rows and holding expansion state live in `rollup-view`.
//!
//! Layers:
//! - `definition`: Record, dimension and sort types (what flows through)
//! - `metrics`: Reduces a row group into one metrics record
//! - `matcher`: Attaches CRM metrics onto ad-spend rows or tree nodes
//! - `tree`: Groups rows into a keyed tree, plus drill-down
//! - `sort`: Orders every level of a tree with one comparator
//! - `key`: Node key minting/parsing and the persisted key-list codec

#[macro_use]
pub mod logging;

pub mod config;
pub mod definition;
pub mod error;
pub mod key;
pub mod matcher;
pub mod metrics;
pub mod sort;
pub mod tree;

pub use config::{MatchRule, Normalizer, RollupConfig};
pub use definition::*;
pub use error::RollupError;
pub use key::{
    child_key, decode_key_list, encode_key_list, is_ancestor, key_depth, key_segments,
    parent_filter, parent_key, KEY_SEPARATOR,
};
pub use matcher::{attach_secondary, attach_to_tree, CrossDatasetMatcher, MatchMode};
pub use metrics::{aggregate, CrmCounts, MetricsAccumulator, MetricsRecord, METRIC_NAMES};
pub use sort::{sort_tree, TreeSorter};
pub use tree::{
    build_level, build_tree, drill_down, find_node, BuildMode, DrillDownResult, TreeNode,
};
