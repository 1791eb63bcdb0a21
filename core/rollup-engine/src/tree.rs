//! FILENAME: core/rollup-engine/src/tree.rs
//! Tree Builder - groups flat rows into a keyed rollup tree.
//!
//! Algorithm (one level at a time):
//! 1. Group the current row set by the current dimension's value, keeping the
//!    order in which values first appear (sorting is a separate pass)
//! 2. Aggregate each group's full row set into the node's metrics
//! 3. Recurse into each group for the next dimension (eager mode), or leave
//!    `children` as None to be fetched later (lazy mode)
//!
//! Node keys are minted here and nowhere else.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::definition::{DimensionValue, FlatRecord};
use crate::error::RollupError;
use crate::key::{child_key, key_depth, parent_filter};
use crate::metrics::{aggregate, MetricsRecord};

// ============================================================================
// TREE NODE
// ============================================================================

/// One node of the rollup tree.
///
/// `children` is None until fetched; once set it is the complete child list,
/// possibly empty. Leaves (`has_children == false`) keep None.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub key: String,
    pub attribute: DimensionValue,
    pub depth: usize,
    pub has_children: bool,
    pub children: Option<Vec<TreeNode>>,
    pub metrics: MetricsRecord,
}

impl TreeNode {
    pub fn label<'a>(&'a self, unknown_label: &'a str) -> &'a str {
        self.attribute.label(unknown_label)
    }

    pub fn is_materialized(&self) -> bool {
        self.children.is_some()
    }

    /// Depth-first search for `key` in this node's subtree.
    pub fn find(&self, key: &str) -> Option<&TreeNode> {
        if self.key == key {
            return Some(self);
        }
        self.children
            .as_ref()
            .and_then(|children| find_node(children, key))
    }

    /// Number of nodes in this subtree, including itself.
    pub fn subtree_len(&self) -> usize {
        1 + self
            .children
            .as_ref()
            .map(|c| c.iter().map(TreeNode::subtree_len).sum())
            .unwrap_or(0)
    }
}

/// Finds a node by key anywhere in `nodes`.
pub fn find_node<'a>(nodes: &'a [TreeNode], key: &str) -> Option<&'a TreeNode> {
    nodes.iter().find_map(|n| n.find(key))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildMode {
    /// Materialize every level.
    Eager,
    /// Materialize the first level only; deeper levels are fetched on demand.
    Lazy,
}

// ============================================================================
// BUILDING
// ============================================================================

/// Builds the root level (and, in eager mode, every level below it).
/// Empty rows or an empty dimension list yield an empty tree.
pub fn build_tree(rows: &[FlatRecord], dimensions: &[String], mode: BuildMode) -> Vec<TreeNode> {
    let refs: Vec<&FlatRecord> = rows.iter().collect();
    build_nodes(&refs, dimensions, 0, None, mode == BuildMode::Eager)
}

/// Builds the children of `parent_key` (or the roots when None) as one lazy
/// level. Rows outside the parent's path are ignored, so a source may hand
/// over a superset.
pub fn build_level(
    rows: &[FlatRecord],
    dimensions: &[String],
    parent_key: Option<&str>,
) -> Result<Vec<TreeNode>, RollupError> {
    if dimensions.is_empty() {
        return Err(RollupError::EmptyDimensions);
    }
    let (depth, filter) = match parent_key {
        Some(key) => (key_depth(key) + 1, parent_filter(dimensions, key)?),
        None => (0, Vec::new()),
    };
    if depth >= dimensions.len() {
        return Err(RollupError::InvalidKey {
            key: parent_key.unwrap_or_default().to_string(),
            reason: "node is a leaf and has no children level".to_string(),
        });
    }
    let refs: Vec<&FlatRecord> = rows.iter().filter(|r| r.matches_filter(&filter)).collect();
    let level = build_nodes(&refs, dimensions, depth, parent_key, false);
    log_debug!(
        "TREE",
        "build_level parent={:?} depth={} rows={}/{} nodes={}",
        parent_key,
        depth,
        refs.len(),
        rows.len(),
        level.len()
    );
    Ok(level)
}

/// Recursively builds one level of the tree.
fn build_nodes(
    rows: &[&FlatRecord],
    dimensions: &[String],
    depth: usize,
    parent_key: Option<&str>,
    eager: bool,
) -> Vec<TreeNode> {
    if depth >= dimensions.len() || rows.is_empty() {
        return Vec::new();
    }

    let dimension = &dimensions[depth];
    let is_leaf_level = depth == dimensions.len() - 1;

    // Group by value, first-appearance order
    let mut slot_of: FxHashMap<&DimensionValue, usize> = FxHashMap::default();
    let mut groups: Vec<(&DimensionValue, Vec<&FlatRecord>)> = Vec::new();
    for &row in rows {
        let value = row.dimension(dimension);
        match slot_of.get(value) {
            Some(&slot) => groups[slot].1.push(row),
            None => {
                slot_of.insert(value, groups.len());
                groups.push((value, vec![row]));
            }
        }
    }

    groups
        .into_iter()
        .map(|(value, group)| {
            let key = child_key(parent_key, value);
            let metrics = aggregate(group.iter().copied());
            let children = if !is_leaf_level && eager {
                Some(build_nodes(&group, dimensions, depth + 1, Some(&key), true))
            } else {
                None
            };
            TreeNode {
                key,
                attribute: value.clone(),
                depth,
                has_children: !is_leaf_level,
                children,
                metrics,
            }
        })
        .collect()
}

// ============================================================================
// DRILL-DOWN
// ============================================================================

/// Source rows behind one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrillDownResult {
    /// The node key that was drilled into.
    pub key: String,

    /// Indices into the row slice that was searched.
    pub row_indices: Vec<usize>,

    /// Total count of matching rows.
    pub total_count: usize,

    /// Whether `row_indices` was cut at `max_records`.
    pub is_truncated: bool,

    pub max_records: usize,
}

/// Collects the rows under `key`, keeping at most `max_records` indices.
pub fn drill_down(
    rows: &[FlatRecord],
    dimensions: &[String],
    key: &str,
    max_records: usize,
) -> Result<DrillDownResult, RollupError> {
    let filter = parent_filter(dimensions, key)?;
    let mut result = DrillDownResult {
        key: key.to_string(),
        row_indices: Vec::new(),
        total_count: 0,
        is_truncated: false,
        max_records,
    };

    for (idx, row) in rows.iter().enumerate() {
        if row.matches_filter(&filter) {
            result.total_count += 1;
            if result.row_indices.len() < max_records {
                result.row_indices.push(idx);
            }
        }
    }

    result.is_truncated = result.total_count > max_records;
    Ok(result)
}
