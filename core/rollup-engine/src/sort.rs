//! FILENAME: core/rollup-engine/src/sort.rs
//! Tree Sorter - orders every level of a rollup tree with one comparator.
//!
//! The same directive applies at every depth. The one exception is a level
//! whose dimension is the configured date dimension: it is always ordered
//! newest-first, whatever metric or direction was requested.

use std::cmp::Ordering;

use chrono::NaiveDate;

use crate::definition::{parse_date, SortDirection, SortDirective, SortKey};
use crate::metrics::METRIC_NAMES;
use crate::tree::TreeNode;

// ============================================================================
// TREE SORTER
// ============================================================================

pub struct TreeSorter<'a> {
    dimensions: &'a [String],
    directive: &'a SortDirective,
    date_dimension: &'a str,
}

impl<'a> TreeSorter<'a> {
    pub fn new(dimensions: &'a [String], directive: &'a SortDirective, date_dimension: &'a str) -> Self {
        TreeSorter { dimensions, directive, date_dimension }
    }

    /// Returns a sorted copy of `nodes`; the input is left untouched.
    pub fn sort(&self, nodes: &[TreeNode]) -> Vec<TreeNode> {
        let mut sorted: Vec<TreeNode> = nodes
            .iter()
            .map(|node| TreeNode {
                children: node.children.as_deref().map(|c| self.sort(c)),
                ..node.clone()
            })
            .collect();
        // sort_by is stable, so ties keep their incoming order
        sorted.sort_by(|a, b| self.compare(a, b));
        sorted
    }

    fn is_date_level(&self, depth: usize) -> bool {
        self.dimensions
            .get(depth)
            .map(|d| d == self.date_dimension)
            .unwrap_or(false)
    }

    /// Compares two siblings.
    pub fn compare(&self, a: &TreeNode, b: &TreeNode) -> Ordering {
        if self.is_date_level(a.depth) {
            return compare_dates(node_date(a), node_date(b), SortDirection::Descending);
        }
        match &self.directive.key {
            SortKey::Date => compare_dates(node_date(a), node_date(b), self.directive.direction),
            SortKey::Metric(name) => {
                let va = metric_value(a, name);
                let vb = metric_value(b, name);
                match self.directive.direction {
                    SortDirection::Ascending => va.total_cmp(&vb),
                    SortDirection::Descending => vb.total_cmp(&va),
                }
            }
        }
    }
}

/// Missing or non-finite metric values compare as 0.
fn metric_value(node: &TreeNode, name: &str) -> f64 {
    node.metrics
        .value(name)
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn node_date(node: &TreeNode) -> Option<NaiveDate> {
    node.attribute.as_known().and_then(parse_date)
}

/// Orders dates in `direction`; nodes without a parseable date go last.
fn compare_dates(a: Option<NaiveDate>, b: Option<NaiveDate>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(da), Some(db)) => match direction {
            SortDirection::Ascending => da.cmp(&db),
            SortDirection::Descending => db.cmp(&da),
        },
    }
}

/// Sorts a whole tree by `directive`, with date levels newest-first.
pub fn sort_tree(
    nodes: &[TreeNode],
    dimensions: &[String],
    directive: &SortDirective,
    date_dimension: &str,
) -> Vec<TreeNode> {
    if let SortKey::Metric(name) = &directive.key {
        if !METRIC_NAMES.contains(&name.as_str()) {
            log_warn!("SORT", "unknown sort metric '{}', keeping source order", name);
        }
    }
    let sorted = TreeSorter::new(dimensions, directive, date_dimension).sort(nodes);
    log_debug!(
        "SORT",
        "sorted {} roots by {} {}",
        sorted.len(),
        directive.key.as_str(),
        directive.direction.as_param()
    );
    sorted
}
