//! FILENAME: core/rollup-view/src/arena.rs
//! Node arena for the materialized tree.
//!
//! Nodes live in a slot vector and are indexed by key. Parent and child links
//! are slot indices, so replacing a node's children is a write to one slot
//! plus inserting the new children. Freed slots are reused.

use rollup_engine::{DimensionValue, MetricsRecord, TreeNode};
use rustc_hash::FxHashMap;

use crate::error::ViewError;

#[derive(Debug, Clone)]
pub struct ArenaNode {
    pub key: String,
    pub attribute: DimensionValue,
    pub depth: usize,
    pub has_children: bool,
    pub metrics: MetricsRecord,
    pub parent: Option<usize>,
    /// None until fetched; then the complete child list.
    pub children: Option<Vec<usize>>,
}

impl ArenaNode {
    pub fn is_materialized(&self) -> bool {
        self.children.is_some()
    }

    /// Has children that were never fetched.
    pub fn needs_fetch(&self) -> bool {
        self.has_children && self.children.is_none()
    }
}

#[derive(Debug, Default)]
pub struct TreeArena {
    slots: Vec<Option<ArenaNode>>,
    free: Vec<usize>,
    index: FxHashMap<String, usize>,
    roots: Vec<usize>,
}

impl TreeArena {
    pub fn new() -> Self {
        TreeArena::default()
    }

    pub fn from_nodes(nodes: &[TreeNode]) -> Self {
        let mut arena = TreeArena::new();
        let roots: Vec<usize> = nodes.iter().map(|n| arena.insert(n, None)).collect();
        arena.roots = roots;
        arena
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&ArenaNode> {
        self.index.get(key).and_then(|&id| self.slot(id))
    }

    fn slot(&self, id: usize) -> Option<&ArenaNode> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: usize) -> Option<&mut ArenaNode> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    fn alloc(&mut self, node: ArenaNode) -> usize {
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(node);
                id
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    /// Inserts `node` and any materialized descendants.
    fn insert(&mut self, node: &TreeNode, parent: Option<usize>) -> usize {
        let id = self.alloc(ArenaNode {
            key: node.key.clone(),
            attribute: node.attribute.clone(),
            depth: node.depth,
            has_children: node.has_children,
            metrics: node.metrics,
            parent,
            children: None,
        });
        self.index.insert(node.key.clone(), id);
        if let Some(children) = &node.children {
            let ids: Vec<usize> = children.iter().map(|c| self.insert(c, Some(id))).collect();
            if let Some(slot) = self.slot_mut(id) {
                slot.children = Some(ids);
            }
        }
        id
    }

    /// Frees `id` and its subtree.
    fn release(&mut self, id: usize) {
        let Some(node) = self.slots.get_mut(id).and_then(Option::take) else {
            return;
        };
        if self.index.get(&node.key) == Some(&id) {
            self.index.remove(&node.key);
        }
        self.free.push(id);
        for child in node.children.unwrap_or_default() {
            self.release(child);
        }
    }

    /// Replaces the children of `key` with `children`. Any previous subtree
    /// is released. Returns the number of children installed.
    pub fn set_children(&mut self, key: &str, children: &[TreeNode]) -> Result<usize, ViewError> {
        let id = *self
            .index
            .get(key)
            .ok_or_else(|| ViewError::UnknownNode(key.to_string()))?;

        let previous = self.slot_mut(id).and_then(|n| n.children.take());
        for child in previous.unwrap_or_default() {
            self.release(child);
        }

        let ids: Vec<usize> = children.iter().map(|c| self.insert(c, Some(id))).collect();
        let count = ids.len();
        if let Some(slot) = self.slot_mut(id) {
            slot.children = Some(ids);
        }
        Ok(count)
    }

    /// Keys of all nodes at `depth`, in tree order.
    pub fn keys_at_depth(&self, depth: usize) -> Vec<String> {
        let mut level: Vec<usize> = self.roots.clone();
        for _ in 0..depth {
            level = level
                .iter()
                .filter_map(|&id| self.slot(id))
                .filter_map(|n| n.children.as_ref())
                .flatten()
                .copied()
                .collect();
        }
        level
            .iter()
            .filter_map(|&id| self.slot(id))
            .map(|n| n.key.clone())
            .collect()
    }

    /// Exports the materialized tree.
    pub fn to_tree(&self) -> Vec<TreeNode> {
        self.export_all(&self.roots)
    }

    fn export_all(&self, ids: &[usize]) -> Vec<TreeNode> {
        ids.iter()
            .filter_map(|&id| self.slot(id))
            .map(|n| TreeNode {
                key: n.key.clone(),
                attribute: n.attribute.clone(),
                depth: n.depth,
                has_children: n.has_children,
                children: n.children.as_deref().map(|c| self.export_all(c)),
                metrics: n.metrics,
            })
            .collect()
    }
}
