//! Working set for one tree type within a batch
//!
//! The working set is an arena holding every node (and closure row) of a tree
//! type as loaded at the start of a batch. Staged inserts join the arena
//! unplaced; strategies read it to plan, and `apply` executes their mutations in
//! memory so later operations of the same batch see consistent indexes before
//! anything is written. At commit time the arena diffs itself against what it
//! loaded and produces a single `ChangeSet`.

use super::IndexMutation;
use crate::db::{ChangeSet, Forest};
use crate::models::{ClosureRow, NodeId, TreeIndex, TreeNode};
use crate::services::TreeError;
use crate::strategies::materialized_path::path_digest;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Stable index of a node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Clean,
    Dirty,
    Inserted,
    Removed,
    /// Inserted and removed within the same batch
    Discarded,
}

#[derive(Debug, Clone)]
struct Entry {
    node: TreeNode,
    state: EntryState,
}

impl Entry {
    fn is_live(&self) -> bool {
        !matches!(self.state, EntryState::Removed | EntryState::Discarded)
    }

    fn touch(&mut self) {
        if self.state == EntryState::Clean {
            self.state = EntryState::Dirty;
        }
    }
}

type ClosureKey = (NodeId, NodeId);

#[derive(Debug, Clone)]
pub struct WorkingSet {
    tree_type: String,
    closure_table: Option<String>,
    entries: Vec<Entry>,
    handles: HashMap<NodeId, NodeHandle>,
    closure: BTreeMap<ClosureKey, i64>,
    loaded_closure: BTreeMap<ClosureKey, i64>,
    expect_empty: bool,
}

impl WorkingSet {
    pub fn from_forest(
        tree_type: impl Into<String>,
        closure_table: Option<String>,
        forest: Forest,
    ) -> Self {
        let mut set = Self {
            tree_type: tree_type.into(),
            closure_table,
            entries: Vec::with_capacity(forest.nodes.len()),
            handles: HashMap::with_capacity(forest.nodes.len()),
            closure: BTreeMap::new(),
            loaded_closure: BTreeMap::new(),
            expect_empty: false,
        };

        for node in forest.nodes {
            set.push(node, EntryState::Clean);
        }
        for row in forest.closure_rows {
            set.closure
                .insert((row.ancestor.clone(), row.descendant.clone()), row.depth);
        }
        set.loaded_closure = set.closure.clone();
        set
    }

    /// Working set built directly from nodes (no closure rows)
    pub fn from_nodes(tree_type: impl Into<String>, nodes: Vec<TreeNode>) -> Self {
        Self::from_forest(
            tree_type,
            None,
            Forest {
                nodes,
                closure_rows: Vec::new(),
            },
        )
    }

    fn push(&mut self, node: TreeNode, state: EntryState) -> NodeHandle {
        let handle = NodeHandle(self.entries.len());
        self.handles.insert(node.id.clone(), handle);
        self.entries.push(Entry { node, state });
        handle
    }

    pub fn tree_type(&self) -> &str {
        &self.tree_type
    }

    pub fn handle(&self, id: &str) -> Option<NodeHandle> {
        self.handles
            .get(id)
            .copied()
            .filter(|handle| self.entries[handle.0].is_live())
    }

    pub fn get(&self, id: &str) -> Option<&TreeNode> {
        self.handle(id).map(|handle| &self.entries[handle.0].node)
    }

    pub fn node(&self, handle: NodeHandle) -> &TreeNode {
        &self.entries[handle.0].node
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handle(id).is_some()
    }

    /// Live nodes in arena order
    pub fn nodes(&self) -> impl Iterator<Item = &TreeNode> {
        self.entries
            .iter()
            .filter(|entry| entry.is_live())
            .map(|entry| &entry.node)
    }

    pub fn len(&self) -> usize {
        self.nodes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Direct children by parent pointer, in arena order
    pub fn children(&self, parent: Option<&str>) -> Vec<&TreeNode> {
        self.nodes()
            .filter(|node| node.parent.as_deref() == parent)
            .collect()
    }

    /// Ids of the parent chain, root first. `None` when the chain loops.
    pub fn ancestor_ids(&self, id: &str) -> Option<Vec<NodeId>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        seen.insert(id.to_string());

        let mut current = self.get(id).and_then(|node| node.parent.clone());
        while let Some(parent_id) = current {
            if !seen.insert(parent_id.clone()) {
                return None;
            }
            current = self.get(&parent_id).and_then(|node| node.parent.clone());
            let exists = self.contains(&parent_id);
            chain.push(parent_id);
            if !exists {
                break;
            }
        }

        chain.reverse();
        Some(chain)
    }

    /// Whether `ancestor` is on the parent chain of `id`
    pub fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = self.get(id).and_then(|node| node.parent.clone());
        while let Some(parent_id) = current {
            if parent_id == ancestor {
                return true;
            }
            if !seen.insert(parent_id.clone()) {
                return false;
            }
            current = self.get(&parent_id).and_then(|node| node.parent.clone());
        }
        false
    }

    /// Top of the parent chain (the node itself for roots)
    pub fn root_of(&self, id: &str) -> NodeId {
        self.ancestor_ids(id)
            .and_then(|chain| chain.into_iter().find(|candidate| self.contains(candidate)))
            .unwrap_or_else(|| id.to_string())
    }

    /// The node and all its descendants by parent pointer, pre-order
    pub fn subtree_ids(&self, id: &str) -> Vec<NodeId> {
        let mut by_parent: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in self.nodes() {
            if let Some(parent) = node.parent.as_deref() {
                by_parent.entry(parent).or_default().push(&node.id);
            }
        }

        let mut result = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            result.push(current.to_string());
            if let Some(children) = by_parent.get(current) {
                stack.extend(children.iter().rev());
            }
        }
        result
    }

    /// Closure rows whose descendant is `id`
    pub fn rows_to(&self, id: &str) -> Vec<ClosureRow> {
        self.closure
            .iter()
            .filter(|((_, descendant), _)| descendant == id)
            .map(|((ancestor, descendant), depth)| ClosureRow::new(ancestor, descendant, *depth))
            .collect()
    }

    /// Closure rows whose ancestor is `id`
    pub fn rows_from(&self, id: &str) -> Vec<ClosureRow> {
        self.closure
            .range((id.to_string(), String::new())..)
            .take_while(|((ancestor, _), _)| ancestor == id)
            .map(|((ancestor, descendant), depth)| ClosureRow::new(ancestor, descendant, *depth))
            .collect()
    }

    pub fn closure_rows(&self) -> Vec<ClosureRow> {
        self.closure
            .iter()
            .map(|((ancestor, descendant), depth)| ClosureRow::new(ancestor, descendant, *depth))
            .collect()
    }

    /// Add a new node, unplaced, to the arena
    pub(crate) fn stage_insert(&mut self, mut node: TreeNode) -> Result<NodeHandle, TreeError> {
        if self.handles.contains_key(&node.id) {
            return Err(TreeError::duplicate_node(&self.tree_type, &node.id));
        }
        node.set_index(TreeIndex::Unplaced);
        node.version = 1;
        Ok(self.push(node, EntryState::Inserted))
    }

    pub(crate) fn set_properties(&mut self, id: &str, properties: Value) -> Result<(), TreeError> {
        let entry = self.entry_mut(id)?;
        if entry.node.properties != properties {
            entry.node.properties = properties;
            entry.touch();
        }
        Ok(())
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut Entry, TreeError> {
        let handle = self
            .handle(id)
            .ok_or_else(|| TreeError::node_not_found(&self.tree_type, id))?;
        Ok(&mut self.entries[handle.0])
    }

    /// Apply planned mutations in order
    pub fn apply(&mut self, mutations: Vec<IndexMutation>) -> Result<(), TreeError> {
        for mutation in mutations {
            tracing::trace!("Applying {} to '{}'", mutation.label(), self.tree_type);
            self.apply_one(mutation)?;
        }
        Ok(())
    }

    fn apply_one(&mut self, mutation: IndexMutation) -> Result<(), TreeError> {
        match mutation {
            IndexMutation::Place { id, parent, index } => {
                let entry = self.entry_mut(&id)?;
                if entry.node.parent != parent || *entry.node.index() != index {
                    entry.node.parent = parent;
                    entry.node.set_index(index);
                    entry.touch();
                }
            }
            IndexMutation::SetParent { id, parent } => {
                let entry = self.entry_mut(&id)?;
                if entry.node.parent != parent {
                    entry.node.parent = parent;
                    entry.touch();
                }
            }
            IndexMutation::ShiftBounds {
                root,
                from,
                delta,
                exclude,
            } => {
                for entry in self.entries.iter_mut().filter(|entry| entry.is_live()) {
                    if exclude.contains(&entry.node.id) {
                        continue;
                    }
                    let TreeIndex::Nested {
                        left,
                        right,
                        root: node_root,
                        ..
                    } = entry.node.index_mut()
                    else {
                        continue;
                    };
                    if root.is_some() && *node_root != root {
                        continue;
                    }
                    let mut changed = false;
                    if *left >= from {
                        *left += delta;
                        changed = true;
                    }
                    if *right >= from {
                        *right += delta;
                        changed = true;
                    }
                    if changed {
                        entry.touch();
                    }
                }
            }
            IndexMutation::OffsetSubtree {
                ids,
                delta,
                level_delta,
                root,
            } => {
                for id in ids {
                    let entry = self.entry_mut(&id)?;
                    if let TreeIndex::Nested {
                        left,
                        right,
                        level,
                        root: node_root,
                    } = entry.node.index_mut()
                    {
                        *left += delta;
                        *right += delta;
                        *level += level_delta;
                        *node_root = root.clone();
                    }
                    entry.touch();
                }
            }
            IndexMutation::RewritePrefix {
                ids,
                old_prefix,
                new_prefix,
                level_delta,
                rehash,
            } => {
                for id in ids {
                    let entry = self.entry_mut(&id)?;
                    if let TreeIndex::Path {
                        path,
                        path_hash,
                        level,
                    } = entry.node.index_mut()
                    {
                        let Some(rest) = path.strip_prefix(old_prefix.as_str()) else {
                            continue;
                        };
                        *path = format!("{}{}", new_prefix, rest);
                        *level += level_delta;
                        if rehash {
                            *path_hash = Some(path_digest(path));
                        }
                        entry.touch();
                    }
                }
            }
            IndexMutation::Remove { ids } => {
                for id in ids {
                    let Some(handle) = self.handle(&id) else {
                        continue;
                    };
                    let entry = &mut self.entries[handle.0];
                    entry.state = match entry.state {
                        EntryState::Inserted => EntryState::Discarded,
                        _ => EntryState::Removed,
                    };
                }
            }
            IndexMutation::InsertClosure(row) => {
                self.closure.insert((row.ancestor, row.descendant), row.depth);
            }
            IndexMutation::RemoveClosure {
                ancestor,
                descendant,
            } => {
                self.closure.remove(&(ancestor, descendant));
            }
            IndexMutation::Touch { ids } => {
                // Ids known only from stale closure rows have no entry
                for id in ids {
                    if let Some(handle) = self.handle(&id) {
                        self.entries[handle.0].touch();
                    }
                }
            }
            IndexMutation::ExpectEmpty => {
                self.expect_empty = true;
            }
        }
        Ok(())
    }

    pub fn inserted_ids(&self) -> Vec<NodeId> {
        self.ids_in(EntryState::Inserted)
    }

    pub fn updated_ids(&self) -> Vec<NodeId> {
        self.ids_in(EntryState::Dirty)
    }

    pub fn removed_ids(&self) -> Vec<NodeId> {
        self.ids_in(EntryState::Removed)
    }

    fn ids_in(&self, state: EntryState) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|entry| entry.state == state)
            .map(|entry| entry.node.id.clone())
            .collect()
    }

    /// Diff against the loaded state
    pub fn change_set(&self) -> ChangeSet {
        let mut change = ChangeSet::new(&self.tree_type);
        change.closure_table = self.closure_table.clone();
        change.expect_empty = self.expect_empty;

        for entry in &self.entries {
            match entry.state {
                EntryState::Inserted => change.inserts.push(entry.node.clone()),
                EntryState::Dirty => {
                    let mut node = entry.node.clone();
                    change
                        .expected_versions
                        .insert(node.id.clone(), node.version);
                    node.version += 1;
                    change.updates.push(node);
                }
                EntryState::Removed => {
                    change
                        .expected_versions
                        .insert(entry.node.id.clone(), entry.node.version);
                    change.removals.push(entry.node.id.clone());
                }
                EntryState::Clean | EntryState::Discarded => {}
            }
        }

        for ((ancestor, descendant), depth) in &self.loaded_closure {
            let key = (ancestor.clone(), descendant.clone());
            if self.closure.get(&key) != Some(depth) {
                change
                    .closure_removals
                    .push(ClosureRow::new(ancestor, descendant, *depth));
            }
        }
        for ((ancestor, descendant), depth) in &self.closure {
            let key = (ancestor.clone(), descendant.clone());
            if self.loaded_closure.get(&key) != Some(depth) {
                change
                    .closure_inserts
                    .push(ClosureRow::new(ancestor, descendant, *depth));
            }
        }

        change
    }
}
