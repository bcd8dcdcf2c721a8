//! In-memory TreeStore
//!
//! A complete `TreeStore` backed by hash maps behind a tokio `RwLock`. Used by the
//! test suites, the benchmarks and the `tree-doctor` dev tool. Commits validate
//! every version before touching any row, so a failed commit leaves the store
//! exactly as it was.

use super::{ChangeSet, ClosureQuery, LockAttempt, NodeQuery, StoreError, TreeStore};
use crate::models::{ClosureRow, NodeId, TreeLock, TreeNode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryState {
    /// tree type → id → node
    nodes: HashMap<String, BTreeMap<NodeId, TreeNode>>,
    /// closure table → rows
    closure: HashMap<String, BTreeSet<ClosureRow>>,
    /// (tree type, root id) → lock
    locks: HashMap<(String, NodeId), TreeLock>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a node as-is, bypassing the engine.
    ///
    /// Seeds fixtures and simulates rows written by other tooling; nothing here
    /// keeps indexes consistent.
    pub async fn put_node(&self, node: TreeNode) {
        let mut state = self.state.write().await;
        state
            .nodes
            .entry(node.tree_type.clone())
            .or_default()
            .insert(node.id.clone(), node);
    }

    /// Write a closure row as-is, bypassing the engine
    pub async fn put_closure_row(&self, closure_table: &str, row: ClosureRow) {
        let mut state = self.state.write().await;
        let rows = state.closure.entry(closure_table.to_string()).or_default();
        rows.retain(|existing| existing.key() != row.key());
        rows.insert(row);
    }

    /// Delete a closure row as-is, bypassing the engine
    pub async fn remove_closure_row(&self, closure_table: &str, ancestor: &str, descendant: &str) {
        let mut state = self.state.write().await;
        if let Some(rows) = state.closure.get_mut(closure_table) {
            rows.retain(|row| !(row.ancestor == ancestor && row.descendant == descendant));
        }
    }

    /// Current lock on a root, if any
    pub async fn lock_for(&self, tree_type: &str, root_id: &str) -> Option<TreeLock> {
        let state = self.state.read().await;
        state
            .locks
            .get(&(tree_type.to_string(), root_id.to_string()))
            .cloned()
    }

    /// Number of stored nodes of a tree type
    pub async fn node_count(&self, tree_type: &str) -> usize {
        let state = self.state.read().await;
        state.nodes.get(tree_type).map(|n| n.len()).unwrap_or(0)
    }

    fn validate(state: &MemoryState, change: &ChangeSet) -> Result<(), StoreError> {
        let nodes = state.nodes.get(&change.tree_type);
        let current = |id: &str| nodes.and_then(|n| n.get(id)).map(|node| node.version);

        if change.expect_empty && nodes.is_some_and(|n| !n.is_empty()) {
            return Err(StoreError::forest_changed(&change.tree_type));
        }

        for node in &change.inserts {
            if current(&node.id).is_some() {
                return Err(StoreError::duplicate_node(&node.id));
            }
        }

        let checked = change
            .updates
            .iter()
            .map(|node| node.id.as_str())
            .chain(change.removals.iter().map(|id| id.as_str()));
        for id in checked {
            let Some(expected) = change.expected_versions.get(id) else {
                continue;
            };
            let actual = current(id);
            if actual != Some(*expected) {
                return Err(StoreError::version_conflict(id, *expected, actual));
            }
        }

        Ok(())
    }

    fn apply(state: &mut MemoryState, change: ChangeSet) {
        let nodes = state.nodes.entry(change.tree_type.clone()).or_default();
        for id in &change.removals {
            nodes.remove(id);
        }
        for node in change.inserts.into_iter().chain(change.updates) {
            nodes.insert(node.id.clone(), node);
        }

        if let Some(table) = change.closure_table {
            let rows = state.closure.entry(table).or_default();
            for row in &change.closure_removals {
                rows.remove(row);
            }
            rows.extend(change.closure_inserts);
        }
    }
}

#[async_trait]
impl TreeStore for MemoryStore {
    async fn get_node(&self, tree_type: &str, id: &str) -> Result<Option<TreeNode>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .nodes
            .get(tree_type)
            .and_then(|nodes| nodes.get(id))
            .cloned())
    }

    async fn query_nodes(
        &self,
        tree_type: &str,
        query: &NodeQuery,
    ) -> Result<Vec<TreeNode>, StoreError> {
        let state = self.state.read().await;
        let Some(nodes) = state.nodes.get(tree_type) else {
            return Ok(Vec::new());
        };
        Ok(nodes
            .values()
            .filter(|node| query.matches(node))
            .cloned()
            .collect())
    }

    async fn query_closure(
        &self,
        closure_table: &str,
        query: &ClosureQuery,
    ) -> Result<Vec<ClosureRow>, StoreError> {
        let state = self.state.read().await;
        let Some(rows) = state.closure.get(closure_table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|row| query.matches(row))
            .cloned()
            .collect())
    }

    async fn commit(&self, changes: Vec<ChangeSet>) -> Result<(), StoreError> {
        let mut state = self.state.write().await;

        for change in &changes {
            Self::validate(&state, change)?;
        }

        for change in changes {
            tracing::debug!(
                "Applying {} row change(s) to tree type '{}'",
                change.row_count(),
                change.tree_type
            );
            Self::apply(&mut state, change);
        }

        Ok(())
    }

    async fn try_lock(
        &self,
        lock: TreeLock,
        now: DateTime<Utc>,
    ) -> Result<LockAttempt, StoreError> {
        let mut state = self.state.write().await;
        let key = (lock.tree_type.clone(), lock.root_id.clone());

        let attempt = match state.locks.get(&key) {
            Some(existing) if existing.blocks(&lock.owner, now) => {
                return Ok(LockAttempt::Held(existing.clone()));
            }
            Some(existing) if existing.owner != lock.owner => {
                LockAttempt::TookOverStale(existing.clone())
            }
            _ => LockAttempt::Acquired,
        };

        state.locks.insert(key, lock);
        Ok(attempt)
    }

    async fn release_lock(
        &self,
        tree_type: &str,
        root_id: &str,
        owner: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let key = (tree_type.to_string(), root_id.to_string());
        if state
            .locks
            .get(&key)
            .map(|lock| lock.owner == owner)
            .unwrap_or(false)
        {
            state.locks.remove(&key);
        }
        Ok(())
    }
}
