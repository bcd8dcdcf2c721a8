//! Tree Coordinator
//!
//! The single write path of the engine. Application code stages inserts,
//! updates and deletions in a `TreeBatch`; on `commit` the batch orders the
//! staged operations, plans each one through the tree type's strategy, applies
//! the planned mutations to an in-memory `WorkingSet` and hands every resulting
//! change to the store in one atomic commit.
//!
//! # Batch lifecycle
//!
//! 1. `TreeCoordinator::begin()` opens a batch with its own lock owner id
//! 2. `prepare_*` stages operations. The working set of a tree type is loaded
//!    the first time the batch touches it, and materialized-path locks are
//!    acquired right away so contention surfaces before any work is done
//! 3. `commit()` runs the staged operations parents-first (removals deepest
//!    first), writes everything or nothing, releases the locks and broadcasts
//!    a `TreeEvent` per operation
//!
//! A batch that is dropped without `commit()` or `abort()` cannot release its
//! locks; they expire after the configured timeout.

use super::events::TreeEvent;
use super::lock::TreeLockManager;
use super::repository::TreeRepository;
use super::TreeError;
use crate::config::{TreeConfig, TreeRegistry};
use crate::db::TreeStore;
use crate::models::{NodeId, TreeLock, TreeNode};
use crate::operations::{NodeChanges, Position, RemovalMode, TreeOperation, WorkingSet};
use crate::strategies::{build_strategy, Discrepancy, TreeStrategy};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Broadcast channel capacity for tree events
const TREE_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Rows written by a committed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub closure_rows_written: usize,
}

impl CommitReport {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0
            && self.updated == 0
            && self.removed == 0
            && self.closure_rows_written == 0
    }
}

/// Entry point for every tree write
pub struct TreeCoordinator {
    store: Arc<dyn TreeStore>,
    registry: TreeRegistry,
    strategies: HashMap<String, Arc<dyn TreeStrategy>>,
    locks: TreeLockManager,
    event_tx: broadcast::Sender<TreeEvent>,
}

impl TreeCoordinator {
    /// Build one strategy per registered tree type.
    ///
    /// Fails when any configuration is invalid, before any tree is touched.
    pub fn new(store: Arc<dyn TreeStore>, registry: TreeRegistry) -> Result<Self, TreeError> {
        let mut strategies = HashMap::new();
        for tree_type in registry.tree_types() {
            if let Some(config) = registry.get(tree_type) {
                strategies.insert(tree_type.to_string(), build_strategy(config)?);
            }
        }

        let (event_tx, _) = broadcast::channel(TREE_EVENT_CHANNEL_CAPACITY);
        tracing::info!(
            "Tree coordinator ready with {} tree type(s)",
            strategies.len()
        );

        Ok(Self {
            locks: TreeLockManager::new(store.clone()),
            store,
            registry,
            strategies,
            event_tx,
        })
    }

    pub fn store(&self) -> &Arc<dyn TreeStore> {
        &self.store
    }

    pub fn registry(&self) -> &TreeRegistry {
        &self.registry
    }

    pub fn config(&self, tree_type: &str) -> Result<&TreeConfig, TreeError> {
        self.registry
            .get(tree_type)
            .ok_or_else(|| TreeError::UnknownTreeType(tree_type.to_string()))
    }

    pub fn strategy(&self, tree_type: &str) -> Result<Arc<dyn TreeStrategy>, TreeError> {
        self.strategies
            .get(tree_type)
            .cloned()
            .ok_or_else(|| TreeError::UnknownTreeType(tree_type.to_string()))
    }

    /// Subscribe to events of committed batches
    pub fn subscribe_to_events(&self) -> broadcast::Receiver<TreeEvent> {
        self.event_tx.subscribe()
    }

    /// Open a new batch
    pub fn begin(&self) -> TreeBatch<'_> {
        TreeBatch::new(self)
    }

    /// Read-side queries and maintenance for one tree type
    pub fn repository(&self, tree_type: &str) -> Result<TreeRepository<'_>, TreeError> {
        TreeRepository::new(self, tree_type)
    }

    /// Load the committed state of a tree type into a fresh working set
    pub async fn load_working_set(&self, tree_type: &str) -> Result<WorkingSet, TreeError> {
        let config = self.config(tree_type)?;
        let closure_table = config.closure_table().map(String::from);
        let forest = self
            .store
            .load_forest(tree_type, closure_table.as_deref())
            .await?;

        tracing::debug!(
            "Loaded {} node(s) and {} closure row(s) of '{}'",
            forest.nodes.len(),
            forest.closure_rows.len(),
            tree_type
        );
        Ok(WorkingSet::from_forest(tree_type, closure_table, forest))
    }

    /// Compare every stored index of a tree type with its parent pointers
    pub async fn verify(&self, tree_type: &str) -> Result<Vec<Discrepancy>, TreeError> {
        let strategy = self.strategy(tree_type)?;
        let working_set = self.load_working_set(tree_type).await?;
        let discrepancies = strategy.verify(&working_set);

        if discrepancies.is_empty() {
            tracing::info!(
                "Tree '{}' verified: {} node(s) consistent",
                tree_type,
                working_set.len()
            );
        } else {
            tracing::warn!(
                "Tree '{}' has {} discrepancy(ies)",
                tree_type,
                discrepancies.len()
            );
        }
        Ok(discrepancies)
    }

    fn emit(&self, event: TreeEvent) {
        // No subscribers is not an error
        let _ = self.event_tx.send(event);
    }
}

#[derive(Debug)]
struct Staged {
    tree_type: String,
    operation: TreeOperation,
}

/// A unit of work against one or more tree types
pub struct TreeBatch<'a> {
    coordinator: &'a TreeCoordinator,
    owner: String,
    working_sets: HashMap<String, WorkingSet>,
    staged: Vec<Staged>,
    locks: Vec<TreeLock>,
}

impl<'a> TreeBatch<'a> {
    fn new(coordinator: &'a TreeCoordinator) -> Self {
        Self {
            coordinator,
            owner: Uuid::new_v4().to_string(),
            working_sets: HashMap::new(),
            staged: Vec::new(),
            locks: Vec::new(),
        }
    }

    /// Lock owner id of this batch
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Number of staged operations
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Stage a new node as the last child of its parent (or as a new root)
    pub async fn prepare_insert(&mut self, node: TreeNode) -> Result<(), TreeError> {
        self.prepare_insert_at(node, Position::LastChild).await
    }

    /// Stage a new node at an explicit position.
    ///
    /// Sibling positions take the parent from the sibling.
    pub async fn prepare_insert_at(
        &mut self,
        node: TreeNode,
        position: Position,
    ) -> Result<(), TreeError> {
        node.validate()?;
        let tree_type = node.tree_type.clone();
        let strategy = self.coordinator.strategy(&tree_type)?;

        let root = {
            let working_set = self.working_set(&tree_type).await?;
            if working_set.contains(&node.id) {
                return Err(TreeError::duplicate_node(&tree_type, &node.id));
            }
            let parent = match position.sibling() {
                Some(sibling) => {
                    working_set
                        .get(sibling)
                        .ok_or_else(|| TreeError::node_not_found(&tree_type, sibling))?
                        .parent
                        .clone()
                }
                None => node.parent.clone(),
            };
            match parent {
                Some(parent_id) => {
                    if !working_set.contains(&parent_id) {
                        return Err(TreeError::node_not_found(&tree_type, parent_id));
                    }
                    working_set.root_of(&parent_id)
                }
                None => node.id.clone(),
            }
        };

        self.lock_roots(&tree_type, strategy.as_ref(), vec![root])
            .await?;

        let id = node.id.clone();
        self.working_set_mut(&tree_type)?.stage_insert(node)?;
        self.stage(&tree_type, TreeOperation::Insert { id, position });
        Ok(())
    }

    /// Stage changes to an existing node.
    ///
    /// A new parent or an explicit position stages a move; a property change
    /// that alters the node's index stages a reindex; anything else is a plain
    /// property write.
    pub async fn prepare_update(
        &mut self,
        tree_type: &str,
        id: &str,
        changes: NodeChanges,
    ) -> Result<(), TreeError> {
        let strategy = self.coordinator.strategy(tree_type)?;

        let (operation, roots) = {
            let working_set = self.working_set(tree_type).await?;
            let node = working_set
                .get(id)
                .ok_or_else(|| TreeError::node_not_found(tree_type, id))?;

            if let Some(properties) = &changes.properties {
                if !properties.is_object() {
                    return Err(
                        crate::models::ValidationError::InvalidProperties(id.to_string()).into(),
                    );
                }
            }

            let parent_changed = changes
                .parent
                .as_ref()
                .map(|parent| parent != &node.parent)
                .unwrap_or(false);
            let reindex = changes
                .properties
                .as_ref()
                .map(|properties| strategy.needs_reindex(node, properties))
                .unwrap_or(false);

            let mut roots = vec![working_set.root_of(id)];
            let operation = if parent_changed || changes.position.is_some() {
                let position = changes.position.clone().unwrap_or_default();
                let parent = changes.parent.clone().unwrap_or_else(|| node.parent.clone());
                let target = match position.sibling() {
                    Some(sibling) => working_set
                        .get(sibling)
                        .ok_or_else(|| TreeError::node_not_found(tree_type, sibling))?
                        .parent
                        .clone(),
                    None => parent.clone(),
                };
                roots.push(match target.as_deref() {
                    Some(target_id) => working_set.root_of(target_id),
                    None => id.to_string(),
                });
                Some(TreeOperation::Move {
                    id: id.to_string(),
                    parent,
                    position,
                })
            } else if reindex {
                Some(TreeOperation::Reindex { id: id.to_string() })
            } else {
                None
            };

            (operation, roots)
        };

        if operation.is_some() {
            self.lock_roots(tree_type, strategy.as_ref(), roots).await?;
        }

        if let Some(properties) = changes.properties {
            self.working_set_mut(tree_type)?
                .set_properties(id, properties)?;
        }
        if let Some(operation) = operation {
            self.stage(tree_type, operation);
        }
        Ok(())
    }

    /// Stage the removal of a node
    pub async fn prepare_delete(
        &mut self,
        tree_type: &str,
        id: &str,
        mode: RemovalMode,
    ) -> Result<(), TreeError> {
        let strategy = self.coordinator.strategy(tree_type)?;
        let root = {
            let working_set = self.working_set(tree_type).await?;
            if !working_set.contains(id) {
                return Err(TreeError::node_not_found(tree_type, id));
            }
            working_set.root_of(id)
        };

        self.lock_roots(tree_type, strategy.as_ref(), vec![root])
            .await?;
        self.stage(
            tree_type,
            TreeOperation::Remove {
                id: id.to_string(),
                mode,
            },
        );
        Ok(())
    }

    /// Stage a rebuild of every index of a tree type from parent pointers
    pub async fn prepare_rebuild(&mut self, tree_type: &str) -> Result<(), TreeError> {
        let strategy = self.coordinator.strategy(tree_type)?;
        let roots: Vec<NodeId> = self
            .working_set(tree_type)
            .await?
            .children(None)
            .into_iter()
            .map(|node| node.id.clone())
            .collect();

        self.lock_roots(tree_type, strategy.as_ref(), roots).await?;
        self.stage(tree_type, TreeOperation::Rebuild);
        Ok(())
    }

    /// Run every staged operation and write the result atomically.
    ///
    /// Locks are released whether or not the commit succeeds.
    pub async fn commit(mut self) -> Result<CommitReport, TreeError> {
        let result = self.run().await;
        self.release_locks().await;

        match &result {
            Ok(report) => tracing::info!(
                "Committed batch {}: {} inserted, {} updated, {} removed",
                self.owner,
                report.inserted,
                report.updated,
                report.removed
            ),
            Err(e) => tracing::warn!("Batch {} failed, nothing written: {}", self.owner, e),
        }
        result
    }

    /// Discard every staged operation and release the batch's locks
    pub async fn abort(mut self) {
        tracing::debug!(
            "Aborting batch {} with {} staged operation(s)",
            self.owner,
            self.staged.len()
        );
        self.staged.clear();
        self.working_sets.clear();
        self.release_locks().await;
    }

    async fn run(&mut self) -> Result<CommitReport, TreeError> {
        let staged = self.ordered();
        let mut events = Vec::with_capacity(staged.len());

        for Staged {
            tree_type,
            operation,
        } in staged
        {
            let strategy = self.coordinator.strategy(&tree_type)?;
            let working_set = self.working_set_mut(&tree_type)?;

            if let TreeOperation::Remove { id, .. } = &operation {
                if !working_set.contains(id) {
                    tracing::debug!("Skipping removal of '{}': already removed", id);
                    continue;
                }
            }

            let mutations = strategy.plan(&operation, working_set)?;
            tracing::debug!(
                "Planned {} mutation(s) for {} on '{}'",
                mutations.len(),
                operation.name(),
                tree_type
            );
            working_set.apply(mutations)?;
            events.push((tree_type, operation));
        }

        let mut report = CommitReport::default();
        let mut changes = Vec::new();
        for working_set in self.working_sets.values() {
            let change = working_set.change_set();
            if change.is_empty() {
                continue;
            }
            report.inserted += change.inserts.len();
            report.updated += change.updates.len();
            report.removed += change.removals.len();
            report.closure_rows_written +=
                change.closure_inserts.len() + change.closure_removals.len();
            changes.push(change);
        }

        if !changes.is_empty() {
            self.coordinator.store.commit(changes).await?;
        }

        for (tree_type, operation) in events {
            if let Some(event) = self.event_for(&tree_type, operation) {
                self.coordinator.emit(event);
            }
        }
        self.working_sets.clear();

        Ok(report)
    }

    /// Staged operations in execution order.
    ///
    /// Rebuilds run first, then inserts and moves by the depth of the parent
    /// they attach to (so parents are placed before their children), then
    /// removals deepest first. Ties keep staging order.
    fn ordered(&mut self) -> Vec<Staged> {
        let staged = std::mem::take(&mut self.staged);
        let mut keyed: Vec<((u8, Reverse<usize>, usize), Staged)> = staged
            .into_iter()
            .map(|staged| {
                let depth = self.depth_of(&staged);
                let key = match staged.operation {
                    TreeOperation::Rebuild => (0, Reverse(0), 0),
                    TreeOperation::Remove { .. } => (2, Reverse(depth), 0),
                    _ => (1, Reverse(0), depth),
                };
                (key, staged)
            })
            .collect();

        // sort_by_key is stable
        keyed.sort_by_key(|(key, _)| *key);
        keyed.into_iter().map(|(_, staged)| staged).collect()
    }

    /// Number of ancestors the operation's node ends up (or starts) below
    fn depth_of(&self, staged: &Staged) -> usize {
        let Some(working_set) = self.working_sets.get(&staged.tree_type) else {
            return 0;
        };
        let chain_len = |id: &str| {
            working_set
                .ancestor_ids(id)
                .map(|chain| chain.len())
                .unwrap_or(0)
        };

        match &staged.operation {
            TreeOperation::Insert { id, position } => match position.sibling() {
                Some(sibling) => chain_len(sibling),
                None => chain_len(id),
            },
            TreeOperation::Move {
                parent, position, ..
            } => match (position.sibling(), parent) {
                (Some(sibling), _) => chain_len(sibling),
                (None, Some(parent)) => chain_len(parent) + 1,
                (None, None) => 0,
            },
            TreeOperation::Reindex { id } | TreeOperation::Remove { id, .. } => chain_len(id),
            TreeOperation::Rebuild => 0,
        }
    }

    fn event_for(&self, tree_type: &str, operation: TreeOperation) -> Option<TreeEvent> {
        let tree_type = tree_type.to_string();
        let event = match operation {
            TreeOperation::Insert { id, .. } => {
                let node = self.working_sets.get(&tree_type)?.get(&id)?.clone();
                TreeEvent::NodeInserted { node }
            }
            TreeOperation::Move { id, .. } => {
                let parent = self
                    .working_sets
                    .get(&tree_type)
                    .and_then(|working_set| working_set.get(&id))
                    .and_then(|node| node.parent.clone());
                TreeEvent::NodeMoved {
                    tree_type,
                    node_id: id,
                    parent,
                }
            }
            TreeOperation::Reindex { id } => TreeEvent::NodeReindexed {
                tree_type,
                node_id: id,
            },
            TreeOperation::Remove { id, mode } => TreeEvent::NodeRemoved {
                tree_type,
                node_id: id,
                mode,
            },
            TreeOperation::Rebuild => TreeEvent::TreeRebuilt { tree_type },
        };
        Some(event)
    }

    fn stage(&mut self, tree_type: &str, operation: TreeOperation) {
        tracing::debug!(
            "Batch {} staged {} {:?} on '{}'",
            self.owner,
            operation.name(),
            operation.node_id(),
            tree_type
        );
        self.staged.push(Staged {
            tree_type: tree_type.to_string(),
            operation,
        });
    }

    /// Working set of a tree type, loaded on first use
    async fn working_set(&mut self, tree_type: &str) -> Result<&mut WorkingSet, TreeError> {
        if !self.working_sets.contains_key(tree_type) {
            let loaded = self.coordinator.load_working_set(tree_type).await?;
            self.working_sets.insert(tree_type.to_string(), loaded);
        }
        self.working_set_mut(tree_type)
    }

    fn working_set_mut(&mut self, tree_type: &str) -> Result<&mut WorkingSet, TreeError> {
        self.working_sets
            .get_mut(tree_type)
            .ok_or_else(|| TreeError::UnknownTreeType(tree_type.to_string()))
    }

    /// Lock every root not already held, when the strategy asks for locks
    async fn lock_roots(
        &mut self,
        tree_type: &str,
        strategy: &dyn TreeStrategy,
        mut roots: Vec<NodeId>,
    ) -> Result<(), TreeError> {
        let Some(timeout) = strategy.lock_timeout() else {
            return Ok(());
        };

        roots.sort();
        roots.dedup();
        for root in roots {
            let held = self
                .locks
                .iter()
                .any(|lock| lock.tree_type == tree_type && lock.root_id == root);
            if held {
                continue;
            }
            let lock = self
                .coordinator
                .locks
                .acquire(tree_type, &root, &self.owner, timeout)
                .await?;
            self.locks.push(lock);
        }
        Ok(())
    }

    async fn release_locks(&mut self) {
        for lock in std::mem::take(&mut self.locks) {
            if let Err(e) = self.coordinator.locks.release(&lock).await {
                tracing::error!(
                    "Failed to release lock on root '{}' of '{}': {}",
                    lock.root_id,
                    lock.tree_type,
                    e
                );
            }
        }
    }
}

impl Drop for TreeBatch<'_> {
    fn drop(&mut self) {
        if !self.locks.is_empty() {
            tracing::warn!(
                "Batch {} dropped holding {} lock(s); they expire after their timeout",
                self.owner,
                self.locks.len()
            );
        }
    }
}

#[cfg(test)]
#[path = "coordinator_test.rs"]
mod coordinator_test;
