//! TreeStore Trait - Persistence Contract
//!
//! This module defines the `TreeStore` trait: the narrow surface the tree engine
//! needs from whatever persistence layer hosts the records.
//!
//! # Architecture
//!
//! - **Reads**: point lookup, filtered node queries (interval containment, path
//!   prefix, parent equality) and closure-row queries
//! - **Writes**: one atomic `commit` of every change a batch produced, guarded by
//!   optimistic version checks
//! - **Locks**: non-blocking advisory locks for materialized-path trees
//!
//! # Design Decisions
//!
//! 1. **Async-First**: All methods are async so embedded and networked backends
//!    fit the same contract
//! 2. **Declarative queries**: `NodeQuery` / `ClosureQuery` carry their own
//!    matching semantics (`matches`), so adapters translate them to their query
//!    language and in-memory stores evaluate them directly
//! 3. **All-or-nothing commit**: either every row of every change set is written
//!    or none is

use super::StoreError;
use crate::models::{ClosureRow, NodeId, TreeIndex, TreeLock, TreeNode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Node filters understood by every store
#[derive(Debug, Clone, PartialEq)]
pub enum NodeQuery {
    /// Every node of the tree type
    All,

    /// Nodes with the given ids
    Ids(Vec<NodeId>),

    /// Nodes without a parent
    Roots,

    /// Direct children by parent pointer
    ChildrenOf(NodeId),

    /// Nested-set nodes strictly inside `(left, right)`
    WithinInterval {
        root: Option<NodeId>,
        left: i64,
        right: i64,
    },

    /// Nested-set nodes whose interval strictly encloses `(left, right)`
    EnclosingInterval {
        root: Option<NodeId>,
        left: i64,
        right: i64,
    },

    /// Materialized-path nodes whose path starts with the prefix
    PathPrefix(String),

    /// Materialized-path nodes whose path is one of the given paths
    PathIn(Vec<String>),
}

impl NodeQuery {
    /// Whether `node` satisfies the filter
    pub fn matches(&self, node: &TreeNode) -> bool {
        match self {
            NodeQuery::All => true,
            NodeQuery::Ids(ids) => ids.iter().any(|id| id == &node.id),
            NodeQuery::Roots => node.parent.is_none(),
            NodeQuery::ChildrenOf(parent) => node.parent.as_deref() == Some(parent.as_str()),
            NodeQuery::WithinInterval { root, left, right } => match node.index() {
                TreeIndex::Nested {
                    left: l,
                    right: r,
                    root: node_root,
                    ..
                } => same_scope(root, node_root) && *l > *left && *r < *right,
                _ => false,
            },
            NodeQuery::EnclosingInterval { root, left, right } => match node.index() {
                TreeIndex::Nested {
                    left: l,
                    right: r,
                    root: node_root,
                    ..
                } => same_scope(root, node_root) && *l < *left && *r > *right,
                _ => false,
            },
            NodeQuery::PathPrefix(prefix) => node
                .path()
                .map(|path| path.starts_with(prefix.as_str()))
                .unwrap_or(false),
            NodeQuery::PathIn(paths) => node
                .path()
                .map(|path| paths.iter().any(|p| p == path))
                .unwrap_or(false),
        }
    }
}

fn same_scope(scope: &Option<NodeId>, node_root: &Option<NodeId>) -> bool {
    match scope {
        Some(root) => node_root.as_deref() == Some(root.as_str()),
        None => true,
    }
}

/// Closure-row filters
#[derive(Debug, Clone, PartialEq)]
pub enum ClosureQuery {
    All,

    /// Rows whose descendant is `id`, at depth >= `min_depth`
    AncestorsOf { id: NodeId, min_depth: i64 },

    /// Rows whose ancestor is `id`, within the depth range
    DescendantsOf {
        id: NodeId,
        min_depth: i64,
        max_depth: Option<i64>,
    },
}

impl ClosureQuery {
    pub fn matches(&self, row: &ClosureRow) -> bool {
        match self {
            ClosureQuery::All => true,
            ClosureQuery::AncestorsOf { id, min_depth } => {
                &row.descendant == id && row.depth >= *min_depth
            }
            ClosureQuery::DescendantsOf {
                id,
                min_depth,
                max_depth,
            } => {
                &row.ancestor == id
                    && row.depth >= *min_depth
                    && max_depth.map(|max| row.depth <= max).unwrap_or(true)
            }
        }
    }
}

/// Everything stored for one tree type
#[derive(Debug, Clone, Default)]
pub struct Forest {
    pub nodes: Vec<TreeNode>,
    pub closure_rows: Vec<ClosureRow>,
}

/// All writes one batch produced for one tree type
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub tree_type: String,

    /// New rows; must not exist yet
    pub inserts: Vec<TreeNode>,

    /// Rewritten rows, carrying their bumped version
    pub updates: Vec<TreeNode>,

    pub removals: Vec<NodeId>,

    /// Versions the batch read, for every updated or removed row
    pub expected_versions: HashMap<NodeId, i64>,

    /// Commit only if the tree type has no stored nodes
    pub expect_empty: bool,

    pub closure_table: Option<String>,

    pub closure_inserts: Vec<ClosureRow>,

    pub closure_removals: Vec<ClosureRow>,
}

impl ChangeSet {
    pub fn new(tree_type: impl Into<String>) -> Self {
        Self {
            tree_type: tree_type.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.removals.is_empty()
            && self.closure_inserts.is_empty()
            && self.closure_removals.is_empty()
    }

    /// Number of rows this change set writes
    pub fn row_count(&self) -> usize {
        self.inserts.len()
            + self.updates.len()
            + self.removals.len()
            + self.closure_inserts.len()
            + self.closure_removals.len()
    }
}

/// Outcome of a lock attempt
#[derive(Debug, Clone, PartialEq)]
pub enum LockAttempt {
    /// Lock written (or refreshed for the same owner)
    Acquired,

    /// A stale lock of another owner was replaced
    TookOverStale(TreeLock),

    /// Another owner holds an unexpired lock
    Held(TreeLock),
}

/// Abstraction over the host persistence layer
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the engine shares one store across
/// batches behind an `Arc`.
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Get a node by id, `Ok(None)` when it does not exist
    async fn get_node(&self, tree_type: &str, id: &str) -> Result<Option<TreeNode>, StoreError>;

    /// Run a node filter; result order is unspecified
    async fn query_nodes(
        &self,
        tree_type: &str,
        query: &NodeQuery,
    ) -> Result<Vec<TreeNode>, StoreError>;

    /// Run a closure-row filter; result order is unspecified
    async fn query_closure(
        &self,
        closure_table: &str,
        query: &ClosureQuery,
    ) -> Result<Vec<ClosureRow>, StoreError>;

    /// Atomically apply every change set, or none of them.
    ///
    /// Fails with `VersionConflict` when a row in `expected_versions` has a
    /// different stored version, and with `ForestChanged` when `expect_empty`
    /// is set but the tree type has stored nodes.
    async fn commit(&self, changes: Vec<ChangeSet>) -> Result<(), StoreError>;

    /// Write `lock` unless another owner holds an unexpired lock on the same root
    async fn try_lock(&self, lock: TreeLock, now: DateTime<Utc>)
        -> Result<LockAttempt, StoreError>;

    /// Remove the lock on `root_id` if `owner` holds it
    async fn release_lock(
        &self,
        tree_type: &str,
        root_id: &str,
        owner: &str,
    ) -> Result<(), StoreError>;

    /// Load every node (and closure row) of a tree type
    async fn load_forest(
        &self,
        tree_type: &str,
        closure_table: Option<&str>,
    ) -> Result<Forest, StoreError> {
        let nodes = self.query_nodes(tree_type, &NodeQuery::All).await?;
        let closure_rows = match closure_table {
            Some(table) => self.query_closure(table, &ClosureQuery::All).await?,
            None => Vec::new(),
        };
        Ok(Forest {
            nodes,
            closure_rows,
        })
    }
}
