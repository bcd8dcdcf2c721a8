//! Tree Indexing Strategies
//!
//! This module defines the `TreeStrategy` contract and its three implementations:
//!
//! - `NestedSetStrategy` - left/right intervals, sibling order, root scoping
//! - `MaterializedPathStrategy` - delimited ancestor paths with optional hashing
//!   and per-root locking
//! - `ClosureTableStrategy` - ancestor/descendant/depth rows in a side table
//!
//! # Architecture
//!
//! Strategies are pure planners on the write side: `plan` inspects the
//! `WorkingSet` and returns the `IndexMutation`s an operation needs, without
//! touching anything. The coordinator applies them. On the read side each
//! strategy answers the structural queries (roots, descendants, ancestors,
//! child counts) against committed state through the `TreeStore`, which is
//! what lets the repository layer be written once for all three.

pub mod closure_table;
pub mod materialized_path;
pub mod nested_set;

pub use closure_table::ClosureTableStrategy;
pub use materialized_path::MaterializedPathStrategy;
pub use nested_set::NestedSetStrategy;

use crate::config::{StrategyConfig, StrategyKind, TreeConfig};
use crate::db::TreeStore;
use crate::models::{NodeId, TreeNode};
use crate::operations::{IndexMutation, TreeOperation, WorkingSet};
use crate::services::TreeError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// One consistency problem found by `verify()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    /// Node the problem belongs to; `None` for index-level problems
    pub node_id: Option<NodeId>,

    /// Root (or interval scope) the problem was found in
    pub root: Option<NodeId>,

    pub kind: DiscrepancyKind,
}

impl Discrepancy {
    pub fn node(node_id: impl Into<NodeId>, kind: DiscrepancyKind) -> Self {
        Self {
            node_id: Some(node_id.into()),
            root: None,
            kind,
        }
    }

    pub fn index(root: Option<NodeId>, kind: DiscrepancyKind) -> Self {
        Self {
            node_id: None,
            root,
            kind,
        }
    }

    pub fn in_root(mut self, root: Option<NodeId>) -> Self {
        self.root = root;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DiscrepancyKind {
    /// The node has no computed index
    Unplaced,

    /// The parent pointer chain loops back on itself
    Cycle,

    /// The parent pointer names a node that does not exist
    OrphanParent { parent: NodeId },

    InvalidBounds { left: i64, right: i64 },

    WrongRoot {
        expected: Option<NodeId>,
        actual: Option<NodeId>,
    },

    /// The node's interval is not strictly inside its parent's
    OutsideParent { parent: NodeId },

    WrongLevel { expected: i64, actual: i64 },

    MissingEndpoint { value: i64 },

    DuplicateEndpoint { value: i64 },

    EndpointOutOfRange { value: i64, max: i64 },

    WrongPath { expected: String, actual: String },

    WrongPathHash,

    /// The path segment cannot be computed from the node's properties
    InvalidSegment { reason: String },

    MissingClosureRow { ancestor: NodeId, depth: i64 },

    UnexpectedClosureRow { ancestor: NodeId, depth: i64 },

    WrongClosureDepth {
        ancestor: NodeId,
        expected: i64,
        actual: i64,
    },
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(id) => write!(f, "node {}: ", id)?,
            None => match &self.root {
                Some(root) => write!(f, "root {}: ", root)?,
                None => f.write_str("forest: ")?,
            },
        }

        match &self.kind {
            DiscrepancyKind::Unplaced => f.write_str("index was never computed"),
            DiscrepancyKind::Cycle => f.write_str("parent chain contains a cycle"),
            DiscrepancyKind::OrphanParent { parent } => {
                write!(f, "parent {} does not exist", parent)
            }
            DiscrepancyKind::InvalidBounds { left, right } => {
                write!(f, "left {} is not lower than right {}", left, right)
            }
            DiscrepancyKind::WrongRoot { expected, actual } => {
                write!(f, "root is {:?}, expected {:?}", actual, expected)
            }
            DiscrepancyKind::OutsideParent { parent } => {
                write!(f, "interval is outside the interval of parent {}", parent)
            }
            DiscrepancyKind::WrongLevel { expected, actual } => {
                write!(f, "level is {}, expected {}", actual, expected)
            }
            DiscrepancyKind::MissingEndpoint { value } => {
                write!(f, "interval endpoint {} is missing", value)
            }
            DiscrepancyKind::DuplicateEndpoint { value } => {
                write!(f, "interval endpoint {} is used more than once", value)
            }
            DiscrepancyKind::EndpointOutOfRange { value, max } => {
                write!(f, "interval endpoint {} is outside 1..={}", value, max)
            }
            DiscrepancyKind::WrongPath { expected, actual } => {
                write!(f, "path is '{}', expected '{}'", actual, expected)
            }
            DiscrepancyKind::WrongPathHash => f.write_str("path hash does not match the path"),
            DiscrepancyKind::InvalidSegment { reason } => {
                write!(f, "path segment cannot be built: {}", reason)
            }
            DiscrepancyKind::MissingClosureRow { ancestor, depth } => {
                write!(f, "missing closure row from {} at depth {}", ancestor, depth)
            }
            DiscrepancyKind::UnexpectedClosureRow { ancestor, depth } => {
                write!(f, "unexpected closure row from {} at depth {}", ancestor, depth)
            }
            DiscrepancyKind::WrongClosureDepth {
                ancestor,
                expected,
                actual,
            } => write!(
                f,
                "closure row from {} has depth {}, expected {}",
                ancestor, actual, expected
            ),
        }
    }
}

/// Index maintenance and structural queries for one tree type
#[async_trait]
pub trait TreeStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn tree_type(&self) -> &str;

    /// Mutations that carry out `operation` on the working set.
    ///
    /// Must fail before returning anything when the operation is invalid, so a
    /// rejected operation never leaves partial state behind.
    fn plan(
        &self,
        operation: &TreeOperation,
        working_set: &WorkingSet,
    ) -> Result<Vec<IndexMutation>, TreeError>;

    /// Compare stored indexes with what the parent pointers imply
    fn verify(&self, working_set: &WorkingSet) -> Vec<Discrepancy>;

    /// Mutations that rebuild every index from parent pointers alone
    fn recover(&self, working_set: &WorkingSet) -> Result<Vec<IndexMutation>, TreeError>;

    /// Lock timeout, when structural writes must hold a tree lock
    fn lock_timeout(&self) -> Option<chrono::Duration> {
        None
    }

    /// Whether replacing `node`'s properties with `properties` changes its index
    fn needs_reindex(&self, _node: &TreeNode, _properties: &serde_json::Value) -> bool {
        false
    }

    /// Whether the encoding keeps an order among siblings
    fn supports_sibling_order(&self) -> bool {
        false
    }

    /// Nodes without a parent, in the strategy's natural order
    async fn roots(&self, store: &dyn TreeStore) -> Result<Vec<TreeNode>, TreeError>;

    /// Descendants of `node` in the strategy's natural order
    async fn descendants(
        &self,
        store: &dyn TreeStore,
        node: &TreeNode,
        direct_only: bool,
    ) -> Result<Vec<TreeNode>, TreeError>;

    /// Proper ancestors of `node`, root first
    async fn ancestors(
        &self,
        store: &dyn TreeStore,
        node: &TreeNode,
    ) -> Result<Vec<TreeNode>, TreeError>;

    async fn child_count(
        &self,
        store: &dyn TreeStore,
        node: &TreeNode,
        direct_only: bool,
    ) -> Result<usize, TreeError> {
        Ok(self.descendants(store, node, direct_only).await?.len())
    }
}

/// Build the strategy a configuration asks for
pub fn build_strategy(config: &TreeConfig) -> Result<Arc<dyn TreeStrategy>, TreeError> {
    config.validate()?;

    let strategy: Arc<dyn TreeStrategy> = match &config.strategy {
        StrategyConfig::Nested(options) => Arc::new(NestedSetStrategy::new(
            config.tree_type.clone(),
            options.clone(),
        )),
        StrategyConfig::Closure(options) => Arc::new(ClosureTableStrategy::new(
            config.tree_type.clone(),
            options.clone(),
        )),
        StrategyConfig::MaterializedPath(options) => Arc::new(MaterializedPathStrategy::new(
            config.tree_type.clone(),
            options.clone(),
        )),
    };

    tracing::debug!(
        "Built {} strategy for tree type '{}'",
        strategy.kind(),
        config.tree_type
    );
    Ok(strategy)
}

/// Node lookup that fails with `NodeNotFound`
pub(crate) fn require<'a>(
    working_set: &'a WorkingSet,
    id: &str,
) -> Result<&'a TreeNode, TreeError> {
    working_set
        .get(id)
        .ok_or_else(|| TreeError::node_not_found(working_set.tree_type(), id))
}

/// Resolve where `Move`/`Insert` sends a node: the target parent, after
/// checking the sibling (if any) and rejecting cycles.
pub(crate) fn resolve_parent(
    working_set: &WorkingSet,
    id: &str,
    requested_parent: Option<&str>,
    position: &crate::operations::Position,
) -> Result<Option<NodeId>, TreeError> {
    let parent = match position.sibling() {
        Some(sibling_id) => {
            if sibling_id == id {
                return Err(TreeError::invalid_hierarchy(
                    id,
                    sibling_id,
                    "a node cannot be positioned relative to itself",
                ));
            }
            require(working_set, sibling_id)?.parent.clone()
        }
        None => requested_parent.map(String::from),
    };

    if let Some(parent_id) = parent.as_deref() {
        if parent_id == id {
            return Err(TreeError::invalid_hierarchy(
                id,
                parent_id,
                "a node cannot be its own parent",
            ));
        }
        require(working_set, parent_id)?;
        if working_set.is_ancestor(id, parent_id) {
            return Err(TreeError::invalid_hierarchy(
                id,
                parent_id,
                "a node cannot be moved under its own descendant",
            ));
        }
    }

    Ok(parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discrepancy_display() {
        let discrepancy = Discrepancy::node(
            "fruits",
            DiscrepancyKind::OutsideParent {
                parent: "food".to_string(),
            },
        );
        assert_eq!(
            discrepancy.to_string(),
            "node fruits: interval is outside the interval of parent food"
        );

        let index_level = Discrepancy::index(
            Some("food".to_string()),
            DiscrepancyKind::MissingEndpoint { value: 3 },
        );
        assert_eq!(
            index_level.to_string(),
            "root food: interval endpoint 3 is missing"
        );
    }

    #[test]
    fn test_build_strategy_validates_config() {
        let strategy = build_strategy(&TreeConfig::nested("category")).unwrap();
        assert_eq!(strategy.kind(), StrategyKind::Nested);
        assert!(strategy.supports_sibling_order());

        assert!(matches!(
            build_strategy(&TreeConfig::closure("comment", "")),
            Err(TreeError::Config(_))
        ));
    }
}
