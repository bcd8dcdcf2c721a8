//! Closure-table rows
//!
//! A closure table keeps one row per (ancestor, descendant) pair, including a
//! self-row at depth 0 for every node.

use super::NodeId;
use serde::{Deserialize, Serialize};

/// One ancestor/descendant pair at a given chain distance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosureRow {
    pub ancestor: NodeId,
    pub descendant: NodeId,
    pub depth: i64,
}

impl ClosureRow {
    pub fn new(ancestor: impl Into<NodeId>, descendant: impl Into<NodeId>, depth: i64) -> Self {
        Self {
            ancestor: ancestor.into(),
            descendant: descendant.into(),
            depth,
        }
    }

    /// The depth-0 row every node carries
    pub fn self_row(id: impl Into<NodeId>) -> Self {
        let id = id.into();
        Self {
            ancestor: id.clone(),
            descendant: id,
            depth: 0,
        }
    }

    /// Row identity without the depth
    pub fn key(&self) -> (NodeId, NodeId) {
        (self.ancestor.clone(), self.descendant.clone())
    }
}
