//! Tree Events
//!
//! Events broadcast by the `TreeCoordinator` after a batch commits. Nothing is
//! emitted for a batch that fails, so subscribers only ever see committed state.

use crate::models::{NodeId, TreeNode};
use crate::operations::RemovalMode;
use serde::Serialize;

/// A committed structural change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TreeEvent {
    /// A node was placed in its tree (carries the computed index)
    NodeInserted { node: TreeNode },

    #[serde(rename_all = "camelCase")]
    NodeMoved {
        tree_type: String,
        node_id: NodeId,
        parent: Option<NodeId>,
    },

    /// The node's index was recomputed after a property change
    #[serde(rename_all = "camelCase")]
    NodeReindexed { tree_type: String, node_id: NodeId },

    #[serde(rename_all = "camelCase")]
    NodeRemoved {
        tree_type: String,
        node_id: NodeId,
        mode: RemovalMode,
    },

    /// Every index of the tree type was rebuilt from parent pointers
    #[serde(rename_all = "camelCase")]
    TreeRebuilt { tree_type: String },
}

impl TreeEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            TreeEvent::NodeInserted { .. } => "node_inserted",
            TreeEvent::NodeMoved { .. } => "node_moved",
            TreeEvent::NodeReindexed { .. } => "node_reindexed",
            TreeEvent::NodeRemoved { .. } => "node_removed",
            TreeEvent::TreeRebuilt { .. } => "tree_rebuilt",
        }
    }

    pub fn tree_type(&self) -> &str {
        match self {
            TreeEvent::NodeInserted { node } => &node.tree_type,
            TreeEvent::NodeMoved { tree_type, .. }
            | TreeEvent::NodeReindexed { tree_type, .. }
            | TreeEvent::NodeRemoved { tree_type, .. }
            | TreeEvent::TreeRebuilt { tree_type } => tree_type,
        }
    }

    /// Node the event is about, `None` for tree-wide events
    pub fn node_id(&self) -> Option<&str> {
        match self {
            TreeEvent::NodeInserted { node } => Some(&node.id),
            TreeEvent::NodeMoved { node_id, .. }
            | TreeEvent::NodeReindexed { node_id, .. }
            | TreeEvent::NodeRemoved { node_id, .. } => Some(node_id),
            TreeEvent::TreeRebuilt { .. } => None,
        }
    }
}
