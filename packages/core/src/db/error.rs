//! Storage Error Types
//!
//! This module defines the errors a `TreeStore` implementation reports back to
//! the engine. Backend-specific failures are carried as `anyhow::Error` so any
//! persistence layer can plug in without widening this enum.

use thiserror::Error;

/// Storage operation errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// A row changed since the working set was loaded
    #[error(
        "Version conflict for node {node_id}: expected version {expected_version}, \
         found {actual_version:?}"
    )]
    VersionConflict {
        node_id: String,
        expected_version: i64,
        /// `None` when the row no longer exists
        actual_version: Option<i64>,
    },

    /// A change set expected an empty tree but nodes were stored meanwhile
    #[error("Tree '{tree_type}' gained nodes since the batch loaded it")]
    ForestChanged { tree_type: String },

    /// An inserted node id already exists
    #[error("Node already exists: {node_id}")]
    DuplicateNode { node_id: String },

    /// Backend failure (connection, query, serialization)
    #[error("Storage backend failed: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Create a version conflict error
    pub fn version_conflict(
        node_id: impl Into<String>,
        expected_version: i64,
        actual_version: Option<i64>,
    ) -> Self {
        Self::VersionConflict {
            node_id: node_id.into(),
            expected_version,
            actual_version,
        }
    }

    /// Create a forest changed error
    pub fn forest_changed(tree_type: impl Into<String>) -> Self {
        Self::ForestChanged {
            tree_type: tree_type.into(),
        }
    }

    /// Create a duplicate node error
    pub fn duplicate_node(node_id: impl Into<String>) -> Self {
        Self::DuplicateNode {
            node_id: node_id.into(),
        }
    }
}
