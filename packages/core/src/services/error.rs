//! Tree Engine Error Types
//!
//! This module defines the errors returned by the coordinator, the strategies
//! and the repository. Every failure aborts the whole batch: nothing is written
//! and locks taken by the batch are released.

use crate::config::{ConfigError, StrategyKind};
use crate::db::StoreError;
use crate::models::ValidationError;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Tree operation errors
#[derive(Error, Debug)]
pub enum TreeError {
    /// The requested structure is impossible (node under its own subtree,
    /// missing parent, sibling of a root in a root-scoped forest, ...)
    #[error("Invalid hierarchy for node {node_id} (target {target_id}): {reason}")]
    InvalidHierarchy {
        node_id: String,
        target_id: String,
        reason: String,
    },

    /// A path segment contains the configured separator
    #[error("Path segment '{segment}' of node {node_id} contains the separator '{separator}'")]
    ReservedCharacter {
        node_id: String,
        segment: String,
        separator: String,
    },

    /// Another batch holds the lock on this tree
    #[error("Tree '{tree_type}' is locked at root {root_id} until {locked_until}")]
    TreeLocked {
        tree_type: String,
        root_id: String,
        locked_until: DateTime<Utc>,
    },

    #[error("Node not found in tree '{tree_type}': {id}")]
    NodeNotFound { tree_type: String, id: String },

    #[error("Unknown tree type: {0}")]
    UnknownTreeType(String),

    #[error("Node already exists in tree '{tree_type}': {id}")]
    DuplicateNode { tree_type: String, id: String },

    /// The configured path source is missing or empty on a node
    #[error("Node {node_id} has no usable value for path source '{source_field}'")]
    MissingPathSource {
        node_id: String,
        source_field: String,
    },

    /// The operation is not available for this strategy
    #[error("Operation '{operation}' is not supported by the {strategy} strategy")]
    Unsupported {
        operation: &'static str,
        strategy: StrategyKind,
    },

    #[error("Node validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage operation failed: {0}")]
    Store(#[from] StoreError),
}

impl TreeError {
    /// Create an invalid hierarchy error
    pub fn invalid_hierarchy(
        node_id: impl Into<String>,
        target_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidHierarchy {
            node_id: node_id.into(),
            target_id: target_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a reserved character error
    pub fn reserved_character(
        node_id: impl Into<String>,
        segment: impl Into<String>,
        separator: impl Into<String>,
    ) -> Self {
        Self::ReservedCharacter {
            node_id: node_id.into(),
            segment: segment.into(),
            separator: separator.into(),
        }
    }

    /// Create a tree locked error
    pub fn tree_locked(
        tree_type: impl Into<String>,
        root_id: impl Into<String>,
        locked_until: DateTime<Utc>,
    ) -> Self {
        Self::TreeLocked {
            tree_type: tree_type.into(),
            root_id: root_id.into(),
            locked_until,
        }
    }

    /// Create a node not found error
    pub fn node_not_found(tree_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NodeNotFound {
            tree_type: tree_type.into(),
            id: id.into(),
        }
    }

    /// Create a duplicate node error
    pub fn duplicate_node(tree_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::DuplicateNode {
            tree_type: tree_type.into(),
            id: id.into(),
        }
    }

    /// Create a missing path source error
    pub fn missing_path_source(
        node_id: impl Into<String>,
        source_field: impl Into<String>,
    ) -> Self {
        Self::MissingPathSource {
            node_id: node_id.into(),
            source_field: source_field.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(operation: &'static str, strategy: StrategyKind) -> Self {
        Self::Unsupported {
            operation,
            strategy,
        }
    }

    /// Whether retrying the same batch later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TreeError::TreeLocked { .. }
                | TreeError::Store(StoreError::VersionConflict { .. })
                | TreeError::Store(StoreError::ForestChanged { .. })
        )
    }
}
