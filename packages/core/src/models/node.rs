//! Tree Node Data Structures
//!
//! This module defines the `TreeNode` record that every tree strategy operates on,
//! together with the strategy-owned `TreeIndex` it carries.
//!
//! # Architecture
//!
//! - **Parent pointer is authoritative**: `parent` is the logical structure; every
//!   other structural field is derived from it
//! - **Strategy-owned index**: interval bounds, path strings and levels live in
//!   `TreeIndex` and are only ever assigned by the engine
//! - **Pure JSON properties**: application data (titles, slugs, sort keys) lives in
//!   `properties`, which is also where path segments are read from
//!
//! # Examples
//!
//! ```rust
//! use arbor_core::models::TreeNode;
//! use serde_json::json;
//!
//! let food = TreeNode::with_id("food", "category", None, json!({"title": "Food"}));
//! let fruits = TreeNode::new("category", Some("food".to_string()), json!({"title": "Fruits"}));
//!
//! assert!(food.is_root());
//! assert!(!fruits.is_placed());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Opaque node identity, independent of the tree strategy
pub type NodeId = String;

/// Default version value for serde deserialization (version 1)
fn default_version() -> i64 {
    1
}

/// Validation errors for TreeNode records
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Node ID cannot be empty")]
    EmptyId,

    #[error("Tree type cannot be empty for node '{0}'")]
    EmptyTreeType(String),

    #[error("Node '{0}' cannot be its own parent")]
    SelfParent(String),

    #[error("Properties of node '{0}' must be a JSON object")]
    InvalidProperties(String),
}

/// Strategy-owned structural fields of a node.
///
/// Exactly one variant is meaningful for a given tree type, matching the
/// strategy configured for it. A node that has not been placed in its tree yet
/// carries `Unplaced`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TreeIndex {
    /// Not computed yet (new node awaiting commit)
    #[default]
    Unplaced,

    /// Nested-set interval bounds
    Nested {
        left: i64,
        right: i64,
        level: i64,
        /// Root node id when the forest is root-scoped
        root: Option<NodeId>,
    },

    /// Materialized path string
    #[serde(rename_all = "camelCase")]
    Path {
        path: String,
        path_hash: Option<String>,
        level: i64,
    },

    /// Closure-table member; the structure lives in closure rows
    Closure,
}

/// A logical tree member.
///
/// # Fields
///
/// - `id`: Unique identifier (UUID unless supplied by the caller)
/// - `tree_type`: Which configured tree this node belongs to
/// - `parent`: Parent node id, `None` marks a root
/// - `properties`: Application data as a JSON object
/// - `version`: Optimistic concurrency token, bumped on every engine write
/// - `index`: Strategy-owned structure, read through accessors only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    /// Unique identifier
    pub id: NodeId,

    /// Tree type this node belongs to (e.g., "category")
    pub tree_type: String,

    /// Parent node ID (None for roots)
    pub parent: Option<NodeId>,

    /// Application properties
    #[serde(default = "empty_properties")]
    pub properties: Value,

    /// Optimistic concurrency control version
    #[serde(default = "default_version")]
    pub version: i64,

    /// Strategy-owned index fields
    #[serde(default)]
    index: TreeIndex,
}

fn empty_properties() -> Value {
    Value::Object(Default::default())
}

impl TreeNode {
    /// Create a new node with a generated UUID
    pub fn new(tree_type: impl Into<String>, parent: Option<NodeId>, properties: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), tree_type, parent, properties)
    }

    /// Create a new node with a caller-supplied id
    pub fn with_id(
        id: impl Into<NodeId>,
        tree_type: impl Into<String>,
        parent: Option<NodeId>,
        properties: Value,
    ) -> Self {
        Self {
            id: id.into(),
            tree_type: tree_type.into(),
            parent,
            properties,
            version: default_version(),
            index: TreeIndex::Unplaced,
        }
    }

    /// Rebuild a node exactly as it was persisted, index included.
    ///
    /// Intended for storage adapters loading rows. Application code never needs
    /// this: index fields are computed by the engine, and values restored here
    /// are only trusted after `verify()`.
    pub fn restore(
        id: impl Into<NodeId>,
        tree_type: impl Into<String>,
        parent: Option<NodeId>,
        properties: Value,
        version: i64,
        index: TreeIndex,
    ) -> Self {
        Self {
            id: id.into(),
            tree_type: tree_type.into(),
            parent,
            properties,
            version,
            index,
        }
    }

    /// Validate record shape (not structure)
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if self.tree_type.is_empty() {
            return Err(ValidationError::EmptyTreeType(self.id.clone()));
        }
        if self.parent.as_deref() == Some(self.id.as_str()) {
            return Err(ValidationError::SelfParent(self.id.clone()));
        }
        if !self.properties.is_object() {
            return Err(ValidationError::InvalidProperties(self.id.clone()));
        }
        Ok(())
    }

    pub fn index(&self) -> &TreeIndex {
        &self.index
    }

    pub(crate) fn set_index(&mut self, index: TreeIndex) {
        self.index = index;
    }

    pub(crate) fn index_mut(&mut self) -> &mut TreeIndex {
        &mut self.index
    }

    /// Whether the node has no parent
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Whether the engine has computed this node's index
    pub fn is_placed(&self) -> bool {
        !matches!(self.index, TreeIndex::Unplaced)
    }

    /// Nested-set left bound
    pub fn left(&self) -> Option<i64> {
        match self.index {
            TreeIndex::Nested { left, .. } => Some(left),
            _ => None,
        }
    }

    /// Nested-set right bound
    pub fn right(&self) -> Option<i64> {
        match self.index {
            TreeIndex::Nested { right, .. } => Some(right),
            _ => None,
        }
    }

    /// Depth in the tree (nested set: root = 0, materialized path: root = 1)
    pub fn level(&self) -> Option<i64> {
        match self.index {
            TreeIndex::Nested { level, .. } | TreeIndex::Path { level, .. } => Some(level),
            _ => None,
        }
    }

    /// Nested-set root id (root-scoped forests only)
    pub fn root(&self) -> Option<&str> {
        match &self.index {
            TreeIndex::Nested { root, .. } => root.as_deref(),
            _ => None,
        }
    }

    /// Materialized path string
    pub fn path(&self) -> Option<&str> {
        match &self.index {
            TreeIndex::Path { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Digest of the materialized path, when hashing is enabled
    pub fn path_hash(&self) -> Option<&str> {
        match &self.index {
            TreeIndex::Path { path_hash, .. } => path_hash.as_deref(),
            _ => None,
        }
    }

    /// Interval bounds as a pair
    pub fn bounds(&self) -> Option<(i64, i64)> {
        match self.index {
            TreeIndex::Nested { left, right, .. } => Some((left, right)),
            _ => None,
        }
    }

    /// Value used for sorting by `field`; `"id"` sorts by the node id
    pub fn sort_value(&self, field: &str) -> Value {
        if field == "id" {
            return Value::String(self.id.clone());
        }
        self.properties.get(field).cloned().unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_node_is_unplaced() {
        let node = TreeNode::new("category", None, json!({}));
        assert!(!node.is_placed());
        assert!(node.is_root());
        assert_eq!(node.version, 1);
        assert!(node.left().is_none());
        assert!(node.path().is_none());
    }

    #[test]
    fn test_validate_rejects_self_parent() {
        let node = TreeNode::with_id("a", "category", Some("a".to_string()), json!({}));
        assert_eq!(
            node.validate(),
            Err(ValidationError::SelfParent("a".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_non_object_properties() {
        let node = TreeNode::with_id("a", "category", None, json!([1, 2]));
        assert!(matches!(
            node.validate(),
            Err(ValidationError::InvalidProperties(_))
        ));
    }

    #[test]
    fn test_accessors_follow_index_variant() {
        let node = TreeNode::restore(
            "a",
            "category",
            None,
            json!({}),
            3,
            TreeIndex::Nested {
                left: 1,
                right: 4,
                level: 0,
                root: Some("a".to_string()),
            },
        );
        assert_eq!(node.bounds(), Some((1, 4)));
        assert_eq!(node.level(), Some(0));
        assert_eq!(node.root(), Some("a"));
        assert!(node.path().is_none());
    }

    #[test]
    fn test_serialization_uses_camel_case_index() {
        let node = TreeNode::restore(
            "b",
            "menu",
            Some("a".to_string()),
            json!({"slug": "b"}),
            1,
            TreeIndex::Path {
                path: "a,b,".to_string(),
                path_hash: None,
                level: 2,
            },
        );
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["treeType"], "menu");
        assert_eq!(value["index"]["kind"], "path");
        assert_eq!(value["index"]["path"], "a,b,");
        assert!(value["index"].get("pathHash").is_some());

        let back: TreeNode = serde_json::from_value(value).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_sort_value_reads_id_and_properties() {
        let node = TreeNode::with_id("x", "category", None, json!({"title": "Apple"}));
        assert_eq!(node.sort_value("id"), json!("x"));
        assert_eq!(node.sort_value("title"), json!("Apple"));
        assert_eq!(node.sort_value("missing"), Value::Null);
    }
}
