//! Tree Operation Types
//!
//! This module provides the vocabulary shared by the coordinator, the strategies
//! and the repository:
//!
//! - `TreeOperation` - a structural change staged in a batch
//! - `Position` - where a node lands relative to its parent or a sibling
//! - `IndexMutation` - an index update a strategy plans for the working set
//! - `WorkingSet` - the in-memory arena a batch mutates before writing
//! - `SortSpec` - property-based ordering used by repository queries

pub mod mutation;
pub mod working_set;

pub use mutation::IndexMutation;
pub use working_set::{NodeHandle, WorkingSet};

use crate::models::{NodeId, TreeNode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Placement of a node relative to its new parent or a sibling.
///
/// Sibling variants imply the parent: the node joins the sibling's parent.
/// Only nested sets keep sibling order; the other strategies honour the parent
/// and ignore the rest.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Position {
    FirstChild,
    #[default]
    LastChild,
    PrevSiblingOf(NodeId),
    NextSiblingOf(NodeId),
}

impl Position {
    pub fn sibling(&self) -> Option<&str> {
        match self {
            Position::PrevSiblingOf(id) | Position::NextSiblingOf(id) => Some(id),
            _ => None,
        }
    }
}

/// What happens to the children of a removed node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemovalMode {
    /// Remove the whole subtree
    #[default]
    Cascade,
    /// Hand the children to the removed node's parent
    ReparentChildren,
}

/// A structural change the coordinator plans through a strategy
#[derive(Debug, Clone, PartialEq)]
pub enum TreeOperation {
    /// Place a node staged in the working set
    Insert { id: NodeId, position: Position },

    /// Reparent and/or reposition an existing node
    Move {
        id: NodeId,
        parent: Option<NodeId>,
        position: Position,
    },

    /// Recompute a node's index after its properties changed
    Reindex { id: NodeId },

    Remove { id: NodeId, mode: RemovalMode },

    /// Rebuild every index of the tree type from parent pointers
    Rebuild,
}

impl TreeOperation {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            TreeOperation::Insert { id, .. }
            | TreeOperation::Move { id, .. }
            | TreeOperation::Reindex { id }
            | TreeOperation::Remove { id, .. } => Some(id),
            TreeOperation::Rebuild => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TreeOperation::Insert { .. } => "insert",
            TreeOperation::Move { .. } => "move",
            TreeOperation::Reindex { .. } => "reindex",
            TreeOperation::Remove { .. } => "remove",
            TreeOperation::Rebuild => "rebuild",
        }
    }
}

/// Application-level changes to an existing node.
///
/// Strategy-owned fields are deliberately absent: they are computed, never
/// assigned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeChanges {
    /// New parent (`Some(None)` makes the node a root)
    pub parent: Option<Option<NodeId>>,

    /// New position; implies a structural move even with an unchanged parent
    pub position: Option<Position>,

    /// Replacement properties
    pub properties: Option<Value>,
}

impl NodeChanges {
    pub fn reparent(parent: Option<NodeId>) -> Self {
        Self {
            parent: Some(parent),
            ..Default::default()
        }
    }

    pub fn reposition(position: Position) -> Self {
        Self {
            position: Some(position),
            ..Default::default()
        }
    }

    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }
}

/// How far `move_up` / `move_down` shift a node among its siblings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingShift {
    By(usize),
    /// To the first (up) or last (down) sibling position
    ToEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Sort by a property (or `"id"`), ties broken by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }

    pub fn compare(&self, a: &TreeNode, b: &TreeNode) -> Ordering {
        let ordering = compare_values(&a.sort_value(&self.field), &b.sort_value(&self.field))
            .then_with(|| a.id.cmp(&b.id));
        match self.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }

    pub fn sort(&self, nodes: &mut [TreeNode]) {
        nodes.sort_by(|a, b| self.compare(a, b));
    }
}

/// Total order over JSON values: null < bool < number < string < array < object
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ if rank(a) == rank(b) => a.to_string().cmp(&b.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}
