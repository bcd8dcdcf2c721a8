//! Index mutations
//!
//! Strategies never write to nodes directly. They return a list of
//! `IndexMutation`s which the working set applies in order, marking every node
//! they touch dirty. Range-style variants (`ShiftBounds`, `RewritePrefix`) mirror
//! the range UPDATE statements a relational adapter would issue.

use crate::models::{ClosureRow, NodeId, TreeIndex};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
pub enum IndexMutation {
    /// Set a node's parent and computed index
    Place {
        id: NodeId,
        parent: Option<NodeId>,
        index: TreeIndex,
    },

    SetParent {
        id: NodeId,
        parent: Option<NodeId>,
    },

    /// Add `delta` to every nested-set bound `>= from` in a scope
    ShiftBounds {
        /// Root the shift is limited to (`None` for the whole forest)
        root: Option<NodeId>,
        from: i64,
        delta: i64,
        /// Nodes that are out of range for this shift (a moving subtree)
        exclude: BTreeSet<NodeId>,
    },

    /// Re-offset a moving nested-set subtree
    OffsetSubtree {
        ids: Vec<NodeId>,
        delta: i64,
        level_delta: i64,
        root: Option<NodeId>,
    },

    /// Replace the path prefix of a set of nodes
    RewritePrefix {
        ids: Vec<NodeId>,
        old_prefix: String,
        new_prefix: String,
        level_delta: i64,
        rehash: bool,
    },

    Remove {
        ids: Vec<NodeId>,
    },

    InsertClosure(ClosureRow),

    RemoveClosure {
        ancestor: NodeId,
        descendant: NodeId,
    },

    /// Bump the version of nodes a plan read from without changing them.
    /// A batch that committed changes to them first makes this commit conflict.
    Touch {
        ids: Vec<NodeId>,
    },

    /// The plan relied on the tree type having no stored nodes
    ExpectEmpty,
}

impl IndexMutation {
    pub fn shift(root: Option<NodeId>, from: i64, delta: i64) -> Self {
        IndexMutation::ShiftBounds {
            root,
            from,
            delta,
            exclude: BTreeSet::new(),
        }
    }

    pub fn touch<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        IndexMutation::Touch {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn remove_closure(row: &ClosureRow) -> Self {
        IndexMutation::RemoveClosure {
            ancestor: row.ancestor.clone(),
            descendant: row.descendant.clone(),
        }
    }

    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            IndexMutation::Place { .. } => "place",
            IndexMutation::SetParent { .. } => "set-parent",
            IndexMutation::ShiftBounds { .. } => "shift-bounds",
            IndexMutation::OffsetSubtree { .. } => "offset-subtree",
            IndexMutation::RewritePrefix { .. } => "rewrite-prefix",
            IndexMutation::Remove { .. } => "remove",
            IndexMutation::InsertClosure(_) => "insert-closure",
            IndexMutation::RemoveClosure { .. } => "remove-closure",
            IndexMutation::Touch { .. } => "touch",
            IndexMutation::ExpectEmpty => "expect-empty",
        }
    }
}
