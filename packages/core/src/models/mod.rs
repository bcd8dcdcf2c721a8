//! Data Models
//!
//! This module contains the records the tree engine reads and writes:
//!
//! - `TreeNode` - A tree member with its parent pointer and strategy-owned index
//! - `ClosureRow` - Ancestor/descendant pairs for closure-table trees
//! - `TreeLock` - Advisory per-root locks for materialized-path trees

mod closure;
mod lock;
mod node;

pub use closure::ClosureRow;
pub use lock::TreeLock;
pub use node::{NodeId, TreeIndex, TreeNode, ValidationError};
