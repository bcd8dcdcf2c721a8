//! Database Layer
//!
//! This module defines how the tree engine talks to the host persistence layer:
//!
//! - `TreeStore` - the async contract (reads, filtered queries, atomic commit, locks)
//! - `NodeQuery` / `ClosureQuery` - declarative filters with their matching rules
//! - `ChangeSet` - every row a committed batch writes for one tree type
//! - `MemoryStore` - a complete in-memory implementation
//!
//! The engine never assumes a particular database. Adapters translate queries to
//! range UPDATE/SELECT statements (or their equivalent) and must apply a commit
//! as a single transaction.

mod error;
mod memory_store;
mod tree_store;

pub use error::StoreError;
pub use memory_store::MemoryStore;
pub use tree_store::{ChangeSet, ClosureQuery, Forest, LockAttempt, NodeQuery, TreeStore};
