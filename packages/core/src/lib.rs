//! Arbor Core Tree Indexing Engine
//!
//! This crate keeps hierarchical records queryable as trees. Every node carries
//! a parent pointer; a per-tree-type strategy derives and maintains a secondary
//! index from it so subtree, ancestor and sibling queries stay cheap.
//!
//! # Architecture
//!
//! - **Parent pointer is authoritative**: indexes are derived, verifiable and
//!   rebuildable from parent pointers alone
//! - **Three strategies**: nested sets (intervals, sibling order), materialized
//!   paths (delimited ancestor paths, optional hashing and locking) and closure
//!   tables (ancestor/descendant/depth rows)
//! - **Batch writes**: structural changes are staged, ordered, planned against an
//!   in-memory working set and written in one atomic store commit
//! - **Storage-agnostic**: the host persistence layer implements `TreeStore`
//!
//! # Modules
//!
//! - [`models`] - Data structures (TreeNode, ClosureRow, TreeLock)
//! - [`config`] - Per-tree-type strategy configuration and the registry
//! - [`operations`] - Operations, positions, mutations and the working set
//! - [`strategies`] - The three indexing strategies behind `TreeStrategy`
//! - [`services`] - TreeCoordinator, TreeRepository, locks and events
//! - [`db`] - The `TreeStore` contract and an in-memory implementation

pub mod config;
pub mod db;
pub mod models;
pub mod operations;
pub mod services;
pub mod strategies;

// Re-export commonly used types
pub use config::{StrategyKind, TreeConfig, TreeRegistry};
pub use db::{MemoryStore, TreeStore};
pub use models::*;
pub use operations::{NodeChanges, Position, RemovalMode, SiblingShift, SortSpec};
pub use services::*;
pub use strategies::{Discrepancy, DiscrepancyKind, TreeStrategy};
