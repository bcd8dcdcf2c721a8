//! Tree Services
//!
//! This module contains the write path and the query layer of the engine:
//!
//! - `TreeCoordinator` / `TreeBatch` - staged, ordered, atomic structural writes
//! - `TreeRepository` - strategy-agnostic structural queries and maintenance
//! - `TreeLockManager` - advisory per-root locks for materialized-path trees
//! - `TreeEvent` - notifications broadcast after a batch commits
//!
//! Services coordinate between the strategies and the store: strategies decide
//! what an operation changes, services decide when it runs and make sure it is
//! written all at once.

pub mod coordinator;
pub mod error;
pub mod events;
pub mod lock;
pub mod repository;

pub use coordinator::{CommitReport, TreeBatch, TreeCoordinator};
pub use error::TreeError;
pub use events::TreeEvent;
pub use lock::TreeLockManager;
pub use repository::TreeRepository;
