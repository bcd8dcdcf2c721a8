//! Tree Lock Manager
//!
//! Acquires and releases the advisory per-root locks materialized-path trees use
//! to serialize structural writes. Acquisition never waits: a lock held by
//! another batch fails fast with `TreeError::TreeLocked`, and a lock past its
//! deadline is taken over.

use super::TreeError;
use crate::db::{LockAttempt, TreeStore};
use crate::models::TreeLock;
use chrono::{Duration, Utc};
use std::sync::Arc;

pub struct TreeLockManager {
    store: Arc<dyn TreeStore>,
}

impl TreeLockManager {
    pub fn new(store: Arc<dyn TreeStore>) -> Self {
        Self { store }
    }

    /// Lock `root_id` for `owner` until now + `timeout`
    pub async fn acquire(
        &self,
        tree_type: &str,
        root_id: &str,
        owner: &str,
        timeout: Duration,
    ) -> Result<TreeLock, TreeError> {
        let now = Utc::now();
        let lock = TreeLock::new(tree_type, root_id, owner, now, timeout);

        match self.store.try_lock(lock.clone(), now).await? {
            LockAttempt::Acquired => {
                tracing::debug!("Locked root '{}' of '{}' for {}", root_id, tree_type, owner);
                Ok(lock)
            }
            LockAttempt::TookOverStale(previous) => {
                tracing::warn!(
                    "Took over stale lock on root '{}' of '{}' (held by {} until {})",
                    root_id,
                    tree_type,
                    previous.owner,
                    previous.locked_until
                );
                Ok(lock)
            }
            LockAttempt::Held(existing) => {
                tracing::warn!(
                    "Root '{}' of '{}' is locked by {} until {}",
                    root_id,
                    tree_type,
                    existing.owner,
                    existing.locked_until
                );
                Err(TreeError::tree_locked(
                    tree_type,
                    root_id,
                    existing.locked_until,
                ))
            }
        }
    }

    pub async fn release(&self, lock: &TreeLock) -> Result<(), TreeError> {
        self.store
            .release_lock(&lock.tree_type, &lock.root_id, &lock.owner)
            .await?;
        tracing::debug!(
            "Released root '{}' of '{}' for {}",
            lock.root_id,
            lock.tree_type,
            lock.owner
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[tokio::test]
    async fn test_second_owner_is_rejected_until_release() {
        let store = Arc::new(MemoryStore::new());
        let locks = TreeLockManager::new(store.clone());

        let lock = locks
            .acquire("menu", "root", "batch-1", Duration::seconds(3))
            .await
            .unwrap();

        let result = locks
            .acquire("menu", "root", "batch-2", Duration::seconds(3))
            .await;
        assert!(matches!(result, Err(TreeError::TreeLocked { .. })));

        locks.release(&lock).await.unwrap();
        assert!(store.lock_for("menu", "root").await.is_none());
        assert!(locks
            .acquire("menu", "root", "batch-2", Duration::seconds(3))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_stale_lock_is_taken_over() {
        let store = Arc::new(MemoryStore::new());
        let past = Utc::now() - Duration::seconds(10);
        store
            .try_lock(
                TreeLock::new("menu", "root", "crashed", past, Duration::seconds(3)),
                past,
            )
            .await
            .unwrap();

        let locks = TreeLockManager::new(store.clone());
        let lock = locks
            .acquire("menu", "root", "batch-2", Duration::seconds(3))
            .await
            .unwrap();

        assert_eq!(lock.owner, "batch-2");
        assert_eq!(store.lock_for("menu", "root").await.unwrap().owner, "batch-2");
    }

    #[test]
    fn test_release_without_lock_is_harmless() {
        tokio_test::block_on(async {
            let store = Arc::new(MemoryStore::new());
            let locks = TreeLockManager::new(store.clone());
            let now = Utc::now();
            let lock = TreeLock::new("menu", "root", "batch-1", now, Duration::seconds(3));

            locks.release(&lock).await.unwrap();
            assert!(store.lock_for("menu", "root").await.is_none());
        });
    }
}
