//! Advisory tree locks
//!
//! Materialized-path trees guard structural writes to one root's subtree with a
//! short-lived lock record. The deadline is a staleness threshold checked when
//! someone else tries to acquire the lock, not an active expiry.

use super::NodeId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeLock {
    pub tree_type: String,
    pub root_id: NodeId,
    /// Batch that holds the lock
    pub owner: String,
    pub locked_until: DateTime<Utc>,
}

impl TreeLock {
    pub fn new(
        tree_type: impl Into<String>,
        root_id: impl Into<NodeId>,
        owner: impl Into<String>,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        Self {
            tree_type: tree_type.into(),
            root_id: root_id.into(),
            owner: owner.into(),
            locked_until: now + timeout,
        }
    }

    /// A lock past its deadline may be taken over
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.locked_until <= now
    }

    /// Whether this lock blocks `owner` at `now`
    pub fn blocks(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.owner != owner && !self.is_stale(now)
    }
}
