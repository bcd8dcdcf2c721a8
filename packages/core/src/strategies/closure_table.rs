//! Closure-Table Strategy
//!
//! Structure lives in a side table of `(ancestor, descendant, depth)` rows: one
//! self-row per node plus one row per proper ancestor. Nodes themselves carry
//! no index fields beyond the `Closure` marker.
//!
//! Ancestor and descendant queries are single row lookups and child counts never
//! load nodes. The price is row churn on move: every old ancestor is unlinked
//! from every member of the moving subtree and every new ancestor linked to it.

use super::{require, resolve_parent, Discrepancy, DiscrepancyKind, TreeStrategy};
use crate::config::{ClosureConfig, StrategyKind};
use crate::db::{ClosureQuery, NodeQuery, TreeStore};
use crate::models::{ClosureRow, NodeId, TreeIndex, TreeNode};
use crate::operations::{IndexMutation, Position, RemovalMode, TreeOperation, WorkingSet};
use crate::services::TreeError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub struct ClosureTableStrategy {
    tree_type: String,
    config: ClosureConfig,
}

/// Parent graph with cycles and dangling parents cut
struct Lineage<'a> {
    parents: BTreeMap<&'a str, Option<&'a str>>,
    detached: Vec<&'a str>,
}

impl<'a> Lineage<'a> {
    fn new(working_set: &'a WorkingSet) -> Self {
        let mut detached = Vec::new();
        let mut parents = BTreeMap::new();
        for node in working_set.nodes() {
            let parent = node.parent.as_deref();
            match parent {
                Some(parent_id) if !working_set.contains(parent_id) => {
                    detached.push(node.id.as_str());
                    parents.insert(node.id.as_str(), None);
                }
                _ => {
                    parents.insert(node.id.as_str(), parent);
                }
            }
        }

        let mut lineage = Self { parents, detached };
        while let Some(on_cycle) = lineage.find_cycle() {
            lineage.parents.insert(on_cycle, None);
            lineage.detached.push(on_cycle);
        }
        lineage
    }

    /// A node that sits on a parent cycle, if any
    fn find_cycle(&self) -> Option<&'a str> {
        let mut cleared: HashSet<&str> = HashSet::new();
        for &start in self.parents.keys() {
            let mut seen: HashSet<&str> = HashSet::new();
            let mut current = Some(start);
            while let Some(id) = current {
                if cleared.contains(id) {
                    break;
                }
                if !seen.insert(id) {
                    return Some(id);
                }
                current = self.parents.get(id).copied().flatten();
            }
            cleared.extend(seen);
        }
        None
    }

    /// Ancestors of `id`, nearest first
    fn ancestors(&self, id: &str) -> Vec<&'a str> {
        let mut chain = Vec::new();
        let mut current = self.parents.get(id).copied().flatten();
        while let Some(parent) = current {
            chain.push(parent);
            current = self.parents.get(parent).copied().flatten();
        }
        chain
    }

    /// Rows the parent graph implies, keyed by (ancestor, descendant)
    fn expected_rows(&self) -> BTreeMap<(NodeId, NodeId), i64> {
        let mut rows = BTreeMap::new();
        for &id in self.parents.keys() {
            rows.insert((id.to_string(), id.to_string()), 0);
            for (distance, ancestor) in self.ancestors(id).into_iter().enumerate() {
                rows.insert((ancestor.to_string(), id.to_string()), distance as i64 + 1);
            }
        }
        rows
    }
}

impl ClosureTableStrategy {
    pub fn new(tree_type: impl Into<String>, config: ClosureConfig) -> Self {
        Self {
            tree_type: tree_type.into(),
            config,
        }
    }

    pub fn closure_table(&self) -> &str {
        &self.config.closure_table
    }

    /// Unlink a subtree from its old ancestors and link it under `parent`
    fn reattach(
        &self,
        working_set: &WorkingSet,
        id: &str,
        parent: Option<&str>,
    ) -> Vec<IndexMutation> {
        let subtree = working_set.rows_from(id);
        let mut guarded: Vec<NodeId> = subtree
            .iter()
            .map(|row| row.descendant.clone())
            .collect();
        guarded.extend(parent.map(String::from));
        let mut mutations = vec![IndexMutation::touch(guarded)];

        for ancestor in working_set.rows_to(id).iter().filter(|row| row.depth > 0) {
            for member in &subtree {
                mutations.push(IndexMutation::RemoveClosure {
                    ancestor: ancestor.ancestor.clone(),
                    descendant: member.descendant.clone(),
                });
            }
        }

        if let Some(parent_id) = parent {
            for ancestor in working_set.rows_to(parent_id) {
                for member in &subtree {
                    mutations.push(IndexMutation::InsertClosure(ClosureRow::new(
                        ancestor.ancestor.clone(),
                        member.descendant.clone(),
                        ancestor.depth + member.depth + 1,
                    )));
                }
            }
        }

        mutations
    }

    fn plan_insert(
        &self,
        working_set: &WorkingSet,
        id: &str,
        position: &Position,
    ) -> Result<Vec<IndexMutation>, TreeError> {
        let node = require(working_set, id)?;
        let parent = resolve_parent(working_set, id, node.parent.as_deref(), position)?;

        let mut mutations = vec![
            IndexMutation::Place {
                id: id.to_string(),
                parent: parent.clone(),
                index: TreeIndex::Closure,
            },
            IndexMutation::InsertClosure(ClosureRow::self_row(id)),
        ];
        if let Some(parent_id) = parent.as_deref() {
            mutations.push(IndexMutation::touch([parent_id]));
            for row in working_set.rows_to(parent_id) {
                mutations.push(IndexMutation::InsertClosure(ClosureRow::new(
                    row.ancestor,
                    id,
                    row.depth + 1,
                )));
            }
        }
        Ok(mutations)
    }

    fn plan_move(
        &self,
        working_set: &WorkingSet,
        id: &str,
        requested_parent: Option<&str>,
        position: &Position,
    ) -> Result<Vec<IndexMutation>, TreeError> {
        let parent = resolve_parent(working_set, id, requested_parent, position)?;
        let mut mutations = self.reattach(working_set, id, parent.as_deref());
        tracing::debug!(
            "Moving {} in '{}' rewrites {} closure row(s)",
            id,
            self.tree_type,
            mutations.len()
        );
        mutations.push(IndexMutation::Place {
            id: id.to_string(),
            parent,
            index: TreeIndex::Closure,
        });
        Ok(mutations)
    }

    fn plan_remove(
        &self,
        working_set: &WorkingSet,
        id: &str,
        mode: RemovalMode,
    ) -> Result<Vec<IndexMutation>, TreeError> {
        let node = require(working_set, id)?;
        let mut mutations = Vec::new();

        let removed: BTreeSet<NodeId> = match mode {
            RemovalMode::Cascade => working_set.subtree_ids(id).into_iter().collect(),
            RemovalMode::ReparentChildren => {
                for child in working_set.children(Some(id)) {
                    mutations.extend(self.reattach(working_set, &child.id, node.parent.as_deref()));
                    mutations.push(IndexMutation::SetParent {
                        id: child.id.clone(),
                        parent: node.parent.clone(),
                    });
                }
                BTreeSet::from([id.to_string()])
            }
        };

        for row in working_set.closure_rows() {
            if removed.contains(&row.ancestor) || removed.contains(&row.descendant) {
                mutations.push(IndexMutation::remove_closure(&row));
            }
        }
        mutations.push(IndexMutation::Remove {
            ids: removed.into_iter().collect(),
        });
        Ok(mutations)
    }
}

#[async_trait]
impl TreeStrategy for ClosureTableStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Closure
    }

    fn tree_type(&self) -> &str {
        &self.tree_type
    }

    fn plan(
        &self,
        operation: &TreeOperation,
        working_set: &WorkingSet,
    ) -> Result<Vec<IndexMutation>, TreeError> {
        match operation {
            TreeOperation::Insert { id, position } => self.plan_insert(working_set, id, position),
            TreeOperation::Move {
                id,
                parent,
                position,
            } => self.plan_move(working_set, id, parent.as_deref(), position),
            TreeOperation::Reindex { .. } => Ok(Vec::new()),
            TreeOperation::Remove { id, mode } => self.plan_remove(working_set, id, *mode),
            TreeOperation::Rebuild => self.recover(working_set),
        }
    }

    fn verify(&self, working_set: &WorkingSet) -> Vec<Discrepancy> {
        let mut discrepancies = Vec::new();
        let mut skipped: HashSet<&str> = HashSet::new();

        for node in working_set.nodes() {
            if let Some(parent_id) = node.parent.as_deref() {
                if !working_set.contains(parent_id) {
                    discrepancies.push(Discrepancy::node(
                        node.id.clone(),
                        DiscrepancyKind::OrphanParent {
                            parent: parent_id.to_string(),
                        },
                    ));
                    skipped.insert(node.id.as_str());
                    continue;
                }
            }
            if working_set.ancestor_ids(&node.id).is_none() {
                discrepancies.push(Discrepancy::node(node.id.clone(), DiscrepancyKind::Cycle));
                skipped.insert(node.id.as_str());
            }
        }

        let lineage = Lineage::new(working_set);
        let expected = lineage.expected_rows();
        let stored: BTreeMap<(NodeId, NodeId), i64> = working_set
            .closure_rows()
            .into_iter()
            .map(|row| ((row.ancestor, row.descendant), row.depth))
            .collect();

        for ((ancestor, descendant), depth) in &expected {
            if skipped.contains(descendant.as_str()) {
                continue;
            }
            match stored.get(&(ancestor.clone(), descendant.clone())) {
                None => discrepancies.push(Discrepancy::node(
                    descendant.clone(),
                    DiscrepancyKind::MissingClosureRow {
                        ancestor: ancestor.clone(),
                        depth: *depth,
                    },
                )),
                Some(actual) if actual != depth => discrepancies.push(Discrepancy::node(
                    descendant.clone(),
                    DiscrepancyKind::WrongClosureDepth {
                        ancestor: ancestor.clone(),
                        expected: *depth,
                        actual: *actual,
                    },
                )),
                Some(_) => {}
            }
        }

        for ((ancestor, descendant), depth) in &stored {
            if skipped.contains(descendant.as_str()) {
                continue;
            }
            if !expected.contains_key(&(ancestor.clone(), descendant.clone())) {
                discrepancies.push(Discrepancy::node(
                    descendant.clone(),
                    DiscrepancyKind::UnexpectedClosureRow {
                        ancestor: ancestor.clone(),
                        depth: *depth,
                    },
                ));
            }
        }

        discrepancies
    }

    fn recover(&self, working_set: &WorkingSet) -> Result<Vec<IndexMutation>, TreeError> {
        let lineage = Lineage::new(working_set);
        let mut mutations = Vec::new();

        for &id in &lineage.detached {
            tracing::warn!(
                "Node {} in '{}' has an unusable parent pointer, recovering it as a root",
                id,
                self.tree_type
            );
        }

        for node in working_set.nodes() {
            let parent = lineage
                .parents
                .get(node.id.as_str())
                .copied()
                .flatten()
                .map(String::from);
            mutations.push(IndexMutation::Place {
                id: node.id.clone(),
                parent,
                index: TreeIndex::Closure,
            });
        }

        let expected = lineage.expected_rows();
        let stored: HashMap<(NodeId, NodeId), i64> = working_set
            .closure_rows()
            .into_iter()
            .map(|row| ((row.ancestor, row.descendant), row.depth))
            .collect();

        for (key, depth) in &stored {
            if expected.get(key) != Some(depth) {
                mutations.push(IndexMutation::RemoveClosure {
                    ancestor: key.0.clone(),
                    descendant: key.1.clone(),
                });
            }
        }
        let mut rewritten = 0;
        for ((ancestor, descendant), depth) in expected {
            if stored.get(&(ancestor.clone(), descendant.clone())) != Some(&depth) {
                rewritten += 1;
                mutations.push(IndexMutation::InsertClosure(ClosureRow::new(
                    ancestor, descendant, depth,
                )));
            }
        }

        tracing::info!(
            "Rebuilt closure table '{}': {} row(s) rewritten",
            self.config.closure_table,
            rewritten
        );
        Ok(mutations)
    }

    async fn roots(&self, store: &dyn TreeStore) -> Result<Vec<TreeNode>, TreeError> {
        let mut roots = store.query_nodes(&self.tree_type, &NodeQuery::Roots).await?;
        roots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(roots)
    }

    async fn descendants(
        &self,
        store: &dyn TreeStore,
        node: &TreeNode,
        direct_only: bool,
    ) -> Result<Vec<TreeNode>, TreeError> {
        let rows = store
            .query_closure(
                &self.config.closure_table,
                &ClosureQuery::DescendantsOf {
                    id: node.id.clone(),
                    min_depth: 1,
                    max_depth: direct_only.then_some(1),
                },
            )
            .await?;
        self.load_ordered(store, rows.into_iter().map(|row| (row.descendant, row.depth)))
            .await
    }

    async fn ancestors(
        &self,
        store: &dyn TreeStore,
        node: &TreeNode,
    ) -> Result<Vec<TreeNode>, TreeError> {
        let rows = store
            .query_closure(
                &self.config.closure_table,
                &ClosureQuery::AncestorsOf {
                    id: node.id.clone(),
                    min_depth: 1,
                },
            )
            .await?;
        // Farthest ancestor first
        self.load_ordered(store, rows.into_iter().map(|row| (row.ancestor, -row.depth)))
            .await
    }

    async fn child_count(
        &self,
        store: &dyn TreeStore,
        node: &TreeNode,
        direct_only: bool,
    ) -> Result<usize, TreeError> {
        let rows = store
            .query_closure(
                &self.config.closure_table,
                &ClosureQuery::DescendantsOf {
                    id: node.id.clone(),
                    min_depth: 1,
                    max_depth: direct_only.then_some(1),
                },
            )
            .await?;
        Ok(rows.len())
    }
}

impl ClosureTableStrategy {
    /// Fetch nodes by id, ordered by the given rank then id
    async fn load_ordered(
        &self,
        store: &dyn TreeStore,
        ranked: impl Iterator<Item = (NodeId, i64)>,
    ) -> Result<Vec<TreeNode>, TreeError> {
        let ranks: HashMap<NodeId, i64> = ranked.collect();
        if ranks.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<NodeId> = ranks.keys().cloned().collect();
        let mut nodes = store
            .query_nodes(&self.tree_type, &NodeQuery::Ids(ids))
            .await?;
        nodes.sort_by_key(|node| {
            (
                ranks.get(&node.id).copied().unwrap_or(i64::MAX),
                node.id.clone(),
            )
        });
        Ok(nodes)
    }
}

#[cfg(test)]
#[path = "closure_table_test.rs"]
mod closure_table_test;
