//! Tree Repository
//!
//! Structural queries and maintenance for one tree type. Every query is written
//! once against the `TreeStrategy` read contract (roots, descendants,
//! ancestors, child counts), so the same calls work for nested sets,
//! materialized paths and closure tables. Writes go through a `TreeBatch` like
//! any other change.
//!
//! Sibling reordering (`move_up`, `move_down`, `reorder`) needs an encoding
//! that keeps sibling order and fails with `TreeError::Unsupported` otherwise.

use super::coordinator::{CommitReport, TreeCoordinator};
use super::TreeError;
use crate::config::StrategyConfig;
use crate::models::{NodeId, TreeNode};
use crate::operations::{NodeChanges, Position, RemovalMode, SiblingShift, SortSpec};
use crate::strategies::{Discrepancy, TreeStrategy};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct TreeRepository<'a> {
    coordinator: &'a TreeCoordinator,
    tree_type: String,
    strategy: Arc<dyn TreeStrategy>,
}

impl<'a> TreeRepository<'a> {
    pub(crate) fn new(
        coordinator: &'a TreeCoordinator,
        tree_type: &str,
    ) -> Result<Self, TreeError> {
        Ok(Self {
            coordinator,
            tree_type: tree_type.to_string(),
            strategy: coordinator.strategy(tree_type)?,
        })
    }

    pub fn tree_type(&self) -> &str {
        &self.tree_type
    }

    pub async fn get_node(&self, id: &str) -> Result<TreeNode, TreeError> {
        self.coordinator
            .store()
            .get_node(&self.tree_type, id)
            .await?
            .ok_or_else(|| TreeError::node_not_found(&self.tree_type, id))
    }

    /// Nodes without a parent
    pub async fn root_nodes(&self, sort: Option<&SortSpec>) -> Result<Vec<TreeNode>, TreeError> {
        let mut roots = self.strategy.roots(self.store()).await?;
        if let Some(sort) = sort {
            sort.sort(&mut roots);
        }
        Ok(roots)
    }

    /// Ancestors of a node, root first, ending with the node itself
    pub async fn get_path(&self, id: &str) -> Result<Vec<TreeNode>, TreeError> {
        let node = self.get_node(id).await?;
        let mut path = self.strategy.ancestors(self.store(), &node).await?;
        path.push(node);
        Ok(path)
    }

    /// Children (or all descendants) of a node; of the whole forest for `None`.
    ///
    /// Without a sort the strategy's natural order is kept. `include_node`
    /// puts the node itself first.
    pub async fn children(
        &self,
        node: Option<&str>,
        direct_only: bool,
        sort: Option<&SortSpec>,
        include_node: bool,
    ) -> Result<Vec<TreeNode>, TreeError> {
        let mut nodes = match node {
            Some(id) => {
                let parent = self.get_node(id).await?;
                self.strategy
                    .descendants(self.store(), &parent, direct_only)
                    .await?
            }
            None if direct_only => self.strategy.roots(self.store()).await?,
            None => {
                let mut all = Vec::new();
                for root in self.strategy.roots(self.store()).await? {
                    let descendants = self.strategy.descendants(self.store(), &root, false).await?;
                    all.push(root);
                    all.extend(descendants);
                }
                all
            }
        };

        if let Some(sort) = sort {
            sort.sort(&mut nodes);
        }
        if include_node {
            if let Some(id) = node {
                nodes.insert(0, self.get_node(id).await?);
            }
        }
        Ok(nodes)
    }

    /// Number of children (or descendants) of a node, or of roots (or all
    /// nodes) for `None`
    pub async fn child_count(
        &self,
        node: Option<&str>,
        direct_only: bool,
    ) -> Result<usize, TreeError> {
        match node {
            Some(id) => {
                let parent = self.get_node(id).await?;
                self.strategy
                    .child_count(self.store(), &parent, direct_only)
                    .await
            }
            None => Ok(self.children(None, direct_only, None, false).await?.len()),
        }
    }

    /// Nodes without children, below `root` or in the whole forest
    pub async fn leafs(&self, root: Option<&str>) -> Result<Vec<TreeNode>, TreeError> {
        let candidates = self.children(root, false, None, false).await?;
        let parents: HashSet<NodeId> = candidates
            .iter()
            .filter_map(|node| node.parent.clone())
            .collect();
        Ok(candidates
            .into_iter()
            .filter(|node| !parents.contains(&node.id))
            .collect())
    }

    /// Siblings after the node, nearest first
    pub async fn next_siblings(
        &self,
        id: &str,
        include_self: bool,
    ) -> Result<Vec<TreeNode>, TreeError> {
        let (siblings, index) = self.siblings(id).await?;
        let start = if include_self { index } else { index + 1 };
        Ok(siblings.into_iter().skip(start).collect())
    }

    /// Siblings before the node, in sibling order (nearest last)
    pub async fn prev_siblings(
        &self,
        id: &str,
        include_self: bool,
    ) -> Result<Vec<TreeNode>, TreeError> {
        let (siblings, index) = self.siblings(id).await?;
        let end = if include_self { index + 1 } else { index };
        Ok(siblings.into_iter().take(end).collect())
    }

    /// All siblings including the node, and the node's position among them
    async fn siblings(&self, id: &str) -> Result<(Vec<TreeNode>, usize), TreeError> {
        let node = self.get_node(id).await?;
        let siblings = self
            .children(node.parent.as_deref(), true, None, false)
            .await?;
        let index = siblings
            .iter()
            .position(|sibling| sibling.id == node.id)
            .ok_or_else(|| TreeError::node_not_found(&self.tree_type, id))?;
        Ok((siblings, index))
    }

    /// Nested JSON view: every node with its `children` array
    pub async fn children_hierarchy(
        &self,
        node: Option<&str>,
        sort: Option<&SortSpec>,
    ) -> Result<Value, TreeError> {
        let nodes = self.children(node, false, None, false).await?;

        let mut by_parent: HashMap<Option<NodeId>, Vec<TreeNode>> = HashMap::new();
        for child in nodes {
            by_parent.entry(child.parent.clone()).or_default().push(child);
        }
        if let Some(sort) = sort {
            for siblings in by_parent.values_mut() {
                sort.sort(siblings);
            }
        }

        let top = node.map(String::from);
        Ok(hierarchy_level(&mut by_parent, &top))
    }

    /// Move a node towards the front of its siblings. Returns `false` when it
    /// is already first.
    pub async fn move_up(&self, id: &str, shift: SiblingShift) -> Result<bool, TreeError> {
        self.require_sibling_order("move_up")?;
        let node = self.get_node(id).await?;
        if !self.orders_siblings_of(&node) {
            return Ok(false);
        }

        let previous = self.prev_siblings(id, false).await?;
        let target = match shift {
            _ if previous.is_empty() => return Ok(false),
            SiblingShift::By(0) => return Ok(false),
            SiblingShift::By(steps) => &previous[previous.len() - steps.min(previous.len())],
            SiblingShift::ToEnd => &previous[0],
        };

        self.reposition(id, Position::PrevSiblingOf(target.id.clone()))
            .await?;
        Ok(true)
    }

    /// Move a node towards the back of its siblings. Returns `false` when it is
    /// already last.
    pub async fn move_down(&self, id: &str, shift: SiblingShift) -> Result<bool, TreeError> {
        self.require_sibling_order("move_down")?;
        let node = self.get_node(id).await?;
        if !self.orders_siblings_of(&node) {
            return Ok(false);
        }

        let next = self.next_siblings(id, false).await?;
        let target = match shift {
            _ if next.is_empty() => return Ok(false),
            SiblingShift::By(0) => return Ok(false),
            SiblingShift::By(steps) => &next[steps.min(next.len()) - 1],
            SiblingShift::ToEnd => &next[next.len() - 1],
        };

        self.reposition(id, Position::NextSiblingOf(target.id.clone()))
            .await?;
        Ok(true)
    }

    /// Sort the children of `node` (the roots for `None`) by `sort`, and their
    /// children too when `recursive`
    pub async fn reorder(
        &self,
        node: Option<&str>,
        sort: &SortSpec,
        recursive: bool,
    ) -> Result<CommitReport, TreeError> {
        self.require_sibling_order("reorder")?;

        let mut batch = self.coordinator.begin();
        let mut pending: Vec<Option<NodeId>> = vec![node.map(String::from)];

        while let Some(parent) = pending.pop() {
            let mut children = self.children(parent.as_deref(), true, None, false).await?;
            sort.sort(&mut children);

            let ordered = parent.is_some() || self.orders_roots();
            for child in &children {
                if ordered {
                    let changes = NodeChanges {
                        parent: Some(parent.clone()),
                        position: Some(Position::LastChild),
                        properties: None,
                    };
                    batch.prepare_update(&self.tree_type, &child.id, changes).await?;
                }
                if recursive {
                    pending.push(Some(child.id.clone()));
                }
            }
        }

        batch.commit().await
    }

    /// Remove a node through a one-operation batch
    pub async fn remove_from_tree(
        &self,
        id: &str,
        mode: RemovalMode,
    ) -> Result<CommitReport, TreeError> {
        let mut batch = self.coordinator.begin();
        batch.prepare_delete(&self.tree_type, id, mode).await?;
        batch.commit().await
    }

    pub async fn verify(&self) -> Result<Vec<Discrepancy>, TreeError> {
        self.coordinator.verify(&self.tree_type).await
    }

    /// Rebuild every index of the tree type from parent pointers
    pub async fn recover(&self) -> Result<CommitReport, TreeError> {
        let mut batch = self.coordinator.begin();
        batch.prepare_rebuild(&self.tree_type).await?;
        let report = batch.commit().await?;
        tracing::info!(
            "Recovered '{}': {} node(s) rewritten",
            self.tree_type,
            report.updated
        );
        Ok(report)
    }

    async fn reposition(&self, id: &str, position: Position) -> Result<(), TreeError> {
        let mut batch = self.coordinator.begin();
        batch
            .prepare_update(&self.tree_type, id, NodeChanges::reposition(position))
            .await?;
        batch.commit().await?;
        Ok(())
    }

    fn require_sibling_order(&self, operation: &'static str) -> Result<(), TreeError> {
        if self.strategy.supports_sibling_order() {
            Ok(())
        } else {
            Err(TreeError::unsupported(operation, self.strategy.kind()))
        }
    }

    /// Root-scoped nested sets number each root on its own, so roots have no
    /// order among themselves
    fn orders_roots(&self) -> bool {
        match self.coordinator.config(&self.tree_type) {
            Ok(config) => match &config.strategy {
                StrategyConfig::Nested(options) => !options.root_scoped,
                _ => self.strategy.supports_sibling_order(),
            },
            Err(_) => false,
        }
    }

    fn orders_siblings_of(&self, node: &TreeNode) -> bool {
        node.parent.is_some() || self.orders_roots()
    }

    fn store(&self) -> &dyn crate::db::TreeStore {
        self.coordinator.store().as_ref()
    }
}

fn hierarchy_level(
    by_parent: &mut HashMap<Option<NodeId>, Vec<TreeNode>>,
    parent: &Option<NodeId>,
) -> Value {
    let siblings = by_parent.remove(parent).unwrap_or_default();
    Value::Array(
        siblings
            .into_iter()
            .map(|node| {
                let children = hierarchy_level(by_parent, &Some(node.id.clone()));
                json!({
                    "id": node.id,
                    "parent": node.parent,
                    "level": node.level(),
                    "properties": node.properties,
                    "children": children,
                })
            })
            .collect(),
    )
}

#[cfg(test)]
#[path = "repository_test.rs"]
mod repository_test;
