//! Materialized-Path Strategy
//!
//! Every node stores the chain of its ancestors' segments as one delimited
//! string, plus its level (number of segments) and optionally a digest of the
//! path. A subtree is a path prefix, so reads are prefix queries and inserts
//! never touch other rows. A move rewrites the prefix of every descendant.
//!
//! # Path format
//!
//! With separator `,` and the default options a root `A` has path `A,` and its
//! child `B` has `A,B,`. `path_starts_with_separator` adds a leading separator
//! (`,A,B,`), `path_ends_with_separator = false` drops the trailing one (`A,B`).
//!
//! Segments come from the configured source property (or the id), optionally
//! suffixed with `-<id>`. A segment containing the separator is rejected before
//! anything is planned.

use super::{require, resolve_parent, Discrepancy, DiscrepancyKind, TreeStrategy};
use crate::config::{MaterializedPathConfig, StrategyKind, MAX_LOCKING_TIMEOUT_SECS};
use crate::db::{NodeQuery, TreeStore};
use crate::models::{NodeId, TreeIndex, TreeNode};
use crate::operations::{IndexMutation, Position, RemovalMode, TreeOperation, WorkingSet};
use crate::services::TreeError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

/// Hex digest stored alongside a path when hashing is enabled
pub fn path_digest(path: &str) -> String {
    blake3::hash(path.as_bytes()).to_hex().to_string()
}

pub struct MaterializedPathStrategy {
    tree_type: String,
    config: MaterializedPathConfig,
}

impl MaterializedPathStrategy {
    pub fn new(tree_type: impl Into<String>, config: MaterializedPathConfig) -> Self {
        Self {
            tree_type: tree_type.into(),
            config,
        }
    }

    pub fn config(&self) -> &MaterializedPathConfig {
        &self.config
    }

    /// Path segment contributed by `node`
    pub fn segment(&self, node: &TreeNode) -> Result<String, TreeError> {
        let source = self.config.path_source.as_str();
        let raw = if source == "id" {
            node.id.clone()
        } else {
            match node.properties.get(source) {
                Some(Value::String(value)) if !value.is_empty() => value.clone(),
                Some(Value::Number(value)) => value.to_string(),
                _ => return Err(TreeError::missing_path_source(&node.id, source)),
            }
        };

        let segment = if self.config.path_append_id && source != "id" {
            format!("{}-{}", raw, node.id)
        } else {
            raw
        };

        if segment.contains(self.config.path_separator.as_str()) {
            return Err(TreeError::reserved_character(
                &node.id,
                segment,
                &self.config.path_separator,
            ));
        }
        Ok(segment)
    }

    /// Path of a node given its parent's path
    pub fn build_path(&self, parent_path: Option<&str>, segment: &str) -> String {
        let separator = self.config.path_separator.as_str();
        let mut path = match parent_path {
            Some(parent) if self.config.path_ends_with_separator => parent.to_string(),
            Some(parent) => format!("{}{}", parent, separator),
            None if self.config.path_starts_with_separator => separator.to_string(),
            None => String::new(),
        };
        path.push_str(segment);
        if self.config.path_ends_with_separator {
            path.push_str(separator);
        }
        path
    }

    /// Prefix shared by every descendant of the node at `path`
    pub fn subtree_prefix(&self, path: &str) -> String {
        let separator = self.config.path_separator.as_str();
        if path.ends_with(separator) {
            path.to_string()
        } else {
            format!("{}{}", path, separator)
        }
    }

    /// Non-empty segments of a path, root first
    pub fn segments<'a>(&self, path: &'a str) -> Vec<&'a str> {
        path.split(self.config.path_separator.as_str())
            .filter(|segment| !segment.is_empty())
            .collect()
    }

    fn index_for(&self, path: String, level: i64) -> TreeIndex {
        TreeIndex::Path {
            path_hash: self.config.track_hash.then(|| path_digest(&path)),
            path,
            level,
        }
    }

    fn stored_path(&self, working_set: &WorkingSet, id: &str) -> Result<(String, i64), TreeError> {
        match require(working_set, id)?.index() {
            TreeIndex::Path { path, level, .. } => Ok((path.clone(), *level)),
            _ => Err(TreeError::invalid_hierarchy(
                id,
                id,
                "node has no materialized path yet",
            )),
        }
    }

    /// Path and level a node gets under `parent`
    fn placement(
        &self,
        working_set: &WorkingSet,
        node: &TreeNode,
        parent: Option<&str>,
    ) -> Result<(String, i64), TreeError> {
        let segment = self.segment(node)?;
        match parent {
            Some(parent_id) => {
                let (parent_path, parent_level) = self.stored_path(working_set, parent_id)?;
                Ok((self.build_path(Some(&parent_path), &segment), parent_level + 1))
            }
            None => Ok((self.build_path(None, &segment), 1)),
        }
    }

    fn plan_insert(
        &self,
        working_set: &WorkingSet,
        id: &str,
        position: &Position,
    ) -> Result<Vec<IndexMutation>, TreeError> {
        let node = require(working_set, id)?;
        let parent = resolve_parent(working_set, id, node.parent.as_deref(), position)?;
        let (path, level) = self.placement(working_set, node, parent.as_deref())?;

        tracing::debug!("Inserting {} into '{}' at path {}", id, self.tree_type, path);
        let mut mutations = Vec::new();
        if let Some(parent_id) = parent.as_deref() {
            mutations.push(IndexMutation::touch([parent_id]));
        }
        mutations.push(IndexMutation::Place {
            id: id.to_string(),
            parent,
            index: self.index_for(path, level),
        });
        Ok(mutations)
    }

    /// Re-place `id` under `parent` and rewrite its descendants' prefixes
    fn relocate(
        &self,
        working_set: &WorkingSet,
        id: &str,
        parent: Option<NodeId>,
    ) -> Result<Vec<IndexMutation>, TreeError> {
        let node = require(working_set, id)?;
        let (old_path, old_level) = self.stored_path(working_set, id)?;
        let (new_path, new_level) = self.placement(working_set, node, parent.as_deref())?;

        let descendants: Vec<NodeId> = working_set
            .subtree_ids(id)
            .into_iter()
            .filter(|member| member != id)
            .collect();
        let old_prefix = self.subtree_prefix(&old_path);
        let new_prefix = self.subtree_prefix(&new_path);

        let mut mutations = Vec::new();
        if let Some(parent_id) = parent.as_deref() {
            mutations.push(IndexMutation::touch([parent_id]));
        }
        mutations.push(IndexMutation::Place {
            id: id.to_string(),
            parent,
            index: self.index_for(new_path, new_level),
        });

        if !descendants.is_empty() && (old_prefix != new_prefix || old_level != new_level) {
            tracing::debug!(
                "Rewriting prefix {} -> {} for {} descendant(s) in '{}'",
                old_prefix,
                new_prefix,
                descendants.len(),
                self.tree_type
            );
            mutations.push(IndexMutation::RewritePrefix {
                ids: descendants,
                old_prefix,
                new_prefix,
                level_delta: new_level - old_level,
                rehash: self.config.track_hash,
            });
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
        self.relocate(working_set, id, parent)
    }

    fn plan_remove(
        &self,
        working_set: &WorkingSet,
        id: &str,
        mode: RemovalMode,
    ) -> Result<Vec<IndexMutation>, TreeError> {
        let node = require(working_set, id)?;

        if mode == RemovalMode::Cascade {
            return Ok(vec![IndexMutation::Remove {
                ids: working_set.subtree_ids(id),
            }]);
        }

        let mut mutations = Vec::new();
        for child in working_set.children(Some(id)) {
            mutations.extend(self.relocate(working_set, &child.id, node.parent.clone())?);
        }
        mutations.push(IndexMutation::Remove {
            ids: vec![id.to_string()],
        });
        Ok(mutations)
    }

    /// Path and level the parent pointers imply, when every segment resolves
    fn expected(&self, working_set: &WorkingSet, node: &TreeNode) -> Option<(String, i64)> {
        let chain = working_set.ancestor_ids(&node.id)?;
        let mut path: Option<String> = None;
        for ancestor_id in &chain {
            let ancestor = working_set.get(ancestor_id)?;
            let segment = self.segment(ancestor).ok()?;
            path = Some(self.build_path(path.as_deref(), &segment));
        }
        let segment = self.segment(node).ok()?;
        Some((
            self.build_path(path.as_deref(), &segment),
            chain.len() as i64 + 1,
        ))
    }

    fn check_node(&self, working_set: &WorkingSet, node: &TreeNode) -> Option<DiscrepancyKind> {
        let TreeIndex::Path {
            path,
            path_hash,
            level,
        } = node.index()
        else {
            return Some(DiscrepancyKind::Unplaced);
        };

        if let Some(parent_id) = node.parent.as_deref() {
            if !working_set.contains(parent_id) {
                return Some(DiscrepancyKind::OrphanParent {
                    parent: parent_id.to_string(),
                });
            }
        }
        if working_set.ancestor_ids(&node.id).is_none() {
            return Some(DiscrepancyKind::Cycle);
        }
        if let Err(error) = self.segment(node) {
            return Some(DiscrepancyKind::InvalidSegment {
                reason: error.to_string(),
            });
        }

        // An ancestor with a broken segment is reported on its own
        let (expected_path, expected_level) = self.expected(working_set, node)?;

        if *path != expected_path {
            return Some(DiscrepancyKind::WrongPath {
                expected: expected_path,
                actual: path.clone(),
            });
        }
        if *level != expected_level {
            return Some(DiscrepancyKind::WrongLevel {
                expected: expected_level,
                actual: *level,
            });
        }
        if self.config.track_hash && path_hash.as_deref() != Some(path_digest(path).as_str()) {
            return Some(DiscrepancyKind::WrongPathHash);
        }
        None
    }

    fn node_path<'a>(&self, node: &'a TreeNode) -> Result<(&'a str, i64), TreeError> {
        match node.index() {
            TreeIndex::Path { path, level, .. } => Ok((path, *level)),
            _ => Err(TreeError::invalid_hierarchy(
                &node.id,
                &node.id,
                "node has no materialized path",
            )),
        }
    }
}

fn by_path(a: &TreeNode, b: &TreeNode) -> std::cmp::Ordering {
    a.path().cmp(&b.path()).then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl TreeStrategy for MaterializedPathStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MaterializedPath
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
            TreeOperation::Reindex { id } => {
                let parent = require(working_set, id)?.parent.clone();
                self.relocate(working_set, id, parent)
            }
            TreeOperation::Remove { id, mode } => self.plan_remove(working_set, id, *mode),
            TreeOperation::Rebuild => self.recover(working_set),
        }
    }

    fn verify(&self, working_set: &WorkingSet) -> Vec<Discrepancy> {
        working_set
            .nodes()
            .filter_map(|node| {
                self.check_node(working_set, node).map(|kind| {
                    Discrepancy::node(node.id.clone(), kind)
                        .in_root(Some(working_set.root_of(&node.id)))
                })
            })
            .collect()
    }

    fn recover(&self, working_set: &WorkingSet) -> Result<Vec<IndexMutation>, TreeError> {
        let mut queue: VecDeque<(&TreeNode, Option<String>, i64)> = VecDeque::new();
        let mut starts: Vec<&TreeNode> = Vec::new();

        for node in working_set.nodes() {
            match node.parent.as_deref() {
                None => starts.push(node),
                Some(parent_id) if !working_set.contains(parent_id) => {
                    tracing::warn!(
                        "Node {} in '{}' references missing parent {}, recovering it as a root",
                        node.id,
                        self.tree_type,
                        parent_id
                    );
                    starts.push(node);
                }
                Some(_) => {}
            }
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut mutations = Vec::new();
        let mut pending: Vec<&TreeNode> = working_set.nodes().collect();

        loop {
            for start in starts.drain(..) {
                queue.push_back((start, None, 1));
            }

            while let Some((node, parent_path, level)) = queue.pop_front() {
                if !visited.insert(node.id.as_str()) {
                    continue;
                }
                let segment = self.segment(node)?;
                let path = self.build_path(parent_path.as_deref(), &segment);
                let parent = if level == 1 { None } else { node.parent.clone() };

                for child in working_set.children(Some(&node.id)) {
                    queue.push_back((child, Some(path.clone()), level + 1));
                }
                mutations.push(IndexMutation::Place {
                    id: node.id.clone(),
                    parent,
                    index: self.index_for(path, level),
                });
            }

            // Whatever is left sits on a parent cycle
            pending.retain(|node| !visited.contains(node.id.as_str()));
            match pending.first() {
                Some(&node) => {
                    tracing::warn!(
                        "Node {} in '{}' is part of a parent cycle, recovering it as a root",
                        node.id,
                        self.tree_type
                    );
                    starts.push(node);
                }
                None => break,
            }
        }

        tracing::info!(
            "Rebuilt materialized paths for {} node(s) in '{}'",
            mutations.len(),
            self.tree_type
        );
        Ok(mutations)
    }

    fn needs_reindex(&self, node: &TreeNode, properties: &Value) -> bool {
        let source = self.config.path_source.as_str();
        source != "id" && node.properties.get(source) != properties.get(source)
    }

    fn lock_timeout(&self) -> Option<chrono::Duration> {
        if !self.config.activate_locking {
            return None;
        }
        // Configs that skipped validation are clamped, never wrapped
        let seconds = self.config.locking_timeout.min(MAX_LOCKING_TIMEOUT_SECS);
        i64::try_from(seconds).ok().map(chrono::Duration::seconds)
    }

    async fn roots(&self, store: &dyn TreeStore) -> Result<Vec<TreeNode>, TreeError> {
        let mut roots = store.query_nodes(&self.tree_type, &NodeQuery::Roots).await?;
        roots.sort_by(by_path);
        Ok(roots)
    }

    async fn descendants(
        &self,
        store: &dyn TreeStore,
        node: &TreeNode,
        direct_only: bool,
    ) -> Result<Vec<TreeNode>, TreeError> {
        let (path, level) = self.node_path(node)?;
        let query = NodeQuery::PathPrefix(self.subtree_prefix(path));

        let mut nodes = store.query_nodes(&self.tree_type, &query).await?;
        nodes.retain(|candidate| candidate.id != node.id);
        if direct_only {
            nodes.retain(|candidate| candidate.level() == Some(level + 1));
        }
        nodes.sort_by(by_path);
        Ok(nodes)
    }

    async fn ancestors(
        &self,
        store: &dyn TreeStore,
        node: &TreeNode,
    ) -> Result<Vec<TreeNode>, TreeError> {
        let (path, _) = self.node_path(node)?;
        let segments = self.segments(path);
        if segments.len() < 2 {
            return Ok(Vec::new());
        }

        let mut paths = Vec::with_capacity(segments.len() - 1);
        let mut current: Option<String> = None;
        for segment in &segments[..segments.len() - 1] {
            let next = self.build_path(current.as_deref(), segment);
            paths.push(next.clone());
            current = Some(next);
        }

        let mut nodes = store
            .query_nodes(&self.tree_type, &NodeQuery::PathIn(paths))
            .await?;
        nodes.sort_by_key(|ancestor| ancestor.level());
        Ok(nodes)
    }
}

#[cfg(test)]
#[path = "materialized_path_test.rs"]
mod materialized_path_test;
