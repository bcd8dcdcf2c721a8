//! Materialized Path and Tree Locking Tests
//!
//! Covers path maintenance through the coordinator (moves to root, subtree
//! prefix rewrites, segment/ancestor equivalence) and the advisory per-root
//! locks that serialize structural writes.

#[cfg(test)]
mod materialized_path_tests {
    use anyhow::Result;
    use arbor_core::config::{MaterializedPathConfig, TreeConfig, TreeRegistry};
    use arbor_core::db::{MemoryStore, NodeQuery, TreeStore};
    use arbor_core::models::{TreeIndex, TreeLock, TreeNode};
    use arbor_core::operations::NodeChanges;
    use arbor_core::services::{TreeCoordinator, TreeError};
    use arbor_core::strategies::materialized_path::path_digest;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    /// Helper to create a coordinator with one materialized-path tree type
    fn create_test_engine(
        options: MaterializedPathConfig,
    ) -> Result<(TreeCoordinator, Arc<MemoryStore>)> {
        let store = Arc::new(MemoryStore::new());
        let registry =
            TreeRegistry::from_configs([TreeConfig::materialized_path("menu", options)])?;
        let coordinator = TreeCoordinator::new(store.clone(), registry)?;
        Ok((coordinator, store))
    }

    fn locking() -> MaterializedPathConfig {
        MaterializedPathConfig {
            activate_locking: true,
            locking_timeout: 3,
            ..Default::default()
        }
    }

    fn item(id: &str, parent: Option<&str>) -> TreeNode {
        TreeNode::with_id(id, "menu", parent.map(String::from), json!({ "title": id }))
    }

    async fn insert_all(
        coordinator: &TreeCoordinator,
        nodes: &[(&str, Option<&str>)],
    ) -> Result<()> {
        let mut batch = coordinator.begin();
        for (id, parent) in nodes {
            batch.prepare_insert(item(id, *parent)).await?;
        }
        batch.commit().await?;
        Ok(())
    }

    async fn path_of(store: &MemoryStore, id: &str) -> Result<(String, i64)> {
        let node = store
            .get_node("menu", id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("node {} missing", id))?;
        Ok((
            node.path().unwrap_or_default().to_string(),
            node.level().unwrap_or(-1),
        ))
    }

    // ========================================================================
    // Paths
    // ========================================================================

    #[tokio::test]
    async fn test_move_child_to_root() -> Result<()> {
        let (coordinator, store) = create_test_engine(MaterializedPathConfig::default())?;
        insert_all(&coordinator, &[("A", None), ("B", Some("A"))]).await?;

        assert_eq!(path_of(&store, "A").await?, ("A,".to_string(), 1));
        assert_eq!(path_of(&store, "B").await?, ("A,B,".to_string(), 2));

        let mut batch = coordinator.begin();
        batch
            .prepare_update("menu", "B", NodeChanges::reparent(None))
            .await?;
        batch.commit().await?;

        assert_eq!(path_of(&store, "B").await?, ("B,".to_string(), 1));
        Ok(())
    }

    #[tokio::test]
    async fn test_segments_match_ancestors() -> Result<()> {
        let (coordinator, store) = create_test_engine(MaterializedPathConfig {
            track_hash: true,
            ..Default::default()
        })?;
        insert_all(
            &coordinator,
            &[
                ("home", None),
                ("products", Some("home")),
                ("tools", Some("products")),
                ("hammers", Some("tools")),
                ("about", Some("home")),
                ("blog", None),
            ],
        )
        .await?;

        let mut batch = coordinator.begin();
        batch
            .prepare_update("menu", "tools", NodeChanges::reparent(Some("blog".to_string())))
            .await?;
        batch.commit().await?;

        let nodes = store.query_nodes("menu", &NodeQuery::All).await?;
        let parents: HashMap<&str, Option<&str>> = nodes
            .iter()
            .map(|node| (node.id.as_str(), node.parent.as_deref()))
            .collect();

        for node in &nodes {
            let mut chain = vec![node.id.as_str()];
            let mut current = node.parent.as_deref();
            while let Some(parent) = current {
                chain.push(parent);
                current = parents.get(parent).copied().flatten();
            }
            chain.reverse();

            let path = node.path().expect("path");
            let segments: Vec<&str> = path.split(',').filter(|s| !s.is_empty()).collect();
            assert_eq!(segments, chain, "path of {}", node.id);
            assert_eq!(segments.len() as i64, node.level().expect("level"));
            assert_eq!(node.path_hash(), Some(path_digest(path).as_str()));
        }

        assert_eq!(path_of(&store, "hammers").await?.0, "blog,tools,hammers,");
        Ok(())
    }

    /// Parent and index of every stored node
    async fn snapshot(
        store: &MemoryStore,
    ) -> Result<BTreeMap<String, (Option<String>, TreeIndex)>> {
        Ok(store
            .query_nodes("menu", &NodeQuery::All)
            .await?
            .into_iter()
            .map(|node| {
                let entry = (node.parent.clone(), node.index().clone());
                (node.id, entry)
            })
            .collect())
    }

    async fn move_node(coordinator: &TreeCoordinator, id: &str, parent: &str) -> Result<()> {
        let mut batch = coordinator.begin();
        batch
            .prepare_update("menu", id, NodeChanges::reparent(Some(parent.to_string())))
            .await?;
        batch.commit().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_move_subtree_and_back_restores_paths() -> Result<()> {
        let (coordinator, store) = create_test_engine(MaterializedPathConfig {
            track_hash: true,
            ..Default::default()
        })?;
        insert_all(
            &coordinator,
            &[
                ("home", None),
                ("products", Some("home")),
                ("tools", Some("products")),
                ("hammers", Some("tools")),
                ("claw", Some("hammers")),
                ("blog", None),
            ],
        )
        .await?;
        let before = snapshot(&store).await?;

        move_node(&coordinator, "tools", "blog").await?;
        assert_eq!(
            path_of(&store, "claw").await?,
            ("blog,tools,hammers,claw,".to_string(), 4)
        );

        move_node(&coordinator, "tools", "products").await?;
        assert_eq!(snapshot(&store).await?, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_insert_conflicts_with_move_of_its_parent() -> Result<()> {
        let (coordinator, store) = create_test_engine(MaterializedPathConfig::default())?;
        insert_all(&coordinator, &[("A", None), ("B", Some("A")), ("C", None)]).await?;

        let mut inserter = coordinator.begin();
        inserter.prepare_insert(item("D", Some("B"))).await?;

        move_node(&coordinator, "B", "C").await?;

        let error = inserter.commit().await.unwrap_err();
        assert!(error.is_retryable());
        assert!(store.get_node("menu", "D").await?.is_none());
        assert!(coordinator.verify("menu").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_and_recover_through_repository() -> Result<()> {
        let (coordinator, store) = create_test_engine(MaterializedPathConfig::default())?;
        insert_all(&coordinator, &[("A", None), ("B", Some("A")), ("C", Some("B"))]).await?;

        // Parent pointer changed behind the engine's back
        let mut c = store.get_node("menu", "C").await?.expect("C");
        c.parent = Some("A".to_string());
        store.put_node(c).await;

        let repository = coordinator.repository("menu")?;
        let discrepancies = repository.verify().await?;
        assert_eq!(discrepancies.len(), 1);
        assert_eq!(discrepancies[0].node_id.as_deref(), Some("C"));

        repository.recover().await?;
        assert!(repository.verify().await?.is_empty());
        assert_eq!(path_of(&store, "C").await?, ("A,C,".to_string(), 2));
        Ok(())
    }

    // ========================================================================
    // Locking
    // ========================================================================

    #[tokio::test]
    async fn test_second_structural_write_under_locked_root_fails() -> Result<()> {
        let (coordinator, store) = create_test_engine(locking())?;
        insert_all(
            &coordinator,
            &[("R", None), ("X", Some("R")), ("Y", Some("X"))],
        )
        .await?;

        let mut first = coordinator.begin();
        first
            .prepare_update("menu", "X", NodeChanges::reparent(None))
            .await?;
        assert!(store.lock_for("menu", "R").await.is_some());

        let mut second = coordinator.begin();
        let error = second
            .prepare_insert(item("Z", Some("Y")))
            .await
            .unwrap_err();
        match &error {
            TreeError::TreeLocked { root_id, .. } => assert_eq!(root_id, "R"),
            other => panic!("expected tree locked, got {:?}", other),
        }
        assert!(error.is_retryable());
        assert!(error.to_string().contains("locked"));

        first.commit().await?;
        assert!(store.lock_for("menu", "R").await.is_none());

        second.prepare_insert(item("Z", Some("R"))).await?;
        second.commit().await?;
        assert_eq!(path_of(&store, "Z").await?, ("R,Z,".to_string(), 2));
        assert_eq!(path_of(&store, "Y").await?, ("X,Y,".to_string(), 2));
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_lock_is_taken_over() -> Result<()> {
        let (coordinator, store) = create_test_engine(locking())?;
        insert_all(&coordinator, &[("R", None)]).await?;

        // A batch that died ten seconds ago, with a three second timeout
        let crashed_at = Utc::now() - Duration::seconds(10);
        store
            .try_lock(
                TreeLock::new("menu", "R", "crashed-batch", crashed_at, Duration::seconds(3)),
                crashed_at,
            )
            .await?;

        let mut batch = coordinator.begin();
        batch.prepare_insert(item("child", Some("R"))).await?;
        assert_eq!(
            store.lock_for("menu", "R").await.map(|lock| lock.owner),
            Some(batch.owner().to_string())
        );
        batch.commit().await?;

        assert!(store.lock_for("menu", "R").await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_unrelated_roots_do_not_contend() -> Result<()> {
        let (coordinator, _store) = create_test_engine(locking())?;
        insert_all(&coordinator, &[("R", None), ("S", None)]).await?;

        let mut first = coordinator.begin();
        first.prepare_insert(item("r1", Some("R"))).await?;

        let mut second = coordinator.begin();
        second.prepare_insert(item("s1", Some("S"))).await?;

        first.commit().await?;
        second.commit().await?;
        Ok(())
    }
}
