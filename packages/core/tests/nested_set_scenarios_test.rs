//! Nested Set Scenario Tests
//!
//! End-to-end checks of nested-set trees through the coordinator and the
//! in-memory store: concrete interval layouts, interval containment after
//! mixed batches, move round trips and the verify/recover cycle.

#[cfg(test)]
mod nested_set_scenarios {
    use anyhow::Result;
    use arbor_core::config::{NestedSetConfig, StrategyConfig, TreeConfig, TreeRegistry};
    use arbor_core::db::{MemoryStore, NodeQuery, TreeStore};
    use arbor_core::models::{TreeIndex, TreeNode};
    use arbor_core::operations::{NodeChanges, Position, RemovalMode};
    use arbor_core::services::TreeCoordinator;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    /// Route engine logs to the test output; `RUST_LOG=arbor_core=debug` to see them
    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Helper to create a coordinator over a fresh store
    fn create_test_engine(root_scoped: bool) -> Result<(TreeCoordinator, Arc<MemoryStore>)> {
        init_logging();
        let store = Arc::new(MemoryStore::new());
        let config = TreeConfig {
            tree_type: "category".to_string(),
            strategy: StrategyConfig::Nested(NestedSetConfig { root_scoped }),
        };
        let registry = TreeRegistry::from_configs([config])?;
        let coordinator = TreeCoordinator::new(store.clone(), registry)?;
        Ok((coordinator, store))
    }

    fn category(id: &str, parent: Option<&str>) -> TreeNode {
        TreeNode::with_id(id, "category", parent.map(String::from), json!({ "title": id }))
    }

    async fn insert_all(
        coordinator: &TreeCoordinator,
        nodes: &[(&str, Option<&str>)],
    ) -> Result<()> {
        let mut batch = coordinator.begin();
        for (id, parent) in nodes {
            batch.prepare_insert(category(id, *parent)).await?;
        }
        batch.commit().await?;
        Ok(())
    }

    async fn move_node(
        coordinator: &TreeCoordinator,
        id: &str,
        changes: NodeChanges,
    ) -> Result<()> {
        let mut batch = coordinator.begin();
        batch.prepare_update("category", id, changes).await?;
        batch.commit().await?;
        Ok(())
    }

    async fn interval(store: &MemoryStore, id: &str) -> Result<(i64, i64, i64)> {
        let node = store
            .get_node("category", id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("node {} missing", id))?;
        let (left, right) = node
            .bounds()
            .ok_or_else(|| anyhow::anyhow!("node {} unplaced", id))?;
        Ok((left, right, node.level().unwrap_or(-1)))
    }

    /// Every stored interval, keyed by id
    async fn snapshot(store: &MemoryStore) -> Result<BTreeMap<String, TreeIndex>> {
        Ok(store
            .query_nodes("category", &NodeQuery::All)
            .await?
            .into_iter()
            .map(|node| (node.id.clone(), node.index().clone()))
            .collect())
    }

    /// Descendant intervals lie strictly inside their ancestors'; unrelated
    /// nodes of the same root are disjoint
    async fn assert_containment(store: &MemoryStore) -> Result<()> {
        let nodes = store.query_nodes("category", &NodeQuery::All).await?;
        let by_id: HashMap<&str, &TreeNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        let is_ancestor = |ancestor: &str, node: &TreeNode| {
            let mut current = node.parent.as_deref();
            while let Some(parent) = current {
                if parent == ancestor {
                    return true;
                }
                current = by_id.get(parent).and_then(|p| p.parent.as_deref());
            }
            false
        };

        for n in &nodes {
            let (nl, nr) = n.bounds().expect("placed");
            for d in &nodes {
                if d.id == n.id || d.root() != n.root() {
                    continue;
                }
                let (dl, dr) = d.bounds().expect("placed");
                if is_ancestor(&n.id, d) {
                    assert!(nl < dl && dl < dr && dr < nr, "{} not inside {}", d.id, n.id);
                } else if !is_ancestor(&d.id, n) {
                    assert!(dr < nl || dl > nr, "{} overlaps {}", d.id, n.id);
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Concrete layouts
    // ========================================================================

    #[tokio::test]
    async fn test_food_tree_intervals() -> Result<()> {
        let (coordinator, store) = create_test_engine(true)?;
        insert_all(&coordinator, &[("food", None)]).await?;
        insert_all(&coordinator, &[("fruits", Some("food"))]).await?;
        insert_all(&coordinator, &[("vegetables", Some("food"))]).await?;

        assert_eq!(interval(&store, "food").await?, (1, 6, 0));
        assert_eq!(interval(&store, "fruits").await?, (2, 3, 1));
        assert_eq!(interval(&store, "vegetables").await?, (4, 5, 1));
        Ok(())
    }

    #[tokio::test]
    async fn test_move_fruits_under_vegetables() -> Result<()> {
        let (coordinator, store) = create_test_engine(true)?;
        insert_all(
            &coordinator,
            &[
                ("food", None),
                ("fruits", Some("food")),
                ("vegetables", Some("food")),
            ],
        )
        .await?;

        move_node(
            &coordinator,
            "fruits",
            NodeChanges::reparent(Some("vegetables".to_string())),
        )
        .await?;

        assert_eq!(interval(&store, "food").await?, (1, 6, 0));
        assert_eq!(interval(&store, "vegetables").await?, (2, 5, 1));
        assert_eq!(interval(&store, "fruits").await?, (3, 4, 2));
        assert!(coordinator.verify("category").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_global_forest_numbers_roots_consecutively() -> Result<()> {
        let (coordinator, store) = create_test_engine(false)?;
        insert_all(
            &coordinator,
            &[("food", None), ("fruits", Some("food")), ("drinks", None)],
        )
        .await?;

        assert_eq!(interval(&store, "food").await?, (1, 4, 0));
        assert_eq!(interval(&store, "fruits").await?, (2, 3, 1));
        assert_eq!(interval(&store, "drinks").await?, (5, 6, 0));

        move_node(
            &coordinator,
            "drinks",
            NodeChanges::reposition(Position::PrevSiblingOf("food".to_string())),
        )
        .await?;
        assert_eq!(interval(&store, "drinks").await?, (1, 2, 0));
        assert_eq!(interval(&store, "food").await?, (3, 6, 0));
        Ok(())
    }

    // ========================================================================
    // Structural properties
    // ========================================================================

    #[tokio::test]
    async fn test_containment_holds_after_mixed_batches() -> Result<()> {
        let (coordinator, store) = create_test_engine(true)?;
        insert_all(
            &coordinator,
            &[
                ("food", None),
                ("fruits", Some("food")),
                ("apples", Some("fruits")),
                ("pears", Some("fruits")),
                ("vegetables", Some("food")),
                ("carrots", Some("vegetables")),
                ("drinks", None),
                ("tea", Some("drinks")),
            ],
        )
        .await?;

        let mut batch = coordinator.begin();
        batch
            .prepare_update(
                "category",
                "vegetables",
                NodeChanges::reparent(Some("drinks".to_string())),
            )
            .await?;
        batch
            .prepare_update(
                "category",
                "pears",
                NodeChanges::reposition(Position::PrevSiblingOf("apples".to_string())),
            )
            .await?;
        batch.prepare_insert(category("coffee", Some("drinks"))).await?;
        batch
            .prepare_delete("category", "tea", RemovalMode::Cascade)
            .await?;
        batch.commit().await?;

        assert_containment(&store).await?;
        assert!(coordinator.verify("category").await?.is_empty());

        let carrots = store.get_node("category", "carrots").await?.expect("carrots");
        assert_eq!(carrots.root(), Some("drinks"));
        assert_eq!(carrots.level(), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_move_and_move_back_restores_intervals() -> Result<()> {
        let (coordinator, store) = create_test_engine(true)?;
        insert_all(
            &coordinator,
            &[
                ("food", None),
                ("fruits", Some("food")),
                ("vegetables", Some("food")),
                ("carrots", Some("vegetables")),
                ("herbs", Some("food")),
            ],
        )
        .await?;
        let before = snapshot(&store).await?;

        move_node(
            &coordinator,
            "vegetables",
            NodeChanges::reparent(Some("fruits".to_string())).with_position(Position::FirstChild),
        )
        .await?;
        assert_eq!(interval(&store, "carrots").await?.2, 3);

        move_node(
            &coordinator,
            "vegetables",
            NodeChanges::reposition(Position::NextSiblingOf("fruits".to_string())),
        )
        .await?;

        assert_eq!(snapshot(&store).await?, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_reparent_removal_promotes_children() -> Result<()> {
        let (coordinator, store) = create_test_engine(true)?;
        insert_all(
            &coordinator,
            &[
                ("food", None),
                ("fruits", Some("food")),
                ("apples", Some("fruits")),
                ("pears", Some("fruits")),
            ],
        )
        .await?;

        let repository = coordinator.repository("category")?;
        repository
            .remove_from_tree("fruits", RemovalMode::ReparentChildren)
            .await?;

        assert_eq!(interval(&store, "food").await?, (1, 6, 0));
        assert_eq!(interval(&store, "apples").await?, (2, 3, 1));
        assert_eq!(interval(&store, "pears").await?, (4, 5, 1));
        assert!(repository.verify().await?.is_empty());
        Ok(())
    }

    // ========================================================================
    // Verify / Recover
    // ========================================================================

    #[tokio::test]
    async fn test_corrupted_left_bound_round_trip() -> Result<()> {
        let (coordinator, store) = create_test_engine(true)?;
        insert_all(
            &coordinator,
            &[
                ("food", None),
                ("fruits", Some("food")),
                ("vegetables", Some("food")),
            ],
        )
        .await?;
        let healthy = snapshot(&store).await?;

        let fruits = store.get_node("category", "fruits").await?.expect("fruits");
        store
            .put_node(TreeNode::restore(
                "fruits",
                "category",
                fruits.parent.clone(),
                fruits.properties.clone(),
                fruits.version,
                TreeIndex::Nested {
                    left: 0,
                    right: 3,
                    level: 1,
                    root: Some("food".to_string()),
                },
            ))
            .await;

        let repository = coordinator.repository("category")?;
        let discrepancies = repository.verify().await?;
        let named: Vec<_> = discrepancies.iter().filter(|d| d.node_id.is_some()).collect();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].node_id.as_deref(), Some("fruits"));

        repository.recover().await?;
        assert!(repository.verify().await?.is_empty());
        assert_eq!(snapshot(&store).await?, healthy);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_global_root_appends_conflict() -> Result<()> {
        let (coordinator, store) = create_test_engine(false)?;
        insert_all(&coordinator, &[("a", None)]).await?;

        let mut first = coordinator.begin();
        first.prepare_insert(category("b", None)).await?;
        let mut second = coordinator.begin();
        second.prepare_insert(category("c", None)).await?;

        second.commit().await?;
        let error = first.commit().await.unwrap_err();
        assert!(error.is_retryable());

        assert!(store.get_node("category", "b").await?.is_none());
        assert_eq!(interval(&store, "c").await?, (3, 4, 0));
        assert!(coordinator.verify("category").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_first_roots_conflict() -> Result<()> {
        let (coordinator, store) = create_test_engine(false)?;

        let mut first = coordinator.begin();
        first.prepare_insert(category("a", None)).await?;
        let mut second = coordinator.begin();
        second.prepare_insert(category("b", None)).await?;

        second.commit().await?;
        let error = first.commit().await.unwrap_err();
        assert!(error.is_retryable());

        assert_eq!(interval(&store, "b").await?, (1, 2, 0));
        assert_eq!(store.node_count("category").await, 1);
        assert!(coordinator.verify("category").await?.is_empty());
        Ok(())
    }
}
