//! Tests for ClosureTableStrategy row maintenance

#[cfg(test)]
mod tests {
    use crate::config::ClosureConfig;
    use crate::db::Forest;
    use crate::models::{ClosureRow, TreeNode};
    use crate::operations::{Position, RemovalMode, TreeOperation, WorkingSet};
    use crate::services::TreeError;
    use crate::strategies::{ClosureTableStrategy, DiscrepancyKind, TreeStrategy};
    use serde_json::json;

    fn strategy() -> ClosureTableStrategy {
        ClosureTableStrategy::new(
            "comment",
            ClosureConfig {
                closure_table: "comment_closure".to_string(),
            },
        )
    }

    fn empty() -> WorkingSet {
        WorkingSet::from_forest("comment", Some("comment_closure".to_string()), Forest::default())
    }

    fn insert(
        strategy: &ClosureTableStrategy,
        working_set: &mut WorkingSet,
        id: &str,
        parent: Option<&str>,
    ) {
        let node = TreeNode::with_id(id, "comment", parent.map(String::from), json!({}));
        working_set.stage_insert(node).unwrap();
        let mutations = strategy
            .plan(
                &TreeOperation::Insert {
                    id: id.to_string(),
                    position: Position::LastChild,
                },
                working_set,
            )
            .unwrap();
        working_set.apply(mutations).unwrap();
    }

    fn run(
        strategy: &ClosureTableStrategy,
        working_set: &mut WorkingSet,
        operation: TreeOperation,
    ) -> Result<(), TreeError> {
        let mutations = strategy.plan(&operation, working_set)?;
        working_set.apply(mutations)
    }

    /// (ancestor, depth) pairs pointing at `id`, nearest first
    fn ancestry(working_set: &WorkingSet, id: &str) -> Vec<(String, i64)> {
        let mut rows: Vec<_> = working_set
            .rows_to(id)
            .into_iter()
            .map(|row| (row.ancestor, row.depth))
            .collect();
        rows.sort_by_key(|(_, depth)| *depth);
        rows
    }

    fn chain(strategy: &ClosureTableStrategy) -> WorkingSet {
        let mut working_set = empty();
        insert(strategy, &mut working_set, "a", None);
        insert(strategy, &mut working_set, "b", Some("a"));
        insert(strategy, &mut working_set, "c", Some("b"));
        insert(strategy, &mut working_set, "x", None);
        working_set
    }

    #[test]
    fn test_insert_writes_one_row_per_ancestor() {
        let working_set = chain(&strategy());

        assert_eq!(
            ancestry(&working_set, "c"),
            vec![
                ("c".to_string(), 0),
                ("b".to_string(), 1),
                ("a".to_string(), 2)
            ]
        );
        assert_eq!(working_set.closure_rows().len(), 7);
    }

    #[test]
    fn test_move_relinks_whole_subtree() {
        let strategy = strategy();
        let mut working_set = chain(&strategy);

        run(
            &strategy,
            &mut working_set,
            TreeOperation::Move {
                id: "b".to_string(),
                parent: Some("x".to_string()),
                position: Position::LastChild,
            },
        )
        .unwrap();

        assert_eq!(
            ancestry(&working_set, "c"),
            vec![
                ("c".to_string(), 0),
                ("b".to_string(), 1),
                ("x".to_string(), 2)
            ]
        );
        assert_eq!(
            working_set.get("b").unwrap().parent.as_deref(),
            Some("x")
        );
        assert!(strategy.verify(&working_set).is_empty());
    }

    #[test]
    fn test_move_and_back_restores_rows() {
        let strategy = strategy();
        let mut working_set = chain(&strategy);
        let before = working_set.closure_rows();

        for parent in ["x", "a"] {
            run(
                &strategy,
                &mut working_set,
                TreeOperation::Move {
                    id: "b".to_string(),
                    parent: Some(parent.to_string()),
                    position: Position::FirstChild,
                },
            )
            .unwrap();
        }

        assert_eq!(working_set.closure_rows(), before);
        assert_eq!(working_set.change_set().closure_inserts.len(), 7);
    }

    #[test]
    fn test_move_under_descendant_is_rejected() {
        let strategy = strategy();
        let working_set = chain(&strategy);
        let result = strategy.plan(
            &TreeOperation::Move {
                id: "a".to_string(),
                parent: Some("c".to_string()),
                position: Position::LastChild,
            },
            &working_set,
        );
        assert!(matches!(result, Err(TreeError::InvalidHierarchy { .. })));
    }

    #[test]
    fn test_cascade_remove_drops_all_rows_of_subtree() {
        let strategy = strategy();
        let mut working_set = chain(&strategy);

        run(
            &strategy,
            &mut working_set,
            TreeOperation::Remove {
                id: "b".to_string(),
                mode: RemovalMode::Cascade,
            },
        )
        .unwrap();

        assert_eq!(
            working_set.closure_rows(),
            vec![ClosureRow::self_row("a"), ClosureRow::self_row("x")]
        );
        assert!(!working_set.contains("c"));
    }

    #[test]
    fn test_remove_reparents_children() {
        let strategy = strategy();
        let mut working_set = chain(&strategy);

        run(
            &strategy,
            &mut working_set,
            TreeOperation::Remove {
                id: "b".to_string(),
                mode: RemovalMode::ReparentChildren,
            },
        )
        .unwrap();

        assert_eq!(
            ancestry(&working_set, "c"),
            vec![("c".to_string(), 0), ("a".to_string(), 1)]
        );
        assert_eq!(working_set.get("c").unwrap().parent.as_deref(), Some("a"));
        assert!(strategy.verify(&working_set).is_empty());
    }

    #[test]
    fn test_verify_and_recover_rows() {
        let strategy = strategy();
        let nodes = vec![
            TreeNode::with_id("a", "comment", None, json!({})),
            TreeNode::with_id("b", "comment", Some("a".to_string()), json!({})),
        ];
        let mut working_set = WorkingSet::from_forest(
            "comment",
            Some("comment_closure".to_string()),
            Forest {
                nodes,
                closure_rows: vec![
                    ClosureRow::self_row("a"),
                    ClosureRow::new("a", "b", 3),
                    ClosureRow::new("z", "b", 1),
                ],
            },
        );

        let kinds: Vec<_> = strategy
            .verify(&working_set)
            .into_iter()
            .map(|d| d.kind)
            .collect();
        assert!(kinds.contains(&DiscrepancyKind::MissingClosureRow {
            ancestor: "b".to_string(),
            depth: 0
        }));
        assert!(kinds.contains(&DiscrepancyKind::WrongClosureDepth {
            ancestor: "a".to_string(),
            expected: 1,
            actual: 3
        }));
        assert!(kinds.contains(&DiscrepancyKind::UnexpectedClosureRow {
            ancestor: "z".to_string(),
            depth: 1
        }));

        let mutations = strategy.recover(&working_set).unwrap();
        working_set.apply(mutations).unwrap();
        assert!(strategy.verify(&working_set).is_empty());
        assert_eq!(
            working_set.closure_rows(),
            vec![
                ClosureRow::self_row("a"),
                ClosureRow::new("a", "b", 1),
                ClosureRow::self_row("b"),
            ]
        );
    }
}
