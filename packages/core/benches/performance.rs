//! Performance benchmarks for Arbor core tree operations
//!
//! Run with: `cargo bench -p arbor-core`
//!
//! These benchmarks measure critical path performance:
//! - Batch insert of a wide nested-set tree (interval shifting)
//! - Subtree moves in a deep materialized-path tree (prefix rewrites)
//! - verify() over a large closure table

use arbor_core::config::{MaterializedPathConfig, TreeConfig, TreeRegistry};
use arbor_core::db::MemoryStore;
use arbor_core::models::TreeNode;
use arbor_core::operations::NodeChanges;
use arbor_core::services::TreeCoordinator;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Setup a coordinator over a fresh in-memory store
fn setup_coordinator() -> TreeCoordinator {
    let store = Arc::new(MemoryStore::new());
    let registry = TreeRegistry::from_configs([
        TreeConfig::nested("category"),
        TreeConfig::materialized_path("menu", MaterializedPathConfig::default()),
        TreeConfig::closure("comment", "comment_closure"),
    ])
    .unwrap();
    TreeCoordinator::new(store, registry).unwrap()
}

/// `width` children under each of `depth` chained parents
async fn seed(coordinator: &TreeCoordinator, tree_type: &str, depth: usize, width: usize) {
    let mut batch = coordinator.begin();
    let mut parent: Option<String> = None;
    for level in 0..depth {
        let id = format!("n{}", level);
        batch
            .prepare_insert(TreeNode::with_id(&id, tree_type, parent.clone(), json!({})))
            .await
            .unwrap();
        for i in 0..width {
            batch
                .prepare_insert(TreeNode::with_id(
                    format!("n{}-{}", level, i),
                    tree_type,
                    Some(id.clone()),
                    json!({}),
                ))
                .await
                .unwrap();
        }
        parent = Some(id);
    }
    batch.commit().await.unwrap();
}

/// Benchmark building a 500-node nested-set tree in one batch
fn bench_nested_insert(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("nested_set_insert");
    group.sample_size(10);

    group.bench_function("500_nodes", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let mut total = std::time::Duration::ZERO;
                for _ in 0..iters {
                    let coordinator = setup_coordinator();
                    let start = std::time::Instant::now();
                    seed(&coordinator, "category", 5, 99).await;
                    total += start.elapsed();
                }
                total
            })
        });
    });

    group.finish();
}

/// Benchmark moving a deep subtree back and forth between roots
fn bench_path_move(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let coordinator = setup_coordinator();
    rt.block_on(async {
        seed(&coordinator, "menu", 20, 10).await;
        let mut batch = coordinator.begin();
        batch
            .prepare_insert(TreeNode::with_id("other", "menu", None, json!({})))
            .await
            .unwrap();
        batch.commit().await.unwrap();
    });

    c.bench_function("materialized_path_move_subtree", |b| {
        let mut toggle = false;
        b.iter(|| {
            toggle = !toggle;
            let parent = if toggle { "other" } else { "n0" };
            rt.block_on(async {
                let mut batch = coordinator.begin();
                batch
                    .prepare_update("menu", "n1", NodeChanges::reparent(Some(parent.to_string())))
                    .await
                    .unwrap();
                black_box(batch.commit().await.unwrap());
            })
        });
    });
}

/// Benchmark verify() over a closure table with ~1000 nodes
fn bench_closure_verify(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let coordinator = setup_coordinator();
    rt.block_on(seed(&coordinator, "comment", 10, 99));

    c.bench_function("closure_table_verify", |b| {
        b.iter(|| {
            rt.block_on(async {
                let discrepancies = coordinator.verify("comment").await.unwrap();
                black_box(discrepancies)
            })
        });
    });
}

criterion_group!(
    benches,
    bench_nested_insert,
    bench_path_move,
    bench_closure_verify
);
criterion_main!(benches);
