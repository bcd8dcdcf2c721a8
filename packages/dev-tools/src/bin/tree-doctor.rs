//! Tree Doctor
//!
//! Offline consistency checker for exported tree data. Loads a JSON dump into
//! an in-memory store, runs `verify()` on every configured tree type and, with
//! `--recover`, rebuilds broken indexes from parent pointers.
//!
//! # Dump format
//!
//! ```json
//! {
//!   "trees": [{ "tree_type": "category", "strategy": "nested" }],
//!   "nodes": [{
//!     "id": "food", "treeType": "category", "parent": null,
//!     "index": { "kind": "nested", "left": 1, "right": 2, "level": 0, "root": "food" }
//!   }],
//!   "closureRows": {
//!     "comment_closure": [{ "ancestor": "c1", "descendant": "c1", "depth": 0 }]
//!   }
//! }
//! ```
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin tree-doctor -- dump.json
//! cargo run --bin tree-doctor -- dump.json --recover --out repaired.json
//! ```
//!
//! Exits with status 1 when discrepancies remain.

use anyhow::Context;
use arbor_core::config::{TreeConfig, TreeRegistry};
use arbor_core::db::{ClosureQuery, MemoryStore, NodeQuery, TreeStore};
use arbor_core::models::{ClosureRow, TreeNode};
use arbor_core::services::TreeCoordinator;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Dump {
    trees: Vec<TreeConfig>,
    #[serde(default)]
    nodes: Vec<TreeNode>,
    #[serde(default)]
    closure_rows: BTreeMap<String, Vec<ClosureRow>>,
}

#[derive(Debug, Parser)]
#[command(name = "tree-doctor")]
#[command(about = "Verify and repair exported Arbor trees", long_about = None)]
struct DoctorCli {
    /// JSON dump to check
    input: PathBuf,

    /// Rebuild indexes of tree types with discrepancies
    #[arg(short, long)]
    recover: bool,

    /// Write the (repaired) dump to this file
    #[arg(short, long)]
    out: Option<PathBuf>,
}

async fn load(dump: &Dump) -> anyhow::Result<(TreeCoordinator, Arc<MemoryStore>)> {
    let store = Arc::new(MemoryStore::new());
    for node in &dump.nodes {
        store.put_node(node.clone()).await;
    }
    for (table, rows) in &dump.closure_rows {
        for row in rows {
            store.put_closure_row(table, row.clone()).await;
        }
    }

    let registry = TreeRegistry::from_configs(dump.trees.iter().cloned())?;
    let coordinator = TreeCoordinator::new(store.clone(), registry)?;
    Ok((coordinator, store))
}

async fn export(dump: &Dump, store: &MemoryStore) -> anyhow::Result<Dump> {
    let mut repaired = Dump {
        trees: dump.trees.clone(),
        ..Default::default()
    };
    for config in &dump.trees {
        repaired
            .nodes
            .extend(store.query_nodes(&config.tree_type, &NodeQuery::All).await?);
        if let Some(table) = config.closure_table() {
            let rows = store.query_closure(table, &ClosureQuery::All).await?;
            repaired.closure_rows.insert(table.to_string(), rows);
        }
    }
    Ok(repaired)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("tree_doctor=info,arbor_core=warn")
            }),
        )
        .init();

    let cli = DoctorCli::parse();
    let raw = std::fs::read_to_string(&cli.input)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;
    let dump: Dump = serde_json::from_str(&raw).context("failed to parse dump")?;
    tracing::info!(
        "Loaded {} tree type(s), {} node(s) from {}",
        dump.trees.len(),
        dump.nodes.len(),
        cli.input.display()
    );

    let (coordinator, store) = load(&dump).await?;
    let mut remaining = 0;

    for config in &dump.trees {
        let repository = coordinator.repository(&config.tree_type)?;
        let discrepancies = repository.verify().await?;

        println!(
            "{} ({}): {} discrepancy(ies)",
            config.tree_type,
            config.kind(),
            discrepancies.len()
        );
        for discrepancy in &discrepancies {
            println!("  - {}", discrepancy);
        }

        if cli.recover && !discrepancies.is_empty() {
            let report = repository.recover().await?;
            let left = repository.verify().await?;
            println!(
                "  recovered: {} node(s) rewritten, {} closure row(s) written, {} left",
                report.updated,
                report.closure_rows_written,
                left.len()
            );
            remaining += left.len();
        } else {
            remaining += discrepancies.len();
        }
    }

    if let Some(path) = &cli.out {
        let repaired = export(&dump, &store).await?;
        std::fs::write(path, serde_json::to_string_pretty(&repaired)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Wrote {}", path.display());
    }

    if remaining > 0 {
        std::process::exit(1);
    }
    Ok(())
}
