//! CLI command handlers.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use keel_core::RolloutConfig;
use keel_reconciler::{
    ApplicationStatus, ComponentRegistry, Controller, InMemoryCluster, ReadinessRegistry,
    Reconciler, ReconciliationSummary,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::Commands;
use crate::declared::{DeclaredController, load_declaration, load_objects};

/// Execute a CLI command, writing its JSON output to stdout.
pub async fn execute_command(command: Commands) -> Result<()> {
    let output = match command {
        Commands::Graph {
            declaration,
            config,
        } => cmd_graph(&declaration, config.as_deref())?,

        Commands::Reconcile {
            declaration,
            config,
            state,
            passes,
        } => {
            let passes =
                cmd_reconcile(&declaration, config.as_deref(), state.as_deref(), passes).await?;
            serde_json::to_string_pretty(&passes)?
        }
    };
    println!("{output}");
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<RolloutConfig> {
    let config = match path {
        Some(path) => RolloutConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RolloutConfig::default(),
    };
    let config = config.with_env_overrides();
    config.validate().context("Invalid rollout configuration")?;
    Ok(config)
}

/// Dependency levels of a declaration, as JSON.
fn cmd_graph(declaration: &Path, config: Option<&Path>) -> Result<String> {
    let config = load_config(config)?;
    let declaration = load_declaration(declaration)?;

    let mut registry = ComponentRegistry::new();
    DeclaredController.setup(&declaration, &mut registry)?;
    let graph = registry
        .into_graph(&declaration, &config)
        .context("Invalid component graph")?;

    info!(
        components = graph.len(),
        edges = graph.edge_count(),
        levels = graph.levels().len(),
        "Graph built"
    );
    Ok(serde_json::to_string_pretty(&serde_json::json!({
        "declaration": declaration.identity().to_string(),
        "levels": graph.level_names(),
    }))?)
}

/// One reconciliation and the declaration status it leaves behind.
#[derive(Debug, Serialize)]
struct Pass {
    summary: ReconciliationSummary,
    status: ApplicationStatus,
}

/// Run up to `passes` reconciliations, handing each the previous requeue
/// token and status. Stops early once nothing needs requeueing.
async fn cmd_reconcile(
    declaration: &Path,
    config: Option<&Path>,
    state: Option<&Path>,
    passes: u32,
) -> Result<Vec<Pass>> {
    let config = load_config(config)?;
    let declaration = load_declaration(declaration)?;

    let cluster = Arc::new(InMemoryCluster::new());
    if let Some(state) = state {
        for object in load_objects(state)? {
            cluster.seed(object).await.context("Invalid object in state file")?;
        }
        info!(objects = cluster.len().await, "Cluster seeded");
    }

    // Nothing updates object status in memory, so only existence is checked.
    let reconciler = Reconciler::builder()
        .with_controller(Arc::new(DeclaredController))
        .with_cluster(cluster)
        .with_readiness(ReadinessRegistry::empty())
        .with_config(config)
        .build()?;

    let mut done: Vec<Pass> = Vec::new();
    for pass in 1..=passes.max(1) {
        let previous = done.last();
        let prior = previous.and_then(|p| p.summary.requeue.as_ref());
        let started = ApplicationStatus::reconcile_started(
            previous.map(|p| &p.status),
            declaration.version(),
            Utc::now(),
        );

        let summary = match reconciler.reconcile(declaration.clone(), prior).await {
            Ok(summary) => summary,
            Err(e) => {
                let status = ApplicationStatus::reconcile_failed(Some(&started), &e, Utc::now());
                warn!(
                    pass,
                    ready = ?status.ready_reason(),
                    updating = ?status.updating_reason(),
                    "Reconciliation rejected"
                );
                return Err(e).context("Reconciliation rejected");
            }
        };
        let status = ApplicationStatus::reconcile_finished(Some(&started), &summary, Utc::now());
        let finished = summary.requeue.is_none();
        info!(
            pass,
            result = ?summary.result,
            ready = ?status.ready_reason(),
            updating = ?status.updating_reason(),
            "Pass finished"
        );
        done.push(Pass { summary, status });
        if finished {
            break;
        }
    }
    Ok(done)
}
