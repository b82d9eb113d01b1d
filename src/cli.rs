//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// keel - phased, dependency-ordered reconciliation
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version)]
#[command(about = "Roll out a declaration's components in dependency order")]
#[command(
    long_about = "keel builds the component dependency graph of a declaration, deploys each level on a bounded worker pool, then verifies readiness. Reconciliations run against an in-memory cluster."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the dependency levels of a declaration
    Graph {
        /// Declaration file (YAML or JSON) listing spec.components
        #[arg(short, long)]
        declaration: PathBuf,

        /// Rollout configuration file (TOML or JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Reconcile a declaration against an in-memory cluster
    Reconcile {
        /// Declaration file (YAML or JSON) listing spec.components
        #[arg(short, long)]
        declaration: PathBuf,

        /// Rollout configuration file (TOML or JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// YAML list of objects already present in the cluster
        #[arg(short, long)]
        state: Option<PathBuf>,

        /// Number of passes; each pass receives the previous requeue token
        #[arg(short, long, default_value_t = 1)]
        passes: u32,
    },
}
