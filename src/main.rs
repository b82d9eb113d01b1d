//! # keel
//!
//! Command-line front end for the reconciliation engine.
//!
//! - `keel graph` prints the dependency levels of a declaration.
//! - `keel reconcile` runs reconciliation passes against an in-memory
//!   cluster and prints each pass summary as JSON.
//!
//! Logs go to stderr and honour `RUST_LOG`; rollout settings can also be
//! overridden through `KEEL_*` environment variables.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod cli;
mod commands;
mod declared;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    commands::execute_command(cli.command).await
}

/// Initialize tracing subscriber.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
