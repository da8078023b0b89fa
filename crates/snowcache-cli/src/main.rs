//! snowcache - query execution and result cache from the command line
//!
//! Usage:
//!   # Cache a query from a local SQLite warehouse and print the first page
//!   snowcache --upstream-url sqlite://warehouse.db run "SELECT * FROM orders"
//!
//!   # Page through, filter and export the cached rows
//!   snowcache read <session> --page 2 --sort-by amount --desc
//!   snowcache export <session> --format xlsx --filename orders
//!
//!   # Housekeeping
//!   snowcache sessions
//!   snowcache cleanup --all
//!   snowcache janitor

mod cli;
mod commands;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use snowcache_engine::prelude::{EngineError, ErrorBody};
use snowcache_engine::{Engine, EngineConfig};
use snowcache_upstream::prelude::{ConnectionConfig, SqliteConnectionFactory};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing with configured log level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = EngineConfig::from_env()?;
    if let Some(path) = &cli.db_path {
        config = config.with_db_path(path);
    }

    let engine = Engine::open(
        config,
        Arc::new(SqliteConnectionFactory::new()),
        ConnectionConfig::new(cli.upstream_url.clone()),
    )?;

    let outcome = commands::dispatch(&engine, &cli.user, cli.command).await;

    if let Err(e) = engine.shutdown().await {
        tracing::warn!(error = %e, "engine shutdown failed");
    }

    match outcome {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => match e.downcast_ref::<EngineError>() {
            Some(engine_err) => {
                let body = ErrorBody::from(engine_err);
                eprintln!("{}", serde_json::to_string_pretty(&body)?);
                Ok(ExitCode::from(2))
            }
            None => Err(e),
        },
    }
}
