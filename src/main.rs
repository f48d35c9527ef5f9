//! bncd -- a multiplexing IRC bouncer (spec.md §6 entry point).

mod bus;
mod caps;
mod cli;
mod config;
mod dispatch;
mod error;
mod ext;
mod listener;
mod manager;
mod model;
mod server;
mod setup;
mod store;
mod tls;
mod upstream;
mod user;

use std::sync::Arc;

use clap::Parser;
use tracing::error;

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::manager::Manager;
use crate::store::redb_store::RedbStore;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).init();

    let cli = Cli::parse();

    match cli.command {
        Command::Init { conf } => setup::run(&conf).await,
        Command::Start { conf } => start(&conf).await,
    }
}

async fn start(conf: &std::path::Path) -> anyhow::Result<()> {
    let config = Config::load_and_validate(conf).map_err(|e| {
        error!(path = %conf.display(), error = %e, "failed to load config");
        e
    })?;

    let store: Arc<dyn Store> = Arc::new(RedbStore::open(&config.bouncer.storage.path).map_err(|e| {
        error!(path = %config.bouncer.storage.path, error = %e, "failed to open storage");
        e
    })?);

    let manager = Manager::new(&config, store).await.map_err(|e| {
        error!(error = %e, "failed to initialize manager");
        e
    })?;

    manager.run(&config).await
}
