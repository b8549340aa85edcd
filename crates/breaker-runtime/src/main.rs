//! breaker-runtime: headless access to the AntiDebug Breaker store

use std::env;

use anyhow::{Context, Result};
use breaker_runtime::cli::{execute, Invocation};
use breaker_runtime::{Capabilities, Config};
use ext_storage::SqliteScriptStore;

fn main() -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(run())
}

async fn run() -> Result<()> {
    let invocation = Invocation::parse(env::args().skip(1))?;
    let config = Config::load_or_default(invocation.config.as_deref()).await?;

    ext_log::init(ext_log::LOG_ENV_VAR, config.log_level()?);
    tracing::debug!(app = %config.app.name, dev = invocation.dev_mode, "Loaded configuration");

    let capabilities =
        Capabilities::from_permissions(config.permissions.as_ref(), invocation.dev_mode)?;
    let store_path = config.storage_path();
    let store = SqliteScriptStore::open(&store_path)
        .await
        .with_context(|| format!("opening store at {}", store_path.display()))?;

    for line in execute(&invocation.command, &store, &capabilities).await? {
        println!("{line}");
    }
    Ok(())
}
