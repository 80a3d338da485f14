use anyhow::{Context, Result};
use clap::Parser;
use registrar::cli::Cli;
use registrar::infra::{CliRuntime, builtin_factories};
use registrar::services::{Bridge, daemon};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.default_log_filter()));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting registrar");

    let (config, options) = cli.into_config()?;
    let runtime = CliRuntime::new(options.runtime_program.clone());
    let factories = builtin_factories();
    let bridge = Arc::new(Bridge::new(
        Arc::new(runtime.clone()),
        &factories,
        &options.registry_uri,
        config,
    )?);

    daemon::connect(&bridge, &options.retry)?;

    // The registry clients block, so the async runtime is built only after
    // they exist and is torn down before the bridge drops them.
    let executor = tokio::runtime::Runtime::new().context("starting async runtime")?;
    let cancel = CancellationToken::new();
    let result = executor.block_on(async {
        let events = runtime.spawn_event_feed(cancel.clone())?;
        daemon::run(Arc::clone(&bridge), events, &options, cancel.clone()).await
    });
    drop(executor);
    drop(bridge);

    result
}
