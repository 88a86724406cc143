//! Sends a file between two sluice managers over a loopback network.
//!
//! Usage: `sluice-loopback <file> [config.json] [output]`

mod app;
mod config;

use std::path::PathBuf;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sluice=debug")),
        )
        .init();

    let mut args = std::env::args_os().skip(1);
    let input = PathBuf::from(args.next().context("missing input file")?);
    let config_path = args.next().map(PathBuf::from);
    let output = args.next().map(PathBuf::from);

    let config = config::LoopbackConfig::load(config_path.as_deref())?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        payload_len = config.payload_len,
        loss_rate = config.loss_rate,
        "starting loopback transfer"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, input, output))?;
    Ok(())
}
