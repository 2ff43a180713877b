use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::warn;
use podmeta::{PodMetaEngine, settings::Settings, telemetry};

#[derive(Debug, Parser)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// YAML settings file; PODMETA_* variables override it
    #[clap(short, long, env = "PODMETA_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "debug" } else { "info" }),
    )
    .init();

    let settings =
        Settings::new(opt.config.as_deref()).context("Failed to load configuration")?;

    if let Err(e) = telemetry::init_metrics() {
        warn!("Failed to initialize metrics: {}", e);
    }

    let engine = PodMetaEngine::new(settings).await?;
    let result = engine.run().await;

    telemetry::shutdown_metrics();
    result
}
