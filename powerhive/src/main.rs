//! PowerHive
//!
//! Fleet controller that continuously matches the aggregate power draw
//! of a cluster of ASIC miners to the surplus generation of a
//! co-located plant. Four periodic services (plant sampler, discovery,
//! status/telemetry samplers, power balancer) share one SQLite store
//! and run under a single supervisor next to the dashboard API.

mod config;
mod server;
mod services;
mod supervisor;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use powerhive_store::Store;
use supervisor::App;

#[derive(Parser)]
#[command(name = "powerhive")]
#[command(about = "Match miner power draw to plant surplus generation")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "powerhive.toml")]
    config: PathBuf,

    /// Enable test mode (POST expected consumption to the test server)
    #[arg(long)]
    test: bool,

    /// Test server URL (overrides the configured one)
    #[arg(long)]
    test_server_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::from_file(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    if cli.test {
        config.plant.test_mode = true;
        info!("test mode enabled");
    }
    if let Some(url) = cli.test_server_url {
        info!(url = %url, "test server URL overridden");
        config.plant.test_server_url = Some(url);
    }

    let store = Store::open(&config.database.path)
        .await
        .with_context(|| format!("open database {}", config.database.path))?;
    store.init().await.context("install database schema")?;

    info!(
        database = %config.database.path,
        http_addr = %config.http.addr,
        "powerhive starting"
    );

    App::new(config, store).run().await?;

    info!("powerhive stopped");
    Ok(())
}
