use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use facility_sync::cli::{run, Cli};
use tracing::Level;

/// Environment variable holding the maximum log level (`info` when unset or invalid).
const LOG_LEVEL_ENV: &str = "FACILITY_SYNC_LOG";

fn log_level() -> Level {
    std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|v| Level::from_str(v.trim()).ok())
        .unwrap_or(Level::INFO)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Tenant passwords are usually kept in .env
    dotenvy::dotenv().ok();

    let level = log_level();
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %level,
        "facility-sync starting"
    );

    let cli = Cli::parse();
    let result = run(cli).await;
    if let Err(e) = &result {
        tracing::error!(error = format!("{e:#}"), "facility-sync exited with error");
    }
    result
}
