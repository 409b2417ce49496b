use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;

use crate::dispatch::{control_queue_name, LineQueue};
use crate::fetch::FetchRequest;
use crate::load_config::load_config;
use crate::service::SyncService;

/// CLI for facility-sync: authenticated, paginated facility-management data sync.
///
/// `run` consumes control envelopes (one JSON object per line on stdin) until
/// `stop` or end of input. `fetch` prints one operation's records as JSON.
#[derive(Parser)]
#[clap(
    name = "facility-sync",
    version,
    about = "Multi-tenant facility-management sync with a control-queue dispatcher"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the service, reading control envelopes from stdin
    Run {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
    /// Fetch one operation for one tenant and print the records as JSON
    Fetch {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Tenant domain, as configured
        #[clap(long)]
        domain: String,
        /// Operation name (query template file stem)
        #[clap(long)]
        operation: String,
        /// Records per page, 1 to 500; defaults to fetch.page_size
        #[clap(long)]
        page_size: Option<u32>,
        /// The operation returns a single object, not a paginated list
        #[clap(long)]
        single: bool,
        /// Template substitution TAG=VALUE, repeatable
        #[clap(long = "sub", value_parser = parse_substitution)]
        substitutions: Vec<(String, String)>,
    },
}

fn parse_substitution(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((tag, value)) if !tag.is_empty() => Ok((tag.to_string(), value.to_string())),
        _ => Err(format!("expected TAG=VALUE, got '{raw}'")),
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Top-level marker event, asserted on by the CLI tests.
    tracing::info!("trace_initialised");

    let result = match cli.command {
        Commands::Run { config } => run_service(config).await,
        Commands::Fetch {
            config,
            domain,
            operation,
            page_size,
            single,
            substitutions,
        } => fetch_once(config, &domain, operation, page_size, single, substitutions).await,
    };

    let exit_span = tracing::info_span!("exit");
    exit_span.in_scope(|| {
        tracing::info!(success = result.is_ok(), "exit");
    });

    result
}

async fn run_service(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let service = Arc::new(
        SyncService::from_config(&config)
            .await
            .context("Failed to start service")?,
    );

    let logged_in = service.login_all().await;
    if logged_in < service.tenants().len() {
        tracing::warn!(
            logged_in,
            tenants = service.tenants().len(),
            "Not every tenant could log in, continuing"
        );
    }

    let mut queue = LineQueue::new(
        control_queue_name(&config.service.store, &config.service.name),
        BufReader::new(tokio::io::stdin()),
    );
    let processed = service.run(&mut queue).await;
    let logged_out = service.shutdown().await;

    let processed = processed?;
    println!("Processed {processed} control messages, logged out {logged_out} sessions.");
    Ok(())
}

async fn fetch_once(
    config_path: PathBuf,
    domain: &str,
    operation: String,
    page_size: Option<u32>,
    single: bool,
    substitutions: Vec<(String, String)>,
) -> Result<()> {
    let config = load_config(&config_path)?;
    let service = SyncService::from_config(&config)
        .await
        .context("Failed to start service")?;

    let mut request = FetchRequest::new(operation, page_size.unwrap_or(config.fetch.page_size))?;
    for (tag, value) in substitutions {
        request = request.with_substitution(tag, value);
    }
    if single {
        request = request.single();
    }

    let fetched = service.fetch(domain, &request).await;
    service.shutdown().await;

    let output = fetched.with_context(|| format!("Fetch of {} for {domain} failed", request.operation()))?;
    tracing::info!(records = output.len(), "Fetch succeeded");
    println!("{}", serde_json::to_string_pretty(&output.into_value())?);
    Ok(())
}
