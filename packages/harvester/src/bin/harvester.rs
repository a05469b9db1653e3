//! Harvester
//!
//! Runs one crawl over every configured channel with every configured account,
//! delivering records to the ingestion sink, then prints a run summary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use harvester::{Driver, FileStateStore, GatewayConnector, HarvesterConfig, LedgerRequeue};
use ingest_client::IngestClient;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit status for a run stopped by the operator (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "harvester")]
#[command(about = "Crawl channel history with a pool of accounts and deliver it to the ingest API")]
struct Cli {
    /// Account list (overrides HARVESTER_ACCOUNTS_FILE)
    #[arg(long)]
    accounts: Option<PathBuf>,

    /// Channel list (overrides HARVESTER_CHANNELS_FILE)
    #[arg(long)]
    channels: Option<PathBuf>,

    /// Directory for cursors, suspensions and the failure ledger
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Which failure-ledger entries to retry: none, retryable or all
    #[arg(long)]
    ledger_requeue: Option<LedgerRequeue>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,harvester=debug,ingest_client=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let cli = Cli::parse();

    let mut config = HarvesterConfig::from_env().context("Failed to load configuration")?;
    if let Some(path) = cli.accounts {
        config = config.with_accounts_file(path);
    }
    if let Some(path) = cli.channels {
        config = config.with_channels_file(path);
    }
    if let Some(dir) = cli.state_dir {
        config = config.with_state_dir(dir);
    }
    if let Some(policy) = cli.ledger_requeue {
        config = config.with_ledger_requeue(policy);
    }

    let accounts = config.load_accounts().context("Failed to load accounts")?;
    let channels = config.load_channels().context("Failed to load channels")?;
    let gateway_url = config
        .gateway_url
        .clone()
        .context("SOURCE_GATEWAY_URL must be set")?;

    tracing::info!(
        accounts = accounts.len(),
        channels = channels.len(),
        state_dir = %config.state_dir.display(),
        "Starting harvester"
    );

    let connector = GatewayConnector::new(&gateway_url, config.request_timeout)
        .context("Failed to configure source gateway")?;
    let store = FileStateStore::new(config.state_dir.clone());
    let cancel = CancellationToken::new();
    let delivery = config.delivery_policy();
    let ingest = IngestClient::with_policy(config.ingest_url.clone(), config.ingest_token, delivery)
        .context("Failed to configure ingest client")?
        .with_cancel_token(cancel.clone());

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing current pages");
            ctrl_c.cancel();
        }
    });

    let driver = Driver::new(Arc::new(connector), Arc::new(ingest), Arc::new(store))
        .with_fetch(config.fetch)
        .with_retry(config.retry)
        .with_suspension(config.suspension)
        .with_ledger_requeue(config.ledger_requeue)
        .with_cancel_token(cancel);

    let summary = driver
        .run(accounts, channels)
        .await
        .context("Harvest run failed to start")?;

    println!("{summary}");

    if summary.interrupted {
        Ok(ExitCode::from(EXIT_INTERRUPTED))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
