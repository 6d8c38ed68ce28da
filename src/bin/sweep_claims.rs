//! `sweep_claims`: one-shot maintenance CLI that releases stale worker
//! claims (spec §4.1 "Claim staleness"), for use from a cron/systemd-timer
//! alongside the long-running `pipeline` supervisor, or to unstick a pool
//! after a worker crash without waiting for the supervisor's own sweep loop.

use anyhow::{Context, Result};
use chrono::Duration;
use clap::Parser;
use pipeline_core::config::Config;
use pipeline_core::store::StrategyStore;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sweep_claims", about = "Release stale worker claims")]
struct Cli {
    /// Path to the strategy store database. Defaults to the pipeline's configured path.
    #[arg(long)]
    database_path: Option<String>,

    /// Claim age, in seconds, beyond which a claim is considered stale.
    /// Defaults to the pipeline's configured `max_claim_age_secs`.
    #[arg(long)]
    max_age_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "pipeline_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;

    let database_path = cli.database_path.unwrap_or(config.database_path);
    let max_age = Duration::seconds(cli.max_age_secs.unwrap_or(config.max_claim_age_secs) as i64);

    let store = StrategyStore::new(&database_path).context("opening strategy store")?;
    let released = store.sweep_stale_claims(max_age).await.context("sweeping stale claims")?;

    info!(released, max_age_secs = max_age.num_seconds(), "swept stale claims");
    println!("released {released} stale claim(s)");

    Ok(())
}
