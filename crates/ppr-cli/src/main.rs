use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ppr_core::Keyed;
use ppr_storage::StateFile;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ppr-cli")]
#[command(about = "Partner payout reconciler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every category, reconcile, and write the state file once.
    Sync,
    /// Print record counts and newest dates from the state file.
    Inspect {
        /// Overrides PPR_STATE_PATH.
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => match ppr_sync::run_sync_once_from_env().await {
            Ok(summary) => {
                println!(
                    "sync complete: run_id={} auth_expired={} state={} ({} bytes)",
                    summary.run_id, summary.auth_expired, summary.state_path, summary.state_bytes
                );
                for category in &summary.categories {
                    println!(
                        "  {:<22} status={:?} resolution={:?} incoming={} resulting={}",
                        category.category.as_str(),
                        category.status,
                        category.resolution,
                        category.incoming,
                        category.resulting
                    );
                }
            }
            // The scheduler must not see a failed job; the state file was left untouched.
            Err(err) => error!(error = %format!("{err:#}"), "sync run aborted"),
        },
        Commands::Inspect { state } => {
            let path = state.unwrap_or_else(|| ppr_sync::ReconcileConfig::from_env().state_path);
            let loaded = StateFile::new(&path).load().await?;
            if !loaded.existed {
                println!("{}: no state file yet", path.display());
                return Ok(());
            }
            let state = loaded.state;
            println!("{}", path.display());
            println!(
                "  distribution_payouts: {} (newest {})",
                state.distribution_payouts.len(),
                newest(&state.distribution_payouts)
            );
            println!(
                "  payouts:              {} (newest {})",
                state.payouts.len(),
                newest(&state.payouts)
            );
            match state.analytics.last_updated {
                Some(day) => println!(
                    "  analytics:            updated {} gmv={} commission={} orders={} refunds={}",
                    day,
                    state.analytics.affiliate_gmv,
                    state.analytics.est_commission,
                    state.analytics.orders,
                    state.analytics.gmv_refund
                ),
                None => println!("  analytics:            never fetched (last_updated is null)"),
            }
        }
    }

    Ok(())
}

fn newest<T: Keyed>(records: &[T]) -> String {
    records
        .iter()
        .map(Keyed::date)
        .max()
        .map(|d| d.to_string())
        .unwrap_or_else(|| "-".to_string())
}
