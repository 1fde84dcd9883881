use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fedspend-cli")]
#[command(about = "Federal spending collector command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one collection cycle and print a per-entity summary
    Sync {
        /// Reconcile into an in-memory store instead of Postgres
        #[arg(long)]
        memory: bool,
    },
    /// Apply migrations, then collect on a fixed interval until Ctrl-C
    Run,
    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { memory: false }) {
        Commands::Sync { memory } => {
            let report = fedspend_sync::run_sync_once_from_env(memory).await?;
            println!(
                "sync complete: run_id={} records={} failed={} contractors_enriched={}",
                report.run_id,
                report.total_count(),
                report.failed_kinds().len(),
                report.contractors_enriched
            );
            for (kind, outcome) in &report.outcomes {
                println!(
                    "  {kind}: pages={} inserted={} updated={} rejected={} failed={}{}",
                    outcome.pages,
                    outcome.inserted,
                    outcome.updated,
                    outcome.rejected,
                    outcome.failed,
                    outcome
                        .error()
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Run => {
            fedspend_sync::run_scheduler_from_env(async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %err, "listening for ctrl-c failed");
                    std::future::pending::<()>().await;
                }
            })
            .await?;
        }
        Commands::Migrate => {
            fedspend_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
