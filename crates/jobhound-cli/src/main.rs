use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "jobhound")]
#[command(about = "Job-lead hunting pipeline and store reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one hunt: fetch, qualify, reconcile, persist.
    Hunt {
        /// Use canned fixture responses instead of the live search API.
        #[arg(long)]
        offline: bool,
    },
    /// Print a summary of the current lead store.
    Report,
    /// Run the in-process cron scheduler until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Hunt { offline: false }) {
        Commands::Hunt { offline } => {
            let summary = if offline {
                jobhound_sync::run_hunt_once_offline_from_env().await?
            } else {
                jobhound_sync::run_hunt_once_from_env().await?
            };
            println!(
                "hunt complete: run_id={} queries={} fetched={} qualified={} added={} total={}",
                summary.run_id,
                summary.queries_run,
                summary.fetched,
                summary.qualified,
                summary.added,
                summary.total_after
            );
        }
        Commands::Report => {
            let markdown = jobhound_sync::report_store_markdown_from_env().await?;
            println!("{markdown}");
        }
        Commands::Watch => {
            jobhound_sync::run_scheduler_from_env().await?;
        }
    }

    Ok(())
}
