use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobwatch_core::SubscriberId;
use jobwatch_sync::{build_pipeline, migrate_from_env, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(about = "Job listing watch: scrape, deduplicate and deliver vacancies to subscribers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one cycle for every subscriber.
    SweepAll,
    /// Run one cycle for a single subscriber.
    Cycle { subscriber_id: i64 },
    /// Delete listings older than the retention horizon.
    Retention {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Print the stored listings of a subscriber.
    Listings { subscriber_id: i64 },
    /// Forget every listing of a subscriber.
    Clear { subscriber_id: i64 },
    /// Apply database migrations.
    Migrate,
    /// Start the recurring scheduler and wait for ctrl-c.
    Run,
    /// Serve the HTTP API; also starts the scheduler when JOBWATCH_SCHEDULER_ENABLED is set.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobwatch_sync=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::SweepAll) {
        Commands::SweepAll => {
            let pipeline = build_pipeline(config).await?;
            let summary = pipeline.trigger_sweep_all().await?;
            println!(
                "sweep complete: subscribers={} delivered={} no_new_listings={} skipped_too_broad={} failed={}",
                summary.subscribers,
                summary.delivered,
                summary.no_new_listings,
                summary.skipped_too_broad,
                summary.failed
            );
        }
        Commands::Cycle { subscriber_id } => {
            let pipeline = build_pipeline(config).await?;
            let outcome = pipeline.trigger_cycle(SubscriberId(subscriber_id)).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if let Some(message) = outcome.subscriber_message() {
                println!("{message}");
            }
            if outcome.is_failure() {
                std::process::exit(1);
            }
        }
        Commands::Retention { days } => {
            if let Some(days) = days {
                config.retention_days = days;
            }
            let pipeline = build_pipeline(config).await?;
            let summary = pipeline.run_retention().await?;
            println!(
                "retention complete: deleted={} cutoff={}",
                summary.deleted, summary.cutoff
            );
        }
        Commands::Listings { subscriber_id } => {
            let pipeline = build_pipeline(config).await?;
            let listings = pipeline.listings(SubscriberId(subscriber_id)).await?;
            println!("{}", serde_json::to_string_pretty(&listings)?);
        }
        Commands::Clear { subscriber_id } => {
            let pipeline = build_pipeline(config).await?;
            let deleted = pipeline.clear_subscriber(SubscriberId(subscriber_id)).await?;
            println!("cleared subscriber {subscriber_id}: deleted={deleted}");
        }
        Commands::Migrate => {
            migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Run => {
            let pipeline = build_pipeline(config).await?;
            let mut sched = pipeline.build_scheduler().await?;
            sched.start().await.context("starting scheduler")?;
            tracing::info!("scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let scheduler_enabled = config.scheduler_enabled;
            let pipeline = build_pipeline(config).await?;
            let _sched = if scheduler_enabled {
                let sched = pipeline.build_scheduler().await?;
                sched.start().await.context("starting scheduler")?;
                tracing::info!("scheduler started");
                Some(sched)
            } else {
                None
            };
            jobwatch_web::serve_from_env(pipeline).await?;
        }
    }

    Ok(())
}
