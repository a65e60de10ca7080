use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "matchday")]
#[command(about = "Televised sports fixture sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and exit.
    Sync {
        /// Keep results in memory instead of writing to DATABASE_URL.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply pending database migrations.
    Migrate,
    /// Serve the HTTP trigger and read endpoints, plus the cron job when enabled.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("matchday=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let summary = matchday_sync::run_sync_once_from_env(dry_run).await?;
            println!(
                "sync complete: run_id={} persisted={} failed_days={} lookups_failed/empty={}/{}",
                summary.run_id,
                summary.persisted,
                summary.failed_days.len(),
                summary.lookups_failed,
                summary.lookups_empty
            );
        }
        Commands::Migrate => {
            let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .connect(&database_url)
                .await
                .context("connecting to database")?;
            sqlx::migrate!("../../migrations")
                .run(&pool)
                .await
                .context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Serve => {
            let config = matchday_sync::SyncConfig::from_env()?;
            let port = config.web_port;
            let pipeline = Arc::new(matchday_sync::pipeline_from_config(config, false).await?);

            let scheduler = matchday_sync::maybe_build_scheduler(Arc::clone(&pipeline)).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %pipeline.config().sync_cron, "scheduler started");
            }

            let state =
                matchday_web::AppState::new(pipeline, std::env::var("SYNC_TRIGGER_TOKEN").ok());
            matchday_web::serve(state, port).await?;
        }
    }

    Ok(())
}
