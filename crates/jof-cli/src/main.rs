use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jof_storage::PgOfferStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jof-cli")]
#[command(about = "Job offer aggregator command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle and print its report
    Sync {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply database migrations to DATABASE_URL
    Migrate,
    /// Serve the REST API, with periodic ingestion when enabled
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jof_sync=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let report = jof_sync::run_ingestion_once_from_env().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "sync complete: run_id={} source={} fetched={} skipped_empty_url={} skipped_known={} persisted={} duplicates={}",
                    report.run_id,
                    report.source_id,
                    report.fetched,
                    report.skipped_empty_url,
                    report.skipped_known,
                    report.persisted,
                    report.duplicates.len()
                );
            }
        }
        Commands::Migrate => {
            let database_url =
                std::env::var("DATABASE_URL").context("DATABASE_URL must be set to migrate")?;
            let store = PgOfferStore::connect(&database_url)
                .await
                .context("connecting to offer database")?;
            store.migrate().await.context("running offer migrations")?;
            tracing::info!("migrations applied");
        }
        Commands::Serve => jof_web::serve_from_env().await?,
    }

    Ok(())
}
