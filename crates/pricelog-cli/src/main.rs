use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use pricelog_storage::{FeedSource, PgStore};
use pricelog_sync::{
    build_pipeline_from_config, fire_on_start, maybe_build_scheduler, report_recent_markdown,
    ImportReport, SyncConfig,
};
use pricelog_web::AppState;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "pricelog-cli")]
#[command(about = "Price history import and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import one feed (the live feed unless a source is given)
    Import(ImportArgs),
    /// Import dated snapshots from object storage, oldest first
    Backfill {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        /// Continue with the next date after a failed import
        #[arg(long)]
        keep_going: bool,
    },
    /// Run the cron-scheduled import until interrupted
    Schedule,
    /// Serve the trigger API (and the scheduler when enabled)
    Serve,
    Migrate,
    /// Print a digest of recent run reports
    Report {
        #[arg(long, default_value_t = 7)]
        runs: usize,
    },
}

#[derive(Debug, Default, Args)]
#[group(multiple = false)]
struct ImportArgs {
    #[arg(long)]
    url: Option<String>,
    /// Snapshot date (YYYY-MM-DD) in the configured bucket
    #[arg(long)]
    date: Option<NaiveDate>,
    #[arg(long)]
    file: Option<PathBuf>,
}

impl ImportArgs {
    fn source(&self, config: &SyncConfig) -> FeedSource {
        if let Some(url) = &self.url {
            FeedSource::url(url.clone())
        } else if let Some(date) = self.date {
            config.snapshot_source(date)
        } else if let Some(path) = &self.file {
            FeedSource::file(path.clone())
        } else {
            config.live_source()
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("PRICELOG_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Import(ImportArgs::default())) {
        Commands::Import(args) => {
            let pipeline = build_pipeline_from_config(&config).await?;
            let report = pipeline.run(args.source(&config)).await?;
            print_report(&report);
        }
        Commands::Backfill {
            from,
            to,
            keep_going,
        } => {
            if from > to {
                bail!("--from {from} is after --to {to}");
            }
            let pipeline = build_pipeline_from_config(&config).await?;
            let mut failed = Vec::new();
            for date in from.iter_days().take_while(|d| *d <= to) {
                match pipeline.run(config.snapshot_source(date)).await {
                    Ok(report) => print_report(&report),
                    Err(err) if keep_going => {
                        error!(%date, error = %err, "snapshot import failed; continuing");
                        failed.push(date);
                    }
                    Err(err) => {
                        return Err(err).with_context(|| format!("importing snapshot {date}"));
                    }
                }
            }
            if !failed.is_empty() {
                bail!("{} snapshot imports failed: {:?}", failed.len(), failed);
            }
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let pipeline = build_pipeline_from_config(&config).await?;
            let Some(mut sched) = maybe_build_scheduler(pipeline.clone(), &config).await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            if config.run_on_start {
                fire_on_start(&pipeline, config.live_source()).await;
            }
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let pipeline = build_pipeline_from_config(&config).await?;
            let sched = maybe_build_scheduler(pipeline.clone(), &config).await?;
            if let Some(sched) = &sched {
                sched.start().await.context("starting scheduler")?;
                if config.run_on_start {
                    fire_on_start(&pipeline, config.live_source()).await;
                }
            }
            pricelog_web::serve(AppState::from_config(pipeline, &config), config.web_port).await?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to the price database")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(&config.reports_dir, runs)?);
        }
    }

    Ok(())
}

fn print_report(report: &ImportReport) {
    println!(
        "import complete: run_id={} feed_date={} rows={} skipped={} products_created={} history_appended={} tags_changed={}",
        report.run_id,
        report.feed_date,
        report.rows_seen,
        report.rows_skipped,
        report.products_created,
        report.history_appended,
        report.tags_changed()
    );
}
