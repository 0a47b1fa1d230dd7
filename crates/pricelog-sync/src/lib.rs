//! Import pipeline: staging, registration, reconciliation, classification
//! and the orchestrator that sequences them.

use std::sync::Arc;

use anyhow::{Context, Result};
use pricelog_storage::{connect_object_store, FeedReader, PgStore};
use tracing::info;

pub mod classifier;
pub mod config;
pub mod error;
pub mod loader;
pub mod pipeline;
pub mod reconciler;
pub mod registrar;
pub mod report;
pub mod scheduler;
pub mod staging;

pub use classifier::{all_time_min, classify, reclassify, ClassifyOutcome};
pub use config::SyncConfig;
pub use error::{ImportError, Phase, RunContext};
pub use loader::{stage_feed, StageOutcome};
pub use pipeline::{ImportPipeline, PipelineOptions, PipelineStatus, RunState};
pub use reconciler::{append_changed, ReconcileOutcome};
pub use registrar::{register_missing, RegisterOutcome};
pub use report::{report_recent_markdown, ImportReport, RunOutcome, RunRecord};
pub use scheduler::{fire_on_start, maybe_build_scheduler};

pub const CRATE_NAME: &str = "pricelog-sync";

pub async fn feed_reader_from_config(config: &SyncConfig) -> Result<FeedReader> {
    let s3 = connect_object_store(&config.object_store_config()).await;
    Ok(FeedReader::new(config.http_client_config())?.with_s3_client(s3))
}

/// Connects to Postgres, applies migrations and wires the pipeline.
pub async fn build_pipeline_from_config(config: &SyncConfig) -> Result<Arc<ImportPipeline>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to the price database")?;
    store.migrate().await.context("applying migrations")?;
    let feeds = feed_reader_from_config(config).await?;
    info!(
        batch_size = config.batch_size,
        page_size = config.page_size,
        "import pipeline ready"
    );
    Ok(Arc::new(ImportPipeline::new(
        Arc::new(store),
        feeds,
        PipelineOptions::from(config),
    )))
}
