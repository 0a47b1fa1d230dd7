use std::sync::Arc;

use anyhow::{Context, Result};
use pricelog_storage::FeedSource;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::error::ImportError;
use crate::pipeline::ImportPipeline;

/// Builds the daily import job, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    pipeline: Arc<ImportPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let source = config.live_source();
    let cron = config.import_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let source = source.clone();
        Box::pin(async move {
            run_scheduled(&pipeline, source).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(%cron, "import job scheduled");
    Ok(Some(sched))
}

async fn run_scheduled(pipeline: &ImportPipeline, source: FeedSource) {
    match pipeline.run(source).await {
        Ok(report) => info!(
            run_id = %report.run_id,
            history_appended = report.history_appended,
            "scheduled import finished"
        ),
        Err(ImportError::AlreadyRunning) => {
            warn!("scheduled import skipped; a run is already in progress")
        }
        Err(err) => error!(error = %err, "scheduled import failed"),
    }
}

/// Fires one background import immediately, for `run_on_start` catch-up.
pub async fn fire_on_start(pipeline: &Arc<ImportPipeline>, source: FeedSource) {
    match pipeline.spawn(source).await {
        Ok(run_id) => info!(%run_id, "start-up import launched"),
        Err(err) => warn!(error = %err, "start-up import not launched"),
    }
}
