//! Pipeline orchestrator: single-flight admission, phase sequencing,
//! cancellation and run bookkeeping.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use pricelog_feed::{ParseOptions, DEFAULT_BATCH_SIZE};
use pricelog_storage::{FeedReader, FeedSource, PriceStore, RunLease};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classifier::reclassify;
use crate::config::{SyncConfig, DEFAULT_PAGE_SIZE};
use crate::error::{ImportError, Phase, RunContext};
use crate::loader::stage_feed;
use crate::reconciler::append_changed;
use crate::registrar::register_missing;
use crate::report::{write_run_report, ImportReport, RunOutcome, RunRecord};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub batch_size: usize,
    pub page_size: usize,
    pub max_run: Option<Duration>,
    /// Where run reports go; `None` keeps them in memory only.
    pub reports_dir: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            max_run: None,
            reports_dir: None,
        }
    }
}

impl From<&SyncConfig> for PipelineOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            page_size: config.page_size,
            max_run: config.max_run(),
            reports_dir: Some(config.reports_dir.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running {
        run_id: Uuid,
        source: FeedSource,
        phase: Phase,
        started_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    #[serde(flatten)]
    pub state: RunState,
    pub last_run: Option<RunRecord>,
}

struct ActiveRun {
    run_id: Uuid,
    source: FeedSource,
    phase: Phase,
    started_at: DateTime<Utc>,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct PipelineState {
    current: Option<ActiveRun>,
    last: Option<RunRecord>,
}

/// Clears the active run if `execute` never reaches its own bookkeeping,
/// which happens when the run panics or its future is dropped.
struct ActiveRunGuard {
    state: Arc<Mutex<PipelineState>>,
    run_id: Uuid,
    source: FeedSource,
    started_at: DateTime<Utc>,
    armed: bool,
}

impl ActiveRunGuard {
    fn abandon(
        state: &mut PipelineState,
        run_id: Uuid,
        source: FeedSource,
        started_at: DateTime<Utc>,
    ) {
        if !state.current.as_ref().is_some_and(|active| active.run_id == run_id) {
            return;
        }
        let Some(active) = state.current.take() else {
            return;
        };
        error!(%run_id, phase = %active.phase, "import run abandoned before completion");
        state.last = Some(RunRecord {
            run_id,
            source,
            started_at,
            finished_at: Utc::now(),
            outcome: RunOutcome::Failed {
                phase: active.phase,
                reason: "run aborted before completion".to_string(),
            },
        });
    }
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (run_id, started_at) = (self.run_id, self.started_at);
        let source = self.source.clone();
        if let Ok(mut state) = self.state.try_lock() {
            Self::abandon(&mut state, run_id, source, started_at);
            return;
        }
        let state = Arc::clone(&self.state);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                Self::abandon(&mut *state.lock().await, run_id, source, started_at);
            });
        }
    }
}

struct Admission {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    lease: Box<dyn RunLease>,
    ctx: RunContext,
}

pub struct ImportPipeline {
    store: Arc<dyn PriceStore>,
    feeds: FeedReader,
    options: PipelineOptions,
    state: Arc<Mutex<PipelineState>>,
}

impl ImportPipeline {
    pub fn new(store: Arc<dyn PriceStore>, feeds: FeedReader, options: PipelineOptions) -> Self {
        Self {
            store,
            feeds,
            options,
            state: Arc::new(Mutex::new(PipelineState::default())),
        }
    }

    pub fn store(&self) -> &Arc<dyn PriceStore> {
        &self.store
    }

    pub async fn run(&self, source: FeedSource) -> Result<ImportReport, ImportError> {
        let admission = self.admit(&source).await?;
        self.execute(admission, source).await
    }

    pub async fn spawn(self: &Arc<Self>, source: FeedSource) -> Result<Uuid, ImportError> {
        let admission = self.admit(&source).await?;
        let run_id = admission.run_id;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            // outcome is recorded in status and the run report
            let _ = this.execute(admission, source).await;
        });
        Ok(run_id)
    }

    pub async fn cancel(&self) -> Option<Uuid> {
        let state = self.state.lock().await;
        let active = state.current.as_ref()?;
        active.cancel.send_replace(true);
        info!(run_id = %active.run_id, phase = %active.phase, "cancellation requested");
        Some(active.run_id)
    }

    pub async fn status(&self) -> PipelineStatus {
        let state = self.state.lock().await;
        let run_state = match &state.current {
            Some(active) => RunState::Running {
                run_id: active.run_id,
                source: active.source.clone(),
                phase: active.phase,
                started_at: active.started_at,
            },
            None => RunState::Idle,
        };
        PipelineStatus {
            state: run_state,
            last_run: state.last.clone(),
        }
    }

    async fn admit(&self, source: &FeedSource) -> Result<Admission, ImportError> {
        let mut state = self.state.lock().await;
        if let Some(active) = &state.current {
            warn!(active_run = %active.run_id, requested = %source, "import rejected; a run is already in progress");
            return Err(ImportError::AlreadyRunning);
        }
        let Some(lease) = self.store.try_acquire_run_lease().await? else {
            warn!(requested = %source, "import rejected; another process holds the run lease");
            return Err(ImportError::AlreadyRunning);
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let (cancel, cancel_rx) = watch::channel(false);
        let deadline = self.options.max_run.map(|max| Instant::now() + max);
        state.current = Some(ActiveRun {
            run_id,
            source: source.clone(),
            phase: Phase::Acquire,
            started_at,
            cancel,
        });

        Ok(Admission {
            run_id,
            started_at,
            lease,
            ctx: RunContext::new(cancel_rx, deadline),
        })
    }

    async fn execute(&self, admission: Admission, source: FeedSource) -> Result<ImportReport, ImportError> {
        let span = info_span!("import_run", run_id = %admission.run_id, source = %source);
        async move {
            let Admission {
                run_id,
                started_at,
                lease,
                ctx,
            } = admission;
            let mut guard = ActiveRunGuard {
                state: Arc::clone(&self.state),
                run_id,
                source: source.clone(),
                started_at,
                armed: true,
            };
            info!("import run started");

            let result = self.run_phases(run_id, &source, &ctx).await;
            if let Err(err) = lease.release().await {
                warn!(error = %err, "releasing run lease failed");
            }

            let outcome = match &result {
                Ok(report) => {
                    info!(
                        products_created = report.products_created,
                        history_appended = report.history_appended,
                        tags_changed = report.tags_changed(),
                        "import run succeeded"
                    );
                    RunOutcome::Succeeded {
                        report: report.clone(),
                    }
                }
                Err(err) => {
                    let phase = self.current_phase().await;
                    error!(%phase, error = %err, "import run failed");
                    RunOutcome::Failed {
                        phase,
                        reason: err.to_string(),
                    }
                }
            };
            let record = RunRecord {
                run_id,
                source: source.clone(),
                started_at,
                finished_at: Utc::now(),
                outcome,
            };

            if let Some(dir) = &self.options.reports_dir {
                match write_run_report(dir, &record).await {
                    Ok(path) => info!(path = %path.display(), "run report written"),
                    Err(err) => warn!(error = %err, "run report not written"),
                }
            }

            let mut state = self.state.lock().await;
            state.current = None;
            state.last = Some(record);
            guard.armed = false;
            result
        }
        .instrument(span)
        .await
    }

    async fn run_phases(
        &self,
        run_id: Uuid,
        source: &FeedSource,
        ctx: &RunContext,
    ) -> Result<ImportReport, ImportError> {
        let store = self.store.as_ref();
        let feed_date = source.feed_date(Local::now().date_naive());

        self.enter(Phase::Fetch, ctx).await?;
        let stream = self.feeds.open(source).await?;

        self.enter(Phase::Stage, ctx).await?;
        store.reset_staging().await?;
        let options = ParseOptions::new(feed_date).with_batch_size(self.options.batch_size);
        let staged = stage_feed(store, stream, run_id, options, ctx).await?;

        self.enter(Phase::Register, ctx).await?;
        let registered = register_missing(store, run_id, self.options.page_size, ctx).await?;

        self.enter(Phase::Reconcile, ctx).await?;
        let reconciled = append_changed(store, run_id, self.options.page_size, ctx).await?;

        self.enter(Phase::Classify, ctx).await?;
        let classified = reclassify(store, run_id, self.options.page_size, ctx).await?;

        self.enter(Phase::Cleanup, ctx).await?;
        store.discard_staging(run_id).await?;

        Ok(ImportReport::assemble(
            run_id,
            source.clone(),
            feed_date,
            staged,
            registered,
            reconciled,
            classified,
        ))
    }

    async fn enter(&self, phase: Phase, ctx: &RunContext) -> Result<(), ImportError> {
        if let Some(active) = self.state.lock().await.current.as_mut() {
            active.phase = phase;
        }
        ctx.checkpoint(phase)?;
        info!(%phase, "phase started");
        Ok(())
    }

    async fn current_phase(&self) -> Phase {
        self.state
            .lock()
            .await
            .current
            .as_ref()
            .map(|active| active.phase)
            .unwrap_or(Phase::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pricelog_core::{NewPriceHistory, NewProduct, PriceHistory, Product, StagingRow};
    use pricelog_storage::{HttpClientConfig, MemoryStore, PersistenceError, TagUpdate};

    fn pipeline(store: Arc<MemoryStore>) -> Arc<ImportPipeline> {
        let feeds = FeedReader::new(HttpClientConfig::default()).unwrap();
        Arc::new(ImportPipeline::new(store, feeds, PipelineOptions::default()))
    }

    #[tokio::test]
    async fn status_starts_idle() {
        let pipeline = pipeline(Arc::new(MemoryStore::new()));
        let status = pipeline.status().await;
        assert!(matches!(status.state, RunState::Idle));
        assert!(status.last_run.is_none());
        assert!(pipeline.cancel().await.is_none());
    }

    #[tokio::test]
    async fn held_lease_rejects_the_run() {
        let store = Arc::new(MemoryStore::new());
        let _held = store.try_acquire_run_lease().await.unwrap().unwrap();
        let pipeline = pipeline(store);
        let err = pipeline
            .run(FeedSource::file("/unused.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::AlreadyRunning));
    }

    #[tokio::test]
    async fn fetch_failure_is_recorded_with_its_phase() {
        let pipeline = pipeline(Arc::new(MemoryStore::new()));
        let err = pipeline
            .run(FeedSource::file("/no/such/feed.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Transport(_)));

        let status = pipeline.status().await;
        assert!(matches!(status.state, RunState::Idle));
        let last = status.last_run.expect("failed run recorded");
        assert!(matches!(
            last.outcome,
            RunOutcome::Failed { phase: Phase::Fetch, .. }
        ));
    }

    /// Delegates to a [`MemoryStore`] but panics while staging is reset.
    struct PanicOnReset {
        inner: MemoryStore,
        armed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl PriceStore for PanicOnReset {
        async fn try_acquire_run_lease(
            &self,
        ) -> Result<Option<Box<dyn RunLease>>, PersistenceError> {
            self.inner.try_acquire_run_lease().await
        }
        async fn reset_staging(&self) -> Result<(), PersistenceError> {
            if self.armed.load(std::sync::atomic::Ordering::SeqCst) {
                panic!("staging reset blew up");
            }
            self.inner.reset_staging().await
        }
        async fn insert_staging(
            &self,
            run_id: Uuid,
            rows: &[StagingRow],
        ) -> Result<u64, PersistenceError> {
            self.inner.insert_staging(run_id, rows).await
        }
        async fn staged_page(
            &self,
            run_id: Uuid,
            after_sku: Option<&str>,
            sku_limit: usize,
        ) -> Result<Vec<StagingRow>, PersistenceError> {
            self.inner.staged_page(run_id, after_sku, sku_limit).await
        }
        async fn discard_staging(&self, run_id: Uuid) -> Result<(), PersistenceError> {
            self.inner.discard_staging(run_id).await
        }
        async fn products_by_sku(&self, skus: &[String]) -> Result<Vec<Product>, PersistenceError> {
            self.inner.products_by_sku(skus).await
        }
        async fn insert_products_if_absent(
            &self,
            products: &[NewProduct],
        ) -> Result<u64, PersistenceError> {
            self.inner.insert_products_if_absent(products).await
        }
        async fn history_around(
            &self,
            product_ids: &[i64],
            on: NaiveDate,
        ) -> Result<Vec<PriceHistory>, PersistenceError> {
            self.inner.history_around(product_ids, on).await
        }
        async fn append_history(&self, rows: &[NewPriceHistory]) -> Result<u64, PersistenceError> {
            self.inner.append_history(rows).await
        }
        async fn full_history(
            &self,
            product_ids: &[i64],
        ) -> Result<Vec<PriceHistory>, PersistenceError> {
            self.inner.full_history(product_ids).await
        }
        async fn clear_tags_absent_from_staging(
            &self,
            run_id: Uuid,
        ) -> Result<u64, PersistenceError> {
            self.inner.clear_tags_absent_from_staging(run_id).await
        }
        async fn update_tags(&self, updates: &[TagUpdate]) -> Result<u64, PersistenceError> {
            self.inner.update_tags(updates).await
        }
    }

    #[tokio::test]
    async fn panicking_run_is_recorded_and_frees_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let feed = dir.path().join("feed.csv");
        std::fs::write(&feed, "sku,name,url,price,discount\nA1,Lamp,u,1000,10\n").unwrap();
        let store = Arc::new(PanicOnReset {
            inner: MemoryStore::new(),
            armed: std::sync::atomic::AtomicBool::new(true),
        });
        let feeds = FeedReader::new(HttpClientConfig::default()).unwrap();
        let pipeline = Arc::new(ImportPipeline::new(
            store.clone(),
            feeds,
            PipelineOptions::default(),
        ));

        let run_id = pipeline.spawn(FeedSource::file(&feed)).await.unwrap();
        let mut last = None;
        for _ in 0..200 {
            let status = pipeline.status().await;
            if matches!(status.state, RunState::Idle) && status.last_run.is_some() {
                last = status.last_run;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let last = last.expect("abandoned run recorded");
        assert_eq!(last.run_id, run_id);
        assert!(matches!(
            last.outcome,
            RunOutcome::Failed { phase: Phase::Stage, .. }
        ));

        store.armed.store(false, std::sync::atomic::Ordering::SeqCst);
        let report = pipeline.run(FeedSource::file(&feed)).await.unwrap();
        assert_eq!(report.products_created, 1);
    }
}
