//! On-demand import triggers over HTTP.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use pricelog_storage::FeedSource;
use pricelog_sync::{ImportError, ImportPipeline, SyncConfig};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricelog-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ImportPipeline>,
    pub live_source: FeedSource,
    pub snapshot_bucket: String,
}

impl AppState {
    pub fn new(
        pipeline: Arc<ImportPipeline>,
        live_source: FeedSource,
        snapshot_bucket: impl Into<String>,
    ) -> Self {
        Self {
            pipeline,
            live_source,
            snapshot_bucket: snapshot_bucket.into(),
        }
    }

    pub fn from_config(pipeline: Arc<ImportPipeline>, config: &SyncConfig) -> Self {
        Self::new(pipeline, config.live_source(), config.snapshot_bucket.clone())
    }
}

#[derive(Debug, Serialize)]
struct Accepted {
    run_id: Uuid,
    source: FeedSource,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/import/trigger", post(trigger_handler))
        .route("/api/import/snapshots/{date}", post(snapshot_handler))
        .route("/api/import/cancel", post(cancel_handler))
        .route("/api/import/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "trigger API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    start_run(&state, state.live_source.clone()).await
}

async fn snapshot_handler(
    State(state): State<Arc<AppState>>,
    Path(date): Path<String>,
) -> Response {
    let Ok(date) = NaiveDate::parse_from_str(&date, "%Y-%m-%d") else {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("`{date}` is not a YYYY-MM-DD date"),
        );
    };
    let source = FeedSource::snapshot(state.snapshot_bucket.clone(), date);
    start_run(&state, source).await
}

async fn cancel_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.cancel().await {
        Some(run_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "run_id": run_id, "cancelling": true })),
        )
            .into_response(),
        None => api_error(StatusCode::CONFLICT, "no import run in progress".to_string()),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.pipeline.status().await).into_response()
}

async fn start_run(state: &AppState, source: FeedSource) -> Response {
    match state.pipeline.spawn(source.clone()).await {
        Ok(run_id) => (StatusCode::ACCEPTED, Json(Accepted { run_id, source })).into_response(),
        Err(err @ ImportError::AlreadyRunning) => api_error(StatusCode::CONFLICT, err.to_string()),
        Err(err) => {
            error!(error = %err, "import trigger failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn api_error(status: StatusCode, error: String) -> Response {
    (status, Json(ApiError { error })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use pricelog_storage::{FeedReader, HttpClientConfig, MemoryStore, PriceStore};
    use pricelog_sync::PipelineOptions;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        state: AppState,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let feed = dir.path().join("live.csv");
        std::fs::write(&feed, "sku,name,url,price,discount\nSP-1,Kettle,u,100000,10\n").unwrap();
        let store = Arc::new(MemoryStore::new());
        let feeds = FeedReader::new(HttpClientConfig::default()).unwrap();
        let pipeline = Arc::new(ImportPipeline::new(
            store.clone(),
            feeds,
            PipelineOptions::default(),
        ));
        let state = AppState::new(pipeline, FeedSource::file(feed), "snapshots");
        Fixture {
            _dir: dir,
            store,
            state,
        }
    }

    fn post(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    async fn finished_status(app: &Router) -> serde_json::Value {
        for _ in 0..200 {
            let resp = app
                .clone()
                .oneshot(
                    axum::http::Request::builder()
                        .uri("/api/import/status")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let status = json(resp).await;
            if status["state"] == "idle" && !status["last_run"].is_null() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("import did not finish");
    }

    #[tokio::test]
    async fn trigger_starts_a_run_and_status_reports_it() {
        let fx = fixture();
        let app = app(fx.state);
        let resp = app.clone().oneshot(post("/api/import/trigger")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let accepted = json(resp).await;
        let run_id = accepted["run_id"].as_str().unwrap().to_string();

        let status = finished_status(&app).await;
        assert_eq!(status["last_run"]["run_id"], run_id.as_str());
        assert_eq!(status["last_run"]["outcome"]["status"], "succeeded");
        assert_eq!(status["last_run"]["outcome"]["report"]["products_created"], 1);
        assert_eq!(fx.store.products().await.len(), 1);
    }

    #[tokio::test]
    async fn trigger_conflicts_while_a_run_holds_the_lease() {
        let fx = fixture();
        let _lease = fx.store.try_acquire_run_lease().await.unwrap().unwrap();
        let resp = app(fx.state).oneshot(post("/api/import/trigger")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(json(resp).await["error"].as_str().unwrap().contains("already in progress"));
    }

    #[tokio::test]
    async fn snapshot_trigger_rejects_bad_dates() {
        let fx = fixture();
        let resp = app(fx.state)
            .oneshot(post("/api/import/snapshots/2025-13-40"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn snapshot_without_object_storage_fails_in_fetch() {
        let fx = fixture();
        let app = app(fx.state);
        let resp = app
            .clone()
            .oneshot(post("/api/import/snapshots/2025-09-06"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(json(resp).await["source"]["date"], "2025-09-06");

        let status = finished_status(&app).await;
        assert_eq!(status["last_run"]["outcome"]["status"], "failed");
        assert_eq!(status["last_run"]["outcome"]["phase"], "fetch");
    }

    #[tokio::test]
    async fn cancel_without_a_run_conflicts() {
        let fx = fixture();
        let resp = app(fx.state).oneshot(post("/api/import/cancel")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
