//! Feed byte streams from HTTP, object storage or the local filesystem.

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use aws_sdk_s3::error::DisplayErrorContext;
use bytes::{Bytes, BytesMut};
use chrono::NaiveDate;
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{info, info_span, Instrument};

const FILE_CHUNK_SIZE: usize = 64 * 1024;

pub type FeedStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedSource {
    Url { url: String },
    Snapshot { bucket: String, date: NaiveDate },
    File { path: PathBuf },
}

impl FeedSource {
    pub fn url(url: impl Into<String>) -> Self {
        FeedSource::Url { url: url.into() }
    }

    pub fn snapshot(bucket: impl Into<String>, date: NaiveDate) -> Self {
        FeedSource::Snapshot {
            bucket: bucket.into(),
            date,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        FeedSource::File { path: path.into() }
    }

    /// Object key of the dated snapshot, e.g. `2026-03-01.csv`.
    pub fn snapshot_key(date: NaiveDate) -> String {
        format!("{}.csv", date.format("%Y-%m-%d"))
    }

    /// Date recorded on history rows: the snapshot's own date, otherwise `today`.
    pub fn feed_date(&self, today: NaiveDate) -> NaiveDate {
        match self {
            FeedSource::Snapshot { date, .. } => *date,
            FeedSource::Url { .. } | FeedSource::File { .. } => today,
        }
    }
}

impl fmt::Display for FeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedSource::Url { url } => write!(f, "{url}"),
            FeedSource::Snapshot { bucket, date } => {
                write!(f, "s3://{bucket}/{}", Self::snapshot_key(*date))
            }
            FeedSource::File { path } => write!(f, "file://{}", path.display()),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("reading response body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("object s3://{bucket}/{key} not found")]
    ObjectNotFound { bucket: String, key: String },
    #[error("object storage request for s3://{bucket}/{key} failed: {message}")]
    ObjectStorage {
        bucket: String,
        key: String,
        message: String,
    },
    #[error("snapshot imports need an object storage client")]
    ObjectStorageNotConfigured,
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Request { source, .. } | TransportError::Body { source, .. } => {
                source.is_timeout()
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    /// Upper bound for the whole transfer, body included.
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            timeout: Duration::from_secs(600),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ObjectStoreConfig {
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services.
    pub endpoint: Option<String>,
}

pub async fn connect_object_store(config: &ObjectStoreConfig) -> aws_sdk_s3::Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &config.region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    let shared = loader.load().await;

    match &config.endpoint {
        Some(endpoint) => {
            let s3_config = aws_sdk_s3::config::Builder::from(&shared)
                .endpoint_url(endpoint)
                .force_path_style(true)
                .build();
            aws_sdk_s3::Client::from_conf(s3_config)
        }
        None => aws_sdk_s3::Client::new(&shared),
    }
}

/// Opens feed sources as chunked byte streams. No retries happen here.
#[derive(Debug, Clone)]
pub struct FeedReader {
    client: reqwest::Client,
    s3: Option<aws_sdk_s3::Client>,
}

impl FeedReader {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, s3: None })
    }

    pub fn with_s3_client(mut self, client: aws_sdk_s3::Client) -> Self {
        self.s3 = Some(client);
        self
    }

    pub async fn open(&self, source: &FeedSource) -> Result<FeedStream, TransportError> {
        match source {
            FeedSource::Url { url } => {
                self.open_url(url)
                    .instrument(info_span!("feed_fetch", url = %url))
                    .await
            }
            FeedSource::Snapshot { bucket, date } => {
                let key = FeedSource::snapshot_key(*date);
                self.open_snapshot(bucket, &key)
                    .instrument(info_span!("feed_fetch", bucket = %bucket, key = %key))
                    .await
            }
            FeedSource::File { path } => open_file(path.clone()).await,
        }
    }

    async fn open_url(&self, url: &str) -> Result<FeedStream, TransportError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        info!(status = status.as_u16(), content_length = ?resp.content_length(), "feed response received");
        let stream = resp
            .bytes_stream()
            .map_err(move |source| TransportError::Body {
                url: final_url.clone(),
                source,
            });
        Ok(Box::pin(stream))
    }

    async fn open_snapshot(&self, bucket: &str, key: &str) -> Result<FeedStream, TransportError> {
        let client = self
            .s3
            .as_ref()
            .ok_or(TransportError::ObjectStorageNotConfigured)?;

        let output = client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(service_err) if service_err.is_no_such_key() => TransportError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                },
                _ => TransportError::ObjectStorage {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    message: DisplayErrorContext(&err).to_string(),
                },
            })?;

        info!(content_length = ?output.content_length(), "snapshot object opened");
        let (bucket, key) = (bucket.to_string(), key.to_string());
        let stream = futures::stream::try_unfold(output.body, move |mut body| {
            let (bucket, key) = (bucket.clone(), key.clone());
            async move {
                match body.try_next().await {
                    Ok(Some(chunk)) => Ok(Some((chunk, body))),
                    Ok(None) => Ok(None),
                    Err(err) => Err(TransportError::ObjectStorage {
                        bucket,
                        key,
                        message: err.to_string(),
                    }),
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

async fn open_file(path: PathBuf) -> Result<FeedStream, TransportError> {
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|source| TransportError::Io {
            path: path.clone(),
            source,
        })?;

    let stream = futures::stream::try_unfold(file, move |mut file| {
        let path = path.clone();
        async move {
            let mut buf = BytesMut::with_capacity(FILE_CHUNK_SIZE);
            let read = file
                .read_buf(&mut buf)
                .await
                .map_err(|source| TransportError::Io { path, source })?;
            if read == 0 {
                Ok(None)
            } else {
                Ok(Some((buf.freeze(), file)))
            }
        }
    });
    Ok(Box::pin(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn snapshot_keys_use_iso_dates() {
        let date = NaiveDate::from_ymd_opt(2025, 9, 6).unwrap();
        assert_eq!(FeedSource::snapshot_key(date), "2025-09-06.csv");
        assert_eq!(
            FeedSource::snapshot("prices", date).to_string(),
            "s3://prices/2025-09-06.csv"
        );
    }

    #[test]
    fn feed_date_comes_from_snapshot_or_today() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        let snapshot_day = NaiveDate::from_ymd_opt(2025, 12, 24).unwrap();
        assert_eq!(
            FeedSource::snapshot("b", snapshot_day).feed_date(today),
            snapshot_day
        );
        assert_eq!(FeedSource::url("http://feed").feed_date(today), today);
    }

    #[tokio::test]
    async fn file_sources_stream_their_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feed.csv");
        let body = "sku,name,url,price\n".repeat(10_000);
        std::fs::write(&path, &body).expect("write feed");

        let reader = FeedReader::new(HttpClientConfig::default()).expect("reader");
        let mut stream = reader.open(&FeedSource::file(&path)).await.expect("open");
        let mut collected = Vec::new();
        let mut chunks = 0;
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.expect("chunk"));
            chunks += 1;
        }
        assert_eq!(collected, body.as_bytes());
        assert!(chunks > 1);
    }

    #[tokio::test]
    async fn missing_file_is_a_transport_error() {
        let reader = FeedReader::new(HttpClientConfig::default()).expect("reader");
        let err = reader
            .open(&FeedSource::file("/definitely/not/here.csv"))
            .await
            .err()
            .expect("missing file should fail");
        assert!(matches!(err, TransportError::Io { .. }));
    }

    #[tokio::test]
    async fn snapshots_without_object_storage_fail_fast() {
        let reader = FeedReader::new(HttpClientConfig::default()).expect("reader");
        let date = NaiveDate::from_ymd_opt(2025, 9, 6).unwrap();
        let err = reader
            .open(&FeedSource::snapshot("prices", date))
            .await
            .err()
            .expect("no s3 client");
        assert!(matches!(err, TransportError::ObjectStorageNotConfigured));
    }

    async fn serve_feeds() -> String {
        use axum::{http::StatusCode, routing::get, Router};

        let app = Router::new()
            .route("/feed.csv", get(|| async { "sku,name,url,price\nA1,Lamp,u,100\n" }))
            .route("/missing.csv", get(|| async { (StatusCode::NOT_FOUND, "gone") }))
            .route("/broken.csv", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .route(
                "/slow.csv",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn url_sources_stream_the_response_body() {
        let base = serve_feeds().await;
        let reader = FeedReader::new(HttpClientConfig::default()).expect("reader");
        let mut stream = reader
            .open(&FeedSource::url(format!("{base}/feed.csv")))
            .await
            .expect("open");
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.expect("chunk"));
        }
        assert_eq!(collected, b"sku,name,url,price\nA1,Lamp,u,100\n");
    }

    #[tokio::test]
    async fn non_success_statuses_are_transport_errors() {
        let base = serve_feeds().await;
        let reader = FeedReader::new(HttpClientConfig::default()).expect("reader");
        for (path, expected) in [("missing.csv", 404), ("broken.csv", 500)] {
            let url = format!("{base}/{path}");
            let err = reader
                .open(&FeedSource::url(url.clone()))
                .await
                .err()
                .expect("status should fail");
            match err {
                TransportError::HttpStatus { status, url: got } => {
                    assert_eq!(status, expected);
                    assert_eq!(got, url);
                }
                other => panic!("expected http status error, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn slow_responses_time_out() {
        let base = serve_feeds().await;
        let reader = FeedReader::new(HttpClientConfig {
            timeout: Duration::from_millis(200),
            ..HttpClientConfig::default()
        })
        .expect("reader");
        let err = reader
            .open(&FeedSource::url(format!("{base}/slow.csv")))
            .await
            .err()
            .expect("should time out");
        assert!(err.is_timeout(), "unexpected error: {err}");
    }
}
