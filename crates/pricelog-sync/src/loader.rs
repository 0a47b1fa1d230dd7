//! Staging loader: streams a feed through the blocking CSV parser into the
//! run's staging arena.

use std::io::{self, Read};
use std::ops::ControlFlow;

use bytes::Bytes;
use futures::StreamExt;
use pricelog_core::StagingRow;
use pricelog_feed::{parse_feed, ParseOptions, ParseSummary};
use pricelog_storage::{FeedStream, PriceStore, TransportError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ImportError, Phase, RunContext};

const CHUNK_CHANNEL_DEPTH: usize = 16;
const BATCH_CHANNEL_DEPTH: usize = 2;
const LOGGED_RECORD_ERRORS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub parse: ParseSummary,
    pub rows_staged: u64,
    pub bytes_read: u64,
    pub feed_sha256: String,
}

struct ChunkReader {
    rx: mpsc::Receiver<Result<Bytes, TransportError>>,
    current: Bytes,
    hasher: Sha256,
    bytes_read: u64,
    transport_error: Option<TransportError>,
    finished: bool,
}

struct ReaderTotals {
    bytes_read: u64,
    feed_sha256: String,
    transport_error: Option<TransportError>,
}

impl ChunkReader {
    fn new(rx: mpsc::Receiver<Result<Bytes, TransportError>>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
            hasher: Sha256::new(),
            bytes_read: 0,
            transport_error: None,
            finished: false,
        }
    }

    fn finish(self) -> ReaderTotals {
        ReaderTotals {
            bytes_read: self.bytes_read,
            feed_sha256: hex::encode(self.hasher.finalize()),
            transport_error: self.transport_error,
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.current.is_empty() {
                let n = buf.len().min(self.current.len());
                let chunk = self.current.split_to(n);
                buf[..n].copy_from_slice(&chunk);
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => {
                    self.hasher.update(&chunk);
                    self.bytes_read += chunk.len() as u64;
                    self.current = chunk;
                }
                Some(Err(err)) => {
                    self.finished = true;
                    let message = err.to_string();
                    self.transport_error = Some(err);
                    return Err(io::Error::other(message));
                }
                None => {
                    self.finished = true;
                    return Ok(0);
                }
            }
        }
    }
}

/// Parses `stream` and bulk-inserts its rows for `run_id`, one insert per batch.
pub async fn stage_feed(
    store: &dyn PriceStore,
    stream: FeedStream,
    run_id: Uuid,
    options: ParseOptions,
    ctx: &RunContext,
) -> Result<StageOutcome, ImportError> {
    let (chunk_tx, chunk_rx) = mpsc::channel::<Result<Bytes, TransportError>>(CHUNK_CHANNEL_DEPTH);
    let (batch_tx, mut batch_rx) = mpsc::channel::<Vec<StagingRow>>(BATCH_CHANNEL_DEPTH);

    let pump = tokio::spawn(async move {
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            let failed = item.is_err();
            if chunk_tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });

    let parser = tokio::task::spawn_blocking(move || {
        let mut reader = ChunkReader::new(chunk_rx);
        let result = parse_feed(&mut reader, &options, |batch| {
            match batch_tx.blocking_send(batch) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
        });
        (result, reader.finish())
    });

    let mut rows_staged = 0u64;
    let mut flush_error = None;
    while let Some(batch) = batch_rx.recv().await {
        if let Err(err) = ctx.checkpoint(Phase::Stage) {
            flush_error = Some(err);
            break;
        }
        match store.insert_staging(run_id, &batch).await {
            Ok(inserted) => rows_staged += inserted,
            Err(err) => {
                flush_error = Some(ImportError::from(err));
                break;
            }
        }
    }

    if flush_error.is_some() {
        pump.abort();
    }
    drop(batch_rx);

    let (parse_result, totals) = parser
        .await
        .map_err(|err| ImportError::Parser(err.to_string()))?;
    pump.abort();

    if let Some(err) = flush_error {
        return Err(err);
    }
    if let Some(err) = totals.transport_error {
        return Err(ImportError::Transport(err));
    }
    let parse = parse_result.map_err(ImportError::FeedFormat)?;

    for err in parse.error_sample.iter().take(LOGGED_RECORD_ERRORS) {
        warn!(line = err.line, reason = %err.reason, "feed record skipped");
    }
    info!(
        rows_seen = parse.rows_seen,
        rows_staged,
        rows_skipped = parse.rows_skipped,
        degraded_fields = parse.degraded_fields,
        bytes_read = totals.bytes_read,
        "feed staged"
    );

    Ok(StageOutcome {
        parse,
        rows_staged,
        bytes_read: totals.bytes_read,
        feed_sha256: totals.feed_sha256,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pricelog_feed::FeedParseError;
    use pricelog_storage::MemoryStore;
    use tokio::sync::watch;

    fn chunked(body: &str, chunk: usize) -> FeedStream {
        let chunks: Vec<Result<Bytes, TransportError>> = body
            .as_bytes()
            .chunks(chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::pin(futures::stream::iter(chunks))
    }

    fn options() -> ParseOptions {
        ParseOptions::new(NaiveDate::from_ymd_opt(2025, 5, 20).unwrap()).with_batch_size(2)
    }

    const FEED: &str = "sku,name,url,price,discount\nA1,Lamp,u,1000,10\nA2,Desk,u,2000,0\n,Orphan,u,5,0\nA3,Chair,u,3000,5\n";

    #[tokio::test]
    async fn stages_rows_across_chunk_boundaries() {
        let store = MemoryStore::new();
        let run = Uuid::new_v4();
        let outcome = stage_feed(&store, chunked(FEED, 7), run, options(), &RunContext::detached())
            .await
            .unwrap();

        assert_eq!(outcome.parse.rows_seen, 4);
        assert_eq!(outcome.parse.rows_skipped, 1);
        assert_eq!(outcome.rows_staged, 3);
        assert_eq!(outcome.bytes_read, FEED.len() as u64);
        assert_eq!(outcome.feed_sha256, hex::encode(Sha256::digest(FEED.as_bytes())));
        assert_eq!(store.staged_row_count().await, 3);
    }

    #[tokio::test]
    async fn identical_feeds_hash_identically() {
        let store = MemoryStore::new();
        let a = stage_feed(&store, chunked(FEED, 5), Uuid::new_v4(), options(), &RunContext::detached())
            .await
            .unwrap();
        let b = stage_feed(&store, chunked(FEED, 64), Uuid::new_v4(), options(), &RunContext::detached())
            .await
            .unwrap();
        assert_eq!(a.feed_sha256, b.feed_sha256);
        assert_eq!(a.parse, b.parse);
    }

    #[tokio::test]
    async fn transport_failure_mid_stream_wins_over_parse_error() {
        let store = MemoryStore::new();
        let items: Vec<Result<Bytes, TransportError>> = vec![
            Ok(Bytes::from_static(b"sku,name,url,price\nA1,x,u,1\n")),
            Err(TransportError::Io {
                path: "feed.csv".into(),
                source: io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
            }),
        ];
        let err = stage_feed(
            &store,
            Box::pin(futures::stream::iter(items)),
            Uuid::new_v4(),
            options(),
            &RunContext::detached(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ImportError::Transport(TransportError::Io { .. })));
    }

    #[tokio::test]
    async fn empty_feed_is_a_format_error() {
        let store = MemoryStore::new();
        let err = stage_feed(&store, chunked("", 4), Uuid::new_v4(), options(), &RunContext::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::FeedFormat(FeedParseError::MissingHeader)));
    }

    #[tokio::test]
    async fn flush_failure_stops_the_parser() {
        let store = MemoryStore::new();
        store.fail_on("insert_staging").await;
        let err = stage_feed(&store, chunked(FEED, 3), Uuid::new_v4(), options(), &RunContext::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Persistence(_)));
    }

    #[tokio::test]
    async fn cancellation_is_checked_between_flushes() {
        let store = MemoryStore::new();
        let (tx, rx) = watch::channel(true);
        let ctx = RunContext::new(rx, None);
        let err = stage_feed(&store, chunked(FEED, 3), Uuid::new_v4(), options(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Cancelled { phase: Phase::Stage }));
        assert_eq!(store.staged_row_count().await, 0);
        drop(tx);
    }
}
