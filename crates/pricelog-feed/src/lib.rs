//! Tolerant row parsing for tabular product/price feeds.

use std::io::Read;
use std::ops::ControlFlow;
use std::str::FromStr;

use chrono::NaiveDate;
use pricelog_core::{normalize_discount, StagingRow};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "pricelog-feed";

pub const MIN_COLUMNS: usize = 4;

pub const DEFAULT_BATCH_SIZE: usize = 5_000;

/// Feed columns in positional-fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Sku,
    Name,
    Url,
    Price,
    Discount,
    Image,
    Desc,
    Category,
}

impl Column {
    pub const ALL: [Column; 8] = [
        Column::Sku,
        Column::Name,
        Column::Url,
        Column::Price,
        Column::Discount,
        Column::Image,
        Column::Desc,
        Column::Category,
    ];

    pub fn header_name(self) -> &'static str {
        match self {
            Column::Sku => "sku",
            Column::Name => "name",
            Column::Url => "url",
            Column::Price => "price",
            Column::Discount => "discount",
            Column::Image => "image",
            Column::Desc => "desc",
            Column::Category => "category",
        }
    }

    pub fn fallback_index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    mapped: [Option<usize>; 8],
}

impl ColumnMap {
    pub fn from_headers<'a>(headers: impl IntoIterator<Item = &'a str>) -> Result<Self, FeedParseError> {
        let names = headers
            .into_iter()
            .enumerate()
            .map(|(i, h)| {
                let h = if i == 0 { h.trim_start_matches('\u{feff}') } else { h };
                h.trim().to_ascii_lowercase()
            })
            .collect::<Vec<_>>();

        if names.iter().all(|n| n.is_empty()) {
            return Err(FeedParseError::MissingHeader);
        }
        if names.len() < MIN_COLUMNS {
            return Err(FeedParseError::TooFewColumns { found: names.len() });
        }

        let mut mapped = [None; 8];
        for column in Column::ALL {
            mapped[column as usize] = names.iter().position(|n| n == column.header_name());
        }
        Ok(Self { mapped })
    }

    pub fn is_mapped(&self, column: Column) -> bool {
        self.mapped[column as usize].is_some()
    }

    pub fn index_of(&self, column: Column) -> usize {
        self.mapped[column as usize].unwrap_or(column.fallback_index())
    }

    fn get<'r>(&self, fields: &'r [String], column: Column) -> Option<&'r str> {
        fields.get(self.index_of(column)).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RecordErrorReason {
    #[error("missing sku")]
    MissingSku,
    #[error("unreadable record: {0}")]
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("line {line}: {reason}")]
pub struct RecordError {
    pub line: u64,
    pub reason: RecordErrorReason,
}

#[derive(Debug, Error)]
pub enum FeedParseError {
    #[error("feed has no header row")]
    MissingHeader,
    #[error("feed header has {found} columns; at least {MIN_COLUMNS} are required")]
    TooFewColumns { found: usize },
    #[error("reading feed: {0}")]
    Read(#[source] csv::Error),
    #[error("row consumer stopped before the feed was exhausted")]
    Aborted,
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub batch_size: usize,
    pub feed_date: NaiveDate,
    pub error_sample_limit: usize,
}

impl ParseOptions {
    pub fn new(feed_date: NaiveDate) -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            feed_date,
            error_sample_limit: 20,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseSummary {
    pub rows_seen: u64,
    pub rows_parsed: u64,
    pub rows_skipped: u64,
    /// Price or discount values that were present but unusable and fell back to zero.
    pub degraded_fields: u64,
    pub batches: u64,
    pub error_sample: Vec<RecordError>,
}

impl ParseSummary {
    fn record_error(&mut self, err: RecordError, limit: usize) {
        self.rows_skipped += 1;
        debug!(line = err.line, reason = %err.reason, "skipping feed record");
        if self.error_sample.len() < limit {
            self.error_sample.push(err);
        }
    }
}

/// Parse a feed, handing full batches of rows to `sink` as they fill up.
///
/// `sink` may return [`ControlFlow::Break`] to stop early, which surfaces as
/// [`FeedParseError::Aborted`].
pub fn parse_feed<R, F>(
    reader: R,
    options: &ParseOptions,
    mut sink: F,
) -> Result<ParseSummary, FeedParseError>
where
    R: Read,
    F: FnMut(Vec<StagingRow>) -> ControlFlow<()>,
{
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = csv_reader.byte_headers().map_err(FeedParseError::Read)?.clone();
    let header_text = decode_fields(&headers);
    let columns = ColumnMap::from_headers(header_text.iter().map(String::as_str))?;

    let batch_size = options.batch_size.max(1);
    let mut summary = ParseSummary::default();
    let mut batch = Vec::with_capacity(batch_size);
    let mut record = csv::ByteRecord::new();

    loop {
        let line = csv_reader.position().line();
        match csv_reader.read_byte_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {}
            Err(err) if is_fatal(&err) => return Err(FeedParseError::Read(err)),
            Err(err) => {
                summary.rows_seen += 1;
                summary.record_error(
                    RecordError {
                        line,
                        reason: RecordErrorReason::Unreadable(err.to_string()),
                    },
                    options.error_sample_limit,
                );
                continue;
            }
        }

        summary.rows_seen += 1;
        let line = record.position().map(|p| p.line()).unwrap_or(line);
        let fields = decode_fields(&record);
        match parse_row(&columns, &fields, summary.rows_seen, options.feed_date) {
            Ok((row, degraded)) => {
                summary.rows_parsed += 1;
                summary.degraded_fields += degraded;
                batch.push(row);
            }
            Err(reason) => {
                summary.record_error(RecordError { line, reason }, options.error_sample_limit);
                continue;
            }
        }

        if batch.len() >= batch_size {
            summary.batches += 1;
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if sink(full).is_break() {
                return Err(FeedParseError::Aborted);
            }
        }
    }

    if !batch.is_empty() {
        summary.batches += 1;
        if sink(batch).is_break() {
            return Err(FeedParseError::Aborted);
        }
    }

    Ok(summary)
}

fn is_fatal(err: &csv::Error) -> bool {
    matches!(err.kind(), csv::ErrorKind::Io(_))
}

fn decode_fields(record: &csv::ByteRecord) -> Vec<String> {
    record
        .iter()
        .map(|field| String::from_utf8_lossy(field).into_owned())
        .collect()
}

pub fn parse_row(
    columns: &ColumnMap,
    fields: &[String],
    line_no: u64,
    feed_date: NaiveDate,
) -> Result<(StagingRow, u64), RecordErrorReason> {
    let sku = columns
        .get(fields, Column::Sku)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(RecordErrorReason::MissingSku)?;

    let text = |column: Column| {
        columns
            .get(fields, column)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };

    let mut degraded = 0;
    let raw_price = text(Column::Price);
    let price = match parse_price(&raw_price) {
        Some(price) => price,
        None => {
            if !raw_price.is_empty() {
                degraded += 1;
            }
            0
        }
    };
    let raw_discount = text(Column::Discount);
    let discount = match parse_discount(&raw_discount) {
        Some(discount) => discount,
        None => {
            if !raw_discount.is_empty() {
                degraded += 1;
            }
            Decimal::ZERO
        }
    };

    Ok((
        StagingRow {
            line_no,
            sku: sku.to_string(),
            name: text(Column::Name),
            url: text(Column::Url),
            image: text(Column::Image),
            description: text(Column::Desc),
            price,
            discount,
            category: text(Column::Category),
            feed_date,
        },
        degraded,
    ))
}

/// Whole, non-negative prices; `"199000.00"` is accepted, `"12.5"` is not.
pub fn parse_price(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(price) = raw.parse::<i64>() {
        return (price >= 0).then_some(price);
    }
    let value = Decimal::from_str(raw).ok()?;
    if !value.fract().is_zero() || value.is_sign_negative() {
        return None;
    }
    value.to_i64()
}

pub fn parse_discount(raw: &str) -> Option<Decimal> {
    let raw = raw.trim().trim_end_matches('%').trim();
    if raw.is_empty() {
        return None;
    }
    Decimal::from_str(raw).ok().and_then(normalize_discount)
}
