//! Persistence contract shared by the pipeline phases.

use async_trait::async_trait;
use chrono::NaiveDate;
use pricelog_core::{NewPriceHistory, NewProduct, PriceHistory, PriceTag, Product, StagingRow};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error during {op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("store error during {op}: {message}")]
    Backend { op: &'static str, message: String },
    #[error("could not decode {what}: {message}")]
    Decode { what: &'static str, message: String },
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl PersistenceError {
    pub(crate) fn database(op: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| PersistenceError::Database { op, source }
    }

    pub fn op(&self) -> Option<&'static str> {
        match self {
            PersistenceError::Database { op, .. } | PersistenceError::Backend { op, .. } => {
                Some(op)
            }
            PersistenceError::Decode { .. } | PersistenceError::Migrate(_) => None,
        }
    }
}

/// Exclusive right to run an import against a store. Dropping it without
/// calling [`RunLease::release`] also gives the right back.
#[async_trait]
pub trait RunLease: Send {
    async fn release(self: Box<Self>) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagUpdate {
    pub product_id: i64,
    pub tag: PriceTag,
}

#[async_trait]
pub trait PriceStore: Send + Sync {
    /// `Ok(None)` means another run already holds the lease.
    async fn try_acquire_run_lease(&self) -> Result<Option<Box<dyn RunLease>>, PersistenceError>;

    async fn reset_staging(&self) -> Result<(), PersistenceError>;

    async fn insert_staging(&self, run_id: Uuid, rows: &[StagingRow])
        -> Result<u64, PersistenceError>;

    /// Every staged row for the next `sku_limit` distinct SKUs after
    /// `after_sku`, ordered by `(sku, line_no)`.
    async fn staged_page(
        &self,
        run_id: Uuid,
        after_sku: Option<&str>,
        sku_limit: usize,
    ) -> Result<Vec<StagingRow>, PersistenceError>;

    async fn discard_staging(&self, run_id: Uuid) -> Result<(), PersistenceError>;

    async fn products_by_sku(&self, skus: &[String]) -> Result<Vec<Product>, PersistenceError>;

    async fn insert_products_if_absent(
        &self,
        products: &[NewProduct],
    ) -> Result<u64, PersistenceError>;

    /// Up to two records per product around `on`: the latest dated on or
    /// before it (by `record_date` then `id`) and the earliest dated after it.
    async fn history_around(
        &self,
        product_ids: &[i64],
        on: NaiveDate,
    ) -> Result<Vec<PriceHistory>, PersistenceError>;

    async fn append_history(&self, rows: &[NewPriceHistory]) -> Result<u64, PersistenceError>;

    async fn full_history(&self, product_ids: &[i64])
        -> Result<Vec<PriceHistory>, PersistenceError>;

    /// Sets `none` on every tagged product whose SKU is not staged for `run_id`.
    async fn clear_tags_absent_from_staging(&self, run_id: Uuid)
        -> Result<u64, PersistenceError>;

    async fn update_tags(&self, updates: &[TagUpdate]) -> Result<u64, PersistenceError>;
}
