//! Postgres-backed [`PriceStore`].

use async_trait::async_trait;
use chrono::NaiveDate;
use pricelog_core::{NewPriceHistory, NewProduct, PriceHistory, PriceTag, Product, StagingRow};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{PersistenceError, PriceStore, RunLease, TagUpdate};

/// Key for `pg_try_advisory_xact_lock`; shared by every process importing into one database.
pub const IMPORT_LOCK_KEY: i64 = 0x7072_6963_656c_6f67;

/// Rows per multi-row INSERT; keeps bind parameters under the protocol limit.
const INSERT_CHUNK: usize = 4_000;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(PersistenceError::database("connect"))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

/// Holds the transaction that owns the advisory lock for the whole run.
struct PgRunLease {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RunLease for PgRunLease {
    async fn release(self: Box<Self>) -> Result<(), PersistenceError> {
        self.tx
            .commit()
            .await
            .map_err(PersistenceError::database("release_run_lease"))
    }
}

fn line_no_to_db(line_no: u64) -> i64 {
    i64::try_from(line_no).unwrap_or(i64::MAX)
}

fn staging_from_row(row: &PgRow) -> Result<StagingRow, sqlx::Error> {
    let line_no: i64 = row.try_get("line_no")?;
    Ok(StagingRow {
        line_no: u64::try_from(line_no).unwrap_or_default(),
        sku: row.try_get("sku")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        image: row.try_get("image")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        discount: row.try_get("discount")?,
        category: row.try_get("category")?,
        feed_date: row.try_get("feed_date")?,
    })
}

fn history_from_row(row: &PgRow) -> Result<PriceHistory, sqlx::Error> {
    Ok(PriceHistory {
        id: row.try_get("id")?,
        product_id: row.try_get("product_id")?,
        price: row.try_get("price")?,
        discount: row.try_get("discount")?,
        record_date: row.try_get("record_date")?,
    })
}

fn product_from_row(row: &PgRow) -> Result<Product, PersistenceError> {
    let column = PersistenceError::database("products_by_sku");
    let tag: String = row.try_get("tag").map_err(PersistenceError::database("products_by_sku"))?;
    let tag = tag.parse::<PriceTag>().map_err(|err| PersistenceError::Decode {
        what: "products.tag",
        message: err.to_string(),
    })?;
    product_columns(row, tag).map_err(column)
}

fn product_columns(row: &PgRow, tag: PriceTag) -> Result<Product, sqlx::Error> {
    Ok(Product {
        id: row.try_get("id")?,
        sku: row.try_get("sku")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        image: row.try_get("image")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        tag,
    })
}

#[async_trait]
impl PriceStore for PgStore {
    async fn try_acquire_run_lease(&self) -> Result<Option<Box<dyn RunLease>>, PersistenceError> {
        let op = "try_acquire_run_lease";
        let mut tx = self.pool.begin().await.map_err(PersistenceError::database(op))?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(IMPORT_LOCK_KEY)
            .fetch_one(&mut *tx)
            .await
            .map_err(PersistenceError::database(op))?;

        if !acquired {
            tx.rollback().await.map_err(PersistenceError::database(op))?;
            return Ok(None);
        }
        Ok(Some(Box::new(PgRunLease { tx })))
    }

    async fn reset_staging(&self) -> Result<(), PersistenceError> {
        sqlx::query("TRUNCATE staging_rows")
            .execute(&self.pool)
            .await
            .map_err(PersistenceError::database("reset_staging"))?;
        Ok(())
    }

    async fn insert_staging(
        &self,
        run_id: Uuid,
        rows: &[StagingRow],
    ) -> Result<u64, PersistenceError> {
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO staging_rows (run_id, line_no, sku, name, url, image, description, price, discount, category, feed_date) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(run_id)
                    .push_bind(line_no_to_db(r.line_no))
                    .push_bind(&r.sku)
                    .push_bind(&r.name)
                    .push_bind(&r.url)
                    .push_bind(&r.image)
                    .push_bind(&r.description)
                    .push_bind(r.price)
                    .push_bind(r.discount)
                    .push_bind(&r.category)
                    .push_bind(r.feed_date);
            });
            let result = qb
                .build()
                .execute(&self.pool)
                .await
                .map_err(PersistenceError::database("insert_staging"))?;
            inserted += result.rows_affected();
        }
        debug!(%run_id, rows = inserted, "staging batch inserted");
        Ok(inserted)
    }

    async fn staged_page(
        &self,
        run_id: Uuid,
        after_sku: Option<&str>,
        sku_limit: usize,
    ) -> Result<Vec<StagingRow>, PersistenceError> {
        let op = "staged_page";
        let limit = i64::try_from(sku_limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT line_no, sku, name, url, image, description, price, discount, category, feed_date
            FROM staging_rows
            WHERE run_id = $1
              AND sku IN (
                SELECT DISTINCT sku FROM staging_rows
                WHERE run_id = $1 AND ($2::text IS NULL OR sku > $2)
                ORDER BY sku
                LIMIT $3
              )
            ORDER BY sku, line_no
            "#,
        )
        .bind(run_id)
        .bind(after_sku)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(PersistenceError::database(op))?;

        rows.iter()
            .map(staging_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(PersistenceError::database(op))
    }

    async fn discard_staging(&self, run_id: Uuid) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM staging_rows WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(PersistenceError::database("discard_staging"))?;
        Ok(())
    }

    async fn products_by_sku(&self, skus: &[String]) -> Result<Vec<Product>, PersistenceError> {
        if skus.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT id, sku, name, url, image, description, category, tag FROM products WHERE sku = ANY($1)",
        )
        .bind(skus)
        .fetch_all(&self.pool)
        .await
        .map_err(PersistenceError::database("products_by_sku"))?;

        rows.iter().map(product_from_row).collect()
    }

    async fn insert_products_if_absent(
        &self,
        products: &[NewProduct],
    ) -> Result<u64, PersistenceError> {
        let mut inserted = 0;
        for chunk in products.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO products (sku, name, url, image, description, category) ",
            );
            qb.push_values(chunk, |mut b, p| {
                b.push_bind(&p.sku)
                    .push_bind(&p.name)
                    .push_bind(&p.url)
                    .push_bind(&p.image)
                    .push_bind(&p.description)
                    .push_bind(&p.category);
            });
            qb.push(" ON CONFLICT (sku) DO NOTHING");
            let result = qb
                .build()
                .execute(&self.pool)
                .await
                .map_err(PersistenceError::database("insert_products_if_absent"))?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn history_around(
        &self,
        product_ids: &[i64],
        on: NaiveDate,
    ) -> Result<Vec<PriceHistory>, PersistenceError> {
        let op = "history_around";
        if product_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            (SELECT DISTINCT ON (product_id) id, product_id, price, discount, record_date
             FROM price_history
             WHERE product_id = ANY($1) AND record_date <= $2
             ORDER BY product_id, record_date DESC, id DESC)
            UNION ALL
            (SELECT DISTINCT ON (product_id) id, product_id, price, discount, record_date
             FROM price_history
             WHERE product_id = ANY($1) AND record_date > $2
             ORDER BY product_id, record_date ASC, id ASC)
            "#,
        )
        .bind(product_ids)
        .bind(on)
        .fetch_all(&self.pool)
        .await
        .map_err(PersistenceError::database(op))?;

        rows.iter()
            .map(history_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(PersistenceError::database(op))
    }

    async fn append_history(&self, rows: &[NewPriceHistory]) -> Result<u64, PersistenceError> {
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO price_history (product_id, price, discount, record_date) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.product_id)
                    .push_bind(r.price)
                    .push_bind(r.discount)
                    .push_bind(r.record_date);
            });
            let result = qb
                .build()
                .execute(&self.pool)
                .await
                .map_err(PersistenceError::database("append_history"))?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn full_history(
        &self,
        product_ids: &[i64],
    ) -> Result<Vec<PriceHistory>, PersistenceError> {
        let op = "full_history";
        if product_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, product_id, price, discount, record_date
            FROM price_history
            WHERE product_id = ANY($1)
            ORDER BY product_id, record_date, id
            "#,
        )
        .bind(product_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(PersistenceError::database(op))?;

        rows.iter()
            .map(history_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(PersistenceError::database(op))
    }

    async fn clear_tags_absent_from_staging(
        &self,
        run_id: Uuid,
    ) -> Result<u64, PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE products p SET tag = 'none'
            WHERE p.tag <> 'none'
              AND NOT EXISTS (
                SELECT 1 FROM staging_rows s WHERE s.run_id = $1 AND s.sku = p.sku
              )
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(PersistenceError::database("clear_tags_absent_from_staging"))?;
        Ok(result.rows_affected())
    }

    async fn update_tags(&self, updates: &[TagUpdate]) -> Result<u64, PersistenceError> {
        if updates.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = updates.iter().map(|u| u.product_id).collect();
        let tags: Vec<&str> = updates.iter().map(|u| u.tag.as_str()).collect();
        let result = sqlx::query(
            r#"
            UPDATE products p SET tag = u.tag
            FROM UNNEST($1::bigint[], $2::text[]) AS u(id, tag)
            WHERE p.id = u.id AND p.tag <> u.tag
            "#,
        )
        .bind(&ids)
        .bind(&tags)
        .execute(&self.pool)
        .await
        .map_err(PersistenceError::database("update_tags"))?;
        Ok(result.rows_affected())
    }
}
