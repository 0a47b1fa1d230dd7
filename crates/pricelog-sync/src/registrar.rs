//! Product registrar: one product per staged SKU, first write wins.

use std::collections::HashSet;

use pricelog_core::NewProduct;
use pricelog_storage::PriceStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ImportError, Phase, RunContext};
use crate::staging::StagedPages;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterOutcome {
    pub products_created: u64,
    pub skus_seen: u64,
}

/// Creates products for staged SKUs the store does not know yet.
pub async fn register_missing(
    store: &dyn PriceStore,
    run_id: Uuid,
    page_size: usize,
    ctx: &RunContext,
) -> Result<RegisterOutcome, ImportError> {
    let mut outcome = RegisterOutcome::default();
    let mut pages = StagedPages::new(store, run_id, page_size);

    while let Some(page) = pages.next_page().await? {
        ctx.checkpoint(Phase::Register)?;
        outcome.skus_seen += page.rows.len() as u64;

        let known: HashSet<String> = store
            .products_by_sku(&page.skus())
            .await?
            .into_iter()
            .map(|p| p.sku)
            .collect();
        let missing: Vec<NewProduct> = page
            .rows
            .iter()
            .filter(|row| !known.contains(&row.sku))
            .map(NewProduct::from)
            .collect();
        if missing.is_empty() {
            continue;
        }

        let created = store.insert_products_if_absent(&missing).await?;
        debug!(candidates = missing.len(), created, "registered page of products");
        outcome.products_created += created;
    }

    info!(
        products_created = outcome.products_created,
        skus_seen = outcome.skus_seen,
        "products registered"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pricelog_core::{PriceTag, StagingRow};
    use pricelog_storage::MemoryStore;
    use rust_decimal::Decimal;

    fn row(line_no: u64, sku: &str, name: &str) -> StagingRow {
        StagingRow {
            line_no,
            sku: sku.to_string(),
            name: name.to_string(),
            url: format!("https://shop.example/{sku}"),
            image: String::new(),
            description: String::new(),
            price: 1000,
            discount: Decimal::ZERO,
            category: "misc".to_string(),
            feed_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
        }
    }

    #[tokio::test]
    async fn empty_staging_registers_nothing() {
        let store = MemoryStore::new();
        let outcome = register_missing(&store, Uuid::new_v4(), 10, &RunContext::detached())
            .await
            .unwrap();
        assert_eq!(outcome.products_created, 0);
    }

    #[tokio::test]
    async fn registration_is_idempotent_and_uses_first_row() {
        let store = MemoryStore::new();
        let run = Uuid::new_v4();
        store
            .insert_staging(
                run,
                &[row(2, "B", "second"), row(1, "A", "alpha"), row(3, "B", "third")],
            )
            .await
            .unwrap();

        let first = register_missing(&store, run, 1, &RunContext::detached()).await.unwrap();
        assert_eq!(first.products_created, 2);
        assert_eq!(store.product("B").await.unwrap().name, "second");

        let second = register_missing(&store, run, 1, &RunContext::detached()).await.unwrap();
        assert_eq!(second.products_created, 0);
        assert_eq!(store.products().await.len(), 2);
    }

    #[tokio::test]
    async fn existing_products_keep_their_fields() {
        let store = MemoryStore::new();
        let run = Uuid::new_v4();
        store
            .seed_product(NewProduct::from(&row(1, "A", "original")), PriceTag::Good)
            .await;
        store.insert_staging(run, &[row(1, "A", "renamed")]).await.unwrap();

        let outcome = register_missing(&store, run, 10, &RunContext::detached()).await.unwrap();
        assert_eq!(outcome.products_created, 0);
        let product = store.product("A").await.unwrap();
        assert_eq!(product.name, "original");
        assert_eq!(product.tag, PriceTag::Good);
    }
}
