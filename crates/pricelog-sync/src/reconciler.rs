//! Price history reconciler: change-detection append against the records
//! neighbouring the feed date.

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use pricelog_core::{NewPriceHistory, PricePoint};
use pricelog_storage::PriceStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ImportError, Phase, RunContext};
use crate::staging::StagedPages;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub history_appended: u64,
    pub unchanged: u64,
    pub duplicate_rows: u64,
    pub unregistered: u64,
}

#[derive(Debug, Default)]
struct Neighbours {
    before: Option<PricePoint>,
    after: Option<PricePoint>,
}

impl Neighbours {
    fn contains(&self, point: &PricePoint) -> bool {
        self.before.as_ref() == Some(point) || self.after.as_ref() == Some(point)
    }
}

/// Appends a history record for every staged SKU whose `(price, discount)`
/// differs from the records on either side of the feed date, or that has
/// no history yet.
pub async fn append_changed(
    store: &dyn PriceStore,
    run_id: Uuid,
    page_size: usize,
    ctx: &RunContext,
) -> Result<ReconcileOutcome, ImportError> {
    let mut outcome = ReconcileOutcome::default();
    let mut pages = StagedPages::new(store, run_id, page_size);

    while let Some(page) = pages.next_page().await? {
        ctx.checkpoint(Phase::Reconcile)?;
        outcome.duplicate_rows += page.duplicates;

        let products: HashMap<String, i64> = store
            .products_by_sku(&page.skus())
            .await?
            .into_iter()
            .map(|p| (p.sku, p.id))
            .collect();
        let ids: Vec<i64> = products.values().copied().collect();

        let dates: BTreeSet<NaiveDate> = page.rows.iter().map(|r| r.feed_date).collect();
        let mut neighbours: HashMap<(i64, NaiveDate), Neighbours> = HashMap::new();
        for date in dates {
            for record in store.history_around(&ids, date).await? {
                let slot = neighbours.entry((record.product_id, date)).or_default();
                if record.record_date <= date {
                    slot.before = Some(record.price_point());
                } else {
                    slot.after = Some(record.price_point());
                }
            }
        }

        let mut appends = Vec::new();
        for row in &page.rows {
            let Some(&product_id) = products.get(&row.sku) else {
                warn!(sku = %row.sku, "staged sku has no product; skipping history");
                outcome.unregistered += 1;
                continue;
            };
            let point = row.price_point();
            let known = neighbours
                .get(&(product_id, row.feed_date))
                .is_some_and(|n| n.contains(&point));
            if known {
                outcome.unchanged += 1;
                continue;
            }
            appends.push(NewPriceHistory {
                product_id,
                price: point.price,
                discount: point.discount,
                record_date: row.feed_date,
            });
        }

        if !appends.is_empty() {
            outcome.history_appended += store.append_history(&appends).await?;
        }
    }

    info!(
        history_appended = outcome.history_appended,
        unchanged = outcome.unchanged,
        duplicate_rows = outcome.duplicate_rows,
        unregistered = outcome.unregistered,
        "price history reconciled"
    );
    Ok(outcome)
}
