//! Tag classifier: deal tiers from the full price history.

use std::collections::HashMap;

use pricelog_core::{PriceHistory, PricePoint, PriceTag};
use pricelog_storage::{PriceStore, TagUpdate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{ImportError, Phase, RunContext};
use crate::staging::StagedPages;

const GOOD_LOWER: Decimal = dec!(0.95);
const GOOD_UPPER: Decimal = dec!(1.05);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyOutcome {
    pub tags_cleared: u64,
    pub tags_assigned: u64,
    pub best: u64,
    pub good: u64,
}

impl ClassifyOutcome {
    pub fn tags_changed(&self) -> u64 {
        self.tags_cleared + self.tags_assigned
    }
}

pub fn all_time_min<'a>(history: impl IntoIterator<Item = &'a PriceHistory>) -> Option<Decimal> {
    history
        .into_iter()
        .map(PriceHistory::price_point)
        .filter(|point| !point.is_degenerate())
        .map(|point| point.effective_price())
        .min()
}

pub fn classify(staged: PricePoint, all_time_min: Option<Decimal>) -> PriceTag {
    if staged.is_degenerate() || !staged.is_discounted() {
        return PriceTag::None;
    }
    let Some(min) = all_time_min else {
        return PriceTag::None;
    };
    let effective = staged.effective_price();
    // the band's lower edge is shadowed by BEST: anything at or below min lands there
    if effective <= min {
        PriceTag::Best
    } else if effective >= min * GOOD_LOWER && effective <= min * GOOD_UPPER {
        PriceTag::Good
    } else {
        PriceTag::None
    }
}

/// Clears tags of products missing from this run's feed, then retags every
/// staged product from its full history. Only changed tags are written.
pub async fn reclassify(
    store: &dyn PriceStore,
    run_id: Uuid,
    page_size: usize,
    ctx: &RunContext,
) -> Result<ClassifyOutcome, ImportError> {
    let mut outcome = ClassifyOutcome {
        tags_cleared: store.clear_tags_absent_from_staging(run_id).await?,
        ..Default::default()
    };

    let mut pages = StagedPages::new(store, run_id, page_size);
    while let Some(page) = pages.next_page().await? {
        ctx.checkpoint(Phase::Classify)?;

        let products = store.products_by_sku(&page.skus()).await?;
        let ids: Vec<i64> = products.iter().map(|p| p.id).collect();
        let mut history: HashMap<i64, Vec<PriceHistory>> = HashMap::new();
        for record in store.full_history(&ids).await? {
            history.entry(record.product_id).or_default().push(record);
        }
        let by_sku: HashMap<&str, _> = products.iter().map(|p| (p.sku.as_str(), p)).collect();

        let mut updates = Vec::new();
        for row in &page.rows {
            let Some(product) = by_sku.get(row.sku.as_str()) else {
                continue;
            };
            let min = history.get(&product.id).and_then(|h| all_time_min(h.iter()));
            let tag = classify(row.price_point(), min);
            match tag {
                PriceTag::Best => outcome.best += 1,
                PriceTag::Good => outcome.good += 1,
                PriceTag::None => {}
            }
            if tag != product.tag {
                updates.push(TagUpdate {
                    product_id: product.id,
                    tag,
                });
            }
        }

        if !updates.is_empty() {
            outcome.tags_assigned += store.update_tags(&updates).await?;
        }
    }

    info!(
        tags_cleared = outcome.tags_cleared,
        tags_assigned = outcome.tags_assigned,
        best = outcome.best,
        good = outcome.good,
        "tags reclassified"
    );
    Ok(outcome)
}
