//! In-process store for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use pricelog_core::{NewPriceHistory, NewProduct, PriceHistory, PriceTag, Product, StagingRow};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{PersistenceError, PriceStore, RunLease, TagUpdate};

#[derive(Debug, Default)]
struct MemoryState {
    products: BTreeMap<String, Product>,
    next_product_id: i64,
    history: Vec<PriceHistory>,
    next_history_id: i64,
    staging: Vec<(Uuid, StagingRow)>,
    fail_on: HashSet<&'static str>,
}

impl MemoryState {
    fn check(&self, op: &'static str) -> Result<(), PersistenceError> {
        if self.fail_on.contains(op) {
            return Err(PersistenceError::Backend {
                op,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    leased: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call of the named store operation fail.
    pub async fn fail_on(&self, op: &'static str) {
        self.state.lock().await.fail_on.insert(op);
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.fail_on.clear();
    }

    pub async fn products(&self) -> Vec<Product> {
        self.state.lock().await.products.values().cloned().collect()
    }

    pub async fn product(&self, sku: &str) -> Option<Product> {
        self.state.lock().await.products.get(sku).cloned()
    }

    pub async fn history(&self) -> Vec<PriceHistory> {
        self.state.lock().await.history.clone()
    }

    /// History of one product in insertion order.
    pub async fn history_for_sku(&self, sku: &str) -> Vec<PriceHistory> {
        let state = self.state.lock().await;
        let Some(product) = state.products.get(sku) else {
            return Vec::new();
        };
        state
            .history
            .iter()
            .filter(|h| h.product_id == product.id)
            .cloned()
            .collect()
    }

    pub async fn staged_row_count(&self) -> usize {
        self.state.lock().await.staging.len()
    }

    /// Seeds a product directly, bypassing registration.
    pub async fn seed_product(&self, product: NewProduct, tag: PriceTag) -> i64 {
        let mut state = self.state.lock().await;
        state.next_product_id += 1;
        let id = state.next_product_id;
        state.products.insert(
            product.sku.clone(),
            Product {
                id,
                sku: product.sku,
                name: product.name,
                url: product.url,
                image: product.image,
                description: product.description,
                category: product.category,
                tag,
            },
        );
        id
    }

    pub async fn seed_history(&self, row: NewPriceHistory) -> i64 {
        let mut state = self.state.lock().await;
        state.next_history_id += 1;
        let id = state.next_history_id;
        state.history.push(PriceHistory {
            id,
            product_id: row.product_id,
            price: row.price,
            discount: row.discount,
            record_date: row.record_date,
        });
        id
    }
}

struct MemoryRunLease {
    leased: Arc<AtomicBool>,
}

impl Drop for MemoryRunLease {
    fn drop(&mut self) {
        self.leased.store(false, Ordering::Release);
    }
}

#[async_trait]
impl RunLease for MemoryRunLease {
    async fn release(self: Box<Self>) -> Result<(), PersistenceError> {
        Ok(())
    }
}

#[async_trait]
impl PriceStore for MemoryStore {
    async fn try_acquire_run_lease(&self) -> Result<Option<Box<dyn RunLease>>, PersistenceError> {
        self.state.lock().await.check("try_acquire_run_lease")?;
        if self
            .leased
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryRunLease {
            leased: Arc::clone(&self.leased),
        })))
    }

    async fn reset_staging(&self) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state.check("reset_staging")?;
        state.staging.clear();
        Ok(())
    }

    async fn insert_staging(
        &self,
        run_id: Uuid,
        rows: &[StagingRow],
    ) -> Result<u64, PersistenceError> {
        let mut state = self.state.lock().await;
        state.check("insert_staging")?;
        state
            .staging
            .extend(rows.iter().cloned().map(|row| (run_id, row)));
        Ok(rows.len() as u64)
    }

    async fn staged_page(
        &self,
        run_id: Uuid,
        after_sku: Option<&str>,
        sku_limit: usize,
    ) -> Result<Vec<StagingRow>, PersistenceError> {
        let state = self.state.lock().await;
        state.check("staged_page")?;

        let skus: BTreeSet<&str> = state
            .staging
            .iter()
            .filter(|(id, row)| *id == run_id && after_sku.map_or(true, |after| row.sku.as_str() > after))
            .map(|(_, row)| row.sku.as_str())
            .collect();
        let page: HashSet<&str> = skus.into_iter().take(sku_limit).collect();

        let mut rows: Vec<StagingRow> = state
            .staging
            .iter()
            .filter(|(id, row)| *id == run_id && page.contains(row.sku.as_str()))
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by(|a, b| a.sku.cmp(&b.sku).then(a.line_no.cmp(&b.line_no)));
        Ok(rows)
    }

    async fn discard_staging(&self, run_id: Uuid) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state.check("discard_staging")?;
        state.staging.retain(|(id, _)| *id != run_id);
        Ok(())
    }

    async fn products_by_sku(&self, skus: &[String]) -> Result<Vec<Product>, PersistenceError> {
        let state = self.state.lock().await;
        state.check("products_by_sku")?;
        Ok(skus
            .iter()
            .filter_map(|sku| state.products.get(sku).cloned())
            .collect())
    }

    async fn insert_products_if_absent(
        &self,
        products: &[NewProduct],
    ) -> Result<u64, PersistenceError> {
        let mut state = self.state.lock().await;
        state.check("insert_products_if_absent")?;
        let mut inserted = 0;
        for product in products {
            if state.products.contains_key(&product.sku) {
                continue;
            }
            state.next_product_id += 1;
            let id = state.next_product_id;
            state.products.insert(
                product.sku.clone(),
                Product {
                    id,
                    sku: product.sku.clone(),
                    name: product.name.clone(),
                    url: product.url.clone(),
                    image: product.image.clone(),
                    description: product.description.clone(),
                    category: product.category.clone(),
                    tag: PriceTag::None,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn history_around(
        &self,
        product_ids: &[i64],
        on: NaiveDate,
    ) -> Result<Vec<PriceHistory>, PersistenceError> {
        let state = self.state.lock().await;
        state.check("history_around")?;
        let wanted: HashSet<i64> = product_ids.iter().copied().collect();
        let mut before: HashMap<i64, &PriceHistory> = HashMap::new();
        let mut after: HashMap<i64, &PriceHistory> = HashMap::new();
        for row in state.history.iter().filter(|h| wanted.contains(&h.product_id)) {
            let key = (row.record_date, row.id);
            if row.record_date <= on {
                before
                    .entry(row.product_id)
                    .and_modify(|cur| {
                        if key > (cur.record_date, cur.id) {
                            *cur = row;
                        }
                    })
                    .or_insert(row);
            } else {
                after
                    .entry(row.product_id)
                    .and_modify(|cur| {
                        if key < (cur.record_date, cur.id) {
                            *cur = row;
                        }
                    })
                    .or_insert(row);
            }
        }
        Ok(before.into_values().chain(after.into_values()).cloned().collect())
    }

    async fn append_history(&self, rows: &[NewPriceHistory]) -> Result<u64, PersistenceError> {
        let mut state = self.state.lock().await;
        state.check("append_history")?;
        for row in rows {
            state.next_history_id += 1;
            let id = state.next_history_id;
            state.history.push(PriceHistory {
                id,
                product_id: row.product_id,
                price: row.price,
                discount: row.discount,
                record_date: row.record_date,
            });
        }
        Ok(rows.len() as u64)
    }

    async fn full_history(
        &self,
        product_ids: &[i64],
    ) -> Result<Vec<PriceHistory>, PersistenceError> {
        let state = self.state.lock().await;
        state.check("full_history")?;
        let wanted: HashSet<i64> = product_ids.iter().copied().collect();
        Ok(state
            .history
            .iter()
            .filter(|h| wanted.contains(&h.product_id))
            .cloned()
            .collect())
    }

    async fn clear_tags_absent_from_staging(
        &self,
        run_id: Uuid,
    ) -> Result<u64, PersistenceError> {
        let mut state = self.state.lock().await;
        state.check("clear_tags_absent_from_staging")?;
        let staged: HashSet<String> = state
            .staging
            .iter()
            .filter(|(id, _)| *id == run_id)
            .map(|(_, row)| row.sku.clone())
            .collect();
        let mut cleared = 0;
        for product in state.products.values_mut() {
            if product.tag != PriceTag::None && !staged.contains(&product.sku) {
                product.tag = PriceTag::None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn update_tags(&self, updates: &[TagUpdate]) -> Result<u64, PersistenceError> {
        let mut state = self.state.lock().await;
        state.check("update_tags")?;
        let by_id: HashMap<i64, PriceTag> =
            updates.iter().map(|u| (u.product_id, u.tag)).collect();
        let mut changed = 0;
        for product in state.products.values_mut() {
            if let Some(tag) = by_id.get(&product.id) {
                if product.tag != *tag {
                    product.tag = *tag;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }
}
