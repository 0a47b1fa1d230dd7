//! Keyset paging over a run's staging arena.

use pricelog_core::StagingRow;
use pricelog_storage::{PersistenceError, PriceStore};
use uuid::Uuid;

/// Walks the staged SKUs of one run in ascending order, `page_size` SKUs at a time.
pub struct StagedPages<'a> {
    store: &'a dyn PriceStore,
    run_id: Uuid,
    page_size: usize,
    after: Option<String>,
    exhausted: bool,
}

impl<'a> StagedPages<'a> {
    pub fn new(store: &'a dyn PriceStore, run_id: Uuid, page_size: usize) -> Self {
        Self {
            store,
            run_id,
            page_size: page_size.max(1),
            after: None,
            exhausted: false,
        }
    }

    pub async fn next_page(&mut self) -> Result<Option<FirstRows>, PersistenceError> {
        if self.exhausted {
            return Ok(None);
        }
        let rows = self
            .store
            .staged_page(self.run_id, self.after.as_deref(), self.page_size)
            .await?;
        if rows.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        let page = FirstRows::from_rows(rows);
        self.after = page.rows.last().map(|row| row.sku.clone());
        Ok(Some(page))
    }
}

/// One row per SKU: the earliest feed line wins, later lines are only counted.
#[derive(Debug, Default)]
pub struct FirstRows {
    pub rows: Vec<StagingRow>,
    pub duplicates: u64,
}

impl FirstRows {
    pub fn from_rows(mut rows: Vec<StagingRow>) -> Self {
        rows.sort_by(|a, b| a.sku.cmp(&b.sku).then(a.line_no.cmp(&b.line_no)));
        let before = rows.len();
        rows.dedup_by(|later, first| later.sku == first.sku);
        let duplicates = (before - rows.len()) as u64;
        Self { rows, duplicates }
    }

    pub fn skus(&self) -> Vec<String> {
        self.rows.iter().map(|row| row.sku.clone()).collect()
    }
}
