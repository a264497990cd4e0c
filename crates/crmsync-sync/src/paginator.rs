//! Drives a warehouse query job page by page until the result is exhausted.

use std::sync::Arc;

use crmsync_adapters::{JobHandle, Warehouse, WarehouseError};
use crmsync_core::WarehouseRow;
use tracing::debug;

pub struct Paginator {
    warehouse: Arc<dyn Warehouse>,
    job: JobHandle,
    page_size: usize,
    page_token: Option<String>,
    pages_fetched: usize,
    done: bool,
}

impl Paginator {
    /// Submit the query. A rejection here is fatal for the run.
    pub async fn open(
        warehouse: Arc<dyn Warehouse>,
        query: &str,
        page_size: usize,
    ) -> Result<Self, WarehouseError> {
        let job = warehouse.open_query(query).await?;
        Ok(Self {
            warehouse,
            job,
            page_size,
            page_token: None,
            pages_fetched: 0,
            done: false,
        })
    }

    pub fn job(&self) -> &JobHandle {
        &self.job
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Next non-empty page, or `None` once the engine returns an empty page or a
    /// page without a continuation token.
    pub async fn next_page(&mut self) -> Result<Option<Vec<WarehouseRow>>, WarehouseError> {
        if self.done {
            return Ok(None);
        }

        let page = self
            .warehouse
            .next_page(&self.job, self.page_token.as_deref(), self.page_size)
            .await?;

        if page.rows.is_empty() {
            debug!(job_id = %self.job.job_id, "empty page; result exhausted");
            self.done = true;
            return Ok(None);
        }

        self.pages_fetched += 1;
        match page.next_page_token {
            Some(token) => self.page_token = Some(token),
            None => self.done = true,
        }
        Ok(Some(page.rows))
    }
}
