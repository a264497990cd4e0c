//! Collaborator contracts for the warehouse and the CRM, plus their implementations.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use crmsync_core::{ObjectType, WarehouseRow};
use crmsync_storage::FetchError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod bigquery;
pub mod hubspot;

pub use bigquery::{BigQueryConfig, BigQueryWarehouse};
pub use hubspot::{HubSpotClient, HubSpotConfig};

pub const CRATE_NAME: &str = "crmsync-adapters";

/// Server-side handle for a submitted query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
    pub location: Option<String>,
}

/// One fetch unit of a query result. A `None` token means the result is exhausted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPage {
    pub rows: Vec<WarehouseRow>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("query rejected: {0}")]
    Rejected(String),
    #[error("unexpected warehouse response: {0}")]
    Response(String),
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn open_query(&self, query: &str) -> Result<JobHandle, WarehouseError>;

    /// `page_size` is advisory; implementations may return fewer rows.
    async fn next_page(
        &self,
        job: &JobHandle,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<RowPage, WarehouseError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmRecord {
    pub id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPage {
    pub records: Vec<CrmRecord>,
    pub next_after: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDefinition {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default)]
    pub property_type: String,
    #[serde(default)]
    pub field_type: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("unexpected crm response: {0}")]
    Response(String),
    #[error(transparent)]
    Transport(#[from] FetchError),
}

#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn update_record(
        &self,
        object_type: &ObjectType,
        id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), CrmError>;

    async fn list_records(
        &self,
        object_type: &ObjectType,
        properties: &[String],
        after: Option<&str>,
        limit: usize,
    ) -> Result<RecordPage, CrmError>;

    async fn list_properties(
        &self,
        object_type: &ObjectType,
    ) -> Result<Vec<PropertyDefinition>, CrmError>;
}

/// Pre-captured query results, for offline previews and tests.
///
/// The fixture file is either a JSON array of pages (each an array of row objects)
/// or an object with a `pages` field holding that array. Page tokens are page indexes.
#[derive(Debug, Clone, Default)]
pub struct FixtureWarehouse {
    pages: Vec<Vec<WarehouseRow>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    Pages(Vec<Vec<WarehouseRow>>),
    Wrapped { pages: Vec<Vec<WarehouseRow>> },
}

impl FixtureWarehouse {
    pub fn from_pages(pages: Vec<Vec<WarehouseRow>>) -> Self {
        Self { pages }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture rows {}", path.display()))?;
        let file: FixtureFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing fixture rows {}", path.display()))?;
        let pages = match file {
            FixtureFile::Pages(pages) | FixtureFile::Wrapped { pages } => pages,
        };
        Ok(Self { pages })
    }

    pub fn total_rows(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl Warehouse for FixtureWarehouse {
    async fn open_query(&self, query: &str) -> Result<JobHandle, WarehouseError> {
        if query.trim().is_empty() {
            return Err(WarehouseError::Rejected("empty query".to_string()));
        }
        Ok(JobHandle {
            job_id: "fixture".to_string(),
            location: None,
        })
    }

    async fn next_page(
        &self,
        _job: &JobHandle,
        page_token: Option<&str>,
        _page_size: usize,
    ) -> Result<RowPage, WarehouseError> {
        let index = match page_token {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| WarehouseError::Response(format!("bad fixture page token {token}")))?,
        };
        let rows = self.pages.get(index).cloned().unwrap_or_default();
        let next_page_token = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
        Ok(RowPage {
            rows,
            next_page_token,
        })
    }
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str()
}
