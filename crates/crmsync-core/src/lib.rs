//! Core domain model for warehouse-to-CRM property sync runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "crmsync-core";

pub const DEFAULT_PAGE_SIZE: usize = 5000;
pub const DEFAULT_WAVE_SIZE: usize = 100;
pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(30);

/// One warehouse result row, keyed by column name.
pub type WarehouseRow = BTreeMap<String, JsonValue>;

/// CRM object types the update path knows how to route.
///
/// The first-class types have dedicated API paths; anything else is sent to the
/// generic custom-object path under its own name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Contacts,
    Companies,
    Deals,
    Tickets,
    Custom(String),
}

impl ObjectType {
    pub fn parse(name: &str) -> Self {
        let trimmed = name.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "contact" | "contacts" => Self::Contacts,
            "company" | "companies" => Self::Companies,
            "deal" | "deals" => Self::Deals,
            "ticket" | "tickets" => Self::Tickets,
            _ => Self::Custom(trimmed.to_string()),
        }
    }

    pub fn api_name(&self) -> &str {
        match self {
            Self::Contacts => "contacts",
            Self::Companies => "companies",
            Self::Deals => "deals",
            Self::Tickets => "tickets",
            Self::Custom(name) => name.as_str(),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

/// Which warehouse columns feed which CRM properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyMapping {
    Single {
        target_property: String,
        source_column: String,
    },
    Multi {
        pairs: Vec<(String, String)>,
    },
}

impl PropertyMapping {
    pub fn single(target_property: impl Into<String>, source_column: impl Into<String>) -> Self {
        Self::Single {
            target_property: target_property.into(),
            source_column: source_column.into(),
        }
    }

    pub fn multi<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Multi {
            pairs: pairs
                .into_iter()
                .map(|(target, column)| (target.into(), column.into()))
                .collect(),
        }
    }

    /// `(target_property, source_column)` pairs in declaration order.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        match self {
            Self::Single {
                target_property,
                source_column,
            } => vec![(target_property.as_str(), source_column.as_str())],
            Self::Multi { pairs } => pairs
                .iter()
                .map(|(target, column)| (target.as_str(), column.as_str()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs().is_empty()
    }

    /// True when any pair names a blank target property or source column.
    pub fn has_blank_pair(&self) -> bool {
        self.pairs()
            .iter()
            .any(|(target, column)| target.trim().is_empty() || column.trim().is_empty())
    }
}

/// How warehouse rows are matched to CRM records. Only primary identifiers are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MatchMode {
    #[default]
    Identifier,
}

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const DRY_RUN_CHECKPOINT_FILE: &str = "checkpoint.dry-run.json";

/// Default checkpoint location under `state_dir`. Dry-runs keep their own file so a
/// preview never marks identifiers processed for the applying run.
pub fn default_checkpoint_path(state_dir: &Path, apply: bool) -> PathBuf {
    state_dir.join(if apply {
        CHECKPOINT_FILE
    } else {
        DRY_RUN_CHECKPOINT_FILE
    })
}

/// Configuration for one sync run.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub object_type: String,
    pub query: String,
    pub mapping: PropertyMapping,
    pub id_column: String,
    pub match_mode: MatchMode,
    pub page_size: usize,
    pub wave_size: usize,
    pub concurrency: usize,
    pub drop_blanks: bool,
    pub apply: bool,
    pub checkpoint_path: PathBuf,
    pub audit_path: PathBuf,
    pub update_timeout: Duration,
}

impl SyncRequest {
    /// Dry-run request with default sizing; callers flip `apply` explicitly.
    pub fn new(
        object_type: impl Into<String>,
        query: impl Into<String>,
        mapping: PropertyMapping,
        id_column: impl Into<String>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        let state_dir = state_dir.into();
        Self {
            object_type: object_type.into(),
            query: query.into(),
            mapping,
            id_column: id_column.into(),
            match_mode: MatchMode::Identifier,
            page_size: DEFAULT_PAGE_SIZE,
            wave_size: DEFAULT_WAVE_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            drop_blanks: true,
            apply: false,
            checkpoint_path: default_checkpoint_path(&state_dir, false),
            audit_path: state_dir.join("audit.csv"),
            update_timeout: DEFAULT_UPDATE_TIMEOUT,
        }
    }
}

/// Identifiers that reached a terminal outcome and must not be attempted again.
///
/// Membership means "do not retry", not "succeeded": discarded, applied and failed
/// identifiers all land here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessedSet(BTreeSet<String>);

impl ProcessedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.0.contains(identifier)
    }

    /// Returns `true` when the identifier was not already present.
    pub fn insert(&mut self, identifier: impl Into<String>) -> bool {
        self.0.insert(identifier.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for ProcessedSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// A property update ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub identifier: String,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    DryRun,
    Updated,
    Error,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DryRun => "DRY_RUN",
            Self::Updated => "UPDATED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one dispatched update, as written to the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub identifier: String,
    pub status: AuditStatus,
    pub properties: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl AuditRecord {
    pub fn dry_run(update: PendingUpdate) -> Self {
        Self {
            identifier: update.identifier,
            status: AuditStatus::DryRun,
            properties: update.properties,
            error: None,
        }
    }

    pub fn updated(update: PendingUpdate) -> Self {
        Self {
            identifier: update.identifier,
            status: AuditStatus::Updated,
            properties: update.properties,
            error: None,
        }
    }

    pub fn failed(update: PendingUpdate, error: impl Into<String>) -> Self {
        Self {
            identifier: update.identifier,
            status: AuditStatus::Error,
            properties: update.properties,
            error: Some(error.into()),
        }
    }

    pub fn properties_json(&self) -> String {
        serde_json::to_string(&self.properties).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Aggregate result of a sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub object_type: String,
    pub applied: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: usize,
    pub waves: usize,
    pub fetched: usize,
    /// Rows without a usable identifier.
    pub invalid: usize,
    /// Identifiers already processed by an earlier run or earlier in this page.
    pub skipped: usize,
    /// Rows whose mapped properties were all blank.
    pub discarded: usize,
    pub attempted: usize,
    pub updated: usize,
    pub dry_run: usize,
    pub failed: usize,
    pub errors: Vec<AuditRecord>,
}

impl RunSummary {
    pub fn new(
        run_id: Uuid,
        object_type: impl Into<String>,
        applied: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            object_type: object_type.into(),
            applied,
            started_at,
            finished_at: started_at,
            pages: 0,
            waves: 0,
            fetched: 0,
            invalid: 0,
            skipped: 0,
            discarded: 0,
            attempted: 0,
            updated: 0,
            dry_run: 0,
            failed: 0,
            errors: Vec::new(),
        }
    }

    pub fn record(&mut self, record: &AuditRecord) {
        self.attempted += 1;
        match record.status {
            AuditStatus::DryRun => self.dry_run += 1,
            AuditStatus::Updated => self.updated += 1,
            AuditStatus::Error => {
                self.failed += 1;
                self.errors.push(record.clone());
            }
        }
    }
}
