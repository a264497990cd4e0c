//! Warehouse-to-CRM sync orchestration: paging, mapping, wave dispatch, and the
//! run-level plumbing (configuration, reports, scheduling) around it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crmsync_adapters::{
    BigQueryConfig, BigQueryWarehouse, CrmClient, FixtureWarehouse, HubSpotClient, HubSpotConfig,
    Warehouse, WarehouseError,
};
use crmsync_core::{RunSummary, SyncRequest};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod export;
pub mod jobs;
pub mod mapper;
pub mod paginator;

pub use dispatcher::{apply_wave, DispatchMode, Dispatcher};
pub use engine::{validate_request, SyncEngine};
pub use events::{ChannelObserver, SyncEvent, SyncObserver, TracingObserver};
pub use export::{export_properties, export_records, ExportSummary};
pub use jobs::{adhoc_job_name, JobRegistry, SyncJobConfig};
pub use mapper::{map_row, MappedRow};
pub use paginator::Paginator;

pub const CRATE_NAME: &str = "crmsync-sync";

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid sync configuration: {0}")]
    Config(String),
    #[error("submitting warehouse query failed")]
    QuerySubmission(#[source] WarehouseError),
    #[error("page fetch failed after {pages_completed} pages and {waves_completed} waves")]
    PageFetch {
        pages_completed: usize,
        waves_completed: usize,
        #[source]
        source: WarehouseError,
    },
    #[error("persisting checkpoint: {0:#}")]
    Checkpoint(anyhow::Error),
    #[error("appending audit rows: {0:#}")]
    Audit(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub hubspot_access_token: Option<String>,
    pub hubspot_base_url: String,
    pub bigquery_access_token: Option<String>,
    pub bigquery_project_id: Option<String>,
    pub bigquery_location: Option<String>,
    pub bigquery_base_url: String,
    pub state_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub jobs_file: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            hubspot_access_token: non_empty("HUBSPOT_ACCESS_TOKEN"),
            hubspot_base_url: non_empty("HUBSPOT_BASE_URL")
                .unwrap_or_else(|| crmsync_adapters::hubspot::DEFAULT_BASE_URL.to_string()),
            bigquery_access_token: non_empty("BIGQUERY_ACCESS_TOKEN"),
            bigquery_project_id: non_empty("BIGQUERY_PROJECT_ID"),
            bigquery_location: non_empty("BIGQUERY_LOCATION"),
            bigquery_base_url: non_empty("BIGQUERY_BASE_URL")
                .unwrap_or_else(|| crmsync_adapters::bigquery::DEFAULT_BASE_URL.to_string()),
            state_dir: non_empty("CRMSYNC_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state")),
            reports_dir: non_empty("CRMSYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            jobs_file: non_empty("CRMSYNC_JOBS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./syncs.yaml")),
            http_timeout_secs: lookup("CRMSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: non_empty("CRMSYNC_USER_AGENT")
                .unwrap_or_else(|| format!("crmsync/{}", env!("CARGO_PKG_VERSION"))),
            scheduler_enabled: lookup("CRMSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    pub fn hubspot_client(&self) -> Result<HubSpotClient> {
        let token = self
            .hubspot_access_token
            .clone()
            .context("HUBSPOT_ACCESS_TOKEN is not set")?;
        let mut config = HubSpotConfig::new(token);
        config.base_url = self.hubspot_base_url.clone();
        config.http.timeout = Duration::from_secs(self.http_timeout_secs);
        config.http.user_agent = Some(self.user_agent.clone());
        HubSpotClient::new(config)
    }

    pub fn bigquery_warehouse(&self) -> Result<BigQueryWarehouse> {
        let project = self
            .bigquery_project_id
            .clone()
            .context("BIGQUERY_PROJECT_ID is not set")?;
        let token = self
            .bigquery_access_token
            .clone()
            .context("BIGQUERY_ACCESS_TOKEN is not set")?;
        let mut config = BigQueryConfig::new(project, token);
        config.base_url = self.bigquery_base_url.clone();
        config.location = self.bigquery_location.clone();
        config.http.timeout = Duration::from_secs(self.http_timeout_secs);
        config.http.user_agent = Some(self.user_agent.clone());
        BigQueryWarehouse::new(config)
    }
}

/// Where a sync run reads its rows from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseSource {
    BigQuery,
    /// JSON fixture pages, for offline runs.
    Fixture(PathBuf),
}

impl WarehouseSource {
    pub fn build(&self, config: &SyncConfig) -> Result<Arc<dyn Warehouse>> {
        let warehouse: Arc<dyn Warehouse> = match self {
            Self::BigQuery => Arc::new(config.bigquery_warehouse()?),
            Self::Fixture(path) => Arc::new(FixtureWarehouse::from_path(path)?),
        };
        Ok(warehouse)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub summary: RunSummary,
    pub report_path: PathBuf,
}

pub async fn write_run_report(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let path = run_dir.join("sync_summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Run one request end to end against configured clients and write its report.
pub async fn run_sync(
    config: &SyncConfig,
    request: &SyncRequest,
    source: &WarehouseSource,
) -> Result<SyncOutcome> {
    let warehouse = source.build(config)?;
    let crm: Arc<dyn CrmClient> = Arc::new(config.hubspot_client()?);
    let summary = SyncEngine::new(warehouse, crm).run(request).await?;
    let report_path = write_run_report(&config.reports_dir, &summary).await?;
    Ok(SyncOutcome {
        summary,
        report_path,
    })
}

/// Register every job with a `cron`. Returns `None` when scheduling is disabled
/// or no job is scheduled. A run still in progress makes the next tick a no-op.
pub async fn maybe_build_scheduler(
    config: Arc<SyncConfig>,
    registry: &JobRegistry,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let mut jobs = Vec::new();
    for job_config in &registry.jobs {
        let Some(cron) = job_config.cron.as_deref() else {
            continue;
        };
        let request = Arc::new(job_config.resolve(&config.state_dir)?);
        let name = Arc::new(job_config.name.clone());
        let running = Arc::new(Mutex::new(()));
        let config = Arc::clone(&config);

        let job = Job::new_async(cron, move |_uuid, _l| {
            let request = Arc::clone(&request);
            let name = Arc::clone(&name);
            let running = Arc::clone(&running);
            let config = Arc::clone(&config);
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    warn!(job = %name, "previous run still in progress; skipping tick");
                    return;
                };
                match run_sync(&config, &request, &WarehouseSource::BigQuery).await {
                    Ok(outcome) => info!(
                        job = %name,
                        run_id = %outcome.summary.run_id,
                        updated = outcome.summary.updated,
                        failed = outcome.summary.failed,
                        report = %outcome.report_path.display(),
                        "scheduled sync finished"
                    ),
                    Err(err) => {
                        error!(job = %name, error = %format!("{err:#}"), "scheduled sync failed")
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job {} for cron {cron}", job_config.name))?;
        jobs.push(job);
    }

    if jobs.is_empty() {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for job in jobs {
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}
