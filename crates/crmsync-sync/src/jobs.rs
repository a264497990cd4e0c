//! Named sync jobs loaded from `syncs.yaml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use crmsync_core::{
    default_checkpoint_path, MatchMode, ObjectType, PropertyMapping, SyncRequest,
    DEFAULT_CONCURRENCY, DEFAULT_PAGE_SIZE, DEFAULT_WAVE_SIZE,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::SyncError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobRegistry {
    #[serde(default)]
    pub jobs: Vec<SyncJobConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncJobConfig {
    pub name: String,
    pub object_type: String,
    #[serde(default)]
    pub query: Option<String>,
    /// Path to a `.sql` file, relative to the registry file.
    #[serde(default)]
    pub query_file: Option<PathBuf>,
    pub id_column: String,
    #[serde(default)]
    pub match_by: Option<String>,
    /// Single-property form: `property` + `column`.
    #[serde(default)]
    pub property: Option<String>,
    #[serde(default)]
    pub column: Option<String>,
    /// Multi-property form: target property -> source column.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub wave_size: Option<usize>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub drop_blanks: Option<bool>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Write to the CRM instead of dry-running. Scheduled runs honor this.
    #[serde(default)]
    pub apply: bool,
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
    #[serde(default)]
    pub audit: Option<PathBuf>,
    /// Six-field cron expression (`sec min hour day month weekday`).
    #[serde(default)]
    pub cron: Option<String>,
}

impl JobRegistry {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut registry: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for job in &mut registry.jobs {
            if let Some(query_file) = &job.query_file {
                let query_path = base.join(query_file);
                let query = std::fs::read_to_string(&query_path).with_context(|| {
                    format!("reading query for job {}: {}", job.name, query_path.display())
                })?;
                job.query = Some(query);
            }
        }
        Ok(registry)
    }

    pub fn find(&self, name: &str) -> Option<&SyncJobConfig> {
        self.jobs.iter().find(|job| job.name == name)
    }
}

/// Stable name for a job described only by flags: `adhoc-<object>-<digest>`, the
/// digest covering the query and every mapping pair.
pub fn adhoc_job_name(
    object_type: &str,
    query: &str,
    mapping: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.trim().as_bytes());
    for (property, column) in mapping {
        hasher.update([0u8]);
        hasher.update(property.as_bytes());
        hasher.update([b'=']);
        hasher.update(column.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!(
        "adhoc-{}-{}",
        ObjectType::parse(object_type).api_name(),
        &digest[..12]
    )
}

fn resolve_mapping(job: &SyncJobConfig) -> Result<PropertyMapping, SyncError> {
    let single = match (&job.property, &job.column) {
        (Some(property), Some(column)) => Some(PropertyMapping::single(property, column)),
        (None, None) => None,
        _ => {
            return Err(SyncError::Config(format!(
                "job {}: `property` and `column` must be set together",
                job.name
            )))
        }
    };

    match (single, job.properties.is_empty()) {
        (Some(_), false) => Err(SyncError::Config(format!(
            "job {}: use either `property`/`column` or `properties`, not both",
            job.name
        ))),
        (Some(mapping), true) => Ok(mapping),
        (None, false) => Ok(PropertyMapping::multi(job.properties.clone())),
        (None, true) => Err(SyncError::Config(format!(
            "job {}: missing property mapping",
            job.name
        ))),
    }
}

fn resolve_match_mode(job: &SyncJobConfig) -> Result<MatchMode, SyncError> {
    match job.match_by.as_deref().map(str::trim) {
        None | Some("id") | Some("identifier") => Ok(MatchMode::Identifier),
        Some(other) => Err(SyncError::Config(format!(
            "job {}: matching by `{other}` is not supported; only `id` is",
            job.name
        ))),
    }
}

impl SyncJobConfig {
    /// Build the job's request; state files default to `<state_dir>/<job name>/`.
    pub fn resolve(&self, state_dir: &Path) -> Result<SyncRequest, SyncError> {
        let mapping = resolve_mapping(self)?;
        let match_mode = resolve_match_mode(self)?;
        let job_dir = state_dir.join(&self.name);

        let mut request = SyncRequest::new(
            self.object_type.clone(),
            self.query.clone().unwrap_or_default(),
            mapping,
            self.id_column.clone(),
            &job_dir,
        );
        request.match_mode = match_mode;
        request.page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        request.wave_size = self.wave_size.unwrap_or(DEFAULT_WAVE_SIZE);
        request.concurrency = self.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
        request.drop_blanks = self.drop_blanks.unwrap_or(true);
        request.apply = self.apply;
        request.checkpoint_path = default_checkpoint_path(&job_dir, self.apply);
        if let Some(secs) = self.timeout_secs {
            request.update_timeout = Duration::from_secs(secs);
        }
        if let Some(path) = &self.checkpoint {
            request.checkpoint_path = path.clone();
        }
        if let Some(path) = &self.audit {
            request.audit_path = path.clone();
        }
        Ok(request)
    }
}
