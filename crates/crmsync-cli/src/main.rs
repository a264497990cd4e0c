use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crmsync_core::{ObjectType, SyncRequest};
use crmsync_sync::{
    adhoc_job_name, export_properties, export_records, maybe_build_scheduler, run_sync,
    JobRegistry, SyncConfig, SyncJobConfig, WarehouseSource,
};
use tracing::info;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "crmsync")]
#[command(about = "Warehouse-to-CRM property sync")]
struct Cli {
    /// Log level used when RUST_LOG is unset. Defaults to CRMSYNC_LOG, then `info`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Push warehouse values into CRM records (dry-run unless --apply).
    Sync(SyncArgs),
    /// Page through CRM records and write them to CSV.
    Export {
        #[arg(long)]
        object: String,
        #[arg(long, value_delimiter = ',', required = true)]
        properties: Vec<String>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Write the property definitions of an object type to CSV.
    Properties {
        #[arg(long)]
        object: String,
        #[arg(long)]
        out: PathBuf,
    },
    /// Run every job with a `cron` until interrupted.
    Schedule,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Job name from the jobs file. Omit to describe the job with flags.
    job: Option<String>,

    #[arg(long)]
    object: Option<String>,
    #[arg(long, conflicts_with = "query_file")]
    query: Option<String>,
    #[arg(long)]
    query_file: Option<PathBuf>,
    #[arg(long)]
    id_column: Option<String>,
    #[arg(long, requires = "column")]
    property: Option<String>,
    #[arg(long, requires = "property")]
    column: Option<String>,
    /// `property=column`, repeatable.
    #[arg(long = "map", value_parser = parse_pair)]
    map: Vec<(String, String)>,

    /// Write to the CRM. Without it the run only audits what it would send.
    #[arg(long)]
    apply: bool,
    /// Audit only, even for a job that applies by default.
    #[arg(long, conflicts_with = "apply")]
    dry_run: bool,
    #[arg(long)]
    page_size: Option<usize>,
    #[arg(long)]
    wave_size: Option<usize>,
    #[arg(long)]
    concurrency: Option<usize>,
    /// Send blank values instead of dropping them.
    #[arg(long)]
    keep_blanks: bool,
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long)]
    audit: Option<PathBuf>,
    /// Read rows from a JSON fixture instead of BigQuery.
    #[arg(long)]
    fixture: Option<PathBuf>,
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((property, column)) if !property.trim().is_empty() && !column.trim().is_empty() => {
            Ok((property.trim().to_string(), column.trim().to_string()))
        }
        _ => Err(format!("expected property=column, got `{raw}`")),
    }
}

impl SyncArgs {
    fn adhoc_job(&self) -> Result<SyncJobConfig> {
        let query = match &self.query_file {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?,
            ),
            None => self.query.clone(),
        };
        let object_type = self.object.clone().unwrap_or_default();
        let mut properties = self.map.iter().cloned().collect::<BTreeMap<_, _>>();
        if let (Some(property), Some(column)) = (&self.property, &self.column) {
            properties.insert(property.clone(), column.clone());
        }
        let name = adhoc_job_name(&object_type, query.as_deref().unwrap_or_default(), &properties);
        Ok(SyncJobConfig {
            name,
            object_type,
            query,
            id_column: self.id_column.clone().unwrap_or_default(),
            property: self.property.clone(),
            column: self.column.clone(),
            properties: self.map.iter().cloned().collect::<BTreeMap<_, _>>(),
            ..Default::default()
        })
    }

    fn request(&self, config: &SyncConfig) -> Result<SyncRequest> {
        let mut job = match &self.job {
            Some(name) => {
                let registry = JobRegistry::load(&config.jobs_file)?;
                registry
                    .find(name)
                    .cloned()
                    .with_context(|| {
                        format!("no job named {name} in {}", config.jobs_file.display())
                    })?
            }
            None => self.adhoc_job()?,
        };
        if self.apply {
            job.apply = true;
        } else if self.dry_run {
            job.apply = false;
        }

        let mut request = job.resolve(&config.state_dir)?;
        if let Some(size) = self.page_size {
            request.page_size = size;
        }
        if let Some(size) = self.wave_size {
            request.wave_size = size;
        }
        if let Some(limit) = self.concurrency {
            request.concurrency = limit;
        }
        if self.keep_blanks {
            request.drop_blanks = false;
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

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("CRMSYNC_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    logging::init(&level);

    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Sync(args) => {
            let request = args.request(&config)?;
            let source = match &args.fixture {
                Some(path) => WarehouseSource::Fixture(path.clone()),
                None => WarehouseSource::BigQuery,
            };
            let outcome = run_sync(&config, &request, &source).await?;
            let summary = &outcome.summary;
            println!(
                "sync complete: run_id={} mode={} pages={} fetched={} skipped={} discarded={} \
                 updated={} dry_run={} failed={} report={}",
                summary.run_id,
                if summary.applied { "apply" } else { "dry-run" },
                summary.pages,
                summary.fetched,
                summary.skipped,
                summary.discarded,
                summary.updated,
                summary.dry_run,
                summary.failed,
                outcome.report_path.display()
            );
        }
        Commands::Export {
            object,
            properties,
            out,
        } => {
            let crm = config.hubspot_client()?;
            let object_type = ObjectType::parse(&object);
            let summary = export_records(&crm, &object_type, &properties, &out).await?;
            println!(
                "export complete: object={} pages={} records={} out={}",
                summary.object_type, summary.pages, summary.records, summary.output
            );
        }
        Commands::Properties { object, out } => {
            let crm = config.hubspot_client()?;
            let count = export_properties(&crm, &ObjectType::parse(&object), &out).await?;
            println!(
                "properties exported: object={object} count={count} out={}",
                out.display()
            );
        }
        Commands::Schedule => {
            let registry = JobRegistry::load(&config.jobs_file)?;
            let enabled = config.scheduler_enabled;
            let Some(mut sched) = maybe_build_scheduler(Arc::new(config), &registry).await? else {
                if enabled {
                    bail!("no job in the jobs file has a cron schedule");
                }
                bail!("scheduler disabled; set CRMSYNC_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
