//! Checkpointed sync run: page loop, wave dispatch, and per-wave flushing.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use crmsync_adapters::{CrmClient, Warehouse};
use crmsync_core::{
    AuditRecord, AuditStatus, ObjectType, PendingUpdate, ProcessedSet, RunSummary, SyncRequest,
    WarehouseRow,
};
use crmsync_storage::{AuditSink, CheckpointStore};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::dispatcher::{DispatchMode, Dispatcher};
use crate::events::{SyncEvent, SyncObserver, TracingObserver};
use crate::mapper::{map_row, MappedRow};
use crate::paginator::Paginator;
use crate::SyncError;

/// Check a request before any remote call and resolve its object type.
pub fn validate_request(request: &SyncRequest) -> Result<ObjectType, SyncError> {
    let mut missing = Vec::new();
    if request.object_type.trim().is_empty() {
        missing.push("object type");
    }
    if request.query.trim().is_empty() {
        missing.push("query");
    }
    if request.mapping.is_empty() {
        missing.push("property mapping");
    }
    if request.id_column.trim().is_empty() {
        missing.push("identifier column");
    }
    if !missing.is_empty() {
        return Err(SyncError::Config(format!("missing {}", missing.join(", "))));
    }
    if request.mapping.has_blank_pair() {
        return Err(SyncError::Config(
            "property mapping has a blank target property or source column".to_string(),
        ));
    }

    for (name, value) in [
        ("page size", request.page_size),
        ("wave size", request.wave_size),
        ("concurrency", request.concurrency),
    ] {
        if value == 0 {
            return Err(SyncError::Config(format!("{name} must be at least 1")));
        }
    }
    if request.update_timeout.is_zero() {
        return Err(SyncError::Config("update timeout must be non-zero".to_string()));
    }

    Ok(ObjectType::parse(&request.object_type))
}

fn into_waves(pending: Vec<PendingUpdate>, wave_size: usize) -> Vec<Vec<PendingUpdate>> {
    let mut waves = Vec::with_capacity(pending.len().div_ceil(wave_size.max(1)));
    let mut iter = pending.into_iter().peekable();
    while iter.peek().is_some() {
        waves.push(iter.by_ref().take(wave_size.max(1)).collect());
    }
    waves
}

pub struct SyncEngine {
    warehouse: Option<Arc<dyn Warehouse>>,
    crm: Option<Arc<dyn CrmClient>>,
    observer: Arc<dyn SyncObserver>,
}

impl SyncEngine {
    pub fn new(warehouse: Arc<dyn Warehouse>, crm: Arc<dyn CrmClient>) -> Self {
        Self {
            warehouse: Some(warehouse),
            crm: Some(crm),
            observer: Arc::new(TracingObserver),
        }
    }

    /// Engine with collaborators wired later; `run` rejects it until both are set.
    pub fn unconfigured() -> Self {
        Self {
            warehouse: None,
            crm: None,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_warehouse(mut self, warehouse: Arc<dyn Warehouse>) -> Self {
        self.warehouse = Some(warehouse);
        self
    }

    pub fn with_crm(mut self, crm: Arc<dyn CrmClient>) -> Self {
        self.crm = Some(crm);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub async fn run(&self, request: &SyncRequest) -> Result<RunSummary, SyncError> {
        let object_type = validate_request(request)?;
        let (Some(warehouse), Some(crm)) = (self.warehouse.clone(), self.crm.clone()) else {
            return Err(SyncError::Config(
                "both a warehouse client and a CRM client are required".to_string(),
            ));
        };

        let run_id = Uuid::new_v4();
        let span = info_span!(
            "sync_run",
            %run_id,
            object_type = %object_type,
            apply = request.apply
        );
        self.run_validated(run_id, request, object_type, warehouse, crm)
            .instrument(span)
            .await
    }

    async fn run_validated(
        &self,
        run_id: Uuid,
        request: &SyncRequest,
        object_type: ObjectType,
        warehouse: Arc<dyn Warehouse>,
        crm: Arc<dyn CrmClient>,
    ) -> Result<RunSummary, SyncError> {
        let mut summary =
            RunSummary::new(run_id, object_type.to_string(), request.apply, Utc::now());
        let checkpoint = CheckpointStore::new(&request.checkpoint_path);
        let audit = AuditSink::new(&request.audit_path);
        let mut processed = checkpoint.load().await;

        self.observer.on_event(&SyncEvent::RunStarted {
            run_id,
            object_type: object_type.to_string(),
            applied: request.apply,
            already_processed: processed.len(),
        });

        let mode = if request.apply {
            DispatchMode::Apply { crm, object_type }
        } else {
            DispatchMode::DryRun
        };
        let dispatcher = Dispatcher::new(mode, request.concurrency, request.update_timeout);

        let mut paginator = Paginator::open(warehouse, &request.query, request.page_size)
            .await
            .map_err(SyncError::QuerySubmission)?;

        loop {
            let rows = match paginator.next_page().await {
                Ok(Some(rows)) => rows,
                Ok(None) => break,
                Err(source) => {
                    return Err(SyncError::PageFetch {
                        pages_completed: summary.pages,
                        waves_completed: summary.waves,
                        source,
                    })
                }
            };
            summary.pages += 1;
            summary.fetched += rows.len();
            let page = summary.pages;

            let (pending, page_counts) = self.triage_page(&rows, request, &mut processed);
            summary.invalid += page_counts.invalid;
            summary.skipped += page_counts.skipped;
            summary.discarded += page_counts.discarded;

            self.observer.on_event(&SyncEvent::PageFetched {
                run_id,
                page,
                rows: rows.len(),
                pending: pending.len(),
                skipped: page_counts.skipped,
                discarded: page_counts.discarded,
                invalid: page_counts.invalid,
            });

            let mut discards_unflushed = page_counts.discarded > 0;
            for (index, wave) in into_waves(pending, request.wave_size).into_iter().enumerate() {
                let records = dispatcher.dispatch(wave).await;
                self.flush_wave(&records, &mut processed, &mut summary, &checkpoint, &audit)
                    .await?;
                discards_unflushed = false;

                self.observer.on_event(&SyncEvent::WaveCompleted {
                    run_id,
                    page,
                    wave: index + 1,
                    attempted: records.len(),
                    updated: count_status(&records, AuditStatus::Updated),
                    dry_run: count_status(&records, AuditStatus::DryRun),
                    failed: count_status(&records, AuditStatus::Error),
                    processed_total: processed.len(),
                });
            }

            if discards_unflushed {
                checkpoint.save(&processed).await.map_err(SyncError::Checkpoint)?;
            }
        }

        summary.finished_at = Utc::now();
        self.observer.on_event(&SyncEvent::RunFinished {
            run_id,
            pages: summary.pages,
            fetched: summary.fetched,
            attempted: summary.attempted,
            updated: summary.updated,
            failed: summary.failed,
            skipped: summary.skipped,
        });
        Ok(summary)
    }

    /// Map a page and drop identifiers that are already terminal. Discarded rows
    /// become terminal here whatever their history, so they count as discarded on
    /// every pass; dispatchable ones become terminal at their wave flush.
    fn triage_page(
        &self,
        rows: &[WarehouseRow],
        request: &SyncRequest,
        processed: &mut ProcessedSet,
    ) -> (Vec<PendingUpdate>, PageCounts) {
        let mut counts = PageCounts::default();
        let mut pending = Vec::new();
        let mut seen = HashSet::new();

        for row in rows {
            match map_row(row, &request.mapping, &request.id_column, request.drop_blanks) {
                MappedRow::Invalid => counts.invalid += 1,
                MappedRow::Discarded { identifier } => {
                    processed.insert(identifier);
                    counts.discarded += 1;
                }
                MappedRow::Pending(update) => {
                    if processed.contains(&update.identifier)
                        || !seen.insert(update.identifier.clone())
                    {
                        counts.skipped += 1;
                    } else {
                        pending.push(update);
                    }
                }
            }
        }
        (pending, counts)
    }

    async fn flush_wave(
        &self,
        records: &[AuditRecord],
        processed: &mut ProcessedSet,
        summary: &mut RunSummary,
        checkpoint: &CheckpointStore,
        audit: &AuditSink,
    ) -> Result<(), SyncError> {
        for record in records {
            processed.insert(record.identifier.clone());
            summary.record(record);
        }
        summary.waves += 1;
        audit.append(records).await.map_err(SyncError::Audit)?;
        checkpoint.save(processed).await.map_err(SyncError::Checkpoint)?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PageCounts {
    invalid: usize,
    skipped: usize,
    discarded: usize,
}

fn count_status(records: &[AuditRecord], status: AuditStatus) -> usize {
    records.iter().filter(|r| r.status == status).count()
}
