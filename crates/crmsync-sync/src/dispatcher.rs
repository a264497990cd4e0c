//! Bounded-concurrency fan-out of one wave of updates.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crmsync_adapters::CrmClient;
use crmsync_core::{AuditRecord, ObjectType, PendingUpdate};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::warn;

/// Apply every update in `wave` with at most `concurrency` calls in flight.
///
/// Workers pull the next item from a shared index until the wave is exhausted.
/// A failing, timed-out, or panicking call becomes an `ERROR` record; it never
/// aborts the wave. Records come back in completion order.
pub async fn apply_wave<F, Fut>(
    wave: Vec<PendingUpdate>,
    concurrency: usize,
    timeout: Duration,
    apply: F,
) -> Vec<AuditRecord>
where
    F: Fn(PendingUpdate) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    if wave.is_empty() {
        return Vec::new();
    }

    let total = wave.len();
    let items = Arc::new(wave);
    let cursor = Arc::new(AtomicUsize::new(0));
    let apply = Arc::new(apply);
    let (tx, mut rx) = mpsc::channel::<AuditRecord>(total);

    let mut workers = JoinSet::new();
    for _ in 0..concurrency.clamp(1, total) {
        let items = Arc::clone(&items);
        let cursor = Arc::clone(&cursor);
        let apply = Arc::clone(&apply);
        let tx = tx.clone();

        workers.spawn(async move {
            loop {
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(update) = items.get(index).cloned() else {
                    break;
                };

                let mut call = tokio::spawn(apply(update.clone()));
                let record = match tokio::time::timeout(timeout, &mut call).await {
                    Ok(Ok(Ok(()))) => AuditRecord::updated(update),
                    Ok(Ok(Err(message))) => AuditRecord::failed(update, message),
                    Ok(Err(join_err)) => {
                        AuditRecord::failed(update, format!("update task failed: {join_err}"))
                    }
                    Err(_) => {
                        call.abort();
                        let message = format!("timed out after {}ms", timeout.as_millis());
                        AuditRecord::failed(update, message)
                    }
                };

                if tx.send(record).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut records = Vec::with_capacity(total);
    while let Some(record) = rx.recv().await {
        records.push(record);
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "dispatch worker exited abnormally");
        }
    }
    records
}

/// Where a wave goes: nowhere (dry-run) or to the CRM.
#[derive(Clone)]
pub enum DispatchMode {
    DryRun,
    Apply {
        crm: Arc<dyn CrmClient>,
        object_type: ObjectType,
    },
}

#[derive(Clone)]
pub struct Dispatcher {
    mode: DispatchMode,
    concurrency: usize,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(mode: DispatchMode, concurrency: usize, timeout: Duration) -> Self {
        Self {
            mode,
            concurrency,
            timeout,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self.mode, DispatchMode::DryRun)
    }

    pub async fn dispatch(&self, wave: Vec<PendingUpdate>) -> Vec<AuditRecord> {
        match &self.mode {
            DispatchMode::DryRun => wave.into_iter().map(AuditRecord::dry_run).collect(),
            DispatchMode::Apply { crm, object_type } => {
                let crm = Arc::clone(crm);
                let object_type = object_type.clone();
                apply_wave(wave, self.concurrency, self.timeout, move |update| {
                    let crm = Arc::clone(&crm);
                    let object_type = object_type.clone();
                    async move {
                        crm.update_record(&object_type, &update.identifier, &update.properties)
                            .await
                            .map_err(|e| e.to_string())
                    }
                })
                .await
            }
        }
    }
}
