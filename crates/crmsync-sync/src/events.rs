//! Structured progress events emitted by a sync run.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    RunStarted {
        run_id: Uuid,
        object_type: String,
        applied: bool,
        already_processed: usize,
    },
    PageFetched {
        run_id: Uuid,
        page: usize,
        rows: usize,
        pending: usize,
        skipped: usize,
        discarded: usize,
        invalid: usize,
    },
    WaveCompleted {
        run_id: Uuid,
        page: usize,
        wave: usize,
        attempted: usize,
        updated: usize,
        dry_run: usize,
        failed: usize,
        processed_total: usize,
    },
    RunFinished {
        run_id: Uuid,
        pages: usize,
        fetched: usize,
        attempted: usize,
        updated: usize,
        failed: usize,
        skipped: usize,
    },
}

pub trait SyncObserver: Send + Sync {
    fn on_event(&self, event: &SyncEvent);
}

/// Default observer: one structured log line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn on_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::RunStarted {
                run_id,
                object_type,
                applied,
                already_processed,
            } => info!(%run_id, %object_type, applied, already_processed, "sync run started"),
            SyncEvent::PageFetched {
                run_id,
                page,
                rows,
                pending,
                skipped,
                discarded,
                invalid,
            } => info!(%run_id, page, rows, pending, skipped, discarded, invalid, "page fetched"),
            SyncEvent::WaveCompleted {
                run_id,
                page,
                wave,
                attempted,
                updated,
                dry_run,
                failed,
                processed_total,
            } => info!(
                %run_id,
                page,
                wave,
                attempted,
                updated,
                dry_run,
                failed,
                processed_total,
                "wave flushed"
            ),
            SyncEvent::RunFinished {
                run_id,
                pages,
                fetched,
                attempted,
                updated,
                failed,
                skipped,
            } => info!(
                %run_id,
                pages,
                fetched,
                attempted,
                updated,
                failed,
                skipped,
                "sync run finished"
            ),
        }
    }
}

/// Forwards events to a channel. Dropped receivers are ignored.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SyncObserver for ChannelObserver {
    fn on_event(&self, event: &SyncEvent) {
        let _ = self.tx.send(event.clone());
    }
}
