use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crmsync_adapters::{
    CrmClient, CrmError, FixtureWarehouse, JobHandle, PropertyDefinition, RecordPage, RowPage,
    Warehouse, WarehouseError,
};
use crmsync_core::{
    default_checkpoint_path, AuditStatus, ObjectType, PropertyMapping, SyncRequest, WarehouseRow,
};
use crmsync_storage::CheckpointStore;
use crmsync_sync::{ChannelObserver, SyncEngine, SyncError, SyncEvent};
use serde_json::{json, Value as JsonValue};
use tempfile::tempdir;

#[derive(Default)]
struct FakeCrm {
    calls: Mutex<Vec<String>>,
    fail: HashSet<String>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeCrm {
    fn failing(ids: &[&str]) -> Self {
        Self {
            fail: ids.iter().map(|id| id.to_string()).collect(),
            ..Default::default()
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CrmClient for FakeCrm {
    async fn update_record(
        &self,
        _object_type: &ObjectType,
        id: &str,
        _properties: &BTreeMap<String, String>,
    ) -> Result<(), CrmError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.calls.lock().unwrap().push(id.to_string());
        if self.fail.contains(id) {
            return Err(CrmError::Response(format!("object {id} not found")));
        }
        Ok(())
    }

    async fn list_records(
        &self,
        _object_type: &ObjectType,
        _properties: &[String],
        _after: Option<&str>,
        _limit: usize,
    ) -> Result<RecordPage, CrmError> {
        Ok(RecordPage::default())
    }

    async fn list_properties(
        &self,
        _object_type: &ObjectType,
    ) -> Result<Vec<PropertyDefinition>, CrmError> {
        Ok(Vec::new())
    }
}

/// Generates pages of `{id, country_normalized}` rows. Always hands out a
/// continuation token, so the run ends only on an empty page.
#[derive(Default)]
struct ScriptedWarehouse {
    page_sizes: Vec<usize>,
    fail_at_page: Option<usize>,
    reject: bool,
}

#[async_trait]
impl Warehouse for ScriptedWarehouse {
    async fn open_query(&self, _query: &str) -> Result<JobHandle, WarehouseError> {
        if self.reject {
            return Err(WarehouseError::Rejected("Syntax error at [1:8]".to_string()));
        }
        Ok(JobHandle {
            job_id: "job-1".to_string(),
            location: Some("US".to_string()),
        })
    }

    async fn next_page(
        &self,
        _job: &JobHandle,
        page_token: Option<&str>,
        _page_size: usize,
    ) -> Result<RowPage, WarehouseError> {
        let index = page_token.map_or(0, |t| t.parse::<usize>().unwrap());
        if self.fail_at_page == Some(index) {
            return Err(WarehouseError::Response("backend error".to_string()));
        }
        let offset: usize = self.page_sizes.iter().take(index).sum();
        let size = self.page_sizes.get(index).copied().unwrap_or(0);
        let rows = (offset..offset + size)
            .map(|i| row(&i.to_string(), Some("US")))
            .collect();
        Ok(RowPage {
            rows,
            next_page_token: Some((index + 1).to_string()),
        })
    }
}

fn row(id: &str, country: Option<&str>) -> WarehouseRow {
    WarehouseRow::from([
        ("id".to_string(), json!(id)),
        (
            "country_normalized".to_string(),
            country.map_or(JsonValue::Null, |c| json!(c)),
        ),
    ])
}

fn request(state_dir: &Path, apply: bool) -> SyncRequest {
    let mut request = SyncRequest::new(
        "contacts",
        "select id, country_normalized from analytics.contact_geo",
        PropertyMapping::single("country", "country_normalized"),
        "id",
        state_dir,
    );
    request.apply = apply;
    request.checkpoint_path = default_checkpoint_path(state_dir, apply);
    request
}

fn engine(warehouse: impl Warehouse + 'static, crm: &Arc<FakeCrm>) -> SyncEngine {
    let crm: Arc<dyn CrmClient> = crm.clone();
    SyncEngine::new(Arc::new(warehouse), crm)
}

async fn checkpoint_ids(path: &Path) -> HashSet<String> {
    CheckpointStore::new(path)
        .load()
        .await
        .iter()
        .map(str::to_string)
        .collect()
}

fn audit_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

fn numbered_pages(sizes: &[usize]) -> FixtureWarehouse {
    let mut next = 0usize;
    let pages = sizes
        .iter()
        .map(|size| {
            let page = (next..next + size)
                .map(|i| row(&format!("c-{i}"), Some("US")))
                .collect();
            next += size;
            page
        })
        .collect();
    FixtureWarehouse::from_pages(pages)
}

#[tokio::test]
async fn second_run_over_same_checkpoint_makes_no_updates() {
    let dir = tempdir().unwrap();
    let req = request(dir.path(), true);
    let crm = Arc::new(FakeCrm::default());

    let first = engine(numbered_pages(&[120, 130]), &crm).run(&req).await.unwrap();
    assert_eq!(first.fetched, 250);
    assert_eq!(first.updated, 250);
    assert_eq!(first.skipped, 0);
    assert_eq!(crm.call_count(), 250);

    let second = engine(numbered_pages(&[120, 130]), &crm).run(&req).await.unwrap();
    assert_eq!(second.fetched, 250);
    assert_eq!(second.skipped, 250);
    assert_eq!(second.attempted, 0);
    assert_eq!(second.waves, 0);
    assert_eq!(crm.call_count(), 250);
    assert_eq!(checkpoint_ids(&req.checkpoint_path).await.len(), 250);
}

#[tokio::test]
async fn preview_then_apply_updates_every_row() {
    let dir = tempdir().unwrap();
    let crm = Arc::new(FakeCrm::default());

    let preview = request(dir.path(), false);
    let previewed = engine(numbered_pages(&[40]), &crm).run(&preview).await.unwrap();
    assert_eq!(previewed.dry_run, 40);
    assert_eq!(crm.call_count(), 0);

    let live = request(dir.path(), true);
    assert_ne!(preview.checkpoint_path, live.checkpoint_path);
    let applied = engine(numbered_pages(&[40]), &crm).run(&live).await.unwrap();
    assert_eq!(applied.skipped, 0);
    assert_eq!(applied.updated, 40);
    assert_eq!(crm.call_count(), 40);
    assert_eq!(audit_lines(&live.audit_path).len(), 1 + 40 + 40);
}

#[tokio::test]
async fn rerun_skips_only_identifiers_that_had_values() {
    let dir = tempdir().unwrap();
    let req = request(dir.path(), true);
    let crm = Arc::new(FakeCrm::default());
    let page = || {
        FixtureWarehouse::from_pages(vec![vec![
            row("1", Some("US")),
            row("2", None),
            row("3", Some("  ")),
        ]])
    };

    let first = engine(page(), &crm).run(&req).await.unwrap();
    assert_eq!(first.updated, 1);
    assert_eq!(first.discarded, 2);

    let second = engine(page(), &crm).run(&req).await.unwrap();
    assert_eq!(second.skipped, 1);
    assert_eq!(second.discarded, 2);
    assert_eq!(second.attempted, 0);
    assert_eq!(crm.call_count(), 1);
    assert_eq!(checkpoint_ids(&req.checkpoint_path).await.len(), 3);
}

#[tokio::test]
async fn blank_rows_are_discarded_but_still_checkpointed() {
    let dir = tempdir().unwrap();
    let mut req = request(dir.path(), true);
    req.mapping = PropertyMapping::multi([
        ("country", "country_normalized"),
        ("state", "state_normalized"),
    ]);
    let crm = Arc::new(FakeCrm::default());

    let mut first = row("1", Some("US"));
    first.insert("state_normalized".into(), json!("CA"));
    let mut second = row("2", None);
    second.insert("state_normalized".into(), JsonValue::Null);
    // Second page has nothing to send, so no wave follows its discard.
    let third = row("3", Some("   "));
    let warehouse = FixtureWarehouse::from_pages(vec![vec![first, second], vec![third]]);

    let summary = engine(warehouse, &crm).run(&req).await.unwrap();
    assert_eq!(summary.discarded, 2);
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.updated, 1);
    assert_eq!(*crm.calls.lock().unwrap(), vec!["1".to_string()]);

    let processed = checkpoint_ids(&req.checkpoint_path).await;
    assert_eq!(
        processed,
        HashSet::from(["1".to_string(), "2".to_string(), "3".to_string()])
    );

    let audit = audit_lines(&req.audit_path);
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[0], "matchVal,status,properties_json,error");
    assert!(audit[1].starts_with("1,UPDATED,"), "{}", audit[1]);
}

#[tokio::test]
async fn keeping_blanks_sends_empty_values() {
    let dir = tempdir().unwrap();
    let mut req = request(dir.path(), true);
    req.drop_blanks = false;
    let crm = Arc::new(FakeCrm::default());
    let warehouse = FixtureWarehouse::from_pages(vec![vec![row("9", Some(""))]]);

    let summary = engine(warehouse, &crm).run(&req).await.unwrap();
    assert_eq!(summary.discarded, 0);
    assert_eq!(summary.updated, 1);
}

#[tokio::test]
async fn one_failed_update_is_isolated_and_not_retried() {
    let dir = tempdir().unwrap();
    let req = request(dir.path(), true);
    let crm = Arc::new(FakeCrm::failing(&["c-4"]));

    let summary = engine(numbered_pages(&[10]), &crm).run(&req).await.unwrap();
    assert_eq!(summary.attempted, 10);
    assert_eq!(summary.updated, 9);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].identifier, "c-4");
    assert_eq!(summary.errors[0].status, AuditStatus::Error);
    assert!(summary.errors[0].error.as_deref().unwrap().contains("not found"));

    assert!(checkpoint_ids(&req.checkpoint_path).await.contains("c-4"));
    let audit = audit_lines(&req.audit_path);
    assert_eq!(audit.len(), 11);
    assert!(audit.iter().any(|line| line.starts_with("c-4,ERROR,")));

    let again = engine(numbered_pages(&[10]), &crm).run(&req).await.unwrap();
    assert_eq!(again.attempted, 0);
    assert_eq!(crm.call_count(), 10);
}

#[tokio::test]
async fn paging_stops_at_first_empty_page() {
    let dir = tempdir().unwrap();
    let req = request(dir.path(), false);
    let crm = Arc::new(FakeCrm::default());
    let warehouse = ScriptedWarehouse {
        page_sizes: vec![5000, 5000],
        ..Default::default()
    };

    let summary = engine(warehouse, &crm).run(&req).await.unwrap();
    assert_eq!(summary.pages, 2);
    assert_eq!(summary.fetched, 10_000);
    assert_eq!(summary.waves, 100);
    assert_eq!(summary.dry_run, 10_000);
    assert!(!summary.applied);
    assert_eq!(crm.call_count(), 0);
    assert_eq!(checkpoint_ids(&req.checkpoint_path).await.len(), 10_000);
}

#[tokio::test]
async fn dry_run_audits_without_calling_the_crm() {
    let dir = tempdir().unwrap();
    let req = request(dir.path(), false);
    let crm = Arc::new(FakeCrm::default());

    let summary = engine(numbered_pages(&[3]), &crm).run(&req).await.unwrap();
    assert_eq!(summary.dry_run, 3);
    assert_eq!(summary.updated, 0);
    assert_eq!(crm.call_count(), 0);

    let audit = audit_lines(&req.audit_path);
    assert_eq!(audit.len(), 4);
    assert!(audit[1..].iter().all(|line| line.contains(",DRY_RUN,")));
    assert!(audit[1].contains(r#""{""country"":""US""}""#), "{}", audit[1]);
}

#[tokio::test]
async fn updates_in_flight_never_exceed_concurrency() {
    let dir = tempdir().unwrap();
    let mut req = request(dir.path(), true);
    req.concurrency = 3;
    req.wave_size = 20;
    let crm = Arc::new(FakeCrm {
        delay: Some(Duration::from_millis(5)),
        ..Default::default()
    });

    let summary = engine(numbered_pages(&[40]), &crm).run(&req).await.unwrap();
    assert_eq!(summary.updated, 40);
    assert_eq!(summary.waves, 2);
    let peak = crm.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "observed {peak} concurrent updates");
}

#[tokio::test]
async fn repeated_identifier_within_a_page_is_sent_once() {
    let dir = tempdir().unwrap();
    let req = request(dir.path(), true);
    let crm = Arc::new(FakeCrm::default());
    let warehouse = FixtureWarehouse::from_pages(vec![vec![
        row("7", Some("US")),
        row("7", Some("CA")),
        row("", Some("MX")),
    ]]);

    let summary = engine(warehouse, &crm).run(&req).await.unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.invalid, 1);
    assert_eq!(crm.call_count(), 1);
}

#[tokio::test]
async fn rejected_query_fails_before_touching_state() {
    let dir = tempdir().unwrap();
    let req = request(dir.path(), true);
    let crm = Arc::new(FakeCrm::default());
    let warehouse = ScriptedWarehouse {
        reject: true,
        ..Default::default()
    };

    let err = engine(warehouse, &crm).run(&req).await.unwrap_err();
    assert!(matches!(err, SyncError::QuerySubmission(WarehouseError::Rejected(_))));
    assert!(!req.checkpoint_path.exists());
    assert!(!req.audit_path.exists());
}

#[tokio::test]
async fn page_failure_keeps_flushed_waves() {
    let dir = tempdir().unwrap();
    let req = request(dir.path(), true);
    let crm = Arc::new(FakeCrm::default());
    let warehouse = ScriptedWarehouse {
        page_sizes: vec![150, 150],
        fail_at_page: Some(1),
        ..Default::default()
    };

    let err = engine(warehouse, &crm).run(&req).await.unwrap_err();
    match err {
        SyncError::PageFetch {
            pages_completed,
            waves_completed,
            ..
        } => {
            assert_eq!(pages_completed, 1);
            assert_eq!(waves_completed, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(checkpoint_ids(&req.checkpoint_path).await.len(), 150);
    assert_eq!(audit_lines(&req.audit_path).len(), 151);
}

#[tokio::test]
async fn missing_configuration_makes_no_remote_calls() {
    let dir = tempdir().unwrap();
    let mut req = request(dir.path(), true);
    req.id_column = String::new();
    let crm = Arc::new(FakeCrm::default());

    let err = engine(numbered_pages(&[5]), &crm).run(&req).await.unwrap_err();
    assert!(matches!(err, SyncError::Config(msg) if msg.contains("identifier column")));
    assert_eq!(crm.call_count(), 0);
}

#[tokio::test]
async fn observer_sees_run_lifecycle() {
    let dir = tempdir().unwrap();
    let mut req = request(dir.path(), false);
    req.wave_size = 2;
    let crm = Arc::new(FakeCrm::default());
    let (observer, mut rx) = ChannelObserver::new();

    let summary = engine(numbered_pages(&[3]), &crm)
        .with_observer(Arc::new(observer))
        .run(&req)
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.len(), 5);
    assert!(matches!(
        events[0],
        SyncEvent::RunStarted { already_processed: 0, applied: false, .. }
    ));
    assert!(matches!(events[1], SyncEvent::PageFetched { page: 1, rows: 3, pending: 3, .. }));
    assert!(matches!(
        events[2],
        SyncEvent::WaveCompleted { wave: 1, dry_run: 2, processed_total: 2, .. }
    ));
    assert!(matches!(
        events[3],
        SyncEvent::WaveCompleted { wave: 2, dry_run: 1, processed_total: 3, .. }
    ));
    match &events[4] {
        SyncEvent::RunFinished { run_id, fetched, .. } => {
            assert_eq!(*run_id, summary.run_id);
            assert_eq!(*fetched, 3);
        }
        other => panic!("unexpected final event: {other:?}"),
    }
}
