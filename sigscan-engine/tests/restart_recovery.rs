//! Restart recovery: resume snapshots and run history survive reopening the store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tempfile::TempDir;

use sigscan_engine::{
    DriverOptions, ItemContext, ItemOutcome, JobKind, MetricsTracker, RunOptions, RunStatus,
    ScanDeps, ScanDriver, ScanRegistry, ScanState, ScanStore,
};

/// Universe provider that stops its job after a fixed number of items
struct StoppingDeps {
    tickers: Vec<String>,
    registry: Arc<ScanRegistry>,
    job: JobKind,
    stop_after: Option<usize>,
    completed: AtomicUsize,
    seen: Mutex<HashSet<String>>,
}

impl StoppingDeps {
    fn new(registry: Arc<ScanRegistry>, job: JobKind, n: usize, stop_after: Option<usize>) -> Self {
        Self {
            tickers: (0..n).map(|i| format!("S{:03}", i)).collect(),
            registry,
            job,
            stop_after,
            completed: AtomicUsize::new(0),
            seen: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl ScanDeps for StoppingDeps {
    fn is_configured(&self) -> bool {
        true
    }

    async fn get_tickers(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.tickers.clone())
    }

    async fn process_item(&self, ticker: &str, _ctx: &ItemContext) -> anyhow::Result<ItemOutcome> {
        self.seen.lock().unwrap().insert(ticker.to_string());
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if Some(done) == self.stop_after {
            self.registry.get(self.job).request_pause();
        }
        Ok(ItemOutcome::clean())
    }

    async fn sweep_cache(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn create_metrics_tracker(&self, job: JobKind) -> Option<Arc<MetricsTracker>> {
        Some(self.registry.metrics_tracker(job))
    }
}

fn sequential() -> ScanDriver {
    ScanDriver::new(DriverOptions {
        concurrency: 1,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_paused_run_resumes_after_restart() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("scans.db");

    let first_run_id = {
        let store = Arc::new(ScanStore::open(&db_path).unwrap());
        let registry = Arc::new(ScanRegistry::new(Some(store)));
        let deps = StoppingDeps::new(Arc::clone(&registry), JobKind::DailyFetch, 12, Some(4));

        let state = registry.get(JobKind::DailyFetch);
        let summary = sequential().run(&state, &deps, RunOptions::default()).await;

        assert_eq!(summary.status, RunStatus::Stopped);
        assert_eq!(summary.processed_tickers, 4);
        assert!(state.can_resume());
        assert!(!state.get_status().pause_requested);
        summary.run_id.unwrap()
    };

    // Process restart
    let store = Arc::new(ScanStore::open(&db_path).unwrap());
    let registry = Arc::new(ScanRegistry::new(Some(Arc::clone(&store))));
    let state = registry.get(JobKind::DailyFetch);
    assert!(state.can_resume());
    assert_eq!(state.resume_state().unwrap().cursor().next_index, 4);

    let deps = StoppingDeps::new(Arc::clone(&registry), JobKind::DailyFetch, 12, None);
    let summary = sequential().run(&state, &deps, RunOptions::default()).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert!(summary.resumed);
    assert_eq!(summary.processed_tickers, 12);
    assert_eq!(deps.seen.lock().unwrap().len(), 8);
    assert!(!deps.seen.lock().unwrap().contains("S000"));

    // Cleared on disk as well
    let reopened = ScanState::with_store(JobKind::DailyFetch, Arc::clone(&store));
    assert!(reopened.resume_state().is_none());

    let history = store.recent_run_metrics(Some(JobKind::DailyFetch), 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, RunStatus::Completed);
    assert_eq!(history[1].run_id, first_run_id);
    assert_eq!(history[1].status, RunStatus::Stopped);
}

#[tokio::test]
async fn test_legacy_snapshot_is_normalized_on_load() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("scans.db");
    let store = Arc::new(ScanStore::open(&db_path).unwrap());

    // Older flat camelCase layout written by a previous release
    let legacy = serde_json::json!({
        "asOfDate": "2026-03-12",
        "totalTickers": 3,
        "nextIndex": 1,
        "failedTickers": [],
        "tickers": ["AAA", "BBB", "CCC"]
    });
    let conn = Connection::open(&db_path).unwrap();
    conn.execute(
        "INSERT INTO scan_resume_state (job_type, state_json, updated_at) VALUES (?1, ?2, ?3)",
        params!["detector_scan", legacy.to_string(), "2026-03-12T20:00:00+00:00"],
    )
    .unwrap();
    drop(conn);

    let registry = Arc::new(ScanRegistry::new(Some(store)));
    let state = registry.get(JobKind::DetectorScan);
    assert!(state.can_resume());

    let deps = StoppingDeps::new(Arc::clone(&registry), JobKind::DetectorScan, 3, None);
    let summary = sequential().run(&state, &deps, RunOptions::default()).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.as_of_date.as_deref(), Some("2026-03-12"));
    let seen = deps.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(!seen.contains("AAA"));
}

#[tokio::test]
async fn test_garbage_snapshot_is_discarded() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("scans.db");
    let store = Arc::new(ScanStore::open(&db_path).unwrap());

    let conn = Connection::open(&db_path).unwrap();
    conn.execute(
        "INSERT INTO scan_resume_state (job_type, state_json, updated_at) VALUES (?1, ?2, ?3)",
        params!["weekly_fetch", "{not json", "2026-03-12T20:00:00+00:00"],
    )
    .unwrap();
    drop(conn);

    let state = ScanState::with_store(JobKind::WeeklyFetch, store);
    assert!(state.resume_state().is_none());
    assert!(!state.can_resume());
}
