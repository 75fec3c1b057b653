//! Per-run metrics accumulation.
//!
//! A `MetricsTracker` is created per run by `ScanDeps::create_metrics_tracker`. Counters are
//! lock-free; latencies are buffered so percentiles can be computed once at finalize time.
//! When a store sink is attached, `finalize` appends exactly one `RunMetricsSnapshot` to the
//! run history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::job::JobKind;
use crate::store::ScanStore;
use crate::summary::RunStatus;

/// Persisted, append-only record of one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetricsSnapshot {
    pub run_id: String,
    pub run_type: JobKind,
    pub status: RunStatus,
    /// Serialized `MetricsCounters`
    pub metrics: Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Nearest-rank latency percentiles in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub count: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

impl LatencyPercentiles {
    fn from_samples(mut samples: Vec<u64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();

        let rank = |p: usize| {
            let idx = (p * samples.len()).div_ceil(100).saturating_sub(1);
            samples[idx.min(samples.len() - 1)]
        };

        Self {
            count: samples.len(),
            p50_ms: rank(50),
            p95_ms: rank(95),
            p99_ms: rank(99),
            max_ms: samples[samples.len() - 1],
        }
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsCounters {
    pub api_calls: u64,
    pub api_failures: u64,
    pub rate_limited: u64,
    pub db_flushes: u64,
    pub rows_written: u64,
    pub tickers_processed: u64,
    pub tickers_detected: u64,
    pub tickers_failed: u64,
    pub tickers_recovered: u64,
    pub latency: LatencyPercentiles,
}

/// Accumulator for one run.
pub struct MetricsTracker {
    run_id: String,
    run_type: JobKind,
    started_at: DateTime<Utc>,
    api_calls: AtomicU64,
    api_failures: AtomicU64,
    rate_limited: AtomicU64,
    db_flushes: AtomicU64,
    rows_written: AtomicU64,
    tickers_processed: AtomicU64,
    tickers_detected: AtomicU64,
    tickers_failed: AtomicU64,
    tickers_recovered: AtomicU64,
    latencies_ms: Mutex<Vec<u64>>,
    sink: Option<Arc<ScanStore>>,
    finalized: AtomicBool,
}

impl MetricsTracker {
    /// Tracker with no persistence; `finalize` only returns the snapshot.
    pub fn new(run_type: JobKind) -> Self {
        Self::build(run_type, None)
    }

    /// Tracker that appends its snapshot to `store` on finalize.
    pub fn with_sink(run_type: JobKind, store: Arc<ScanStore>) -> Self {
        Self::build(run_type, Some(store))
    }

    fn build(run_type: JobKind, sink: Option<Arc<ScanStore>>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            run_type,
            started_at: Utc::now(),
            api_calls: AtomicU64::new(0),
            api_failures: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            db_flushes: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            tickers_processed: AtomicU64::new(0),
            tickers_detected: AtomicU64::new(0),
            tickers_failed: AtomicU64::new(0),
            tickers_recovered: AtomicU64::new(0),
            latencies_ms: Mutex::new(Vec::new()),
            sink,
            finalized: AtomicBool::new(false),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_type(&self) -> JobKind {
        self.run_type
    }

    /// Successful upstream call and its latency.
    pub fn record_api_call(&self, latency: Duration) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
        self.push_latency(latency);
    }

    /// Failed upstream call. Counts toward `api_calls` as well.
    pub fn record_api_failure(&self, latency: Duration) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
        self.api_failures.fetch_add(1, Ordering::Relaxed);
        self.push_latency(latency);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// One persistence flush that wrote `rows` rows.
    pub fn record_db_flush(&self, rows: u64) {
        self.db_flushes.fetch_add(1, Ordering::Relaxed);
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn record_ticker(&self, detected: bool, failed: bool) {
        self.tickers_processed.fetch_add(1, Ordering::Relaxed);
        if detected {
            self.tickers_detected.fetch_add(1, Ordering::Relaxed);
        }
        if failed {
            self.tickers_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_recovered(&self, detected: bool) {
        self.tickers_recovered.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .tickers_failed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if detected {
            self.tickers_detected.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn push_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latencies_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ms);
    }

    /// Current counter values.
    pub fn counters(&self) -> MetricsCounters {
        let samples = self
            .latencies_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        MetricsCounters {
            api_calls: self.api_calls.load(Ordering::Relaxed),
            api_failures: self.api_failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            db_flushes: self.db_flushes.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            tickers_processed: self.tickers_processed.load(Ordering::Relaxed),
            tickers_detected: self.tickers_detected.load(Ordering::Relaxed),
            tickers_failed: self.tickers_failed.load(Ordering::Relaxed),
            tickers_recovered: self.tickers_recovered.load(Ordering::Relaxed),
            latency: LatencyPercentiles::from_samples(samples),
        }
    }

    /// Build the run's snapshot and persist it to the sink.
    ///
    /// Returns `None` if the tracker was already finalized; history is written once per run.
    pub fn finalize(&self, status: RunStatus) -> Option<RunMetricsSnapshot> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            debug!(run_id = %self.run_id, "Metrics already finalized");
            return None;
        }

        let metrics = match serde_json::to_value(self.counters()) {
            Ok(value) => value,
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Failed to serialize run metrics");
                Value::Null
            }
        };

        let snapshot = RunMetricsSnapshot {
            run_id: self.run_id.clone(),
            run_type: self.run_type,
            status,
            metrics,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };

        if let Some(store) = &self.sink {
            if let Err(e) = store.append_run_metrics(&snapshot) {
                warn!(run_id = %self.run_id, error = %e, "Failed to persist run metrics");
            }
        }

        debug!(run_id = %self.run_id, status = %status, "Run metrics finalized");
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_rank_percentiles() {
        let p = LatencyPercentiles::from_samples((1..=100).collect());
        assert_eq!(p.count, 100);
        assert_eq!(p.p50_ms, 50);
        assert_eq!(p.p95_ms, 95);
        assert_eq!(p.p99_ms, 99);
        assert_eq!(p.max_ms, 100);

        let single = LatencyPercentiles::from_samples(vec![42]);
        assert_eq!(single.p50_ms, 42);
        assert_eq!(single.p99_ms, 42);

        assert_eq!(LatencyPercentiles::from_samples(vec![]), LatencyPercentiles::default());
    }

    #[test]
    fn test_counters_accumulate() {
        let tracker = MetricsTracker::new(JobKind::DailyFetch);
        tracker.record_api_call(Duration::from_millis(20));
        tracker.record_api_failure(Duration::from_millis(80));
        tracker.record_rate_limited();
        tracker.record_db_flush(250);
        tracker.record_db_flush(50);
        tracker.record_ticker(true, false);
        tracker.record_ticker(false, true);
        tracker.record_recovered(false);

        let c = tracker.counters();
        assert_eq!(c.api_calls, 2);
        assert_eq!(c.api_failures, 1);
        assert_eq!(c.rate_limited, 1);
        assert_eq!(c.db_flushes, 2);
        assert_eq!(c.rows_written, 300);
        assert_eq!(c.tickers_processed, 2);
        assert_eq!(c.tickers_detected, 1);
        assert_eq!(c.tickers_failed, 0);
        assert_eq!(c.tickers_recovered, 1);
        assert_eq!(c.latency.max_ms, 80);
    }

    #[test]
    fn test_finalize_persists_once() {
        let store = Arc::new(ScanStore::in_memory().unwrap());
        let tracker = MetricsTracker::with_sink(JobKind::DetectorScan, Arc::clone(&store));
        tracker.record_ticker(true, false);

        let snapshot = tracker.finalize(RunStatus::Completed).unwrap();
        assert_eq!(snapshot.metrics["tickers_detected"], 1);
        assert!(tracker.finalize(RunStatus::Completed).is_none());

        let history = store.recent_run_metrics(Some(JobKind::DetectorScan), 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].run_id, tracker.run_id());
        assert_eq!(history[0].status, RunStatus::Completed);
    }
}
