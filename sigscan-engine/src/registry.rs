//! One long-lived `ScanState` per job family.

use std::sync::Arc;

use crate::job::JobKind;
use crate::metrics::MetricsTracker;
use crate::state::{ScanState, StatusReport};
use crate::store::ScanStore;

/// Owns the control handle of every job type.
pub struct ScanRegistry {
    states: [Arc<ScanState>; 4],
    store: Option<Arc<ScanStore>>,
}

impl ScanRegistry {
    /// Build all job states. With a store, persisted resume snapshots are reloaded.
    pub fn new(store: Option<Arc<ScanStore>>) -> Self {
        let states = JobKind::ALL.map(|kind| {
            Arc::new(match &store {
                Some(store) => ScanState::with_store(kind, Arc::clone(store)),
                None => ScanState::new(kind),
            })
        });

        Self { states, store }
    }

    pub fn get(&self, kind: JobKind) -> Arc<ScanState> {
        Arc::clone(&self.states[slot(kind)])
    }

    /// Status of every job, in `JobKind::ALL` order.
    pub fn statuses(&self) -> Vec<StatusReport> {
        self.states.iter().map(|state| state.get_status()).collect()
    }

    pub fn store(&self) -> Option<&Arc<ScanStore>> {
        self.store.as_ref()
    }

    /// Tracker whose snapshot lands in this registry's store, for use from
    /// `ScanDeps::create_metrics_tracker`.
    pub fn metrics_tracker(&self, kind: JobKind) -> Arc<MetricsTracker> {
        Arc::new(match &self.store {
            Some(store) => MetricsTracker::with_sink(kind, Arc::clone(store)),
            None => MetricsTracker::new(kind),
        })
    }

    /// Ask every running job to stop. Returns how many accepted.
    pub fn stop_all(&self) -> usize {
        self.states
            .iter()
            .filter(|state| state.request_stop())
            .count()
    }
}

fn slot(kind: JobKind) -> usize {
    match kind {
        JobKind::DailyFetch => 0,
        JobKind::WeeklyFetch => 1,
        JobKind::DetectorScan => 2,
        JobKind::TableRebuild => 3,
    }
}
