//! Per-job control handle shared by the driver and the admin layer.
//!
//! # States
//!
//! ```text
//!            claim (CAS)                 request_stop / request_pause
//!  ┌──────┐ ────────────▶ ┌─────────┐ ─────────────────────────────▶ ┌──────────┐
//!  │ IDLE │               │ RUNNING │                                │ STOPPING │
//!  └──────┘ ◀──────────── └─────────┘ ◀───────────┐                  └──────────┘
//!     ▲ │      release                            └──── release ─────────┘
//!     │ │ not configured
//!     │ ▼
//!  ┌──────────┐
//!  │ DISABLED │ (left again by the next successful claim)
//!  └──────────┘
//! ```
//!
//! The run's terminal outcome (`completed`, `completed-with-errors`, `stopped`, `failed`)
//! is kept in `last_summary`; the machine itself returns to `idle` when the claim is released.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job::JobKind;
use crate::resume::ResumeState;
use crate::store::ScanStore;
use crate::summary::RunSummary;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const DISABLED: u8 = 2;

/// Externally visible machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Disabled,
    Idle,
    Running,
    Stopping,
}

/// Errors from explicit control calls.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("resume state for {found} cannot be stored on {expected}")]
    KindMismatch { expected: JobKind, found: JobKind },

    #[error(transparent)]
    Storage(#[from] sigscan_common::Error),
}

/// Plug-in resume behavior: shape normalization and validity.
#[derive(Debug, Clone, Copy)]
pub struct ResumePolicy {
    pub normalize: fn(JobKind, &Value) -> Option<ResumeState>,
    pub validate: fn(&ResumeState) -> bool,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self {
            normalize: ResumeState::normalize,
            validate: ResumeState::can_resume,
        }
    }
}

/// Live counters for the current (or most recent) run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub processed: usize,
    pub detected: usize,
    pub failed: usize,
    pub recovered: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ScanProgress {
    total: AtomicUsize,
    processed: AtomicUsize,
    detected: AtomicUsize,
    failed: AtomicUsize,
    recovered: AtomicUsize,
}

impl ScanProgress {
    pub(crate) fn reset(&self, start: ProgressSnapshot) {
        self.total.store(start.total, Ordering::Relaxed);
        self.processed.store(start.processed, Ordering::Relaxed);
        self.detected.store(start.detected, Ordering::Relaxed);
        self.failed.store(start.failed, Ordering::Relaxed);
        self.recovered.store(start.recovered, Ordering::Relaxed);
    }

    pub(crate) fn record_item(&self, detected: bool, failed: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if detected {
            self.detected.fetch_add(1, Ordering::Relaxed);
        }
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_recovered(&self, detected: bool) {
        self.recovered.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .failed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if detected {
            self.detected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            detected: self.detected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }
}

/// Status report for the admin layer. `extra` fields are merged at the top level.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub job: JobKind,
    pub status: ScanStatus,
    pub is_running: bool,
    pub is_stopping: bool,
    pub pause_requested: bool,
    pub can_resume: bool,
    pub progress: ProgressSnapshot,
    pub last_run: Option<RunSummary>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Default)]
struct RunControl {
    token: Option<CancellationToken>,
}

/// Control handle for one job family.
pub struct ScanState {
    kind: JobKind,
    status: AtomicU8,
    stopping: AtomicBool,
    pause_requested: AtomicBool,
    control: Mutex<RunControl>,
    resume: RwLock<Option<ResumeState>>,
    extra_status: RwLock<Map<String, Value>>,
    last_summary: RwLock<Option<RunSummary>>,
    progress: ScanProgress,
    policy: ResumePolicy,
    store: Option<Arc<ScanStore>>,
}

impl ScanState {
    /// In-memory state with the default resume policy.
    pub fn new(kind: JobKind) -> Self {
        Self::with_policy(kind, None, ResumePolicy::default())
    }

    /// State backed by a store; any persisted resume snapshot is loaded immediately.
    pub fn with_store(kind: JobKind, store: Arc<ScanStore>) -> Self {
        Self::with_policy(kind, Some(store), ResumePolicy::default())
    }

    /// Fully specified constructor.
    pub fn with_policy(kind: JobKind, store: Option<Arc<ScanStore>>, policy: ResumePolicy) -> Self {
        let resume = store
            .as_ref()
            .and_then(|store| load_resume(kind, store, &policy));

        Self {
            kind,
            status: AtomicU8::new(IDLE),
            stopping: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            control: Mutex::new(RunControl::default()),
            resume: RwLock::new(resume),
            extra_status: RwLock::new(Map::new()),
            last_summary: RwLock::new(None),
            progress: ScanProgress::default(),
            policy,
            store,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Current machine state.
    pub fn status(&self) -> ScanStatus {
        match self.status.load(Ordering::Acquire) {
            RUNNING if self.is_stopping() => ScanStatus::Stopping,
            RUNNING => ScanStatus::Running,
            DISABLED => ScanStatus::Disabled,
            _ => ScanStatus::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == RUNNING
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Full status report with `extra_status` merged in. No side effects.
    pub fn get_status(&self) -> StatusReport {
        StatusReport {
            job: self.kind,
            status: self.status(),
            is_running: self.is_running(),
            is_stopping: self.is_stopping(),
            pause_requested: self.pause_requested.load(Ordering::Acquire),
            can_resume: self.can_resume(),
            progress: self.progress.snapshot(),
            last_run: self.last_summary(),
            extra: read(&self.extra_status).clone(),
        }
    }

    /// Ask the active run to stop admitting work. Idempotent; ignored when idle.
    pub fn request_stop(&self) -> bool {
        let control = lock(&self.control);
        if self.status.load(Ordering::Acquire) != RUNNING {
            debug!(job = %self.kind, "Stop requested while idle, ignoring");
            return false;
        }

        if !self.stopping.swap(true, Ordering::AcqRel) {
            info!(job = %self.kind, "Stop requested");
        }
        if let Some(token) = &control.token {
            token.cancel();
        }
        true
    }

    /// Same signal as `request_stop`, recorded as a pause for operators.
    ///
    /// Returns false for job types that cannot be paused or when nothing is running.
    pub fn request_pause(&self) -> bool {
        if !self.kind.supports_pause() {
            warn!(job = %self.kind, "Pause is not supported for this job");
            return false;
        }

        let accepted = self.request_stop();
        if accepted {
            self.pause_requested.store(true, Ordering::Release);
        }
        accepted
    }

    /// True iff a snapshot exists and the policy accepts it.
    pub fn can_resume(&self) -> bool {
        read(&self.resume)
            .as_ref()
            .map_or(false, |state| state.kind() == self.kind && (self.policy.validate)(state))
    }

    /// Current snapshot, if any.
    pub fn resume_state(&self) -> Option<ResumeState> {
        read(&self.resume).clone()
    }

    /// Overwrite or clear the resume snapshot (memory first, then the store).
    pub fn set_resume_state(&self, state: Option<ResumeState>) -> Result<(), StateError> {
        if let Some(found) = state.as_ref().map(ResumeState::kind) {
            if found != self.kind {
                return Err(StateError::KindMismatch {
                    expected: self.kind,
                    found,
                });
            }
        }

        *write(&self.resume) = state.clone();

        if let Some(store) = &self.store {
            let persisted = match &state {
                Some(snapshot) => store.save_resume_state(snapshot),
                None => store.clear_resume_state(self.kind),
            };
            persisted.map_err(|e| {
                sigscan_common::Error::Storage(format!("{:#}", e))
                    .with_context(format!("persisting {} resume state", self.kind))
            })?;
        }

        debug!(job = %self.kind, present = state.is_some(), "Resume state updated");
        Ok(())
    }

    /// Merge reporting fields without touching the state machine.
    pub fn set_extra_status(&self, fields: Map<String, Value>) {
        write(&self.extra_status).extend(fields);
    }

    /// Live counters for the current or last run.
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Summary of the most recent run that claimed this job.
    pub fn last_summary(&self) -> Option<RunSummary> {
        read(&self.last_summary).clone()
    }

    // ========================================================================
    // Driver-side operations
    // ========================================================================

    /// Atomically claim `idle|disabled → running`. No suspension point precedes this.
    pub(crate) fn try_claim(&self) -> Option<RunClaim<'_>> {
        self.status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s != RUNNING).then_some(RUNNING)
            })
            .ok()?;

        let token = CancellationToken::new();
        {
            let mut control = lock(&self.control);
            // A stop may land between the CAS and here
            if self.is_stopping() {
                token.cancel();
            }
            control.token = Some(token.clone());
        }

        Some(RunClaim { state: self, token })
    }

    /// Record that the upstream is not configured. Never touches a running claim.
    pub(crate) fn mark_disabled(&self) {
        let _ = self
            .status
            .compare_exchange(IDLE, DISABLED, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn progress_counters(&self) -> &ScanProgress {
        &self.progress
    }

    pub(crate) fn record_summary(&self, summary: &RunSummary) {
        *write(&self.last_summary) = Some(summary.clone());
    }

    fn release(&self) {
        let mut control = lock(&self.control);
        control.token = None;
        self.stopping.store(false, Ordering::Release);
        self.pause_requested.store(false, Ordering::Release);
        self.status.store(IDLE, Ordering::Release);
    }
}

/// Exclusive ownership of a job for one run. Dropping it releases the job.
pub(crate) struct RunClaim<'a> {
    state: &'a ScanState,
    token: CancellationToken,
}

impl RunClaim<'_> {
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.state.release();
    }
}

fn load_resume(kind: JobKind, store: &ScanStore, policy: &ResumePolicy) -> Option<ResumeState> {
    match store.load_resume_state(kind) {
        Ok(Some(raw)) => {
            let state = (policy.normalize)(kind, &raw);
            if state.is_none() {
                warn!(job = %kind, "Discarding unreadable resume snapshot");
            }
            state
        }
        Ok(None) => None,
        Err(e) => {
            warn!(job = %kind, error = %e, "Failed to load resume snapshot");
            None
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resume::ScanCursor;
    use serde_json::json;

    fn snapshot(kind: JobKind, next_index: usize) -> ResumeState {
        let tickers: Vec<String> = (0..10).map(|i| format!("T{}", i)).collect();
        let mut cursor = ScanCursor::start(tickers);
        cursor.next_index = next_index;
        ResumeState::new(kind, "2026-03-13", cursor)
    }

    #[test]
    fn test_claim_is_exclusive() {
        let state = ScanState::new(JobKind::DailyFetch);
        let claim = state.try_claim().expect("first claim");
        assert!(state.is_running());
        assert!(state.try_claim().is_none());

        drop(claim);
        assert_eq!(state.status(), ScanStatus::Idle);
        assert!(state.try_claim().is_some());
    }

    #[test]
    fn test_stop_ignored_when_idle() {
        let state = ScanState::new(JobKind::DailyFetch);
        assert!(!state.request_stop());
        assert!(!state.is_stopping());
    }

    #[test]
    fn test_stop_cancels_token_and_resets_on_release() {
        let state = ScanState::new(JobKind::WeeklyFetch);
        let claim = state.try_claim().unwrap();
        let token = claim.token().clone();

        assert!(state.request_stop());
        assert!(state.request_stop());
        assert_eq!(state.status(), ScanStatus::Stopping);
        assert!(token.is_cancelled());

        drop(claim);
        assert!(!state.is_running());
        assert!(!state.is_stopping());
    }

    #[test]
    fn test_pause_respects_job_support() {
        let rebuild = ScanState::new(JobKind::TableRebuild);
        let _claim = rebuild.try_claim().unwrap();
        assert!(!rebuild.request_pause());
        assert!(!rebuild.is_stopping());

        let daily = ScanState::new(JobKind::DailyFetch);
        let _claim = daily.try_claim().unwrap();
        assert!(daily.request_pause());
        assert!(daily.get_status().pause_requested);
        assert!(daily.is_stopping());
    }

    #[test]
    fn test_disabled_does_not_override_running() {
        let state = ScanState::new(JobKind::DetectorScan);
        state.mark_disabled();
        assert_eq!(state.status(), ScanStatus::Disabled);

        let claim = state.try_claim().unwrap();
        state.mark_disabled();
        assert_eq!(state.status(), ScanStatus::Running);
        drop(claim);
        assert_eq!(state.status(), ScanStatus::Idle);
    }

    #[test]
    fn test_resume_state_round_trip() {
        let state = ScanState::new(JobKind::DailyFetch);
        assert!(!state.can_resume());

        state.set_resume_state(Some(snapshot(JobKind::DailyFetch, 4))).unwrap();
        assert!(state.can_resume());

        state.set_resume_state(None).unwrap();
        assert!(!state.can_resume());
        assert!(state.resume_state().is_none());
    }

    #[test]
    fn test_resume_state_kind_mismatch() {
        let state = ScanState::new(JobKind::DailyFetch);
        let err = state
            .set_resume_state(Some(snapshot(JobKind::WeeklyFetch, 1)))
            .unwrap_err();
        assert!(matches!(err, StateError::KindMismatch { .. }));
        assert!(state.resume_state().is_none());
    }

    #[test]
    fn test_invalid_snapshot_is_not_resumable() {
        let state = ScanState::new(JobKind::DailyFetch);
        state.set_resume_state(Some(snapshot(JobKind::DailyFetch, 10))).unwrap();
        assert!(state.resume_state().is_some());
        assert!(!state.can_resume());
    }

    #[test]
    fn test_custom_policy_validator() {
        fn never(_: &ResumeState) -> bool {
            false
        }
        let policy = ResumePolicy {
            validate: never,
            ..Default::default()
        };
        let state = ScanState::with_policy(JobKind::DailyFetch, None, policy);
        state.set_resume_state(Some(snapshot(JobKind::DailyFetch, 2))).unwrap();
        assert!(!state.can_resume());
    }

    #[test]
    fn test_extra_status_merges_into_report() {
        let state = ScanState::new(JobKind::DetectorScan);
        let mut fields = Map::new();
        fields.insert("last_published".into(), json!("2026-03-12"));
        state.set_extra_status(fields);

        let mut more = Map::new();
        more.insert("universe".into(), json!("us_equities"));
        state.set_extra_status(more);

        let report = serde_json::to_value(state.get_status()).unwrap();
        assert_eq!(report["last_published"], "2026-03-12");
        assert_eq!(report["universe"], "us_equities");
        assert_eq!(report["status"], "idle");
    }

    #[test]
    fn test_snapshot_survives_restart() {
        let store = Arc::new(ScanStore::in_memory().unwrap());
        {
            let state = ScanState::with_store(JobKind::DailyFetch, Arc::clone(&store));
            state.set_resume_state(Some(snapshot(JobKind::DailyFetch, 3))).unwrap();
        }

        let reopened = ScanState::with_store(JobKind::DailyFetch, Arc::clone(&store));
        assert!(reopened.can_resume());
        assert_eq!(reopened.resume_state().unwrap().cursor().next_index, 3);

        reopened.set_resume_state(None).unwrap();
        let again = ScanState::with_store(JobKind::DailyFetch, store);
        assert!(again.resume_state().is_none());
    }

    #[test]
    fn test_store_failure_is_a_storage_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = dir.path().join("scans.db");
        let store = Arc::new(ScanStore::open(&db_path).unwrap());
        let state = ScanState::with_store(JobKind::DailyFetch, store);

        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute("DROP TABLE scan_resume_state", []).unwrap();
        drop(conn);

        let err = state
            .set_resume_state(Some(snapshot(JobKind::DailyFetch, 2)))
            .unwrap_err();
        match &err {
            StateError::Storage(inner) => {
                assert!(matches!(inner, sigscan_common::Error::WithContext { .. }));
                assert!(!inner.is_cancelled());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().starts_with("persisting daily_fetch resume state"));
        // Memory is updated before the store write
        assert!(state.can_resume());
    }

    #[test]
    fn test_progress_counters() {
        let state = ScanState::new(JobKind::DailyFetch);
        let progress = state.progress_counters();
        progress.reset(ProgressSnapshot {
            total: 3,
            ..Default::default()
        });
        progress.record_item(true, false);
        progress.record_item(false, true);
        progress.record_recovered(false);

        assert_eq!(
            state.progress(),
            ProgressSnapshot {
                total: 3,
                processed: 2,
                detected: 1,
                failed: 0,
                recovered: 1,
            }
        );
    }
}
