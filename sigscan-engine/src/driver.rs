//! Orchestrator driver: the generic execution algorithm behind every scan job.
//!
//! # Run Flow
//!
//! ```text
//! is_configured? ──no──▶ disabled
//!       │
//!   claim (CAS) ──taken──▶ running (guard)
//!       │
//!   resume snapshot valid? ──yes──▶ continue at next_index
//!       │ no                 (universe refetched once if the snapshot lacks it)
//!   get_tickers() once ──err──▶ failed
//!       │
//!   first pass (bounded pool, stop check per admission) ──stop──▶ stopped + snapshot
//!       │
//!   retry pass over failures only ──stop──▶ stopped + snapshot
//!       │
//!   sweep_cache() (every claimed run) ─▶ finalize ─▶ release claim
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use sigscan_common::config::ScanConfig;
use sigscan_common::Error;

use crate::job::JobKind;
use crate::metrics::MetricsTracker;
use crate::pool::{run_bounded, with_item_timeout, ItemContext};
use crate::resume::{ResumeState, ScanCursor};
use crate::state::{ProgressSnapshot, ScanState};
use crate::summary::{RunStatus, RunSummary};

/// Result of processing one ticker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemOutcome {
    /// The item matched the job's detection criteria
    pub detected: bool,
}

impl ItemOutcome {
    pub fn detected() -> Self {
        Self { detected: true }
    }

    pub fn clean() -> Self {
        Self { detected: false }
    }
}

/// External collaborators of a run.
#[async_trait]
pub trait ScanDeps: Send + Sync {
    /// Whether the upstream data source is configured. Checked before the claim.
    fn is_configured(&self) -> bool;

    /// Fetch the ticker universe. Called at most once per run, and on resume only when the
    /// snapshot did not keep its ticker list.
    async fn get_tickers(&self) -> anyhow::Result<Vec<String>>;

    /// Process one ticker. Errors are caught at the item boundary.
    async fn process_item(&self, ticker: &str, ctx: &ItemContext) -> anyhow::Result<ItemOutcome>;

    /// Evict stale result-cache entries. Called once per claimed run.
    async fn sweep_cache(&self) -> anyhow::Result<()>;

    /// Per-run metrics tracker; `None` suppresses all metrics bookkeeping.
    fn create_metrics_tracker(&self, _job: JobKind) -> Option<Arc<MetricsTracker>> {
        None
    }

    /// Market date a fresh run works on.
    fn as_of_date(&self) -> String {
        Local::now().date_naive().format("%Y-%m-%d").to_string()
    }
}

/// Per-invocation options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Ignore any resume snapshot; it is discarded once the new universe is fetched
    pub force_fresh: bool,
}

impl RunOptions {
    pub fn fresh() -> Self {
        Self { force_fresh: true }
    }
}

/// Driver tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverOptions {
    /// Maximum in-flight items
    pub concurrency: usize,
    /// Per-item deadline; `None` disables it
    pub item_timeout: Option<Duration>,
    /// Whether to run the single retry pass
    pub retry_failed: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            item_timeout: None,
            retry_failed: true,
        }
    }
}

/// Executes runs against a `ScanState`. Stateless apart from its options.
#[derive(Debug, Clone, Default)]
pub struct ScanDriver {
    options: DriverOptions,
}

/// Where the work of a run ended up before finalization.
struct ScanProgressState {
    cursor: ScanCursor,
    anchor: Option<String>,
    resumed: bool,
    stopped: bool,
}

impl ScanDriver {
    pub fn new(options: DriverOptions) -> Self {
        Self { options }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        Self::new(DriverOptions {
            concurrency: config.concurrency.max(1),
            item_timeout: (config.item_timeout_secs > 0)
                .then(|| Duration::from_secs(config.item_timeout_secs)),
            retry_failed: config.retry_failed,
        })
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// Run one scan for `state`'s job. Never panics or returns an error; every path yields a
    /// summary.
    pub async fn run<D>(&self, state: &ScanState, deps: &D, options: RunOptions) -> RunSummary
    where
        D: ScanDeps + ?Sized,
    {
        let job = state.kind();

        if !deps.is_configured() {
            state.mark_disabled();
            info!(job = %job, "Upstream not configured, scan disabled");
            return RunSummary::disabled(job);
        }

        // Claim before the first await so a concurrent caller sees `running`
        let Some(claim) = state.try_claim() else {
            debug!(job = %job, "Scan already running, skipping");
            return RunSummary::already_running(job);
        };

        let tracker = deps.create_metrics_tracker(job);
        let run_id = tracker
            .as_ref()
            .map(|t| t.run_id().to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let span = info_span!("scan_run", job = %job, run_id = %run_id);
        let summary = self
            .execute(state, deps, claim.token(), tracker, run_id, options)
            .instrument(span)
            .await;

        state.record_summary(&summary);
        drop(claim);
        summary
    }

    async fn execute<D>(
        &self,
        state: &ScanState,
        deps: &D,
        token: &CancellationToken,
        tracker: Option<Arc<MetricsTracker>>,
        run_id: String,
        options: RunOptions,
    ) -> RunSummary
    where
        D: ScanDeps + ?Sized,
    {
        let started_at = Utc::now();
        let outcome = self.scan(state, deps, token, tracker.as_ref(), options).await;

        if let Err(e) = deps.sweep_cache().await {
            warn!(error = %e, "Cache sweep failed");
        }

        let summary = match outcome {
            Ok(progress) => self.finalize(state, progress, run_id, started_at),
            Err(e) => {
                error!(error = %e, "Scan failed before processing");
                RunSummary::failed(state.kind(), run_id, started_at, e.to_string())
            }
        };

        if let Some(tracker) = &tracker {
            tracker.finalize(summary.status);
        }

        info!(
            status = %summary.status,
            processed = summary.processed_tickers,
            detected = summary.detected_tickers,
            errors = summary.error_tickers,
            recovered = summary.retry_recovered.len(),
            "Scan finished"
        );
        summary
    }

    /// Resume-or-fetch, then the first pass and the retry pass.
    async fn scan<D>(
        &self,
        state: &ScanState,
        deps: &D,
        token: &CancellationToken,
        tracker: Option<&Arc<MetricsTracker>>,
        options: RunOptions,
    ) -> sigscan_common::Result<ScanProgressState>
    where
        D: ScanDeps + ?Sized,
    {
        let job = state.kind();
        let (mut cursor, anchor, resumed) = self.working_set(state, deps, options).await?;

        let progress = state.progress_counters();
        progress.reset(ProgressSnapshot {
            total: cursor.total_tickers,
            processed: cursor.processed_tickers,
            detected: cursor.detected_tickers,
            failed: cursor.failed_tickers.len(),
            recovered: cursor.recovered_tickers.len(),
        });

        info!(
            total = cursor.total_tickers,
            start_index = cursor.next_index,
            carried_failures = cursor.failed_tickers.len(),
            resumed,
            "Scan started"
        );

        let item_ctx = |attempt| ItemContext {
            job,
            cancel: token.child_token(),
            metrics: tracker.cloned(),
            attempt,
        };
        let item_timeout = self.options.item_timeout;

        // First pass over the unadmitted remainder
        let remaining = cursor.remaining().to_vec();
        let start = cursor.next_index;
        let pass = run_bounded(
            &remaining,
            self.options.concurrency,
            || state.is_stopping(),
            |ticker| {
                let ctx = item_ctx(1);
                async move {
                    let result =
                        with_item_timeout(deps.process_item(&ticker, &ctx), item_timeout, &ctx.cancel)
                            .await;
                    (ticker, result)
                }
            },
            |(ticker, result): (String, anyhow::Result<ItemOutcome>)| {
                cursor.processed_tickers += 1;
                match result {
                    Ok(outcome) => {
                        if outcome.detected {
                            cursor.detected_tickers += 1;
                        }
                        progress.record_item(outcome.detected, false);
                        if let Some(t) = tracker {
                            t.record_ticker(outcome.detected, false);
                        }
                    }
                    Err(e) => {
                        if interrupted(&e) {
                            debug!(ticker = %ticker, "Item interrupted by stop");
                        } else {
                            debug!(ticker = %ticker, error = %e, "Item failed");
                        }
                        progress.record_item(false, true);
                        if let Some(t) = tracker {
                            t.record_ticker(false, true);
                        }
                        cursor.failed_tickers.push(ticker);
                    }
                }
            },
        )
        .await;
        cursor.next_index = start + pass.admitted;

        if pass.stopped {
            return Ok(ScanProgressState {
                cursor,
                anchor,
                resumed,
                stopped: true,
            });
        }

        // Retry pass over failures only, strictly after the first pass
        let mut stopped = false;
        if self.options.retry_failed && !cursor.failed_tickers.is_empty() {
            let retry = std::mem::take(&mut cursor.failed_tickers);
            info!(count = retry.len(), "Retrying failed tickers");

            let mut still_failed = Vec::new();
            let pass = run_bounded(
                &retry,
                self.options.concurrency,
                || state.is_stopping(),
                |ticker| {
                    let ctx = item_ctx(2);
                    async move {
                        let result = with_item_timeout(
                            deps.process_item(&ticker, &ctx),
                            item_timeout,
                            &ctx.cancel,
                        )
                        .await;
                        (ticker, result)
                    }
                },
                |(ticker, result): (String, anyhow::Result<ItemOutcome>)| match result {
                    Ok(outcome) => {
                        if outcome.detected {
                            cursor.detected_tickers += 1;
                        }
                        progress.record_recovered(outcome.detected);
                        if let Some(t) = tracker {
                            t.record_recovered(outcome.detected);
                        }
                        cursor.recovered_tickers.push(ticker);
                    }
                    Err(e) => {
                        if interrupted(&e) {
                            debug!(ticker = %ticker, "Retry interrupted by stop");
                        } else {
                            warn!(ticker = %ticker, error = %e, "Item failed after retry");
                        }
                        still_failed.push(ticker);
                    }
                },
            )
            .await;

            // Withheld retries stay pending for the next run
            still_failed.extend(retry.into_iter().skip(pass.admitted));
            cursor.failed_tickers = still_failed;
            stopped = pass.stopped;
        }

        Ok(ScanProgressState {
            cursor,
            anchor,
            resumed,
            stopped,
        })
    }

    /// Pick up a valid snapshot or fetch a fresh universe.
    async fn working_set<D>(
        &self,
        state: &ScanState,
        deps: &D,
        options: RunOptions,
    ) -> sigscan_common::Result<(ScanCursor, Option<String>, bool)>
    where
        D: ScanDeps + ?Sized,
    {
        let job = state.kind();

        if !options.force_fresh && state.can_resume() {
            if let Some(snapshot) = state.resume_state() {
                let mut cursor = snapshot.cursor().clone();

                if cursor.needs_universe() {
                    let tickers = fetch_universe(deps).await?;
                    if tickers.len() != cursor.total_tickers {
                        warn!(
                            expected = cursor.total_tickers,
                            found = tickers.len(),
                            "Universe changed since the snapshot, starting over"
                        );
                        let anchor = job.is_dated().then(|| deps.as_of_date());
                        return Ok((ScanCursor::start(tickers), anchor, false));
                    }
                    cursor.tickers = tickers;
                }

                info!(
                    next_index = cursor.next_index,
                    total = cursor.total_tickers,
                    "Resuming from snapshot"
                );
                let anchor = snapshot.anchor().map(str::to_string);
                return Ok((cursor, anchor, true));
            }
        }

        let tickers = fetch_universe(deps).await?;

        // A failed fetch above leaves any snapshot in place
        if options.force_fresh && state.resume_state().is_some() {
            info!("Fresh run requested, discarding resume snapshot");
            if let Err(e) = state.set_resume_state(None) {
                warn!(error = %e, "Failed to clear resume snapshot");
            }
        }

        let anchor = job.is_dated().then(|| deps.as_of_date());
        Ok((ScanCursor::start(tickers), anchor, false))
    }

    fn finalize(
        &self,
        state: &ScanState,
        progress: ScanProgressState,
        run_id: String,
        started_at: DateTime<Utc>,
    ) -> RunSummary {
        let job = state.kind();
        let ScanProgressState {
            cursor,
            anchor,
            resumed,
            stopped,
        } = progress;

        let status = if stopped {
            let snapshot = ResumeState::new(job, anchor.clone().unwrap_or_default(), cursor.clone());
            if let Err(e) = state.set_resume_state(Some(snapshot)) {
                warn!(error = %e, "Failed to save resume snapshot");
            }
            info!(next_index = cursor.next_index, "Scan stopped, resume snapshot saved");
            RunStatus::Stopped
        } else {
            if state.resume_state().is_some() {
                if let Err(e) = state.set_resume_state(None) {
                    warn!(error = %e, "Failed to clear resume snapshot");
                }
            }
            if cursor.failed_tickers.is_empty() {
                RunStatus::Completed
            } else {
                RunStatus::CompletedWithErrors
            }
        };

        RunSummary {
            job,
            status,
            run_id: Some(run_id),
            as_of_date: anchor,
            resumed,
            total_tickers: cursor.total_tickers,
            processed_tickers: cursor.processed_tickers,
            detected_tickers: cursor.detected_tickers,
            error_tickers: cursor.failed_tickers.len(),
            failed_tickers: cursor.failed_tickers,
            retry_recovered: cursor.recovered_tickers,
            started_at,
            finished_at: Utc::now(),
            error: None,
        }
    }
}

async fn fetch_universe<D>(deps: &D) -> sigscan_common::Result<Vec<String>>
where
    D: ScanDeps + ?Sized,
{
    deps.get_tickers()
        .await
        .map_err(|e| Error::Universe(format!("{:#}", e)))
}

/// The worker gave up because its token was cancelled.
fn interrupted(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Error>().is_some_and(Error::is_cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let mut config = ScanConfig::default();
        config.concurrency = 3;
        config.item_timeout_secs = 0;
        config.retry_failed = false;

        let driver = ScanDriver::from_config(&config);
        assert_eq!(driver.options().concurrency, 3);
        assert!(driver.options().item_timeout.is_none());
        assert!(!driver.options().retry_failed);

        config.item_timeout_secs = 45;
        let driver = ScanDriver::from_config(&config);
        assert_eq!(driver.options().item_timeout, Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_fresh_options() {
        assert!(RunOptions::fresh().force_fresh);
        assert!(!RunOptions::default().force_fresh);
    }

    #[test]
    fn test_interrupted_only_for_cancellation() {
        assert!(interrupted(&anyhow::Error::new(Error::Cancelled)));
        assert!(interrupted(&anyhow::Error::new(
            Error::Cancelled.with_context("fetching bars")
        )));
        assert!(!interrupted(&anyhow::Error::new(Error::Timeout(5))));
        assert!(!interrupted(&anyhow::anyhow!("upstream error")));
    }
}
