//! Cron-based recurring triggers for scan jobs.
//!
//! Each job family gets one `ScanScheduler`. It sleeps until the next cron boundary,
//! skipping non-trading days when configured, then invokes the driver. Concurrency safety
//! comes from the driver's claim: a tick that lands while a run is active returns `running`
//! and is simply logged.
//!
//! # Schedule Configuration
//!
//! ```json
//! {
//!   "scan": {
//!     "schedules": {
//!       "daily_fetch": { "enabled": true, "cron": "0 30 18 * * MON-FRI", "trading_days_only": true },
//!       "weekly_fetch": { "enabled": true, "cron": "0 0 10 * * SAT", "trading_days_only": false }
//!     }
//!   }
//! }
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Weekday};
use cron::Schedule;
use serde_json::{json, Map};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sigscan_common::config::{JobScheduleConfig, SchedulesConfig};

use crate::driver::{RunOptions, ScanDeps, ScanDriver};
use crate::job::JobKind;
use crate::state::ScanState;
use crate::summary::{RunStatus, RunSummary};

/// Upper bound on cron candidates examined when looking for a trading day.
const MAX_LOOKAHEAD: usize = 512;

/// Market calendar boundary.
pub trait TradingCalendar: Send + Sync {
    fn is_trading_day(&self, date: NaiveDate) -> bool;
}

/// Monday to Friday, minus an explicit holiday list.
#[derive(Debug, Clone, Default)]
pub struct WeekdayCalendar {
    holidays: HashSet<NaiveDate>,
}

impl WeekdayCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_holidays(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }
}

impl TradingCalendar for WeekdayCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }
}

/// Schedule entry for `kind`.
pub fn schedule_for(schedules: &SchedulesConfig, kind: JobKind) -> &JobScheduleConfig {
    match kind {
        JobKind::DailyFetch => &schedules.daily_fetch,
        JobKind::WeeklyFetch => &schedules.weekly_fetch,
        JobKind::DetectorScan => &schedules.detector_scan,
        JobKind::TableRebuild => &schedules.table_rebuild,
    }
}

/// Recurring trigger for one job.
pub struct ScanScheduler<D: ScanDeps + ?Sized> {
    job: JobKind,
    /// `None` when the schedule is disabled
    schedule: Option<Schedule>,
    trading_days_only: bool,
    driver: ScanDriver,
    state: Arc<ScanState>,
    deps: Arc<D>,
    calendar: Arc<dyn TradingCalendar>,
    shutdown: CancellationToken,
}

impl<D: ScanDeps + ?Sized> ScanScheduler<D> {
    pub fn new(
        config: &JobScheduleConfig,
        driver: ScanDriver,
        state: Arc<ScanState>,
        deps: Arc<D>,
        calendar: Arc<dyn TradingCalendar>,
    ) -> Result<Self> {
        let job = state.kind();
        let schedule = if config.enabled {
            let schedule = Schedule::from_str(&config.cron)
                .with_context(|| format!("Invalid {} cron: {}", job, config.cron))?;
            info!(job = %job, cron = %config.cron, trading_days_only = config.trading_days_only, "Scheduler configured");
            Some(schedule)
        } else {
            None
        };

        Ok(Self {
            job,
            schedule,
            trading_days_only: config.trading_days_only,
            driver,
            state,
            deps,
            calendar,
            shutdown: CancellationToken::new(),
        })
    }

    /// Replace the shutdown token, e.g. with a child of a service-wide token.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.schedule.is_some()
    }

    /// Next firing time strictly after `after`, honouring the trading calendar.
    pub fn next_fire_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let schedule = self.schedule.as_ref()?;
        schedule
            .after(after)
            .take(MAX_LOOKAHEAD)
            .find(|t| !self.trading_days_only || self.calendar.is_trading_day(t.date_naive()))
    }

    /// Trigger one run immediately (manual trigger path).
    pub async fn run_once(&self, options: RunOptions) -> RunSummary {
        self.driver.run(&self.state, self.deps.as_ref(), options).await
    }

    /// Run until the shutdown token is cancelled.
    ///
    /// Shutdown during a run requests a stop and waits for the run to save its snapshot.
    pub async fn run(&self) -> Result<()> {
        if self.schedule.is_none() {
            info!(job = %self.job, "Schedule disabled, not starting");
            return Ok(());
        }

        loop {
            let now = Local::now();
            let Some(next) = self.next_fire_after(&now) else {
                warn!(job = %self.job, "No upcoming fire time within lookahead, scheduler exiting");
                return Ok(());
            };

            let mut fields = Map::new();
            fields.insert("next_run_at".into(), json!(next.to_rfc3339()));
            self.state.set_extra_status(fields);

            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(job = %self.job, next = %next, wait_secs = wait.as_secs(), "Waiting for next run");

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(job = %self.job, "Scheduler shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let run = self.run_once(RunOptions::default());
            tokio::pin!(run);
            let summary = tokio::select! {
                summary = &mut run => summary,
                _ = self.shutdown.cancelled() => {
                    self.state.request_stop();
                    run.await
                }
            };

            match summary.status {
                status if !status.is_terminal() => {
                    info!(job = %self.job, status = %status, "Tick skipped, rescheduling");
                }
                RunStatus::Failed => {
                    warn!(job = %self.job, error = ?summary.error, "Scheduled run failed");
                }
                status => {
                    info!(job = %self.job, status = %status, "Scheduled run finished");
                }
            }

            if self.shutdown.is_cancelled() {
                info!(job = %self.job, "Scheduler shutting down");
                return Ok(());
            }
        }
    }
}
