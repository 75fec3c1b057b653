//! Sigscan Engine Library
//!
//! Resumable batch-scan orchestration for the long-running per-ticker jobs: the daily
//! data refresh, its weekly variant, the composite-signal detector pass and the derived-table
//! rebuild.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         sigscan-engine                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────┐   ┌───────────────┐   ┌───────────────┐       │
//! │  │ ScanScheduler │──▶│  ScanDriver   │──▶│  bounded pool │       │
//! │  └───────────────┘   └───────┬───────┘   └───────────────┘       │
//! │                              │                                   │
//! │  ┌───────────────┐   ┌───────▼───────┐   ┌───────────────┐       │
//! │  │ ScanRegistry  │──▶│   ScanState   │──▶│   ScanStore   │       │
//! │  └───────────────┘   └───────────────┘   └───────────────┘       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! - **Claim**: a run owns its job through an atomic `idle → running` swap taken before the
//!   first await. A second caller gets a `running` summary back immediately.
//! - **Resume snapshot**: written when a run is stopped, so the next run continues at the
//!   first unadmitted ticker instead of restarting the universe.
//! - **Retry pass**: failed tickers are retried once, after the first pass completes.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod driver;
pub mod job;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod resume;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod summary;

pub use driver::{DriverOptions, ItemOutcome, RunOptions, ScanDeps, ScanDriver};
pub use job::JobKind;
pub use metrics::{MetricsCounters, MetricsTracker, RunMetricsSnapshot};
pub use pool::ItemContext;
pub use registry::ScanRegistry;
pub use resume::{ResumeState, ScanCursor};
pub use scheduler::{ScanScheduler, TradingCalendar, WeekdayCalendar};
pub use state::{ProgressSnapshot, ResumePolicy, ScanState, ScanStatus, StatusReport};
pub use store::ScanStore;
pub use summary::{RunStatus, RunSummary};

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sigscan_common::config::{Config, ScanConfig};

/// Scan service state: the registry, driver settings and the scheduler lifecycle.
pub struct ScanService {
    /// Scan configuration
    config: ScanConfig,
    /// Control handles, one per job
    registry: Arc<ScanRegistry>,
    /// Shared driver settings
    driver: ScanDriver,
    /// Calendar used by every scheduler
    calendar: Arc<dyn TradingCalendar>,
    /// Cancelled on shutdown; schedulers hold child tokens
    shutdown: CancellationToken,
}

impl ScanService {
    /// Open the on-disk store, prune old history and reload resume snapshots.
    pub fn open(config: &Config) -> Result<Self> {
        let store = ScanStore::open(&config.storage.db_path)
            .with_context(|| format!("Failed to open scan store at {:?}", config.storage.db_path))?;

        if let Err(e) = store.prune_run_metrics(config.storage.history_retention_days) {
            warn!(error = %e, "Failed to prune run metrics history");
        }

        let registry = ScanRegistry::new(Some(Arc::new(store)));
        for status in registry.statuses() {
            if status.can_resume {
                info!(job = %status.job, "Resume snapshot available");
            }
        }

        Ok(Self::with_registry(
            config.scan.clone(),
            registry,
            Arc::new(WeekdayCalendar::new()),
        ))
    }

    /// Build from parts (in-memory registries, custom calendars).
    pub fn with_registry(
        config: ScanConfig,
        registry: ScanRegistry,
        calendar: Arc<dyn TradingCalendar>,
    ) -> Self {
        Self {
            driver: ScanDriver::from_config(&config),
            config,
            registry: Arc::new(registry),
            calendar,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ScanRegistry> {
        &self.registry
    }

    pub fn driver(&self) -> &ScanDriver {
        &self.driver
    }

    /// Manual trigger from the admin layer.
    pub async fn trigger(
        &self,
        kind: JobKind,
        deps: &dyn ScanDeps,
        options: RunOptions,
    ) -> RunSummary {
        let state = self.registry.get(kind);
        self.driver.run(&state, deps, options).await
    }

    /// Spawn one scheduler task per job that has dependencies and an enabled schedule.
    pub fn spawn_schedulers(
        &self,
        deps: HashMap<JobKind, Arc<dyn ScanDeps>>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        for kind in JobKind::ALL {
            let Some(job_deps) = deps.get(&kind) else {
                info!(job = %kind, "No dependencies registered, scheduler not started");
                continue;
            };

            let schedule = scheduler::schedule_for(&self.config.schedules, kind);
            let scheduler = ScanScheduler::new(
                schedule,
                self.driver.clone(),
                self.registry.get(kind),
                Arc::clone(job_deps),
                Arc::clone(&self.calendar),
            )?
            .with_shutdown(self.shutdown.child_token());

            if !scheduler.is_enabled() {
                continue;
            }

            handles.push(tokio::spawn(async move {
                if let Err(e) = scheduler.run().await {
                    error!(job = %kind, error = %e, "Scheduler exited with error");
                }
            }));
        }

        info!(count = handles.len(), "Schedulers started");
        Ok(handles)
    }

    /// Stop the schedulers and ask every running job to stop at its next admission.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let stopped = self.registry.stop_all();
        info!(stopped, "Scan service shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingDeps {
        processed: AtomicUsize,
    }

    #[async_trait]
    impl ScanDeps for CountingDeps {
        fn is_configured(&self) -> bool {
            true
        }

        async fn get_tickers(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec!["AAA".into(), "BBB".into()])
        }

        async fn process_item(&self, _ticker: &str, _ctx: &ItemContext) -> anyhow::Result<ItemOutcome> {
            self.processed.fetch_add(1, Ordering::SeqCst);
            Ok(ItemOutcome::clean())
        }

        async fn sweep_cache(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_open_and_trigger() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.db_path = dir.path().join("scans.db");

        let service = ScanService::open(&config).unwrap();
        let deps = CountingDeps {
            processed: AtomicUsize::new(0),
        };

        let summary = service
            .trigger(JobKind::TableRebuild, &deps, RunOptions::default())
            .await;
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.as_of_date, None);
        assert_eq!(deps.processed.load(Ordering::SeqCst), 2);

        let status = service.registry().get(JobKind::TableRebuild).get_status();
        assert_eq!(status.last_run.unwrap().processed_tickers, 2);
    }

    #[tokio::test]
    async fn test_schedulers_skip_jobs_without_deps() {
        let service = ScanService::with_registry(
            ScanConfig::default(),
            ScanRegistry::new(None),
            Arc::new(WeekdayCalendar::new()),
        );
        let mut deps: HashMap<JobKind, Arc<dyn ScanDeps>> = HashMap::new();
        deps.insert(
            JobKind::DailyFetch,
            Arc::new(CountingDeps {
                processed: AtomicUsize::new(0),
            }),
        );

        let handles = service.spawn_schedulers(deps).unwrap();
        assert_eq!(handles.len(), 1);

        service.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
