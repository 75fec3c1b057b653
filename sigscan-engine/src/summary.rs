//! Run outcomes returned by the driver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::JobKind;

/// Terminal status of one driver invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// Upstream not configured; nothing was claimed
    Disabled,
    /// Another run already owns the job; this call was rejected by the guard
    Running,
    /// Every ticker succeeded (possibly after a retry)
    Completed,
    /// At least one ticker still failed after the retry pass
    CompletedWithErrors,
    /// Cancelled cooperatively; a resume snapshot was written
    Stopped,
    /// The universe could not be fetched
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed-with-errors",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Parse the stored string form.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "disabled" => Some(Self::Disabled),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "completed-with-errors" => Some(Self::CompletedWithErrors),
            "stopped" => Some(Self::Stopped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// True for outcomes produced by a run that actually claimed the job.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Disabled | Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one run. Built by the driver and never mutated after it returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub job: JobKind,
    pub status: RunStatus,
    /// Identifier shared with the persisted metrics snapshot
    pub run_id: Option<String>,
    /// Market date the run worked on
    pub as_of_date: Option<String>,
    /// Whether this run continued from a resume snapshot
    pub resumed: bool,
    pub total_tickers: usize,
    pub processed_tickers: usize,
    pub detected_tickers: usize,
    pub error_tickers: usize,
    pub failed_tickers: Vec<String>,
    pub retry_recovered: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Failure reason for `failed` runs
    pub error: Option<String>,
}

impl RunSummary {
    fn empty(job: JobKind, status: RunStatus) -> Self {
        let now = Utc::now();
        Self {
            job,
            status,
            run_id: None,
            as_of_date: None,
            resumed: false,
            total_tickers: 0,
            processed_tickers: 0,
            detected_tickers: 0,
            error_tickers: 0,
            failed_tickers: Vec::new(),
            retry_recovered: Vec::new(),
            started_at: now,
            finished_at: now,
            error: None,
        }
    }

    /// Result for an unconfigured upstream.
    pub fn disabled(job: JobKind) -> Self {
        Self::empty(job, RunStatus::Disabled)
    }

    /// Result for a call rejected because another run is active.
    pub fn already_running(job: JobKind) -> Self {
        Self::empty(job, RunStatus::Running)
    }

    /// Result for a run whose universe fetch failed.
    pub(crate) fn failed(
        job: JobKind,
        run_id: String,
        started_at: DateTime<Utc>,
        error: String,
    ) -> Self {
        Self {
            run_id: Some(run_id),
            started_at,
            error: Some(error),
            ..Self::empty(job, RunStatus::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            RunStatus::Disabled,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::CompletedWithErrors,
            RunStatus::Stopped,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::from_db_string(status.as_str()), Some(status));
            assert_eq!(
                serde_json::to_string(&status).unwrap(),
                format!("\"{}\"", status.as_str())
            );
        }
    }

    #[test]
    fn test_guard_outcomes_are_not_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Disabled.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
    }

    #[test]
    fn test_guard_summary_is_empty() {
        let summary = RunSummary::already_running(JobKind::DetectorScan);
        assert_eq!(summary.status, RunStatus::Running);
        assert_eq!(summary.processed_tickers, 0);
        assert!(summary.run_id.is_none());
    }
}
