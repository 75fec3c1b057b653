//! Job families driven by the scan orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A long-running job type. Each kind owns exactly one `ScanState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Daily per-ticker market data refresh
    DailyFetch,
    /// Weekly variant of the data refresh
    WeeklyFetch,
    /// Composite-signal detector pass
    DetectorScan,
    /// Derived-table rebuild
    TableRebuild,
}

impl JobKind {
    /// Every job family, in registry order.
    pub const ALL: [JobKind; 4] = [
        JobKind::DailyFetch,
        JobKind::WeeklyFetch,
        JobKind::DetectorScan,
        JobKind::TableRebuild,
    ];

    /// Stable name used for logging and persistence keys.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DailyFetch => "daily_fetch",
            Self::WeeklyFetch => "weekly_fetch",
            Self::DetectorScan => "detector_scan",
            Self::TableRebuild => "table_rebuild",
        }
    }

    /// Whether operators may pause this job (as opposed to only stopping it).
    pub fn supports_pause(&self) -> bool {
        matches!(self, Self::DailyFetch | Self::WeeklyFetch | Self::DetectorScan)
    }

    /// Whether resume snapshots for this job are anchored to a market date.
    pub fn is_dated(&self) -> bool {
        !matches!(self, Self::TableRebuild)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily_fetch" | "daily-fetch" => Ok(Self::DailyFetch),
            "weekly_fetch" | "weekly-fetch" => Ok(Self::WeeklyFetch),
            "detector_scan" | "detector-scan" => Ok(Self::DetectorScan),
            "table_rebuild" | "table-rebuild" => Ok(Self::TableRebuild),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}
