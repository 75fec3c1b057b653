//! Resume snapshots describing where an interrupted pass stopped.
//!
//! Each job family has its own variant. A snapshot is written only when a run ends
//! `stopped` and is cleared when a later run finishes cleanly.
//!
//! # Stored Shape
//!
//! ```json
//! {
//!   "kind": "daily_fetch",
//!   "as_of_date": "2026-03-13",
//!   "cursor": {
//!     "tickers": ["AAA", "BBB", "CCC"],
//!     "total_tickers": 3,
//!     "next_index": 1,
//!     "failed_tickers": [],
//!     "processed_tickers": 1,
//!     "detected_tickers": 0,
//!     "recovered_tickers": []
//!   }
//! }
//! ```
//!
//! `normalize` also accepts the older flat camelCase layout
//! (`asOfDate`, `nextIndex`, `totalTickers`, `failedTickers`). Those snapshots may omit the
//! ticker list; the driver then fetches the universe once and checks it against
//! `totalTickers` before continuing at `nextIndex`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobKind;

/// Position inside a pass over a fixed ticker universe.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanCursor {
    /// Universe captured when the interrupted run started
    pub tickers: Vec<String>,
    /// Size of that universe
    pub total_tickers: usize,
    /// First index never admitted to the pool
    pub next_index: usize,
    /// Failures accumulated so far (not yet retried)
    pub failed_tickers: Vec<String>,
    /// Items completed before the interruption
    pub processed_tickers: usize,
    /// Items flagged as detections before the interruption
    pub detected_tickers: usize,
    /// Failures the retry pass already recovered before the interruption
    #[serde(default)]
    pub recovered_tickers: Vec<String>,
}

impl ScanCursor {
    /// Fresh cursor at the start of a universe.
    pub fn start(tickers: Vec<String>) -> Self {
        Self {
            total_tickers: tickers.len(),
            tickers,
            ..Default::default()
        }
    }

    /// Tickers not yet admitted.
    pub fn remaining(&self) -> &[String] {
        self.tickers.get(self.next_index..).unwrap_or(&[])
    }

    /// The snapshot kept its position but not the universe itself.
    pub fn needs_universe(&self) -> bool {
        self.tickers.is_empty() && self.total_tickers > 0
    }

    /// A cursor is usable when the universe is intact (or absent, to be refetched) and work
    /// is left: either unadmitted tickers or failures awaiting their retry pass.
    pub fn has_pending_work(&self) -> bool {
        self.total_tickers > 0
            && (self.needs_universe() || self.tickers.len() == self.total_tickers)
            && self.next_index <= self.total_tickers
            && (self.next_index < self.total_tickers || !self.failed_tickers.is_empty())
    }
}

/// Job-specific resume snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumeState {
    DailyFetch { as_of_date: String, cursor: ScanCursor },
    WeeklyFetch { week_ending: String, cursor: ScanCursor },
    DetectorScan { as_of_date: String, cursor: ScanCursor },
    TableRebuild { cursor: ScanCursor },
}

impl ResumeState {
    /// Build the variant for `kind`. `anchor` is ignored for undated jobs.
    pub fn new(kind: JobKind, anchor: impl Into<String>, cursor: ScanCursor) -> Self {
        match kind {
            JobKind::DailyFetch => Self::DailyFetch {
                as_of_date: anchor.into(),
                cursor,
            },
            JobKind::WeeklyFetch => Self::WeeklyFetch {
                week_ending: anchor.into(),
                cursor,
            },
            JobKind::DetectorScan => Self::DetectorScan {
                as_of_date: anchor.into(),
                cursor,
            },
            JobKind::TableRebuild => Self::TableRebuild { cursor },
        }
    }

    /// Job family this snapshot belongs to.
    pub fn kind(&self) -> JobKind {
        match self {
            Self::DailyFetch { .. } => JobKind::DailyFetch,
            Self::WeeklyFetch { .. } => JobKind::WeeklyFetch,
            Self::DetectorScan { .. } => JobKind::DetectorScan,
            Self::TableRebuild { .. } => JobKind::TableRebuild,
        }
    }

    pub fn cursor(&self) -> &ScanCursor {
        match self {
            Self::DailyFetch { cursor, .. }
            | Self::WeeklyFetch { cursor, .. }
            | Self::DetectorScan { cursor, .. }
            | Self::TableRebuild { cursor } => cursor,
        }
    }

    /// Market date the interrupted run was working on, if the job is dated.
    pub fn anchor(&self) -> Option<&str> {
        match self {
            Self::DailyFetch { as_of_date, .. } | Self::DetectorScan { as_of_date, .. } => {
                Some(as_of_date)
            }
            Self::WeeklyFetch { week_ending, .. } => Some(week_ending),
            Self::TableRebuild { .. } => None,
        }
    }

    /// Default validity predicate.
    pub fn can_resume(&self) -> bool {
        let anchored = match self.anchor() {
            Some(anchor) => !anchor.trim().is_empty(),
            None => true,
        };
        anchored && self.cursor().has_pending_work()
    }

    /// Convert a stored snapshot of any supported layout into the canonical variant.
    ///
    /// Returns `None` when the value cannot describe a snapshot for `kind`.
    pub fn normalize(kind: JobKind, raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;

        if let Some(tag) = obj.get("kind").and_then(Value::as_str) {
            if tag.parse::<JobKind>().ok()? != kind {
                return None;
            }
        }

        // Canonical layout nests the cursor; legacy layout keeps fields flat.
        let cursor_obj = obj
            .get("cursor")
            .and_then(Value::as_object)
            .unwrap_or(obj);

        let tickers = string_list(cursor_obj, &["tickers", "universe"]);
        let total_tickers =
            usize_field(cursor_obj, &["total_tickers", "totalTickers"]).unwrap_or(tickers.len());
        let next_index = usize_field(cursor_obj, &["next_index", "nextIndex"])?;

        let cursor = ScanCursor {
            tickers,
            total_tickers,
            next_index,
            failed_tickers: string_list(cursor_obj, &["failed_tickers", "failedTickers"]),
            processed_tickers: usize_field(cursor_obj, &["processed_tickers", "processedTickers"])
                .unwrap_or(next_index),
            detected_tickers: usize_field(cursor_obj, &["detected_tickers", "detectedTickers"])
                .unwrap_or(0),
            recovered_tickers: string_list(
                cursor_obj,
                &["recovered_tickers", "recoveredTickers", "retryRecovered"],
            ),
        };

        let anchor = str_field(
            obj,
            &["as_of_date", "asOfDate", "week_ending", "weekEnding", "date"],
        )
        .unwrap_or_default();

        Some(Self::new(kind, anchor, cursor))
    }
}

fn str_field(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn usize_field(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<usize> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_u64))
        .map(|n| n as usize)
}

fn string_list(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_array))
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tickers(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("T{:03}", i)).collect()
    }

    #[test]
    fn test_can_resume_requires_pending_work() {
        let mut cursor = ScanCursor::start(tickers(20));
        cursor.next_index = 5;
        let state = ResumeState::new(JobKind::DailyFetch, "2026-03-13", cursor.clone());
        assert!(state.can_resume());
        assert_eq!(state.cursor().remaining().len(), 15);

        cursor.next_index = 20;
        let done = ResumeState::new(JobKind::DailyFetch, "2026-03-13", cursor.clone());
        assert!(!done.can_resume());

        // Pending retries keep a fully admitted pass resumable
        cursor.failed_tickers = vec!["T007".into()];
        let retries = ResumeState::new(JobKind::DailyFetch, "2026-03-13", cursor);
        assert!(retries.can_resume());
    }

    #[test]
    fn test_dated_jobs_need_anchor() {
        let mut cursor = ScanCursor::start(tickers(4));
        cursor.next_index = 1;

        assert!(!ResumeState::new(JobKind::WeeklyFetch, "  ", cursor.clone()).can_resume());
        assert!(ResumeState::new(JobKind::TableRebuild, "", cursor).can_resume());
    }

    #[test]
    fn test_truncated_universe_is_rejected() {
        let mut cursor = ScanCursor::start(tickers(10));
        cursor.next_index = 2;
        cursor.tickers.truncate(6);

        assert!(!ResumeState::new(JobKind::DetectorScan, "2026-03-13", cursor).can_resume());
    }

    #[test]
    fn test_normalize_canonical_layout() {
        let mut cursor = ScanCursor::start(tickers(3));
        cursor.next_index = 1;
        cursor.processed_tickers = 1;
        let state = ResumeState::new(JobKind::DailyFetch, "2026-03-13", cursor);

        let raw = serde_json::to_value(&state).unwrap();
        assert_eq!(raw["kind"], "daily_fetch");
        assert_eq!(ResumeState::normalize(JobKind::DailyFetch, &raw), Some(state));
    }

    #[test]
    fn test_normalize_legacy_camel_case() {
        let raw = json!({
            "asOfDate": "2026-03-12",
            "totalTickers": 3,
            "nextIndex": 2,
            "failedTickers": ["BBB"],
            "tickers": ["AAA", "BBB", "CCC"]
        });

        let state = ResumeState::normalize(JobKind::DailyFetch, &raw).unwrap();
        assert_eq!(state.anchor(), Some("2026-03-12"));
        assert_eq!(state.cursor().next_index, 2);
        assert_eq!(state.cursor().processed_tickers, 2);
        assert_eq!(state.cursor().failed_tickers, vec!["BBB".to_string()]);
        assert!(state.can_resume());
    }

    #[test]
    fn test_legacy_snapshot_without_universe_is_resumable() {
        let raw = json!({
            "asOfDate": "2026-03-12",
            "totalTickers": 3,
            "nextIndex": 1,
            "failedTickers": []
        });

        let state = ResumeState::normalize(JobKind::DailyFetch, &raw).unwrap();
        assert!(state.cursor().tickers.is_empty());
        assert!(state.cursor().needs_universe());
        assert_eq!(state.cursor().total_tickers, 3);
        assert!(state.can_resume());

        // Without a total there is nothing to check a refetched universe against
        let untotalled = json!({ "asOfDate": "2026-03-12", "nextIndex": 1 });
        let state = ResumeState::normalize(JobKind::DailyFetch, &untotalled).unwrap();
        assert!(!state.can_resume());
    }

    #[test]
    fn test_recovered_tickers_default_when_missing() {
        let raw = json!({
            "kind": "daily_fetch",
            "as_of_date": "2026-03-13",
            "cursor": {
                "tickers": ["AAA", "BBB"],
                "total_tickers": 2,
                "next_index": 2,
                "failed_tickers": ["BBB"],
                "processed_tickers": 2,
                "detected_tickers": 0
            }
        });
        let typed: ResumeState = serde_json::from_value(raw.clone()).unwrap();
        assert!(typed.cursor().recovered_tickers.is_empty());

        let mut with_recovered = raw;
        with_recovered["cursor"]["recovered_tickers"] = json!(["AAA"]);
        let state = ResumeState::normalize(JobKind::DailyFetch, &with_recovered).unwrap();
        assert_eq!(state.cursor().recovered_tickers, vec!["AAA".to_string()]);
    }

    #[test]
    fn test_normalize_rejects_other_kind_and_garbage() {
        let state = ResumeState::new(JobKind::WeeklyFetch, "2026-03-14", ScanCursor::start(tickers(2)));
        let raw = serde_json::to_value(&state).unwrap();

        assert!(ResumeState::normalize(JobKind::DailyFetch, &raw).is_none());
        assert!(ResumeState::normalize(JobKind::DailyFetch, &json!("nope")).is_none());
        assert!(ResumeState::normalize(JobKind::DailyFetch, &json!({ "asOfDate": "x" })).is_none());
    }
}
