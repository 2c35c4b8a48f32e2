//! Data models for bugledger entities.
//!
//! This module defines the core records:
//! - `Bug` - One distinct defect per namespace, with embedded reporting stages,
//!   labels and daily crash history
//! - `Crash` - A saved crash occurrence under a bug, with its evidence references
//! - `Job` - A patch test or bisection task under a bug
//! - `Manager` / `ManagerStats` - Fuzzing manager state and per-day counters
//! - `Discussion` - An external message thread referencing bugs
//! - `ReportingQuota` - Per-(namespace, stage) daily report counter

pub mod bug;
pub mod crash;
pub mod discussion;
pub mod job;
pub mod manager;
pub mod reporting;

pub use bug::{
    BisectStatus, Bug, BugDailyStats, BugDiscussionInfo, BugLabel, BugStatus, BugTreeTest,
    BugTreeTestInfo, Commit, MAX_BUG_HISTORY_DAYS, ReproLevel, SUBSYSTEM_LABEL,
};
pub use crash::{Asset, Crash, CrashReference, ReferenceKind, ReportElements};
pub use discussion::{Discussion, DiscussionMessage, DiscussionSummary, MAX_DISCUSSION_MESSAGES};
pub use job::{Job, JobKey, JobKind, JobResult, JobState, ResultFlags};
pub use manager::{Manager, ManagerStats};
pub use reporting::{BugReporting, ReportingQuota, ReportingStatus};

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

/// Returns `t`'s date as a single integer `YYYYMMDD`.
pub fn time_date(t: DateTime<Utc>) -> u32 {
    // Years before 0 collapse to 0; chrono's largest year * 10000 fits u32.
    let year = u32::try_from(t.year()).unwrap_or(0);
    year * 10000 + t.month() * 100 + t.day()
}

/// Converts a `YYYYMMDD` date back to midnight UTC of that day.
///
/// Returns `None` for values that are not a calendar date.
pub fn date_time(date: u32) -> Option<DateTime<Utc>> {
    let day = NaiveDate::from_ymd_opt(i32::try_from(date / 10000).ok()?, date / 100 % 100, date % 100)?;
    Some(Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0)?))
}

/// Append `value` unless it is already present.
pub(crate) fn merge_string(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|s| s == value) {
        list.push(value.to_string());
    }
}
