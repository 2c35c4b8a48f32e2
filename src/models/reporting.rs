//! Per-stage reporting records embedded in a Bug, and the daily quota record.

use super::bug::ReproLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a bug stands in one reporting stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportingStatus {
    Unreported,
    /// Unreported, and blocked from being reported until the hold is released.
    OnHold,
    Reported,
    Closed,
}

impl fmt::Display for ReportingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReportingStatus::Unreported => "unreported",
            ReportingStatus::OnHold => "on_hold",
            ReportingStatus::Reported => "reported",
            ReportingStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// State of a bug in one configured reporting stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BugReporting {
    /// Stage name from the namespace configuration.
    pub name: String,
    /// Stage ID used in communication with external systems.
    pub id: String,
    /// ID assigned by the external system.
    pub ext_id: Option<String>,
    pub link: Option<String>,
    /// Additional addresses to CC.
    pub cc: Vec<String>,
    /// The crash last reported in this stage.
    pub crash_id: Option<i64>,
    /// Auto-upstreamed or auto-obsoleted.
    pub auto: bool,
    /// The stage was introduced after the bug progressed past it. Such entries
    /// are inserted already reported and closed, even though nothing was sent.
    pub dummy: bool,
    /// May lag behind the bug's level if a repro arrived but was not reported yet.
    pub repro_level: ReproLevel,
    /// Comma-separated labels already announced in this stage.
    pub labels: String,
    /// While set, the bug must not be reported in this stage.
    pub on_hold: Option<DateTime<Utc>>,
    pub reported: Option<DateTime<Utc>>,
    pub closed: Option<DateTime<Utc>>,
}

impl BugReporting {
    pub fn new(name: &str, id: String) -> Self {
        Self {
            name: name.to_string(),
            id,
            ..Default::default()
        }
    }

    /// A placeholder for a stage the bug never actually went through.
    pub fn dummy(name: &str, id: String, now: DateTime<Utc>) -> Self {
        Self {
            dummy: true,
            reported: Some(now),
            closed: Some(now),
            ..Self::new(name, id)
        }
    }

    pub fn status(&self) -> ReportingStatus {
        if self.closed.is_some() {
            ReportingStatus::Closed
        } else if self.reported.is_some() {
            ReportingStatus::Reported
        } else if self.on_hold.is_some() {
            ReportingStatus::OnHold
        } else {
            ReportingStatus::Unreported
        }
    }

    pub fn get_labels(&self) -> Vec<&str> {
        self.labels.split(',').filter(|l| !l.is_empty()).collect()
    }

    /// Add a label to the announced list. Adding a known label is a no-op.
    pub fn add_label(&mut self, label: &str) {
        let mut list = self.get_labels();
        if list.contains(&label) {
            return;
        }
        list.push(label);
        self.labels = list.join(",");
    }
}

/// Reports sent through one stage of one namespace on one day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingQuota {
    pub namespace: String,
    pub stage: String,
    /// YYYYMMDD the counter applies to; a different day resets it.
    pub date: u32,
    pub sent: u32,
}

impl ReportingQuota {
    /// Consume one unit of today's quota. `limit == 0` means unlimited.
    ///
    /// Returns false if the quota for `date` is exhausted.
    pub fn try_consume(&mut self, date: u32, limit: u32) -> bool {
        if self.date != date {
            self.date = date;
            self.sent = 0;
        }
        if limit != 0 && self.sent >= limit {
            return false;
        }
        self.sent += 1;
        true
    }

    /// Give back a unit consumed on `date` by a report that did not go out.
    pub fn refund(&mut self, date: u32) -> bool {
        if self.date != date || self.sent == 0 {
            return false;
        }
        self.sent -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_progression() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut r = BugReporting::new("public", "id".to_string());
        assert_eq!(r.status(), ReportingStatus::Unreported);
        r.on_hold = Some(now);
        assert_eq!(r.status(), ReportingStatus::OnHold);
        r.on_hold = None;
        r.reported = Some(now);
        assert_eq!(r.status(), ReportingStatus::Reported);
        r.closed = Some(now);
        assert_eq!(r.status(), ReportingStatus::Closed);
    }

    #[test]
    fn test_dummy_is_closed_and_reported() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let r = BugReporting::dummy("moderation", "id".to_string(), now);
        assert!(r.dummy);
        assert_eq!(r.status(), ReportingStatus::Closed);
        assert_eq!(r.reported, Some(now));
    }

    #[test]
    fn test_add_label_dedups_and_keeps_order() {
        let mut r = BugReporting::new("public", "id".to_string());
        assert!(r.get_labels().is_empty());
        r.add_label("net");
        r.add_label("fs");
        r.add_label("net");
        assert_eq!(r.labels, "net,fs");
        assert_eq!(r.get_labels(), vec!["net", "fs"]);
    }

    #[test]
    fn test_quota_resets_on_new_day() {
        let mut q = ReportingQuota::default();
        assert!(q.try_consume(20240101, 2));
        assert!(q.try_consume(20240101, 2));
        assert!(!q.try_consume(20240101, 2));
        assert_eq!(q.sent, 2);
        assert!(q.try_consume(20240102, 2));
        assert_eq!(q.sent, 1);
    }

    #[test]
    fn test_refund_only_same_day() {
        let mut q = ReportingQuota::default();
        assert!(q.try_consume(20240101, 1));
        assert!(q.refund(20240101));
        assert!(!q.refund(20240101));
        assert!(q.try_consume(20240101, 1));
        assert!(!q.refund(20240102));
        assert_eq!(q.sent, 1);
    }

    #[test]
    fn test_quota_unlimited() {
        let mut q = ReportingQuota::default();
        for _ in 0..100 {
            assert!(q.try_consume(20240101, 0));
        }
    }
}
