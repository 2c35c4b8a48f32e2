//! Saved crash occurrences and their evidence references.
//!
//! A crash stays referenced while any reporting stage or job still needs its
//! logs and reproducers. `reported` is a watermark derived from the references:
//! it always equals the latest reference time, or `None` with no references.
//! The evidence collector outside this crate keys purging off that watermark.

use crate::blob::BlobHandle;
use crate::identity::BugKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who holds a reference on a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    /// Key is the reporting stage name.
    Reporting,
    /// Key is the external job key.
    Job,
    /// Synthesized for records saved before references were tracked.
    Unknown,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReferenceKind::Reporting => "reporting",
            ReferenceKind::Job => "job",
            ReferenceKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReference {
    pub kind: ReferenceKind,
    #[serde(default)]
    pub key: String,
    pub time: DateTime<Utc>,
}

impl CrashReference {
    pub fn new(kind: ReferenceKind, key: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            kind,
            key: key.into(),
            time,
        }
    }
}

/// Parsed parts of the crash report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportElements {
    pub guilty_files: Vec<String>,
}

/// A build or crash artifact available for download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub kind: String,
    pub download_url: String,
    pub created: DateTime<Utc>,
}

/// A saved crash under a bug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crash {
    pub id: i64,
    pub bug: BugKey,
    /// May differ from the bug title when merged through an alternate title.
    pub title: String,
    pub manager: String,
    #[serde(default)]
    pub build_id: String,
    pub time: DateTime<Utc>,
    /// Latest reference time; `None` when nothing references the crash.
    #[serde(default)]
    pub reported: Option<DateTime<Utc>>,
    #[serde(default)]
    pub references: Vec<CrashReference>,
    #[serde(default)]
    pub maintainers: Vec<String>,
    #[serde(default)]
    pub log: Option<BlobHandle>,
    #[serde(default)]
    pub report: Option<BlobHandle>,
    #[serde(default)]
    pub report_elements: ReportElements,
    #[serde(default)]
    pub repro_opts: String,
    #[serde(default)]
    pub repro_syz: Option<BlobHandle>,
    #[serde(default)]
    pub repro_c: Option<BlobHandle>,
    /// The repro no longer triggers the bug on HEAD.
    #[serde(default)]
    pub repro_is_revoked: bool,
    #[serde(default)]
    pub last_repro_retest: Option<DateTime<Utc>>,
    #[serde(default)]
    pub machine_info: Option<BlobHandle>,
    #[serde(default)]
    pub flags: i64,
    /// Greater values are reported first (e.g. mainline over side branches).
    #[serde(default)]
    pub report_priority: i64,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

impl Crash {
    pub fn new(id: i64, bug: BugKey, title: &str, manager: &str, time: DateTime<Utc>) -> Self {
        Self {
            id,
            bug,
            title: title.to_string(),
            manager: manager.to_string(),
            build_id: String::new(),
            time,
            reported: None,
            references: Vec::new(),
            maintainers: Vec::new(),
            log: None,
            report: None,
            report_elements: ReportElements::default(),
            repro_opts: String::new(),
            repro_syz: None,
            repro_c: None,
            repro_is_revoked: false,
            last_repro_retest: None,
            machine_info: None,
            flags: 0,
            report_priority: 0,
            assets: Vec::new(),
        }
    }

    /// Add a reference, or refresh the time of an existing one with the same kind and key.
    ///
    /// The new reference is normally the latest one, but the watermark is
    /// recomputed over all references regardless.
    pub fn add_reference(&mut self, new_ref: CrashReference) {
        match self
            .references
            .iter_mut()
            .find(|r| r.kind == new_ref.kind && r.key == new_ref.key)
        {
            Some(existing) => existing.time = new_ref.time,
            None => self.references.push(new_ref),
        }
        self.reported = self.references.iter().map(|r| r.time).max();
    }

    /// Drop every reference with the given kind and key.
    pub fn clear_reference(&mut self, kind: ReferenceKind, key: &str) {
        self.references.retain(|r| !(r.kind == kind && r.key == key));
        self.reported = self.references.iter().map(|r| r.time).max();
    }

    pub fn is_referenced(&self) -> bool {
        !self.references.is_empty()
    }

    pub fn repro_level(&self) -> super::ReproLevel {
        if self.repro_c.is_some() {
            super::ReproLevel::C
        } else if self.repro_syz.is_some() {
            super::ReproLevel::Syz
        } else {
            super::ReproLevel::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn crash() -> Crash {
        Crash::new(1, BugKey::derive("s", "ns", "title", 0), "title", "mgr", t(0))
    }

    fn max_time(c: &Crash) -> Option<DateTime<Utc>> {
        c.references.iter().map(|r| r.time).max()
    }

    #[test]
    fn test_add_reference_sets_watermark() {
        let mut c = crash();
        c.add_reference(CrashReference::new(ReferenceKind::Reporting, "public", t(5)));
        assert_eq!(c.reported, Some(t(5)));
        assert_eq!(c.references.len(), 1);
    }

    #[test]
    fn test_add_reference_updates_in_place() {
        let mut c = crash();
        c.add_reference(CrashReference::new(ReferenceKind::Reporting, "public", t(5)));
        c.add_reference(CrashReference::new(ReferenceKind::Job, "job-1", t(6)));
        let before = c.references.len();
        c.add_reference(CrashReference::new(ReferenceKind::Reporting, "public", t(9)));
        assert_eq!(c.references.len(), before);
        assert_eq!(c.references[0].time, t(9));
        assert_eq!(c.reported, Some(t(9)));
    }

    #[test]
    fn test_same_key_different_kind_is_distinct() {
        let mut c = crash();
        c.add_reference(CrashReference::new(ReferenceKind::Reporting, "x", t(1)));
        c.add_reference(CrashReference::new(ReferenceKind::Job, "x", t(2)));
        assert_eq!(c.references.len(), 2);
    }

    #[test]
    fn test_clear_reference_recomputes_max() {
        let mut c = crash();
        c.add_reference(CrashReference::new(ReferenceKind::Reporting, "a", t(1)));
        c.add_reference(CrashReference::new(ReferenceKind::Reporting, "b", t(7)));
        c.add_reference(CrashReference::new(ReferenceKind::Job, "j", t(3)));
        c.clear_reference(ReferenceKind::Reporting, "b");
        assert_eq!(c.reported, Some(t(3)));
        c.clear_reference(ReferenceKind::Job, "j");
        assert_eq!(c.reported, Some(t(1)));
        c.clear_reference(ReferenceKind::Reporting, "a");
        assert_eq!(c.reported, None);
        assert!(!c.is_referenced());
    }

    #[test]
    fn test_clear_missing_reference_is_harmless() {
        let mut c = crash();
        c.add_reference(CrashReference::new(ReferenceKind::Reporting, "a", t(4)));
        c.clear_reference(ReferenceKind::Job, "a");
        assert_eq!(c.references.len(), 1);
        assert_eq!(c.reported, Some(t(4)));
    }

    #[test]
    fn test_watermark_invariant_over_mixed_sequence() {
        let mut c = crash();
        let ops: [(bool, ReferenceKind, &str, i64); 9] = [
            (true, ReferenceKind::Reporting, "moderation", 1),
            (true, ReferenceKind::Job, "j1", 4),
            (true, ReferenceKind::Reporting, "public", 2),
            (false, ReferenceKind::Job, "j1", 0),
            (true, ReferenceKind::Reporting, "moderation", 8),
            (false, ReferenceKind::Reporting, "moderation", 0),
            (true, ReferenceKind::Job, "j2", 3),
            (false, ReferenceKind::Reporting, "public", 0),
            (false, ReferenceKind::Job, "j2", 0),
        ];
        for (add, kind, key, minute) in ops {
            if add {
                c.add_reference(CrashReference::new(kind, key, t(minute)));
            } else {
                c.clear_reference(kind, key);
            }
            assert_eq!(c.reported, max_time(&c));
        }
        assert!(c.references.is_empty());
    }

    #[test]
    fn test_repro_level() {
        let mut c = crash();
        assert_eq!(c.repro_level(), crate::models::ReproLevel::None);
        c.repro_syz = Some(BlobHandle(1));
        assert_eq!(c.repro_level(), crate::models::ReproLevel::Syz);
        c.repro_c = Some(BlobHandle(2));
        assert_eq!(c.repro_level(), crate::models::ReproLevel::C);
    }
}
