//! The Bug record and the arrays embedded in it.

use super::reporting::BugReporting;
use super::discussion::DiscussionSummary;
use super::{merge_string, time_date};
use crate::identity::{BugKey, format_display_title};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Daily crash history is trimmed to this many buckets.
pub const MAX_BUG_HISTORY_DAYS: usize = 365 * 5;

/// Label kind used for auto-assigned and manual subsystem tags.
pub const SUBSYSTEM_LABEL: &str = "subsystems";

/// Lifecycle status of a bug.
///
/// Bugs are never deleted; they move to one of the terminal variants instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BugStatus {
    #[default]
    Open,
    Fixed,
    Invalid,
    /// Merged into the referenced bug.
    Duplicate(BugKey),
}

impl BugStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, BugStatus::Open)
    }

    pub fn dup_of(&self) -> Option<&BugKey> {
        match self {
            BugStatus::Duplicate(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BugStatus::Open => "open",
            BugStatus::Fixed => "fixed",
            BugStatus::Invalid => "invalid",
            BugStatus::Duplicate(_) => "dup",
        }
    }
}

impl fmt::Display for BugStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BugStatus::Duplicate(key) => write!(f, "dup of {}", key),
            other => f.write_str(other.as_str()),
        }
    }
}

/// How reliably a crash can be reproduced.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ReproLevel {
    #[default]
    None,
    /// Reproducer in the fuzzer's own program format.
    Syz,
    /// Standalone C reproducer.
    C,
}

impl fmt::Display for ReproLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReproLevel::None => "none",
            ReproLevel::Syz => "syz",
            ReproLevel::C => "c",
        };
        f.write_str(s)
    }
}

/// Outcome of a cause or fix bisection as seen from the bug.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BisectStatus {
    #[default]
    Not,
    Pending,
    Error,
    /// Exactly one commit found.
    Yes,
    /// One commit found, but suspected to be wrong.
    Unreliable,
    /// Multiple commits due to skips.
    Inconclusive,
    /// Happens on the oldest testable commit (or on HEAD for fix bisection).
    Horizon,
}

impl fmt::Display for BisectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BisectStatus::Error => "error",
            BisectStatus::Yes => "done",
            BisectStatus::Unreliable => "unreliable",
            BisectStatus::Inconclusive | BisectStatus::Horizon => "inconclusive",
            BisectStatus::Not | BisectStatus::Pending => "",
        };
        f.write_str(s)
    }
}

/// A label attached to a bug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugLabel {
    pub label: String,

    /// Empty for flag-like labels.
    #[serde(default)]
    pub value: String,

    /// Who set the label by hand. `None` means the label was assigned automatically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_by: Option<String>,

    /// Link to the message that set the label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl BugLabel {
    pub fn auto(label: &str, value: &str) -> Self {
        Self {
            label: label.to_string(),
            value: value.to_string(),
            set_by: None,
            link: None,
        }
    }

    pub fn is_manual(&self) -> bool {
        self.set_by.as_deref().is_some_and(|s| !s.is_empty())
    }
}

impl fmt::Display for BugLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            f.write_str(&self.label)
        } else {
            write!(f, "{}:{}", self.label, self.value)
        }
    }
}

/// Number of crashes observed on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugDailyStats {
    /// YYYYMMDD
    pub date: u32,
    pub crash_count: i64,
}

/// A fixing commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Commit {
    pub hash: String,
    pub title: String,
    pub author: String,
    pub author_name: String,
    pub cc: Vec<String>,
    pub date: Option<DateTime<Utc>>,
}

/// Discussion summary copied onto the bug, one entry per source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugDiscussionInfo {
    pub source: String,
    pub summary: DiscussionSummary,
}

/// Latest results of patch tests on other trees for one crash/tree pair.
///
/// The string fields hold external job keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BugTreeTest {
    pub crash_id: i64,
    pub repo: String,
    /// Branch name or commit.
    pub branch: String,
    pub merge_base_repo: Option<String>,
    pub merge_base_branch: Option<String>,
    /// The first job that finished successfully.
    pub first: Option<String>,
    pub first_ok: Option<String>,
    pub first_crash: Option<String>,
    pub last: Option<String>,
    /// Cleared once a later job succeeds.
    pub error: Option<String>,
    pub pending: Option<String>,
}

/// Cross-tree patch testing status of a bug.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BugTreeTestInfo {
    /// The bug needs to be considered as soon as possible.
    pub need_poll: bool,
    pub next_poll: Option<DateTime<Utc>>,
    pub list: Vec<BugTreeTest>,
}

/// One distinct defect in a namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bug {
    pub namespace: String,
    /// Disambiguates bugs with the same title; 0 for the first one.
    pub seq: i64,
    pub title: String,
    /// Crash titles already merged into this bug.
    pub merged_titles: Vec<String>,
    /// Alternative crash titles that may be merged into this bug.
    pub alt_titles: Vec<String>,
    pub status: BugStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    pub num_crashes: i64,
    pub num_repro: i64,
    /// Best repro level ever found.
    pub repro_level: ReproLevel,
    /// Best repro level that still works on HEAD.
    pub head_repro_level: ReproLevel,
    pub bisect_cause: BisectStatus,
    pub bisect_fix: BisectStatus,
    pub has_report: bool,
    pub need_commit_info: bool,
    pub first_time: Option<DateTime<Utc>>,
    pub last_time: Option<DateTime<Utc>>,
    pub last_saved_crash: Option<DateTime<Utc>>,
    pub last_repro_time: Option<DateTime<Utc>>,
    pub last_cause_bisect: Option<DateTime<Utc>>,
    /// When we became aware of the fixing commit.
    pub fix_time: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub closed: Option<DateTime<Utc>>,
    pub subsystems_time: Option<DateTime<Utc>>,
    pub subsystems_rev: u32,
    /// One entry per configured reporting stage, in configuration order.
    pub reporting: Vec<BugReporting>,
    /// Titles of fixing commits.
    pub commits: Vec<String>,
    /// Parallel to `commits`; may be shorter.
    pub commit_info: Vec<Commit>,
    /// Managers that hit the bug.
    pub happened_on: Vec<String>,
    /// Managers that have the fix.
    pub patched_on: Vec<String>,
    /// Don't CC these addresses on this bug.
    pub uncc: Vec<String>,
    pub daily_stats: Vec<BugDailyStats>,
    pub labels: Vec<BugLabel>,
    pub discussion_info: Vec<BugDiscussionInfo>,
    pub tree_tests: BugTreeTestInfo,
    /// External key of the latest successful cross-tree fix bisection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_candidate_job: Option<String>,
}

impl Bug {
    /// Create a new open bug first observed at `now`.
    pub fn new(namespace: &str, title: &str, seq: i64, now: DateTime<Utc>) -> Self {
        Self {
            namespace: namespace.to_string(),
            seq,
            title: title.to_string(),
            merged_titles: vec![title.to_string()],
            first_time: Some(now),
            last_activity: Some(now),
            ..Default::default()
        }
    }

    /// Derive this bug's identity key.
    pub fn key(&self, salt: &str) -> BugKey {
        BugKey::derive(salt, &self.namespace, &self.title, self.seq)
    }

    pub fn display_title(&self) -> String {
        format_display_title(&self.title, self.seq)
    }

    /// Count one more crash observed at `now`.
    ///
    /// Buckets stay in ascending date order. A bucket dated after `now` (clock
    /// skew around midnight) absorbs the crash rather than breaking the order.
    pub fn increase_crash_stats(&mut self, now: DateTime<Utc>) {
        self.num_crashes += 1;
        let date = time_date(now);
        match self.daily_stats.last_mut() {
            Some(last) if last.date >= date => last.crash_count += 1,
            _ => self.daily_stats.push(BugDailyStats {
                date,
                crash_count: 1,
            }),
        }
        if self.daily_stats.len() > MAX_BUG_HISTORY_DAYS {
            let excess = self.daily_stats.len() - MAX_BUG_HISTORY_DAYS;
            self.daily_stats.drain(..excess);
        }
    }

    /// Buckets dated on or after `from`.
    pub fn daily_stats_tail(&self, from: DateTime<Utc>) -> &[BugDailyStats] {
        let start_date = time_date(from);
        let start = self.daily_stats.partition_point(|s| s.date < start_date);
        &self.daily_stats[start..]
    }

    /// Record the fixing commits reported for this bug.
    pub fn update_commits(&mut self, commits: Vec<String>, now: DateTime<Utc>) {
        self.commits = commits;
        self.commit_info.clear();
        self.need_commit_info = true;
        self.fix_time = Some(now);
        self.patched_on.clear();
    }

    pub fn commit_info(&self, i: usize) -> Commit {
        self.commit_info.get(i).cloned().unwrap_or_default()
    }

    pub fn labels_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a BugLabel> + 'a {
        self.labels.iter().filter(move |l| l.label == kind)
    }

    pub fn has_user_label(&self, kind: &str) -> bool {
        self.labels_of(kind).any(BugLabel::is_manual)
    }

    /// Set a label by hand. Re-adding an identical label only updates its setter.
    pub fn set_user_label(&mut self, label: BugLabel) -> Result<()> {
        if !label.is_manual() {
            return Err(Error::InvalidInput(format!(
                "label {} has no setter identity",
                label
            )));
        }
        match self
            .labels
            .iter_mut()
            .find(|l| l.label == label.label && l.value == label.value)
        {
            Some(existing) => *existing = label,
            None => self.labels.push(label),
        }
        Ok(())
    }

    /// Replace the automatic subsystem labels with a classifier's output.
    ///
    /// Returns false (and changes nothing) if a user has set subsystems by hand
    /// or if the bug was already classified by a newer classifier revision.
    pub fn set_auto_subsystems(&mut self, names: &[String], now: DateTime<Utc>, rev: u32) -> bool {
        if self.has_user_label(SUBSYSTEM_LABEL) || rev < self.subsystems_rev {
            return false;
        }
        self.subsystems_rev = rev;
        self.subsystems_time = Some(now);
        self.labels
            .retain(|l| l.label != SUBSYSTEM_LABEL || l.is_manual());
        let mut seen = Vec::new();
        for name in names {
            if seen.contains(name) {
                continue;
            }
            seen.push(name.clone());
            self.labels.push(BugLabel::auto(SUBSYSTEM_LABEL, name));
        }
        true
    }

    /// Record that `title` was merged into this bug.
    pub fn merge_title(&mut self, title: &str) {
        merge_string(&mut self.merged_titles, title);
    }

    pub fn add_alt_titles(&mut self, titles: &[String]) {
        for title in titles {
            merge_string(&mut self.alt_titles, title);
        }
    }

    /// Titles under which crashes are attributed to this bug.
    pub fn crash_titles(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.title.as_str())
            .chain(self.merged_titles.iter().map(String::as_str))
    }

    pub fn reporting_by_name(&self, name: &str) -> Option<&BugReporting> {
        self.reporting.iter().find(|r| r.name == name)
    }

    pub fn reporting_by_name_mut(&mut self, name: &str) -> Option<&mut BugReporting> {
        self.reporting.iter_mut().find(|r| r.name == name)
    }

    pub fn discussion_info_mut(&mut self, source: &str) -> &mut BugDiscussionInfo {
        let pos = match self.discussion_info.iter().position(|d| d.source == source) {
            Some(pos) => pos,
            None => {
                self.discussion_info.push(BugDiscussionInfo {
                    source: source.to_string(),
                    summary: DiscussionSummary::default(),
                });
                self.discussion_info.len() - 1
            }
        };
        &mut self.discussion_info[pos]
    }
}
