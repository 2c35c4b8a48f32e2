//! Record kinds, their keys and their index terms.

use super::Record;
use super::migrate;
use crate::Result;
use crate::identity::{BugKey, STAGE_ID_LEN};
use crate::models::{
    Bug, Crash, Discussion, Job, JobKey, JobState, Manager, ManagerStats, ReportingQuota,
};

/// Index term: `"{namespace}|{title}"` for every title crashes are attributed under.
pub const TERM_CRASH_TITLE: &str = "crash_title";
/// Index term: an alternate title.
pub const TERM_ALT_TITLE: &str = "alt_title";
pub const TERM_NAMESPACE: &str = "namespace";
pub const TERM_STATUS: &str = "status";
/// Index term on jobs: "queued", "running" or "finished".
pub const TERM_STATE: &str = "state";
pub const TERM_BUG: &str = "bug";
/// Index term on bugs: the short form of each reporting stage ID.
pub const TERM_STAGE_ID: &str = "stage_id";

pub fn crash_title_term(namespace: &str, title: &str) -> String {
    format!("{}|{}", namespace, title)
}

/// Legacy full-length stage IDs are indexed by their short prefix.
pub fn stage_id_term(id: &str) -> String {
    id.chars().take(STAGE_ID_LEN).collect::<String>().to_ascii_lowercase()
}

pub fn crash_key(bug: &BugKey, id: i64) -> String {
    format!("{}/{}", bug, id)
}

pub fn manager_key(namespace: &str, name: &str) -> String {
    format!("{}-{}", namespace, name)
}

pub fn manager_stats_key(namespace: &str, name: &str, date: u32) -> String {
    format!("{}/{}", manager_key(namespace, name), date)
}

pub fn discussion_key(source: &str, id: &str) -> String {
    format!("{}-{}", source, id)
}

pub fn quota_key(namespace: &str, stage: &str) -> String {
    format!("{}/{}", namespace, stage)
}

impl Record for Bug {
    const KIND: &'static str = "Bug";

    fn index_terms(&self) -> Vec<(&'static str, String)> {
        let mut terms = vec![
            (TERM_NAMESPACE, self.namespace.clone()),
            (TERM_STATUS, self.status.as_str().to_string()),
        ];
        for title in self.crash_titles() {
            terms.push((TERM_CRASH_TITLE, crash_title_term(&self.namespace, title)));
        }
        for title in &self.alt_titles {
            terms.push((TERM_ALT_TITLE, title.clone()));
        }
        for entry in self.reporting.iter().filter(|r| !r.id.is_empty()) {
            terms.push((TERM_STAGE_ID, stage_id_term(&entry.id)));
        }
        terms
    }

    fn load(raw: serde_json::Value) -> Result<Self> {
        migrate::load_bug(raw)
    }
}

impl Record for Crash {
    const KIND: &'static str = "Crash";

    fn load(raw: serde_json::Value) -> Result<Self> {
        migrate::load_crash(raw)
    }
}

impl Record for Job {
    const KIND: &'static str = "Job";

    fn index_terms(&self) -> Vec<(&'static str, String)> {
        let state = match self.state() {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Finished => "finished",
        };
        vec![(TERM_STATE, state.to_string())]
    }
}

impl Record for Manager {
    const KIND: &'static str = "Manager";

    fn index_terms(&self) -> Vec<(&'static str, String)> {
        vec![(TERM_NAMESPACE, self.namespace.clone())]
    }
}

impl Record for ManagerStats {
    const KIND: &'static str = "ManagerStats";
}

impl Record for Discussion {
    const KIND: &'static str = "Discussion";

    fn index_terms(&self) -> Vec<(&'static str, String)> {
        self.bug_keys
            .iter()
            .map(|key| (TERM_BUG, key.to_string()))
            .collect()
    }
}

impl Record for ReportingQuota {
    const KIND: &'static str = "ReportingQuota";
}

/// Storage key of a job.
pub fn job_key(key: &JobKey) -> String {
    key.to_string()
}
