//! Fuzzing manager records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fuzzing manager instance, keyed by `(namespace, name)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manager {
    pub namespace: String,
    pub name: String,
    pub link: Option<String>,
    pub current_build: Option<String>,
    pub failed_build_bug: Option<String>,
    pub failed_syz_build_bug: Option<String>,
    pub last_alive: Option<DateTime<Utc>>,
    pub current_up_time_secs: u64,
    pub last_generated_job: Option<DateTime<Utc>>,
}

impl Manager {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// Per-day manager runtime counters. Owned by the manager record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerStats {
    /// YYYYMMDD
    pub date: u32,
    pub max_corpus: i64,
    /// Coverage.
    pub max_pcs: i64,
    /// Feedback signal.
    pub max_cover: i64,
    pub total_fuzzing_time_secs: u64,
    pub total_crashes: i64,
    /// Unique crash types.
    pub crash_types: i64,
    pub suppressed_crashes: i64,
    pub total_execs: i64,
}

impl ManagerStats {
    pub fn new(date: u32) -> Self {
        Self {
            date,
            ..Default::default()
        }
    }
}
