//! Patch testing and bisection jobs.

use super::bug::Commit;
use crate::blob::BlobHandle;
use crate::identity::BugKey;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    TestPatch,
    BisectCause,
    BisectFix,
}

impl JobKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "test_patch" | "test-patch" | "patch" => Ok(Self::TestPatch),
            "bisect_cause" | "bisect-cause" | "cause" => Ok(Self::BisectCause),
            "bisect_fix" | "bisect-fix" | "fix" => Ok(Self::BisectFix),
            _ => Err(Error::InvalidInput(format!("Invalid job kind: {}", s))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TestPatch => "test_patch",
            Self::BisectCause => "bisect_cause",
            Self::BisectFix => "bisect_fix",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality flags reported with a bisection result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultFlags(u32);

impl ResultFlags {
    pub const NONE: Self = Self(0);
    /// The result points to a merge commit.
    pub const MERGE: Self = Self(1 << 0);
    /// The result commit does not change the kernel binary.
    pub const NOOP: Self = Self(1 << 1);
    /// The result is a release commit.
    pub const RELEASE: Self = Self(1 << 2);
    /// The result was explicitly ignored.
    pub const IGNORE: Self = Self(1 << 3);

    const UNRELIABLE: Self = Self(Self::MERGE.0 | Self::NOOP.0 | Self::RELEASE.0 | Self::IGNORE.0);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for ResultFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Execution results, meaningful once the job is finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobResult {
    /// `None` if no crash was hit during testing.
    pub crash_title: Option<String>,
    pub crash_log: Option<BlobHandle>,
    pub crash_report: Option<BlobHandle>,
    pub commits: Vec<Commit>,
    pub build_id: Option<String>,
    pub log: Option<BlobHandle>,
    /// Set if the job failed.
    pub error: Option<BlobHandle>,
    pub flags: ResultFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Finished,
}

/// Identity of a job: its owning bug plus an allocated id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub bug: BugKey,
    pub id: i64,
}

impl JobKey {
    pub fn new(bug: BugKey, id: i64) -> Self {
        Self { bug, id }
    }

    /// Parse the external form `"{bug key}/{id}"`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (bug, id) = raw
            .split_once('/')
            .ok_or_else(|| Error::MalformedInput(format!("bad job key: {}", raw)))?;
        let id = id
            .parse()
            .map_err(|_| Error::MalformedInput(format!("bad job key: {}", raw)))?;
        Ok(Self {
            bug: BugKey::parse(bug)?,
            id,
        })
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bug, self.id)
    }
}

/// A patch test or bisection task, owned by a bug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub bug: BugKey,
    pub kind: JobKind,
    pub created: DateTime<Utc>,
    /// Requester identity.
    pub user: String,
    #[serde(default)]
    pub cc: Vec<String>,
    /// Reporting stage the request came through.
    #[serde(default)]
    pub reporting: Option<String>,
    /// External message ID of the request.
    #[serde(default)]
    pub ext_id: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    pub namespace: String,
    pub manager: String,
    pub bug_title: String,
    pub crash_id: i64,

    pub repo: String,
    pub branch: String,
    /// If set, the job runs on the merge base of the two trees.
    #[serde(default)]
    pub merge_base_repo: Option<String>,
    #[serde(default)]
    pub merge_base_branch: Option<String>,
    /// Overrides the bisection start revision.
    #[serde(default)]
    pub bisect_from: Option<String>,
    #[serde(default)]
    pub patch: Option<BlobHandle>,
    #[serde(default)]
    pub config: Option<BlobHandle>,

    /// Number of times execution was started.
    #[serde(default)]
    pub attempts: u32,
    /// Started but not finished; stays set if the executor died.
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    /// Related to tree origin detection.
    #[serde(default)]
    pub tree_origin: bool,

    #[serde(default)]
    pub result: JobResult,

    /// The result was reported back to the requester.
    #[serde(default)]
    pub reported: bool,
    /// User who marked the result invalid.
    #[serde(default)]
    pub invalidated_by: Option<String>,
}

impl Job {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.bug.clone(), self.id)
    }

    pub fn state(&self) -> JobState {
        if self.finished.is_some() {
            JobState::Finished
        } else if self.is_running {
            JobState::Running
        } else {
            JobState::Queued
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    pub fn is_bisection(&self) -> bool {
        matches!(self.kind, JobKind::BisectCause | JobKind::BisectFix)
    }

    pub fn is_cross_tree(&self) -> bool {
        self.is_bisection() && self.merge_base_repo.as_deref().is_some_and(|r| !r.is_empty())
    }

    /// A result pointing to a merge, a no-op commit, a release, or an ignored
    /// commit is kept but never reported.
    pub fn is_unreliable(&self) -> bool {
        self.result.flags.intersects(ResultFlags::UNRELIABLE)
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated_by.is_some()
    }

    pub fn failed(&self) -> bool {
        self.result.error.is_some()
    }
}
