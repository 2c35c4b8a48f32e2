//! Contracts with collaborators outside the ledger.
//!
//! - [`Classifier`] maps guilty source files to subsystem names
//! - [`ReportTransport`] delivers a rendered report and returns its external ID
//! - [`JobRunner`] accepts job specifications for asynchronous execution
//!
//! File-backed implementations ([`OutboxTransport`], [`SpoolRunner`]) let the
//! `bl` binary hand work to external tools through JSONL files.

use crate::blob::BlobHandle;
use crate::identity::BugKey;
use crate::models::{Job, JobKind, ReproLevel};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Assigns subsystems to a crash from the files it blames.
pub trait Classifier {
    /// Subsystem names for `files`, most relevant first.
    fn classify(&self, files: &[String]) -> Result<Vec<String>>;

    /// Revision of the classification rules. Output from an older revision
    /// never replaces output from a newer one.
    fn revision(&self) -> u32;
}

/// A report for one bug in one stage, ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedReport {
    pub namespace: String,
    pub stage: String,
    pub stage_id: String,
    pub bug: BugKey,
    pub title: String,
    pub crash_id: i64,
    pub crash_title: String,
    pub manager: String,
    pub repro_level: ReproLevel,
    pub labels: Vec<String>,
    pub cc: Vec<String>,
    pub maintainers: Vec<String>,
    pub log: Option<BlobHandle>,
    pub report: Option<BlobHandle>,
    pub repro_syz: Option<BlobHandle>,
    pub repro_c: Option<BlobHandle>,
    /// Sent to a thread that already exists, e.g. with a new reproducer.
    pub is_update: bool,
    /// External thread to reply to when updating.
    pub ext_id: Option<String>,
}

/// Where a report ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub ext_id: String,
    pub link: Option<String>,
}

/// Delivers reports to a mailing list, tracker or similar.
pub trait ReportTransport {
    fn send(&self, report: &RenderedReport) -> Result<Delivery>;
}

/// What a runner needs to execute a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job: String,
    pub kind: JobKind,
    pub namespace: String,
    pub manager: String,
    pub bug_title: String,
    pub crash_id: i64,
    pub repo: String,
    pub branch: String,
    pub merge_base_repo: Option<String>,
    pub merge_base_branch: Option<String>,
    pub bisect_from: Option<String>,
    pub patch: Option<BlobHandle>,
    pub config: Option<BlobHandle>,
}

impl From<&Job> for JobSpec {
    fn from(job: &Job) -> Self {
        Self {
            job: job.key().to_string(),
            kind: job.kind,
            namespace: job.namespace.clone(),
            manager: job.manager.clone(),
            bug_title: job.bug_title.clone(),
            crash_id: job.crash_id,
            repo: job.repo.clone(),
            branch: job.branch.clone(),
            merge_base_repo: job.merge_base_repo.clone(),
            merge_base_branch: job.merge_base_branch.clone(),
            bisect_from: job.bisect_from.clone(),
            patch: job.patch,
            config: job.config,
        }
    }
}

/// Executes patch tests and bisections. Completion comes back through
/// [`crate::jobs::finish_job`].
pub trait JobRunner {
    fn submit(&self, spec: &JobSpec) -> Result<()>;
}

fn append_jsonl<T: Serialize>(path: &PathBuf, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(value)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", json)?;
    Ok(())
}

/// Appends reports to `<dir>/<stage>.jsonl` for an external mailer to pick up.
pub struct OutboxTransport {
    pub dir: PathBuf,
}

impl OutboxTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ReportTransport for OutboxTransport {
    fn send(&self, report: &RenderedReport) -> Result<Delivery> {
        let path = self.dir.join(format!("{}.jsonl", report.stage));
        append_jsonl(&path, report)?;
        let ext_id = match &report.ext_id {
            Some(thread) if report.is_update => thread.clone(),
            _ => format!("<{}.{}@bugledger>", report.stage_id, report.crash_id),
        };
        Ok(Delivery { ext_id, link: None })
    }
}

/// Appends job specs to `<dir>/queue.jsonl` for an external runner.
pub struct SpoolRunner {
    pub dir: PathBuf,
}

impl SpoolRunner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl JobRunner for SpoolRunner {
    fn submit(&self, spec: &JobSpec) -> Result<()> {
        append_jsonl(&self.dir.join("queue.jsonl"), spec)
    }
}
