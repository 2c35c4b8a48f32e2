//! Patch testing and bisection jobs.
//!
//! A job lives under its bug and holds a `Job` reference on the crash it
//! tests, from creation until its result is reported or invalidated.

use crate::blob::{BlobKind, BlobStore};
use crate::bugs::load_bug;
use crate::context::Context;
use crate::external::{JobRunner, JobSpec};
use crate::ledger;
use crate::models::{
    BisectStatus, Bug, BugTreeTest, Commit, Crash, Job, JobKey, JobKind, JobResult, ReferenceKind, ReproLevel,
    ResultFlags,
};
use crate::reporting::best_crash;
use crate::storage::records::{TERM_STATE, job_key};
use crate::storage::{Record, Storage, TX_ATTEMPTS};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};

/// Request to create a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub bug: crate::identity::BugKey,
    /// Crash to test; the best saved crash of the bug if unset.
    pub crash_id: Option<i64>,
    pub user: String,
    pub cc: Vec<String>,
    pub reporting: Option<String>,
    pub ext_id: Option<String>,
    pub link: Option<String>,
    pub repo: String,
    pub branch: String,
    pub merge_base_repo: Option<String>,
    pub merge_base_branch: Option<String>,
    pub bisect_from: Option<String>,
    pub patch: Vec<u8>,
    pub config: Vec<u8>,
    /// Patch-less test run on another tree to find where the bug originates.
    pub tree_origin: bool,
}

impl NewJob {
    pub fn new(kind: JobKind, bug: crate::identity::BugKey, user: &str, repo: &str, branch: &str) -> Self {
        Self {
            kind,
            bug,
            crash_id: None,
            user: user.to_string(),
            cc: Vec::new(),
            reporting: None,
            ext_id: None,
            link: None,
            repo: repo.to_string(),
            branch: branch.to_string(),
            merge_base_repo: None,
            merge_base_branch: None,
            bisect_from: None,
            patch: Vec::new(),
            config: Vec::new(),
            tree_origin: false,
        }
    }

    fn is_cross_tree(&self) -> bool {
        self.kind != JobKind::TestPatch && self.merge_base_repo.as_deref().is_some_and(|r| !r.is_empty())
    }
}

/// What a runner reports back when a job completes.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub crash_title: Option<String>,
    pub crash_log: Vec<u8>,
    pub crash_report: Vec<u8>,
    pub commits: Vec<Commit>,
    pub build_id: Option<String>,
    pub log: Vec<u8>,
    /// Non-empty if the job failed.
    pub error: Vec<u8>,
    pub flags: ResultFlags,
}

pub fn load_job(storage: &Storage, key: &JobKey) -> Result<Job> {
    storage
        .get(&job_key(key))?
        .ok_or_else(|| Error::NotFound(format!("job not found: {}", key)))
}

/// All jobs of bug `bug`.
pub fn jobs_of(storage: &Storage, bug: &crate::identity::BugKey) -> Result<Vec<Job>> {
    Ok(storage
        .children::<Job>(bug.as_str())?
        .into_iter()
        .map(|(_, job)| job)
        .collect())
}

fn select_crash(storage: &Storage, req: &NewJob) -> Result<Crash> {
    match req.crash_id {
        Some(id) => ledger::load_crash(storage, &req.bug, id),
        None => best_crash(storage, &req.bug)?
            .ok_or_else(|| Error::InvalidInput(format!("bug {} has no saved crash", req.bug))),
    }
}

fn validate(req: &NewJob, bug: &Bug, crash: &Crash) -> Result<()> {
    if !bug.status.is_open() {
        return Err(Error::InvalidInput(format!("bug {} is {}", req.bug, bug.status)));
    }
    if req.repo.is_empty() || req.branch.is_empty() {
        return Err(Error::InvalidInput("job needs a repo and a branch".to_string()));
    }
    match req.kind {
        JobKind::TestPatch if req.patch.is_empty() && !req.tree_origin => {
            Err(Error::InvalidInput("patch test without a patch".to_string()))
        }
        JobKind::TestPatch => Ok(()),
        JobKind::BisectCause | JobKind::BisectFix => {
            if crash.repro_level() == ReproLevel::None {
                return Err(Error::InvalidInput(format!(
                    "crash {} has no reproducer to bisect with",
                    crash.id
                )));
            }
            let current = match req.kind {
                JobKind::BisectCause => bug.bisect_cause,
                _ => bug.bisect_fix,
            };
            if !req.is_cross_tree() && current == BisectStatus::Pending {
                return Err(Error::InvalidInput(format!(
                    "{} is already pending for bug {}",
                    req.kind, req.bug
                )));
            }
            Ok(())
        }
    }
}

fn same_tree(test: &BugTreeTest, job: &Job) -> bool {
    test.repo == job.repo
        && test.branch == job.branch
        && test.merge_base_repo == job.merge_base_repo
        && test.merge_base_branch == job.merge_base_branch
}

/// Create a job for a bug.
///
/// The crash reference is taken before the job is written and dropped again
/// if the job cannot be created.
pub fn create_job(ctx: &Context, storage: &mut Storage, req: &NewJob) -> Result<Job> {
    let now = ctx.now();
    let bug = load_bug(storage, &req.bug)?;
    let crash = select_crash(storage, req)?;
    validate(req, &bug, &crash)?;

    let id = storage.allocate_id(Job::KIND)?;
    let job = Job {
        id,
        bug: req.bug.clone(),
        kind: req.kind,
        created: now,
        user: req.user.clone(),
        cc: req.cc.clone(),
        reporting: req.reporting.clone(),
        ext_id: req.ext_id.clone(),
        link: req.link.clone(),
        namespace: bug.namespace.clone(),
        manager: crash.manager.clone(),
        bug_title: bug.display_title(),
        crash_id: crash.id,
        repo: req.repo.clone(),
        branch: req.branch.clone(),
        merge_base_repo: req.merge_base_repo.clone(),
        merge_base_branch: req.merge_base_branch.clone(),
        bisect_from: req.bisect_from.clone(),
        patch: storage.put_optional(BlobKind::Patch, &req.patch)?,
        config: storage.put_optional(BlobKind::KernelConfig, &req.config)?,
        attempts: 0,
        is_running: false,
        last_started: None,
        finished: None,
        tree_origin: req.tree_origin,
        result: JobResult::default(),
        reported: false,
        invalidated_by: None,
    };
    let key = job.key();
    let reference = key.to_string();
    ledger::add_crash_reference(storage, &req.bug, crash.id, ReferenceKind::Job, &reference, now)?;

    let written = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut bug: Bug = tx.must_get(req.bug.as_str())?;
        validate(req, &bug, &crash)?;
        if job.is_bisection() && !job.is_cross_tree() {
            match job.kind {
                JobKind::BisectCause => bug.bisect_cause = BisectStatus::Pending,
                _ => bug.bisect_fix = BisectStatus::Pending,
            }
        }
        if job.tree_origin {
            let pending = Some(reference.clone());
            match bug.tree_tests.list.iter_mut().find(|t| same_tree(t, &job)) {
                Some(test) => test.pending = pending,
                None => bug.tree_tests.list.push(BugTreeTest {
                    crash_id: job.crash_id,
                    repo: job.repo.clone(),
                    branch: job.branch.clone(),
                    merge_base_repo: job.merge_base_repo.clone(),
                    merge_base_branch: job.merge_base_branch.clone(),
                    pending,
                    ..Default::default()
                }),
            }
        }
        tx.put(req.bug.as_str(), None, &bug)?;
        tx.put(&job_key(&key), Some(req.bug.as_str()), &job)
    });
    if let Err(e) = written {
        ledger::remove_crash_reference(storage, &req.bug, crash.id, ReferenceKind::Job, &reference)?;
        return Err(e);
    }
    tracing::info!(job = %key, kind = %job.kind, crash = crash.id, "job created");
    Ok(job)
}

/// Mark a job as (re)started by a runner.
pub fn start_job(ctx: &Context, storage: &mut Storage, key: &JobKey) -> Result<Job> {
    let now = ctx.now();
    let job = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut job: Job = tx.must_get(&job_key(key))?;
        if job.is_finished() {
            return Err(Error::InvalidInput(format!("job {} is already finished", key)));
        }
        job.attempts += 1;
        job.is_running = true;
        job.last_started = Some(now);
        tx.put(&job_key(key), Some(key.bug.as_str()), &job)?;
        Ok(job)
    })?;
    tracing::debug!(job = %key, attempts = job.attempts, "job started");
    Ok(job)
}

fn bisect_status(job: &Job) -> BisectStatus {
    if job.failed() {
        return BisectStatus::Error;
    }
    match job.result.commits.len() {
        0 => BisectStatus::Horizon,
        1 if job.is_unreliable() => BisectStatus::Unreliable,
        1 => BisectStatus::Yes,
        _ => BisectStatus::Inconclusive,
    }
}

/// Apply a finished job's result to its bug.
fn apply_result(bug: &mut Bug, job: &Job, now: DateTime<Utc>) {
    let reference = job.key().to_string();
    if job.is_cross_tree() {
        let found_fix = job.kind == JobKind::BisectFix
            && !job.failed()
            && !job.is_unreliable()
            && job.result.commits.len() == 1;
        if found_fix {
            bug.fix_candidate_job = Some(reference.clone());
        }
    } else if job.is_bisection() {
        let status = bisect_status(job);
        match job.kind {
            JobKind::BisectCause => {
                bug.bisect_cause = status;
                bug.last_cause_bisect = Some(now);
            }
            _ => bug.bisect_fix = status,
        }
    }
    if job.tree_origin {
        if let Some(test) = bug.tree_tests.list.iter_mut().find(|t| same_tree(t, job)) {
            if test.pending.as_deref() == Some(reference.as_str()) {
                test.pending = None;
            }
            test.last = Some(reference.clone());
            if job.failed() {
                test.error = Some(reference.clone());
            } else {
                test.error = None;
                test.first.get_or_insert_with(|| reference.clone());
                if job.result.crash_title.is_some() {
                    test.first_crash.get_or_insert_with(|| reference.clone());
                } else {
                    test.first_ok.get_or_insert_with(|| reference.clone());
                }
            }
        }
    }
}

/// Record the result of a running job.
pub fn finish_job(ctx: &Context, storage: &mut Storage, key: &JobKey, outcome: &JobOutcome) -> Result<Job> {
    let now = ctx.now();
    let result = JobResult {
        crash_title: outcome.crash_title.clone(),
        crash_log: storage.put_optional(BlobKind::CrashLog, &outcome.crash_log)?,
        crash_report: storage.put_optional(BlobKind::CrashReport, &outcome.crash_report)?,
        commits: outcome.commits.clone(),
        build_id: outcome.build_id.clone(),
        log: storage.put_optional(BlobKind::JobLog, &outcome.log)?,
        error: storage.put_optional(BlobKind::JobError, &outcome.error)?,
        flags: outcome.flags,
    };
    let job = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut job: Job = tx.must_get(&job_key(key))?;
        if job.is_finished() {
            return Err(Error::InvalidInput(format!("job {} is already finished", key)));
        }
        if !job.is_running {
            return Err(Error::InvalidInput(format!("job {} was never started", key)));
        }
        job.is_running = false;
        job.finished = Some(now);
        job.result = result.clone();

        let mut bug: Bug = tx.must_get(key.bug.as_str())?;
        apply_result(&mut bug, &job, now);
        tx.put(key.bug.as_str(), None, &bug)?;
        tx.put(&job_key(key), Some(key.bug.as_str()), &job)?;
        Ok(job)
    })?;
    tracing::info!(
        job = %key,
        kind = %job.kind,
        failed = job.failed(),
        commits = job.result.commits.len(),
        "job finished"
    );
    Ok(job)
}

/// Note that the job result went back to the requester; releases the crash.
pub fn mark_job_reported(ctx: &Context, storage: &mut Storage, key: &JobKey) -> Result<Job> {
    let job = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut job: Job = tx.must_get(&job_key(key))?;
        if !job.is_finished() {
            return Err(Error::InvalidInput(format!("job {} is not finished", key)));
        }
        job.reported = true;
        tx.put(&job_key(key), Some(key.bug.as_str()), &job)?;
        Ok(job)
    })?;
    ledger::remove_crash_reference(storage, &key.bug, job.crash_id, ReferenceKind::Job, &key.to_string())?;
    tracing::debug!(job = %key, at = %ctx.now(), "job reported");
    Ok(job)
}

/// Mark a finished bisection as wrong. The bug becomes eligible for a new
/// bisection of the same kind.
pub fn invalidate_job(ctx: &Context, storage: &mut Storage, key: &JobKey, user: &str) -> Result<Job> {
    if user.is_empty() {
        return Err(Error::InvalidInput("invalidation needs a user".to_string()));
    }
    let now = ctx.now();
    let job = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut job: Job = tx.must_get(&job_key(key))?;
        if !job.is_bisection() || !job.is_finished() {
            return Err(Error::InvalidInput(format!("job {} is not a finished bisection", key)));
        }
        job.invalidated_by = Some(user.to_string());

        let mut bug: Bug = tx.must_get(key.bug.as_str())?;
        let reference = key.to_string();
        if job.is_cross_tree() {
            if bug.fix_candidate_job.as_deref() == Some(reference.as_str()) {
                bug.fix_candidate_job = None;
            }
        } else {
            match job.kind {
                JobKind::BisectCause => bug.bisect_cause = BisectStatus::Not,
                _ => bug.bisect_fix = BisectStatus::Not,
            }
        }
        bug.last_activity = Some(now);
        tx.put(key.bug.as_str(), None, &bug)?;
        tx.put(&job_key(key), Some(key.bug.as_str()), &job)?;
        Ok(job)
    })?;
    ledger::remove_crash_reference(storage, &key.bug, job.crash_id, ReferenceKind::Job, &key.to_string())?;
    tracing::info!(job = %key, user, "job invalidated");
    Ok(job)
}

/// Jobs waiting for a runner.
pub fn queued_jobs(storage: &Storage) -> Result<Vec<Job>> {
    Ok(storage
        .lookup::<Job>(TERM_STATE, "queued")?
        .into_iter()
        .map(|(_, job)| job)
        .collect())
}

/// Running jobs started more than `timeout` before `now`; their runner is
/// presumed dead.
pub fn stale_jobs(storage: &Storage, now: DateTime<Utc>, timeout: Duration) -> Result<Vec<Job>> {
    Ok(storage
        .lookup::<Job>(TERM_STATE, "running")?
        .into_iter()
        .map(|(_, job)| job)
        .filter(|job| job.last_started.is_some_and(|t| now - t > timeout))
        .collect())
}

/// Hand queued and stale jobs to `runner`, starting each one.
pub fn dispatch_jobs(
    ctx: &Context,
    storage: &mut Storage,
    runner: &dyn JobRunner,
    stale_after: Duration,
) -> Result<Vec<JobKey>> {
    let mut pending = queued_jobs(storage)?;
    pending.extend(stale_jobs(storage, ctx.now(), stale_after)?);
    let mut dispatched = Vec::with_capacity(pending.len());
    for job in pending {
        runner.submit(&JobSpec::from(&job))?;
        let job = start_job(ctx, storage, &job.key())?;
        if job.attempts > 1 {
            tracing::warn!(job = %job.key(), attempts = job.attempts, "restarting stale job");
        }
        dispatched.push(job.key());
    }
    Ok(dispatched)
}
