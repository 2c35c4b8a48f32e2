use super::{Output, Session, parse_bug, read_input, to_json};
use crate::external::SpoolRunner;
use crate::jobs::{self, JobOutcome, NewJob};
use crate::models::{Commit, Job, JobKey, JobKind, ResultFlags};
use crate::Result;
use chrono::Duration;
use serde::Serialize;
use std::path::PathBuf;

const SPOOL_DIR: &str = "jobs";

fn job_line(job: &Job) -> String {
    let state = match (&job.finished, job.is_running) {
        (Some(_), _) if job.is_invalidated() => "invalidated".to_string(),
        (Some(_), _) if job.failed() => "failed".to_string(),
        (Some(_), _) => format!("finished, {} commit(s)", job.result.commits.len()),
        (None, true) => format!("running, attempt {}", job.attempts),
        (None, false) => "queued".to_string(),
    };
    format!("{} {} on {}/{} ({})", job.key(), job.kind, job.repo, job.branch, state)
}

#[derive(Serialize)]
pub struct JobView {
    pub key: String,
    pub job: Job,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            key: job.key().to_string(),
            job,
        }
    }
}

impl Output for JobView {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        job_line(&self.job)
    }
}

#[derive(Serialize)]
pub struct JobList {
    pub jobs: Vec<JobView>,
}

impl Output for JobList {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.jobs.is_empty() {
            return "No jobs".to_string();
        }
        self.jobs
            .iter()
            .map(|v| job_line(&v.job))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Inputs of `bl job create`.
#[derive(Debug)]
pub struct JobCreateArgs {
    pub bug: String,
    pub kind: String,
    pub user: String,
    pub repo: String,
    pub branch: String,
    pub crash: Option<i64>,
    pub merge_base_repo: Option<String>,
    pub merge_base_branch: Option<String>,
    pub bisect_from: Option<String>,
    pub patch: Option<PathBuf>,
    pub kernel_config: Option<PathBuf>,
    pub tree_origin: bool,
}

pub fn job_create(session: &mut Session, args: JobCreateArgs) -> Result<JobView> {
    let mut req = NewJob::new(
        JobKind::parse(&args.kind)?,
        parse_bug(&session.storage, &args.bug)?,
        &args.user,
        &args.repo,
        &args.branch,
    );
    req.crash_id = args.crash;
    req.merge_base_repo = args.merge_base_repo;
    req.merge_base_branch = args.merge_base_branch;
    req.bisect_from = args.bisect_from;
    req.patch = read_input(args.patch.as_deref())?;
    req.config = read_input(args.kernel_config.as_deref())?;
    req.tree_origin = args.tree_origin;
    Ok(jobs::create_job(&session.ctx, &mut session.storage, &req)?.into())
}

pub fn job_start(session: &mut Session, job: &str) -> Result<JobView> {
    let key = JobKey::parse(job)?;
    Ok(jobs::start_job(&session.ctx, &mut session.storage, &key)?.into())
}

pub fn job_finish(
    session: &mut Session,
    job: &str,
    crash_title: Option<String>,
    commits: Vec<String>,
    flags: u32,
    log: Option<PathBuf>,
    error: Option<PathBuf>,
) -> Result<JobView> {
    let key = JobKey::parse(job)?;
    let outcome = JobOutcome {
        crash_title,
        commits: commits
            .into_iter()
            .map(|title| Commit {
                title,
                ..Default::default()
            })
            .collect(),
        log: read_input(log.as_deref())?,
        error: read_input(error.as_deref())?,
        flags: ResultFlags::from_bits(flags),
        ..Default::default()
    };
    Ok(jobs::finish_job(&session.ctx, &mut session.storage, &key, &outcome)?.into())
}

pub fn job_reported(session: &mut Session, job: &str) -> Result<JobView> {
    let key = JobKey::parse(job)?;
    Ok(jobs::mark_job_reported(&session.ctx, &mut session.storage, &key)?.into())
}

pub fn job_invalidate(session: &mut Session, job: &str, user: &str) -> Result<JobView> {
    let key = JobKey::parse(job)?;
    Ok(jobs::invalidate_job(&session.ctx, &mut session.storage, &key, user)?.into())
}

pub fn job_list(session: &Session, bug: &str) -> Result<JobList> {
    let bug = parse_bug(&session.storage, bug)?;
    let mut list = jobs::jobs_of(&session.storage, &bug)?;
    list.sort_by_key(|j| j.id);
    Ok(JobList {
        jobs: list.into_iter().map(JobView::from).collect(),
    })
}

pub fn job_stale(session: &Session, hours: i64) -> Result<JobList> {
    let stale = jobs::stale_jobs(&session.storage, session.ctx.now(), Duration::hours(hours))?;
    Ok(JobList {
        jobs: stale.into_iter().map(JobView::from).collect(),
    })
}

#[derive(Serialize)]
pub struct DispatchResult {
    pub spool: PathBuf,
    pub dispatched: Vec<String>,
}

impl Output for DispatchResult {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Dispatched {} job(s) to {}",
            self.dispatched.len(),
            self.spool.display()
        )
    }
}

pub fn job_dispatch(session: &mut Session, spool: Option<PathBuf>, stale_hours: i64) -> Result<DispatchResult> {
    let spool = spool.unwrap_or_else(|| session.data_dir.join(SPOOL_DIR));
    let runner = SpoolRunner::new(&spool);
    let dispatched = jobs::dispatch_jobs(
        &session.ctx,
        &mut session.storage,
        &runner,
        Duration::hours(stale_hours),
    )?;
    Ok(DispatchResult {
        spool,
        dispatched: dispatched.iter().map(ToString::to_string).collect(),
    })
}
