use super::{Output, Session, parse_bug, read_input, to_json};
use crate::bugs::{self, CrashOutcome, NewCrash};
use crate::identity::BugKey;
use crate::ledger;
use crate::models::{Bug, BugLabel, BugStatus, Crash};
use crate::Result;
use serde::Serialize;
use std::path::PathBuf;

impl Output for CrashOutcome {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let what = if self.new_bug { "New bug" } else { "Bug" };
        let saved = match self.crash_id {
            Some(id) => format!("crash {} saved", id),
            None => "crash counted, not saved".to_string(),
        };
        format!("{} {}: {} ({})", what, self.bug, self.title, saved)
    }
}

/// Inputs of `bl crash report`.
#[derive(Debug, Default)]
pub struct CrashReportArgs {
    pub namespace: String,
    pub manager: String,
    pub title: String,
    pub alt_titles: Vec<String>,
    pub build_id: Option<String>,
    pub log: Option<PathBuf>,
    pub report: Option<PathBuf>,
    pub repro_syz: Option<PathBuf>,
    pub repro_c: Option<PathBuf>,
    pub repro_opts: Option<String>,
    pub machine_info: Option<PathBuf>,
    pub guilty_files: Vec<String>,
    pub maintainers: Vec<String>,
    pub priority: i64,
}

pub fn crash_report(session: &mut Session, args: CrashReportArgs) -> Result<CrashOutcome> {
    let req = NewCrash {
        namespace: args.namespace,
        manager: args.manager,
        build_id: args.build_id.unwrap_or_default(),
        title: args.title,
        alt_titles: args.alt_titles,
        maintainers: args.maintainers,
        guilty_files: args.guilty_files,
        log: read_input(args.log.as_deref())?,
        report: read_input(args.report.as_deref())?,
        machine_info: read_input(args.machine_info.as_deref())?,
        repro_opts: args.repro_opts.unwrap_or_default(),
        repro_syz: read_input(args.repro_syz.as_deref())?,
        repro_c: read_input(args.repro_c.as_deref())?,
        flags: 0,
        report_priority: args.priority,
    };
    bugs::report_crash(&session.ctx, &mut session.storage, &req)
}

#[derive(Serialize)]
pub struct CrashList {
    pub bug: BugKey,
    pub crashes: Vec<Crash>,
}

impl Output for CrashList {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.crashes.is_empty() {
            return format!("No saved crashes for {}", self.bug);
        }
        let mut lines = vec![format!("{} saved crash(es) for {}:", self.crashes.len(), self.bug)];
        for c in &self.crashes {
            let refs: Vec<String> = c.references.iter().map(|r| format!("{}:{}", r.kind, r.key)).collect();
            lines.push(format!(
                "  #{} {} on {} repro={} refs=[{}]",
                c.id,
                c.time.format("%Y-%m-%d %H:%M"),
                c.manager,
                c.repro_level(),
                refs.join(", ")
            ));
        }
        lines.join("\n")
    }
}

pub fn crash_list(session: &Session, bug: &str) -> Result<CrashList> {
    let bug = parse_bug(&session.storage, bug)?;
    let mut crashes = ledger::crashes_of(&session.storage, &bug)?;
    crashes.sort_by_key(|c| c.id);
    Ok(CrashList { bug, crashes })
}

/// A bug with its key and display title.
#[derive(Serialize)]
pub struct BugView {
    pub key: BugKey,
    pub title: String,
    pub bug: Bug,
}

impl BugView {
    pub(crate) fn new(key: BugKey, bug: Bug) -> Self {
        Self {
            title: bug.display_title(),
            key,
            bug,
        }
    }
}

impl Output for BugView {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let bug = &self.bug;
        let mut lines = vec![
            format!("{} [{}]", self.title, bug.status),
            format!("  key: {}", self.key),
            format!("  namespace: {}", bug.namespace),
            format!(
                "  crashes: {} (repro: {}, {} with repro)",
                bug.num_crashes, bug.repro_level, bug.num_repro
            ),
        ];
        if let Some(reason) = &bug.status_reason {
            lines.push(format!("  reason: {}", reason));
        }
        if !bug.reporting.is_empty() {
            let stages: Vec<String> = bug
                .reporting
                .iter()
                .map(|r| format!("{}={}", r.name, r.status()))
                .collect();
            lines.push(format!("  reporting: {}", stages.join(", ")));
        }
        if !bug.labels.is_empty() {
            let labels: Vec<String> = bug.labels.iter().map(|l| l.to_string()).collect();
            lines.push(format!("  labels: {}", labels.join(", ")));
        }
        if !bug.commits.is_empty() {
            lines.push(format!("  fixed by: {}", bug.commits.join("; ")));
        }
        lines.join("\n")
    }
}

pub fn bug_show(session: &Session, bug: &str, canonical: bool) -> Result<BugView> {
    let key = parse_bug(&session.storage, bug)?;
    let (key, bug) = if canonical {
        bugs::canonical_bug(&session.storage, &key)?
    } else {
        let bug = bugs::load_bug(&session.storage, &key)?;
        (key, bug)
    };
    Ok(BugView::new(key, bug))
}

pub fn bug_by_title(session: &Session, namespace: &str, title: &str) -> Result<BugView> {
    let (key, bug) = bugs::bug_by_display_title(&session.ctx, &session.storage, namespace, title)?;
    Ok(BugView::new(key, bug))
}

/// Find the bug behind a stage ID echoed back by a reporting system.
pub fn bug_by_stage(session: &Session, id: &str) -> Result<BugView> {
    let (key, bug) = bugs::bug_by_stage_id(&session.storage, id)?;
    Ok(BugView::new(key, bug))
}

pub fn bug_dup(session: &mut Session, bug: &str, dup_of: &str) -> Result<BugView> {
    let key = parse_bug(&session.storage, bug)?;
    let target = parse_bug(&session.storage, dup_of)?;
    let bug = bugs::mark_duplicate(&session.ctx, &mut session.storage, &key, &target)?;
    Ok(BugView::new(key, bug))
}

pub fn bug_set_status(
    session: &mut Session,
    bug: &str,
    status: BugStatus,
    reason: Option<String>,
) -> Result<BugView> {
    let key = parse_bug(&session.storage, bug)?;
    let bug = bugs::set_bug_status(&session.ctx, &mut session.storage, &key, status, reason)?;
    Ok(BugView::new(key, bug))
}

pub fn bug_reopen(session: &mut Session, bug: &str) -> Result<BugView> {
    let key = parse_bug(&session.storage, bug)?;
    let bug = bugs::reopen(&session.ctx, &mut session.storage, &key)?;
    Ok(BugView::new(key, bug))
}

pub fn bug_commits(session: &mut Session, bug: &str, commits: Vec<String>) -> Result<BugView> {
    let key = parse_bug(&session.storage, bug)?;
    let bug = bugs::update_commits(&session.ctx, &mut session.storage, &key, commits)?;
    Ok(BugView::new(key, bug))
}

pub fn bug_label(
    session: &mut Session,
    bug: &str,
    label: &str,
    value: &str,
    by: &str,
    link: Option<String>,
) -> Result<BugView> {
    let key = parse_bug(&session.storage, bug)?;
    let label = BugLabel {
        label: label.to_string(),
        value: value.to_string(),
        set_by: Some(by.to_string()),
        link,
    };
    let bug = bugs::set_label(&session.ctx, &mut session.storage, &key, label)?;
    Ok(BugView::new(key, bug))
}

#[derive(Serialize)]
pub struct SimilarBugs {
    pub bug: BugKey,
    pub similar: Vec<BugView>,
}

impl Output for SimilarBugs {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.similar.is_empty() {
            return format!("No bugs similar to {}", self.bug);
        }
        let mut lines = vec![format!("{} bug(s) similar to {}:", self.similar.len(), self.bug)];
        for view in &self.similar {
            lines.push(format!(
                "  {} [{}] {} ({})",
                view.key, view.bug.namespace, view.title, view.bug.status
            ));
        }
        lines.join("\n")
    }
}

pub fn bug_similar(session: &Session, bug: &str) -> Result<SimilarBugs> {
    let key = parse_bug(&session.storage, bug)?;
    let similar = bugs::load_similar_bugs(&session.ctx, &session.storage, &key)?
        .into_iter()
        .map(|(k, b)| BugView::new(k, b))
        .collect();
    Ok(SimilarBugs { bug: key, similar })
}
