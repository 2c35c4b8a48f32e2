//! Staged external reporting.
//!
//! Each bug carries one [`BugReporting`] entry per configured stage, in
//! configuration order. The current stage is the first one that is not
//! closed; a stage is reported at most once per bug, then either upstreamed
//! (closed, so the next stage becomes current) or closed with the bug.
//!
//! Reporting a crash touches three records in separate transactions:
//! 1. the daily quota of the stage
//! 2. the crash (a reference for the stage is added)
//! 3. the bug (the stage is marked reported)
//!
//! If delivery or step 3 fails, the quota unit is given back so the daily
//! cap counts only reports that were recorded.
//!
//! The crash reference is added before the bug points at the crash and the
//! previous crash of the stage is released only after, so an interruption
//! can leave a crash over-retained but never under-retained.

use crate::bugs::load_bug;
use crate::config::{NamespaceConfig, StageConfig};
use crate::context::Context;
use crate::external::{RenderedReport, ReportTransport};
use crate::identity::{BugKey, stage_id};
use crate::ledger;
use crate::models::{Bug, BugReporting, Crash, ReferenceKind, ReportingQuota, ReportingStatus, time_date};
use crate::storage::records::quota_key;
use crate::storage::{Storage, TX_ATTEMPTS};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Why a report was not sent this time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    OnHold,
    Embargo,
    Quota,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReportOutcome {
    Reported {
        stage: String,
        stage_id: String,
        crash_id: i64,
        ext_id: String,
        link: Option<String>,
        is_update: bool,
    },
    /// Nothing changed; retry later.
    Deferred { stage: String, reason: DeferReason },
}

/// Add entries for configured stages the bug does not have yet.
///
/// A stage that appears before a stage the bug already progressed through,
/// or any new stage of a bug that is no longer open, is inserted as a dummy:
/// reported and closed at `now` without anything being sent. Entries of
/// stages no longer configured are kept after the configured ones.
///
/// Returns true if the reporting list changed.
pub fn backfill_reporting(bug: &mut Bug, key: &BugKey, stages: &[StageConfig], now: DateTime<Utc>) -> bool {
    let mut list = Vec::with_capacity(stages.len());
    for (i, stage) in stages.iter().enumerate() {
        if let Some(existing) = bug.reporting_by_name(&stage.name) {
            list.push(existing.clone());
            continue;
        }
        let later_progressed = stages[i + 1..].iter().any(|s| {
            bug.reporting_by_name(&s.name)
                .is_some_and(|r| r.reported.is_some() || r.closed.is_some())
        });
        let id = stage_id(key, &stage.name);
        if later_progressed || !bug.status.is_open() {
            list.push(BugReporting::dummy(&stage.name, id, now));
        } else {
            list.push(BugReporting::new(&stage.name, id));
        }
    }
    for entry in &bug.reporting {
        if !stages.iter().any(|s| s.name == entry.name) {
            list.push(entry.clone());
        }
    }
    if list == bug.reporting {
        return false;
    }
    bug.reporting = list;
    true
}

/// The stage the bug is currently in, if it is open and has one.
pub fn current_stage<'a>(
    bug: &'a Bug,
    ns: &'a NamespaceConfig,
) -> Option<(&'a StageConfig, &'a BugReporting)> {
    if !bug.status.is_open() {
        return None;
    }
    ns.reporting.iter().find_map(|stage| {
        bug.reporting_by_name(&stage.name)
            .filter(|r| r.closed.is_none())
            .map(|r| (stage, r))
    })
}

/// Close every stage that is still open. Returns `(stage, crash id)` pairs
/// whose crash references the caller must release.
pub fn close_open_stages(bug: &mut Bug, now: DateTime<Utc>) -> Vec<(String, i64)> {
    let mut released = Vec::new();
    for entry in bug.reporting.iter_mut().filter(|r| r.closed.is_none()) {
        entry.closed = Some(now);
        if let Some(crash_id) = entry.crash_id {
            released.push((entry.name.clone(), crash_id));
        }
    }
    released
}

/// Release the stage references returned by [`close_open_stages`].
pub fn release_stage_references(storage: &mut Storage, key: &BugKey, released: &[(String, i64)]) -> Result<()> {
    for (stage, crash_id) in released {
        ledger::remove_crash_reference(storage, key, *crash_id, ReferenceKind::Reporting, stage)?;
    }
    Ok(())
}

/// Consume one report from today's quota of `stage`.
fn consume_quota(storage: &mut Storage, namespace: &str, stage: &StageConfig, now: DateTime<Utc>) -> Result<bool> {
    if stage.daily_limit == 0 {
        return Ok(true);
    }
    let key = quota_key(namespace, &stage.name);
    let date = time_date(now);
    storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut quota: ReportingQuota = tx.get(&key)?.unwrap_or_else(|| ReportingQuota {
            namespace: namespace.to_string(),
            stage: stage.name.clone(),
            ..Default::default()
        });
        if !quota.try_consume(date, stage.daily_limit) {
            return Ok(false);
        }
        tx.put(&key, None, &quota)?;
        Ok(true)
    })
}

/// Return a unit taken by [`consume_quota`] for a report that failed.
fn refund_quota(storage: &mut Storage, namespace: &str, stage: &StageConfig, now: DateTime<Utc>) -> Result<()> {
    if stage.daily_limit == 0 {
        return Ok(());
    }
    let key = quota_key(namespace, &stage.name);
    let date = time_date(now);
    storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let Some(mut quota) = tx.get::<ReportingQuota>(&key)? else {
            return Ok(());
        };
        if quota.refund(date) {
            tx.put(&key, None, &quota)?;
        }
        Ok(())
    })
}

/// Pick the crash most worth reporting: best repro, then one with a report,
/// then priority, then the most recent.
pub fn best_crash(storage: &Storage, key: &BugKey) -> Result<Option<Crash>> {
    Ok(ledger::crashes_of(storage, key)?.into_iter().max_by(|a, b| {
        (a.repro_level(), a.report.is_some(), a.report_priority, a.time)
            .cmp(&(b.repro_level(), b.report.is_some(), b.report_priority, b.time))
    }))
}

fn render_report(
    bug: &Bug,
    key: &BugKey,
    entry: &BugReporting,
    crash: &Crash,
    is_update: bool,
) -> RenderedReport {
    RenderedReport {
        namespace: bug.namespace.clone(),
        stage: entry.name.clone(),
        stage_id: entry.id.clone(),
        bug: key.clone(),
        title: bug.display_title(),
        crash_id: crash.id,
        crash_title: crash.title.clone(),
        manager: crash.manager.clone(),
        repro_level: crash.repro_level(),
        labels: bug.labels.iter().map(|l| l.to_string()).collect(),
        cc: entry.cc.clone(),
        maintainers: crash
            .maintainers
            .iter()
            .filter(|m| !bug.uncc.contains(m))
            .cloned()
            .collect(),
        log: crash.log,
        report: crash.report,
        repro_syz: crash.repro_syz,
        repro_c: crash.repro_c,
        is_update,
        ext_id: entry.ext_id.clone(),
    }
}

/// Report bug `key` in its current stage.
///
/// An already reported stage is reported again only with a crash whose
/// reproducer is better than the one the stage has seen; such updates do
/// not count against the quota. `crash_id` picks the crash; by default the
/// best saved crash is used.
pub fn report_to_stage(
    ctx: &Context,
    storage: &mut Storage,
    key: &BugKey,
    crash_id: Option<i64>,
    transport: &dyn ReportTransport,
) -> Result<ReportOutcome> {
    let now = ctx.now();
    let mut bug = load_bug(storage, key)?;
    let ns = ctx.namespace(&bug.namespace)?;
    if !bug.status.is_open() {
        return Err(Error::InvalidInput(format!("bug {} is {}", key, bug.status)));
    }
    backfill_reporting(&mut bug, key, &ns.reporting, now);
    let (stage, entry) = current_stage(&bug, ns)
        .ok_or_else(|| Error::InvalidInput(format!("bug {} has no open reporting stage", key)))?;
    let stage_name = stage.name.clone();

    let is_update = match entry.status() {
        ReportingStatus::OnHold => {
            tracing::info!(bug = %key, stage = %stage_name, "report deferred: on hold");
            return Ok(ReportOutcome::Deferred {
                stage: stage_name,
                reason: DeferReason::OnHold,
            });
        }
        ReportingStatus::Reported => true,
        ReportingStatus::Unreported | ReportingStatus::Closed => false,
    };

    let crash = match crash_id {
        Some(id) => ledger::load_crash(storage, key, id)?,
        None => best_crash(storage, key)?
            .ok_or_else(|| Error::NotFound(format!("no saved crashes for bug {}", key)))?,
    };

    if is_update {
        if crash.repro_level() <= entry.repro_level {
            return Err(Error::InvalidInput(format!(
                "bug {} is already reported in stage {}",
                key, stage_name
            )));
        }
    } else {
        let embargo = Duration::hours(i64::from(stage.embargo_hours));
        if stage.embargo_hours > 0 && bug.first_time.is_some_and(|first| first + embargo > now) {
            tracing::info!(bug = %key, stage = %stage_name, "report deferred: embargo");
            return Ok(ReportOutcome::Deferred {
                stage: stage_name,
                reason: DeferReason::Embargo,
            });
        }
        if !consume_quota(storage, &bug.namespace, stage, now)? {
            tracing::info!(bug = %key, stage = %stage_name, limit = stage.daily_limit, "report deferred: quota exhausted");
            return Ok(ReportOutcome::Deferred {
                stage: stage_name,
                reason: DeferReason::Quota,
            });
        }
    }

    let result = deliver_report(ctx, storage, &bug, key, entry, &crash, transport);
    if result.is_err() && !is_update {
        if let Err(err) = refund_quota(storage, &bug.namespace, stage, now) {
            tracing::warn!(bug = %key, stage = %stage_name, %err, "failed to refund reporting quota");
        }
    }
    result
}

/// Send the report and record it on the crash and the bug.
fn deliver_report(
    ctx: &Context,
    storage: &mut Storage,
    bug: &Bug,
    key: &BugKey,
    entry: &BugReporting,
    crash: &Crash,
    transport: &dyn ReportTransport,
) -> Result<ReportOutcome> {
    let now = ctx.now();
    let ns = ctx.namespace(&bug.namespace)?;
    let is_update = entry.reported.is_some();
    let stage_name = entry.name.clone();
    let rendered = render_report(bug, key, entry, crash, is_update);
    ledger::add_crash_reference(storage, key, crash.id, ReferenceKind::Reporting, &stage_name, now)?;
    let delivery = transport.send(&rendered)?;

    let stages = &ns.reporting;
    let repro_level = crash.repro_level();
    let previous = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut bug: Bug = tx.must_get(key.as_str())?;
        backfill_reporting(&mut bug, key, stages, now);
        let entry = bug.reporting_by_name_mut(&stage_name).ok_or_else(|| {
            Error::IntegrityViolation(format!("bug {} lost stage {}", key, stage_name))
        })?;
        if entry.closed.is_some() {
            return Err(Error::InvalidInput(format!(
                "stage {} of bug {} was closed concurrently",
                stage_name, key
            )));
        }
        let previous = entry.crash_id.replace(crash.id);
        entry.reported.get_or_insert(now);
        entry.ext_id = Some(delivery.ext_id.clone());
        if delivery.link.is_some() {
            entry.link = delivery.link.clone();
        }
        entry.repro_level = repro_level;
        bug.last_activity = Some(now);
        tx.put(key.as_str(), None, &bug)?;
        Ok(previous)
    })?;

    if let Some(old) = previous.filter(|&old| old != crash.id) {
        ledger::remove_crash_reference(storage, key, old, ReferenceKind::Reporting, &stage_name)?;
    }

    tracing::info!(bug = %key, stage = %stage_name, crash = crash.id, is_update, "bug reported");
    Ok(ReportOutcome::Reported {
        stage_id: stage_id(key, &stage_name),
        stage: stage_name,
        crash_id: crash.id,
        ext_id: delivery.ext_id,
        link: delivery.link,
        is_update,
    })
}

/// Run `f` on the current stage of bug `key` in one bug transaction.
///
/// `f` gets the stage name and whether it is the last configured stage.
fn update_current_stage<F>(ctx: &Context, storage: &mut Storage, key: &BugKey, mut f: F) -> Result<Bug>
where
    F: FnMut(&mut Bug, &str, bool) -> Result<()>,
{
    let now = ctx.now();
    let bug = load_bug(storage, key)?;
    let ns = ctx.namespace(&bug.namespace)?;
    storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut bug: Bug = tx.must_get(key.as_str())?;
        backfill_reporting(&mut bug, key, &ns.reporting, now);
        let stage = current_stage(&bug, ns)
            .map(|(stage, _)| stage.name.clone())
            .ok_or_else(|| Error::InvalidInput(format!("bug {} has no open reporting stage", key)))?;
        let is_last = ns.reporting.last().is_some_and(|s| s.name == stage);
        f(&mut bug, &stage, is_last)?;
        bug.last_activity = Some(now);
        tx.put(key.as_str(), None, &bug)?;
        Ok(bug)
    })
}

fn stage_mut<'a>(bug: &'a mut Bug, stage: &str) -> Result<&'a mut BugReporting> {
    bug.reporting_by_name_mut(stage)
        .ok_or_else(|| Error::NotFound(format!("reporting stage {}", stage)))
}

/// Block the current stage from being reported until released.
pub fn hold_stage(ctx: &Context, storage: &mut Storage, key: &BugKey) -> Result<Bug> {
    let now = ctx.now();
    update_current_stage(ctx, storage, key, |bug, stage, _| {
        let entry = stage_mut(bug, stage)?;
        if entry.status() != ReportingStatus::Unreported {
            return Err(Error::InvalidInput(format!(
                "stage {} is {}, only unreported stages can be held",
                stage,
                entry.status()
            )));
        }
        entry.on_hold = Some(now);
        tracing::info!(bug = %key, stage, "reporting put on hold");
        Ok(())
    })
}

pub fn release_hold(ctx: &Context, storage: &mut Storage, key: &BugKey) -> Result<Bug> {
    update_current_stage(ctx, storage, key, |bug, stage, _| {
        let entry = stage_mut(bug, stage)?;
        if entry.on_hold.take().is_none() {
            return Err(Error::InvalidInput(format!("stage {} is not on hold", stage)));
        }
        tracing::info!(bug = %key, stage, "reporting hold released");
        Ok(())
    })
}

/// Close the current, already reported stage so the next one becomes current.
pub fn upstream_stage(ctx: &Context, storage: &mut Storage, key: &BugKey, auto: bool) -> Result<Bug> {
    let now = ctx.now();
    let mut released: Option<(String, i64)> = None;
    let bug = update_current_stage(ctx, storage, key, |bug, stage, is_last| {
        released = None;
        if is_last {
            return Err(Error::InvalidInput(format!(
                "stage {} is the last reporting stage",
                stage
            )));
        }
        let entry = stage_mut(bug, stage)?;
        if entry.status() != ReportingStatus::Reported {
            return Err(Error::InvalidInput(format!(
                "stage {} is {}, only reported stages can be upstreamed",
                stage,
                entry.status()
            )));
        }
        entry.closed = Some(now);
        entry.auto = auto;
        released = entry.crash_id.map(|id| (stage.to_string(), id));
        tracing::info!(bug = %key, stage, auto, "bug upstreamed");
        Ok(())
    })?;
    if let Some(released) = released {
        release_stage_references(storage, key, &[released])?;
    }
    Ok(bug)
}

/// Remember that `label` was announced in `stage`.
pub fn add_reported_label(
    ctx: &Context,
    storage: &mut Storage,
    key: &BugKey,
    stage: &str,
    label: &str,
) -> Result<Bug> {
    let now = ctx.now();
    let bug = load_bug(storage, key)?;
    let ns = ctx.namespace(&bug.namespace)?;
    storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut bug: Bug = tx.must_get(key.as_str())?;
        backfill_reporting(&mut bug, key, &ns.reporting, now);
        stage_mut(&mut bug, stage)?.add_label(label);
        tx.put(key.as_str(), None, &bug)?;
        Ok(bug)
    })
}
