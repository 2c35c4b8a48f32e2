use super::{BugView, Output, Session, parse_bug, to_json};
use crate::external::OutboxTransport;
use crate::reporting::{self, DeferReason, ReportOutcome};
use crate::Result;
use std::path::PathBuf;

const OUTBOX_DIR: &str = "outbox";

impl Output for ReportOutcome {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        match self {
            ReportOutcome::Reported {
                stage,
                crash_id,
                ext_id,
                is_update,
                ..
            } => {
                let what = if *is_update { "Updated" } else { "Reported" };
                format!("{} in stage {} with crash {} ({})", what, stage, crash_id, ext_id)
            }
            ReportOutcome::Deferred { stage, reason } => {
                let why = match reason {
                    DeferReason::OnHold => "the stage is on hold",
                    DeferReason::Embargo => "the bug is under embargo",
                    DeferReason::Quota => "today's quota is used up",
                };
                format!("Not reported in stage {}: {}; try again later", stage, why)
            }
        }
    }
}

pub fn report_send(
    session: &mut Session,
    bug: &str,
    crash: Option<i64>,
    outbox: Option<PathBuf>,
) -> Result<ReportOutcome> {
    let key = parse_bug(&session.storage, bug)?;
    let dir = outbox.unwrap_or_else(|| session.data_dir.join(OUTBOX_DIR));
    let transport = OutboxTransport::new(dir);
    reporting::report_to_stage(&session.ctx, &mut session.storage, &key, crash, &transport)
}

pub fn report_hold(session: &mut Session, bug: &str) -> Result<BugView> {
    let key = parse_bug(&session.storage, bug)?;
    let bug = reporting::hold_stage(&session.ctx, &mut session.storage, &key)?;
    Ok(BugView::new(key, bug))
}

pub fn report_release(session: &mut Session, bug: &str) -> Result<BugView> {
    let key = parse_bug(&session.storage, bug)?;
    let bug = reporting::release_hold(&session.ctx, &mut session.storage, &key)?;
    Ok(BugView::new(key, bug))
}

pub fn report_upstream(session: &mut Session, bug: &str) -> Result<BugView> {
    let key = parse_bug(&session.storage, bug)?;
    let bug = reporting::upstream_stage(&session.ctx, &mut session.storage, &key, false)?;
    Ok(BugView::new(key, bug))
}

pub fn report_label(session: &mut Session, bug: &str, stage: &str, label: &str) -> Result<BugView> {
    let key = parse_bug(&session.storage, bug)?;
    let bug = reporting::add_reported_label(&session.ctx, &mut session.storage, &key, stage, label)?;
    Ok(BugView::new(key, bug))
}
