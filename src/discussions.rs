//! External discussion threads about bugs.

use crate::bugs::load_bug;
use crate::context::Context;
use crate::identity::BugKey;
use crate::models::{Bug, Discussion, DiscussionMessage, DiscussionSummary};
use crate::storage::records::{TERM_BUG, discussion_key};
use crate::storage::{Storage, TX_ATTEMPTS};
use crate::{Error, Result};

/// New state of one thread as seen by its source (mailing list, tracker).
#[derive(Debug, Clone, Default)]
pub struct DiscussionUpdate {
    pub source: String,
    /// Base message ID of the thread.
    pub id: String,
    pub kind: String,
    pub subject: String,
    pub bugs: Vec<BugKey>,
    pub messages: Vec<DiscussionMessage>,
}

pub fn load_discussion(storage: &Storage, source: &str, id: &str) -> Result<Discussion> {
    storage
        .get(&discussion_key(source, id))?
        .ok_or_else(|| Error::NotFound(format!("discussion not found: {} {}", source, id)))
}

/// Summary of all `source` threads that mention bug `key`.
fn bug_summary(storage: &Storage, key: &BugKey, source: &str) -> Result<DiscussionSummary> {
    let mut total = DiscussionSummary::default();
    for (_, d) in storage.lookup::<Discussion>(TERM_BUG, key.as_str())? {
        if d.source != source {
            continue;
        }
        total.all_messages += d.summary.all_messages;
        total.external_messages += d.summary.external_messages;
        total.last_message = total.last_message.max(d.summary.last_message);
        total.last_patch_message = total.last_patch_message.max(d.summary.last_patch_message);
    }
    Ok(total)
}

/// Merge a thread update and refresh the discussion summary of every bug it
/// mentions.
pub fn record_discussion(ctx: &Context, storage: &mut Storage, update: &DiscussionUpdate) -> Result<Discussion> {
    if update.source.is_empty() || update.id.is_empty() {
        return Err(Error::InvalidInput("discussion needs a source and an id".to_string()));
    }
    for key in &update.bugs {
        load_bug(storage, key)?;
    }

    let key = discussion_key(&update.source, &update.id);
    let (discussion, added) = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut d: Discussion = tx.get(&key)?.unwrap_or_else(|| Discussion {
            id: update.id.clone(),
            source: update.source.clone(),
            ..Default::default()
        });
        if !update.kind.is_empty() {
            d.kind = update.kind.clone();
        }
        if !update.subject.is_empty() {
            d.subject = update.subject.clone();
        }
        for bug in &update.bugs {
            if !d.bug_keys.contains(bug) {
                d.bug_keys.push(bug.clone());
            }
        }
        let added = d.add_messages(&update.messages);
        tx.put(&key, None, &d)?;
        Ok((d, added))
    })?;

    let now = ctx.now();
    for bug_key in &discussion.bug_keys {
        let summary = bug_summary(storage, bug_key, &update.source)?;
        storage.run_in_transaction(TX_ATTEMPTS, |tx| {
            let mut bug: Bug = tx.must_get(bug_key.as_str())?;
            let info = bug.discussion_info_mut(&update.source);
            if info.summary == summary {
                return Ok(());
            }
            info.summary = summary.clone();
            if added > 0 {
                bug.last_activity = Some(now);
            }
            tx.put(bug_key.as_str(), None, &bug)
        })?;
    }
    tracing::debug!(discussion = %key, added, bugs = discussion.bug_keys.len(), "discussion recorded");
    Ok(discussion)
}
