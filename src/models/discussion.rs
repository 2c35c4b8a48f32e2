//! External discussion threads that reference bugs.

use crate::identity::BugKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of most recent messages kept on a discussion.
pub const MAX_DISCUSSION_MESSAGES: usize = 64;

/// Aggregate counters that stay exact after old messages are evicted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscussionSummary {
    pub all_messages: u32,
    pub external_messages: u32,
    pub last_message: Option<DateTime<Utc>>,
    pub last_patch_message: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscussionMessage {
    pub id: String,
    /// Sent by someone other than the bot itself.
    #[serde(default)]
    pub external: bool,
    /// Carries a patch.
    #[serde(default)]
    pub patch: bool,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Discussion {
    /// The thread's base message ID.
    pub id: String,
    pub source: String,
    pub kind: String,
    pub subject: String,
    pub bug_keys: Vec<BugKey>,
    /// Tail of the thread, at most [`MAX_DISCUSSION_MESSAGES`] entries, oldest first.
    pub messages: Vec<DiscussionMessage>,
    pub summary: DiscussionSummary,
}

impl Discussion {
    /// Merge messages into the thread.
    ///
    /// Messages already seen (by id) are skipped, so replays do not inflate
    /// the summary. Returns the number of new messages.
    pub fn add_messages(&mut self, messages: &[DiscussionMessage]) -> usize {
        let mut added = 0;
        for msg in messages {
            if self.messages.iter().any(|m| m.id == msg.id) {
                continue;
            }
            added += 1;
            self.summary.all_messages += 1;
            if msg.external {
                self.summary.external_messages += 1;
            }
            if self.summary.last_message.is_none_or(|t| msg.time > t) {
                self.summary.last_message = Some(msg.time);
            }
            if msg.patch && self.summary.last_patch_message.is_none_or(|t| msg.time > t) {
                self.summary.last_patch_message = Some(msg.time);
            }
            self.messages.push(msg.clone());
        }
        self.messages.sort_by_key(|m| m.time);
        if self.messages.len() > MAX_DISCUSSION_MESSAGES {
            let excess = self.messages.len() - MAX_DISCUSSION_MESSAGES;
            self.messages.drain(..excess);
        }
        added
    }
}
