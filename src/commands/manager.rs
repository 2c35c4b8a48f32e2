use super::{Output, Session, parse_bug, read_input, to_json};
use crate::discussions::{self, DiscussionUpdate};
use crate::models::{Discussion, DiscussionMessage, Manager, ManagerStats};
use crate::stats::{self, Heartbeat};
use crate::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Serialize)]
pub struct ManagerView {
    pub manager: Manager,
    pub stats: Vec<ManagerStats>,
}

impl Output for ManagerView {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let m = &self.manager;
        let mut lines = vec![format!("{}/{}", m.namespace, m.name)];
        if let Some(alive) = m.last_alive {
            lines.push(format!("  last alive: {}", alive.format("%Y-%m-%d %H:%M:%S")));
        }
        if let Some(build) = &m.current_build {
            lines.push(format!("  build: {}", build));
        }
        for s in &self.stats {
            lines.push(format!(
                "  {}: crashes={} execs={} corpus={} cover={} fuzzing={}s",
                s.date, s.total_crashes, s.total_execs, s.max_corpus, s.max_cover, s.total_fuzzing_time_secs
            ));
        }
        lines.join("\n")
    }
}

pub fn manager_heartbeat(session: &mut Session, namespace: &str, name: &str, beat: &Heartbeat) -> Result<ManagerView> {
    let (manager, today) = stats::manager_heartbeat(&session.ctx, &mut session.storage, namespace, name, beat)?;
    Ok(ManagerView {
        manager,
        stats: vec![today],
    })
}

pub fn manager_show(session: &Session, namespace: &str, name: &str) -> Result<ManagerView> {
    Ok(ManagerView {
        manager: stats::load_manager(&session.storage, namespace, name)?,
        stats: stats::stats_history(&session.storage, namespace, name)?,
    })
}

#[derive(Serialize)]
pub struct ManagerList {
    pub managers: Vec<Manager>,
}

impl Output for ManagerList {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.managers.is_empty() {
            return "No managers".to_string();
        }
        self.managers
            .iter()
            .map(|m| {
                let alive = m
                    .last_alive
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                format!("{} (last alive {})", m.name, alive)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn manager_list(session: &Session, namespace: &str) -> Result<ManagerList> {
    let mut managers = stats::managers_of(&session.storage, namespace)?;
    managers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(ManagerList { managers })
}

impl Output for Discussion {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "{} {} \"{}\": {} message(s), {} external, {} bug(s)",
            self.source,
            self.id,
            self.subject,
            self.summary.all_messages,
            self.summary.external_messages,
            self.bug_keys.len()
        )
    }
}

/// Inputs of `bl discussion record`.
#[derive(Debug)]
pub struct DiscussionArgs {
    pub source: String,
    pub id: String,
    pub kind: String,
    pub subject: String,
    pub bugs: Vec<String>,
    pub messages: Option<PathBuf>,
}

pub fn discussion_record(session: &mut Session, args: DiscussionArgs) -> Result<Discussion> {
    let raw = read_input(args.messages.as_deref())?;
    let messages: Vec<DiscussionMessage> = if raw.is_empty() {
        Vec::new()
    } else {
        serde_json::from_slice(&raw).map_err(|e| Error::MalformedInput(format!("messages: {}", e)))?
    };
    let update = DiscussionUpdate {
        source: args.source,
        id: args.id,
        kind: args.kind,
        subject: args.subject,
        bugs: args.bugs.iter().map(|b| parse_bug(&session.storage, b)).collect::<Result<_>>()?,
        messages,
    };
    discussions::record_discussion(&session.ctx, &mut session.storage, &update)
}
