//! Bug records: crash observation, duplicate resolution and status changes.
//!
//! A crash title maps to the highest-seq bug of its namespace that has
//! absorbed that title. Open bugs take the crash; duplicates forward it to
//! their canonical bug; fixed and invalid bugs make way for a new bug with
//! the next seq.

use crate::blob::{BlobKind, BlobStore};
use crate::config::NamespaceConfig;
use crate::context::Context;
use crate::external::Classifier;
use crate::identity::{BugKey, HASH_LEN, STAGE_ID_LEN, legacy_stage_id, looks_like_stage_id, parse_display_title};
use crate::ledger;
use crate::models::{Bug, BugLabel, BugStatus, Crash, ReferenceKind, ReproLevel, merge_string};
use crate::reporting::{backfill_reporting, close_open_stages, release_stage_references};
use crate::storage::records::{
    TERM_ALT_TITLE, TERM_CRASH_TITLE, TERM_STAGE_ID, crash_key, crash_title_term, stage_id_term,
};
use crate::storage::{Record, Storage, TX_ATTEMPTS};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;

/// Every crash is saved until a bug has this many.
pub const MAX_CRASHES_PER_BUG: i64 = 40;

/// Past [`MAX_CRASHES_PER_BUG`], save at most one crash per interval.
pub fn save_crash_interval() -> Duration {
    Duration::hours(1)
}

/// Longest duplicate chain followed before it is declared broken.
pub const MAX_DUP_CHAIN: usize = 100;

pub fn load_bug(storage: &Storage, key: &BugKey) -> Result<Bug> {
    storage
        .get(key.as_str())?
        .ok_or_else(|| Error::NotFound(format!("bug not found: {}", key)))
}

/// Follow duplicate links from `start` to the first bug that is not a duplicate.
///
/// A missing `start` is not-found; a missing link target or a chain longer
/// than [`MAX_DUP_CHAIN`] (which includes any cycle) is an integrity violation.
fn walk_canonical<F>(start: &BugKey, mut get: F) -> Result<(BugKey, Bug)>
where
    F: FnMut(&BugKey) -> Result<Option<Bug>>,
{
    let mut key = start.clone();
    for _ in 0..=MAX_DUP_CHAIN {
        let bug = match get(&key)? {
            Some(bug) => bug,
            None if key == *start => {
                return Err(Error::NotFound(format!("bug not found: {}", key)));
            }
            None => {
                return Err(Error::IntegrityViolation(format!(
                    "duplicate chain from {} points to missing bug {}",
                    start, key
                )));
            }
        };
        match bug.status.dup_of().cloned() {
            None => return Ok((key, bug)),
            Some(next) => key = next,
        }
    }
    Err(Error::IntegrityViolation(format!(
        "duplicate chain from {} does not terminate within {} hops",
        start, MAX_DUP_CHAIN
    )))
}

/// The bug that `key` ultimately duplicates, or `key` itself.
pub fn canonical_bug(storage: &Storage, key: &BugKey) -> Result<(BugKey, Bug)> {
    walk_canonical(key, |k| storage.get(k.as_str()))
}

/// Highest-seq bug in `namespace` that crashes titled `title` belong to.
pub fn find_bug_by_title(storage: &Storage, namespace: &str, title: &str) -> Result<Option<(BugKey, Bug)>> {
    let term = crash_title_term(namespace, title);
    let mut best: Option<(BugKey, Bug)> = None;
    for (key, bug) in storage.lookup::<Bug>(TERM_CRASH_TITLE, &term)? {
        if best.as_ref().is_none_or(|(_, b)| bug.seq > b.seq) {
            best = Some((BugKey::parse(&key)?, bug));
        }
    }
    Ok(best)
}

/// Look a bug up by the title users see, e.g. `"WARNING in foo (2)"`.
pub fn bug_by_display_title(ctx: &Context, storage: &Storage, namespace: &str, display: &str) -> Result<(BugKey, Bug)> {
    let ns = ctx.namespace(namespace)?;
    let (title, seq) = parse_display_title(display)?;
    let key = BugKey::derive(&ns.key, &ns.name, &title, seq);
    let bug = load_bug(storage, &key)?;
    Ok((key, bug))
}

/// Find the bug a reporting stage ID was handed out for.
///
/// Both the current short IDs and legacy full-length ones resolve, whichever
/// form the bug has stored.
pub fn bug_by_stage_id(storage: &Storage, id: &str) -> Result<(BugKey, Bug)> {
    let id = id.trim().to_ascii_lowercase();
    if !looks_like_stage_id(&id) {
        return Err(Error::MalformedInput(format!(
            "stage id must be {} or {} hex characters, got: {}",
            STAGE_ID_LEN, HASH_LEN, id
        )));
    }
    for (raw_key, bug) in storage.lookup::<Bug>(TERM_STAGE_ID, &stage_id_term(&id))? {
        let key = BugKey::parse(&raw_key)?;
        let matches = bug.reporting.iter().any(|r| {
            r.id == id
                || (id.len() == STAGE_ID_LEN && r.id.starts_with(&id))
                || (id.len() == HASH_LEN && legacy_stage_id(&key, &r.name) == id)
        });
        if matches {
            return Ok((key, bug));
        }
    }
    Err(Error::NotFound(format!("no bug has stage id {}", id)))
}

/// Other bugs sharing an alternate title with bug `key`, within its
/// similarity domain. Candidates for a manual merge.
pub fn load_similar_bugs(ctx: &Context, storage: &Storage, key: &BugKey) -> Result<Vec<(BugKey, Bug)>> {
    let bug = load_bug(storage, key)?;
    let namespaces = ctx.config().similarity_namespaces(&bug.namespace);
    let mut seen: HashSet<BugKey> = HashSet::from([key.clone()]);
    let mut similar = Vec::new();
    for title in &bug.alt_titles {
        for (other_key, other) in storage.lookup::<Bug>(TERM_ALT_TITLE, title)? {
            if !namespaces.contains(&other.namespace.as_str()) {
                continue;
            }
            let other_key = BugKey::parse(&other_key)?;
            if seen.insert(other_key.clone()) {
                similar.push((other_key, other));
            }
        }
    }
    Ok(similar)
}

/// One crash as reported by a fuzzing manager.
#[derive(Debug, Clone, Default)]
pub struct NewCrash {
    pub namespace: String,
    pub manager: String,
    pub build_id: String,
    pub title: String,
    pub alt_titles: Vec<String>,
    pub maintainers: Vec<String>,
    pub guilty_files: Vec<String>,
    pub log: Vec<u8>,
    pub report: Vec<u8>,
    pub machine_info: Vec<u8>,
    pub repro_opts: String,
    pub repro_syz: Vec<u8>,
    pub repro_c: Vec<u8>,
    pub flags: i64,
    pub report_priority: i64,
}

impl NewCrash {
    pub fn new(namespace: &str, manager: &str, title: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            manager: manager.to_string(),
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn repro_level(&self) -> ReproLevel {
        if !self.repro_c.is_empty() {
            ReproLevel::C
        } else if !self.repro_syz.is_empty() {
            ReproLevel::Syz
        } else {
            ReproLevel::None
        }
    }
}

/// Result of [`report_crash`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrashOutcome {
    pub bug: BugKey,
    /// Display title of the bug the crash went to.
    pub title: String,
    pub new_bug: bool,
    /// Set if the crash was saved.
    pub crash_id: Option<i64>,
}

fn need_save_crash(bug: &Bug, level: ReproLevel, now: DateTime<Utc>) -> bool {
    bug.num_crashes < MAX_CRASHES_PER_BUG
        || level > bug.repro_level
        || bug
            .last_saved_crash
            .is_none_or(|t| now - t > save_crash_interval())
}

/// Find or create the bug crashes titled `title` go to.
fn resolve_bug_for_crash(
    storage: &mut Storage,
    ns: &NamespaceConfig,
    title: &str,
    now: DateTime<Utc>,
) -> Result<(BugKey, bool)> {
    let seq = match find_bug_by_title(storage, &ns.name, title)? {
        Some((key, bug)) => match bug.status {
            BugStatus::Open => return Ok((key, false)),
            BugStatus::Duplicate(_) => return Ok((canonical_bug(storage, &key)?.0, false)),
            BugStatus::Fixed | BugStatus::Invalid => bug.seq + 1,
        },
        None => 0,
    };
    let key = BugKey::derive(&ns.key, &ns.name, title, seq);
    let created = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        if tx.get::<Bug>(key.as_str())?.is_some() {
            return Ok(false);
        }
        let mut bug = Bug::new(&ns.name, title, seq, now);
        backfill_reporting(&mut bug, &key, &ns.reporting, now);
        tx.put(key.as_str(), None, &bug)?;
        Ok(true)
    })?;
    if created {
        tracing::info!(bug = %key, namespace = %ns.name, title, seq, "new bug");
    }
    Ok((key, created))
}

/// Record a crash observation.
///
/// Counters and history of the bug are always updated. The crash itself is
/// saved (with its blobs) only while the bug has few crashes, when it brings
/// a better reproducer, or when none was saved recently.
pub fn report_crash(ctx: &Context, storage: &mut Storage, req: &NewCrash) -> Result<CrashOutcome> {
    let now = ctx.now();
    let ns = ctx.namespace(&req.namespace)?;
    if req.title.trim().is_empty() {
        return Err(Error::InvalidInput("crash title must not be empty".to_string()));
    }
    if req.manager.is_empty() {
        return Err(Error::InvalidInput("crash manager must not be empty".to_string()));
    }
    let (key, new_bug) = resolve_bug_for_crash(storage, ns, &req.title, now)?;
    let level = req.repro_level();

    // Blobs are written outside the bug transaction; a crash that ends up
    // not being saved leaves them unreferenced.
    let mut prepared = None;
    if need_save_crash(&load_bug(storage, &key)?, level, now) {
        let id = storage.allocate_id(Crash::KIND)?;
        let mut crash = Crash::new(id, key.clone(), &req.title, &req.manager, now);
        crash.build_id = req.build_id.clone();
        crash.maintainers = req.maintainers.clone();
        crash.report_elements.guilty_files = req.guilty_files.clone();
        crash.repro_opts = req.repro_opts.clone();
        crash.flags = req.flags;
        crash.report_priority = req.report_priority;
        crash.log = storage.put_optional(BlobKind::CrashLog, &req.log)?;
        crash.report = storage.put_optional(BlobKind::CrashReport, &req.report)?;
        crash.machine_info = storage.put_optional(BlobKind::MachineInfo, &req.machine_info)?;
        crash.repro_syz = storage.put_optional(BlobKind::ReproSyz, &req.repro_syz)?;
        crash.repro_c = storage.put_optional(BlobKind::ReproC, &req.repro_c)?;
        prepared = Some(crash);
    }

    let (bug, crash_id) = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut bug: Bug = tx.must_get(key.as_str())?;
        let saved = match &prepared {
            Some(crash) if need_save_crash(&bug, level, now) => {
                tx.put(&crash_key(&key, crash.id), Some(key.as_str()), crash)?;
                bug.last_saved_crash = Some(now);
                Some(crash.id)
            }
            _ => None,
        };
        bug.increase_crash_stats(now);
        bug.first_time.get_or_insert(now);
        bug.last_time = Some(now);
        merge_string(&mut bug.happened_on, &req.manager);
        if level != ReproLevel::None {
            bug.num_repro += 1;
            bug.last_repro_time = Some(now);
        }
        bug.repro_level = bug.repro_level.max(level);
        bug.head_repro_level = bug.head_repro_level.max(level);
        if !req.report.is_empty() {
            bug.has_report = true;
        }
        bug.merge_title(&req.title);
        bug.add_alt_titles(&req.alt_titles);
        bug.last_activity = Some(now);
        tx.put(key.as_str(), None, &bug)?;
        Ok((bug, saved))
    })?;

    tracing::debug!(bug = %key, manager = %req.manager, saved = crash_id.is_some(), "crash observed");
    Ok(CrashOutcome {
        title: bug.display_title(),
        bug: key,
        new_bug,
        crash_id,
    })
}

/// Close bug `key` as fixed or invalid.
pub fn set_bug_status(
    ctx: &Context,
    storage: &mut Storage,
    key: &BugKey,
    status: BugStatus,
    reason: Option<String>,
) -> Result<Bug> {
    if !matches!(status, BugStatus::Fixed | BugStatus::Invalid) {
        return Err(Error::InvalidInput(format!(
            "cannot set status {} directly; use reopen or mark_duplicate",
            status
        )));
    }
    let now = ctx.now();
    let (bug, released) = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut bug: Bug = tx.must_get(key.as_str())?;
        if !bug.status.is_open() {
            return Err(Error::InvalidInput(format!("bug {} is already {}", key, bug.status)));
        }
        bug.status = status.clone();
        bug.status_reason = reason.clone();
        bug.closed = Some(now);
        bug.last_activity = Some(now);
        let released = close_open_stages(&mut bug, now);
        tx.put(key.as_str(), None, &bug)?;
        Ok((bug, released))
    })?;
    release_stage_references(storage, key, &released)?;
    tracing::info!(bug = %key, status = %bug.status, "bug closed");
    Ok(bug)
}

/// Mark bug `key` as a duplicate of `dup_of`.
///
/// Refused if `dup_of` is missing, lives in another namespace, or
/// (through its own chain) resolves back to `key`.
pub fn mark_duplicate(ctx: &Context, storage: &mut Storage, key: &BugKey, dup_of: &BugKey) -> Result<Bug> {
    if key == dup_of {
        return Err(Error::InvalidInput(format!("bug {} cannot duplicate itself", key)));
    }
    let now = ctx.now();
    let (bug, released) = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut bug: Bug = tx.must_get(key.as_str())?;
        let target: Bug = tx.must_get(dup_of.as_str())?;
        if target.namespace != bug.namespace {
            return Err(Error::InvalidInput(format!(
                "cannot dup bug {} into namespace {}",
                key, target.namespace
            )));
        }
        let (canonical, _) = walk_canonical(dup_of, |k| tx.get::<Bug>(k.as_str()))?;
        if canonical == *key {
            return Err(Error::InvalidInput(format!(
                "marking {} as a duplicate of {} would create a cycle",
                key, dup_of
            )));
        }
        bug.status = BugStatus::Duplicate(dup_of.clone());
        bug.status_reason = None;
        bug.closed.get_or_insert(now);
        bug.last_activity = Some(now);
        let released = close_open_stages(&mut bug, now);
        tx.put(key.as_str(), None, &bug)?;
        Ok((bug, released))
    })?;
    release_stage_references(storage, key, &released)?;
    tracing::info!(bug = %key, dup_of = %dup_of, "bug marked duplicate");
    Ok(bug)
}

/// Reopen a closed bug. Stages closed together with the bug reopen too and
/// take their crash references back.
pub fn reopen(ctx: &Context, storage: &mut Storage, key: &BugKey) -> Result<Bug> {
    let now = ctx.now();
    let (bug, reopened) = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut bug: Bug = tx.must_get(key.as_str())?;
        if bug.status.is_open() {
            return Err(Error::InvalidInput(format!("bug {} is already open", key)));
        }
        let closed = bug.closed.take();
        let mut reopened = Vec::new();
        for entry in bug.reporting.iter_mut().filter(|r| !r.dummy) {
            if closed.is_some() && entry.closed == closed {
                entry.closed = None;
                if let Some(crash_id) = entry.crash_id {
                    reopened.push((entry.name.clone(), crash_id));
                }
            }
        }
        bug.status = BugStatus::Open;
        bug.status_reason = None;
        bug.last_activity = Some(now);
        tx.put(key.as_str(), None, &bug)?;
        Ok((bug, reopened))
    })?;
    for (stage, crash_id) in &reopened {
        ledger::add_crash_reference(storage, key, *crash_id, ReferenceKind::Reporting, stage, now)?;
    }
    tracing::info!(bug = %key, "bug reopened");
    Ok(bug)
}

/// Record the commits that fix bug `key`.
pub fn update_commits(ctx: &Context, storage: &mut Storage, key: &BugKey, commits: Vec<String>) -> Result<Bug> {
    let now = ctx.now();
    storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut bug: Bug = tx.must_get(key.as_str())?;
        bug.update_commits(commits.clone(), now);
        tx.put(key.as_str(), None, &bug)?;
        Ok(bug)
    })
}

/// Set a label by hand.
pub fn set_label(ctx: &Context, storage: &mut Storage, key: &BugKey, label: BugLabel) -> Result<Bug> {
    let now = ctx.now();
    storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut bug: Bug = tx.must_get(key.as_str())?;
        bug.set_user_label(label.clone())?;
        bug.last_activity = Some(now);
        tx.put(key.as_str(), None, &bug)?;
        Ok(bug)
    })
}

/// Re-run subsystem classification over the guilty files of the bug's crashes.
///
/// Returns true if the automatic labels were replaced.
pub fn refresh_subsystems(
    ctx: &Context,
    storage: &mut Storage,
    key: &BugKey,
    classifier: &dyn Classifier,
) -> Result<bool> {
    let mut files: Vec<String> = Vec::new();
    for crash in ledger::crashes_of(storage, key)? {
        for file in crash.report_elements.guilty_files {
            merge_string(&mut files, &file);
        }
    }
    if files.is_empty() {
        return Ok(false);
    }
    let names = classifier.classify(&files)?;
    let revision = classifier.revision();
    let now = ctx.now();
    let changed = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut bug: Bug = tx.must_get(key.as_str())?;
        if !bug.set_auto_subsystems(&names, now, revision) {
            return Ok(false);
        }
        tx.put(key.as_str(), None, &bug)?;
        Ok(true)
    })?;
    tracing::debug!(bug = %key, revision, changed, ?names, "subsystems refreshed");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, NamespaceConfig, StageConfig};
    use crate::models::{ReportingStatus, SUBSYSTEM_LABEL};
    use crate::test_utils::{NS, TestEnv, observe, test_config};

    fn put_bug(env: &mut TestEnv, bug: &Bug) -> BugKey {
        let salt = env.ctx.namespace(&bug.namespace).unwrap().key.clone();
        let key = bug.key(&salt);
        env.storage
            .run_in_transaction(1, |tx| tx.put(key.as_str(), None, bug))
            .unwrap();
        key
    }

    fn dup_bug(title: &str, of: &BugKey) -> Bug {
        let mut bug = Bug::new(NS, title, 0, crate::test_utils::t0());
        bug.status = BugStatus::Duplicate(of.clone());
        bug
    }

    #[test]
    fn test_first_crash_creates_bug() {
        let mut env = TestEnv::new();
        let out = observe(&mut env, "KASAN: use-after-free in foo");
        assert!(out.new_bug);
        assert!(out.crash_id.is_some());

        let bug = load_bug(&env.storage, &out.bug).unwrap();
        assert_eq!(bug.seq, 0);
        assert_eq!(bug.num_crashes, 1);
        assert_eq!(bug.happened_on, vec!["ci"]);
        let names: Vec<_> = bug.reporting.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["moderation", "public"]);
        assert!(bug.reporting.iter().all(|r| r.status() == ReportingStatus::Unreported));
        assert_eq!(out.bug, BugKey::derive("test-salt", NS, "KASAN: use-after-free in foo", 0));
    }

    #[test]
    fn test_repeated_crash_goes_to_same_bug() {
        let mut env = TestEnv::new();
        let a = observe(&mut env, "t");
        let b = observe(&mut env, "t");
        assert_eq!(a.bug, b.bug);
        assert!(!b.new_bug);
        assert_eq!(load_bug(&env.storage, &a.bug).unwrap().num_crashes, 2);
    }

    #[test]
    fn test_crash_on_fixed_bug_opens_next_seq() {
        let mut env = TestEnv::new();
        let first = observe(&mut env, "t");
        set_bug_status(&env.ctx, &mut env.storage, &first.bug, BugStatus::Fixed, None).unwrap();

        let second = observe(&mut env, "t");
        assert!(second.new_bug);
        assert_ne!(second.bug, first.bug);
        assert_eq!(second.title, "t (2)");
        let (key, bug) = bug_by_display_title(&env.ctx, &env.storage, NS, "t (2)").unwrap();
        assert_eq!(key, second.bug);
        assert_eq!(bug.seq, 1);

        // The newest bug wins title lookups from now on.
        let third = observe(&mut env, "t");
        assert_eq!(third.bug, second.bug);
    }

    #[test]
    fn test_crash_on_duplicate_goes_to_canonical() {
        let mut env = TestEnv::new();
        let a = observe(&mut env, "a");
        let b = observe(&mut env, "b");
        mark_duplicate(&env.ctx, &mut env.storage, &a.bug, &b.bug).unwrap();

        let again = observe(&mut env, "a");
        assert_eq!(again.bug, b.bug);
        let canonical = load_bug(&env.storage, &b.bug).unwrap();
        assert!(canonical.merged_titles.contains(&"a".to_string()));
        assert_eq!(canonical.num_crashes, 2);
    }

    #[test]
    fn test_bug_by_stage_id_short_and_legacy() {
        let mut env = TestEnv::new();
        let out = observe(&mut env, "WARNING in foo");
        observe(&mut env, "WARNING in bar");

        let short = crate::identity::stage_id(&out.bug, "public");
        assert_eq!(bug_by_stage_id(&env.storage, &short).unwrap().0, out.bug);
        let legacy = legacy_stage_id(&out.bug, "public");
        assert_eq!(bug_by_stage_id(&env.storage, &legacy).unwrap().0, out.bug);
        assert_eq!(bug_by_stage_id(&env.storage, &short.to_uppercase()).unwrap().0, out.bug);
    }

    #[test]
    fn test_bug_by_stage_id_stored_in_legacy_form() {
        let mut env = TestEnv::new();
        let mut bug = Bug::new(NS, "old", 0, crate::test_utils::t0());
        let key = bug.key("test-salt");
        let legacy = legacy_stage_id(&key, "moderation");
        bug.reporting = vec![crate::models::BugReporting::new("moderation", legacy.clone())];
        put_bug(&mut env, &bug);

        assert_eq!(bug_by_stage_id(&env.storage, &legacy).unwrap().0, key);
        assert_eq!(bug_by_stage_id(&env.storage, &legacy[..STAGE_ID_LEN]).unwrap().0, key);
    }

    #[test]
    fn test_bug_by_stage_id_errors() {
        let mut env = TestEnv::new();
        observe(&mut env, "t");
        assert!(matches!(
            bug_by_stage_id(&env.storage, "not-an-id"),
            Err(Error::MalformedInput(_))
        ));
        assert!(matches!(
            bug_by_stage_id(&env.storage, &"0".repeat(STAGE_ID_LEN)),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            bug_by_stage_id(&env.storage, &"0".repeat(HASH_LEN)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_canonical_chain_resolves() {
        let mut env = TestEnv::new();
        let d = put_bug(&mut env, &Bug::new(NS, "d", 0, crate::test_utils::t0()));
        let c = put_bug(&mut env, &dup_bug("c", &d));
        let b = put_bug(&mut env, &dup_bug("b", &c));
        let a = put_bug(&mut env, &dup_bug("a", &b));
        let (key, bug) = canonical_bug(&env.storage, &a).unwrap();
        assert_eq!(key, d);
        assert_eq!(bug.title, "d");
        assert_eq!(canonical_bug(&env.storage, &d).unwrap().0, d);
    }

    #[test]
    fn test_canonical_cycle_is_integrity_violation() {
        let mut env = TestEnv::new();
        let a_key = BugKey::derive("test-salt", NS, "a", 0);
        let b = put_bug(&mut env, &dup_bug("b", &a_key));
        put_bug(&mut env, &dup_bug("a", &b));
        assert!(matches!(
            canonical_bug(&env.storage, &a_key),
            Err(Error::IntegrityViolation(_))
        ));
    }

    #[test]
    fn test_canonical_missing_target_is_integrity_violation() {
        let mut env = TestEnv::new();
        let ghost = BugKey::derive("test-salt", NS, "ghost", 0);
        let a = put_bug(&mut env, &dup_bug("a", &ghost));
        assert!(matches!(
            canonical_bug(&env.storage, &a),
            Err(Error::IntegrityViolation(_))
        ));
        assert!(matches!(
            canonical_bug(&env.storage, &ghost),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_mark_duplicate_refusals() {
        let mut env = TestEnv::new();
        let a = observe(&mut env, "a");
        let b = observe(&mut env, "b");
        let ghost = BugKey::derive("test-salt", NS, "ghost", 0);

        assert!(matches!(
            mark_duplicate(&env.ctx, &mut env.storage, &a.bug, &a.bug),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            mark_duplicate(&env.ctx, &mut env.storage, &a.bug, &ghost),
            Err(Error::NotFound(_))
        ));

        mark_duplicate(&env.ctx, &mut env.storage, &b.bug, &a.bug).unwrap();
        let err = mark_duplicate(&env.ctx, &mut env.storage, &a.bug, &b.bug).unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert!(load_bug(&env.storage, &a.bug).unwrap().status.is_open());
    }

    #[test]
    fn test_crash_saving_is_throttled() {
        let mut env = TestEnv::new();
        for _ in 0..MAX_CRASHES_PER_BUG {
            assert!(observe(&mut env, "t").crash_id.is_some());
        }
        let out = observe(&mut env, "t");
        assert!(out.crash_id.is_none());

        let mut better = NewCrash::new(NS, "ci", "t");
        better.repro_syz = b"r0 = open()".to_vec();
        assert!(report_crash(&env.ctx, &mut env.storage, &better).unwrap().crash_id.is_some());
        assert!(observe(&mut env, "t").crash_id.is_none());

        env.clock.advance(Duration::minutes(61));
        assert!(observe(&mut env, "t").crash_id.is_some());

        let bug = load_bug(&env.storage, &out.bug).unwrap();
        assert_eq!(bug.num_crashes, MAX_CRASHES_PER_BUG + 4);
        assert_eq!(bug.repro_level, ReproLevel::Syz);
        assert_eq!(bug.num_repro, 1);
        assert_eq!(
            ledger::crashes_of(&env.storage, &out.bug).unwrap().len() as i64,
            MAX_CRASHES_PER_BUG + 2
        );
    }

    #[test]
    fn test_crash_blobs_are_stored() {
        let mut env = TestEnv::new();
        let mut req = NewCrash::new(NS, "ci", "t");
        req.log = b"console output".to_vec();
        req.repro_c = b"int main() {}".to_vec();
        let out = report_crash(&env.ctx, &mut env.storage, &req).unwrap();
        let crash = ledger::load_crash(&env.storage, &out.bug, out.crash_id.unwrap()).unwrap();
        assert_eq!(env.storage.get_blob(crash.log.unwrap()).unwrap(), b"console output");
        assert_eq!(crash.repro_level(), ReproLevel::C);
        assert!(crash.report.is_none());
        assert!(!crash.is_referenced());
    }

    #[test]
    fn test_report_crash_rejects_unknown_namespace() {
        let mut env = TestEnv::new();
        let req = NewCrash::new("nope", "ci", "t");
        assert!(matches!(
            report_crash(&env.ctx, &mut env.storage, &req),
            Err(Error::Config(_))
        ));
    }

    fn two_namespace_config() -> Config {
        let mut config = test_config();
        config.namespaces.push(NamespaceConfig {
            name: "stable".to_string(),
            key: "stable-salt".to_string(),
            similarity_domain: Some("linux".to_string()),
            reporting: vec![StageConfig::new("public")],
        });
        config.namespaces.push(NamespaceConfig {
            name: "android".to_string(),
            key: "android-salt".to_string(),
            similarity_domain: None,
            reporting: vec![StageConfig::new("public")],
        });
        config
    }

    #[test]
    fn test_similar_bugs_within_domain() {
        let mut env = TestEnv::with_config(two_namespace_config());
        let mut report = |ns: &str, title: &str| {
            let mut req = NewCrash::new(ns, "ci", title);
            req.alt_titles = vec!["WARNING in foo".to_string()];
            report_crash(&env.ctx, &mut env.storage, &req).unwrap().bug
        };
        let upstream = report(NS, "WARNING in foo");
        let stable = report("stable", "WARNING in foo");
        let _android = report("android", "WARNING in foo");
        let other = report(NS, "WARNING in foo2");

        let similar = load_similar_bugs(&env.ctx, &env.storage, &upstream).unwrap();
        let keys: HashSet<_> = similar.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, HashSet::from([stable, other]));
    }

    #[test]
    fn test_reopen_restores_stages_closed_with_bug() {
        let mut env = TestEnv::new();
        let out = observe(&mut env, "t");
        set_bug_status(&env.ctx, &mut env.storage, &out.bug, BugStatus::Invalid, Some("flaky".into())).unwrap();
        assert!(set_bug_status(&env.ctx, &mut env.storage, &out.bug, BugStatus::Fixed, None).is_err());

        env.clock.advance(Duration::hours(1));
        let bug = reopen(&env.ctx, &mut env.storage, &out.bug).unwrap();
        assert!(bug.status.is_open());
        assert!(bug.closed.is_none());
        assert!(bug.status_reason.is_none());
        assert!(bug.reporting.iter().all(|r| r.closed.is_none()));
        assert!(reopen(&env.ctx, &mut env.storage, &out.bug).is_err());
    }

    #[test]
    fn test_set_status_rejects_open_and_dup() {
        let mut env = TestEnv::new();
        let out = observe(&mut env, "t");
        assert!(set_bug_status(&env.ctx, &mut env.storage, &out.bug, BugStatus::Open, None).is_err());
        assert!(
            set_bug_status(&env.ctx, &mut env.storage, &out.bug, BugStatus::Duplicate(out.bug.clone()), None)
                .is_err()
        );
    }

    #[test]
    fn test_update_commits() {
        let mut env = TestEnv::new();
        let out = observe(&mut env, "t");
        let bug = update_commits(&env.ctx, &mut env.storage, &out.bug, vec!["net: fix foo".into()]).unwrap();
        assert_eq!(bug.commits, vec!["net: fix foo"]);
        assert!(bug.need_commit_info);
        assert_eq!(bug.fix_time, Some(env.ctx.now()));
    }

    struct PrefixClassifier {
        revision: u32,
    }

    impl Classifier for PrefixClassifier {
        fn classify(&self, files: &[String]) -> Result<Vec<String>> {
            Ok(files
                .iter()
                .filter_map(|f| f.split('/').next())
                .map(str::to_string)
                .collect())
        }

        fn revision(&self) -> u32 {
            self.revision
        }
    }

    #[test]
    fn test_refresh_subsystems() {
        let mut env = TestEnv::new();
        let mut req = NewCrash::new(NS, "ci", "t");
        req.guilty_files = vec!["net/ipv4/tcp.c".to_string(), "mm/slab.c".to_string()];
        let out = report_crash(&env.ctx, &mut env.storage, &req).unwrap();

        let classifier = PrefixClassifier { revision: 2 };
        assert!(refresh_subsystems(&env.ctx, &mut env.storage, &out.bug, &classifier).unwrap());
        let bug = load_bug(&env.storage, &out.bug).unwrap();
        let names: Vec<_> = bug.labels_of(SUBSYSTEM_LABEL).map(|l| l.value.as_str()).collect();
        assert_eq!(names, vec!["net", "mm"]);

        let old = PrefixClassifier { revision: 1 };
        assert!(!refresh_subsystems(&env.ctx, &mut env.storage, &out.bug, &old).unwrap());
    }

    #[test]
    fn test_manual_label_blocks_classifier() {
        let mut env = TestEnv::new();
        let mut req = NewCrash::new(NS, "ci", "t");
        req.guilty_files = vec!["net/core/dev.c".to_string()];
        let out = report_crash(&env.ctx, &mut env.storage, &req).unwrap();
        set_label(
            &env.ctx,
            &mut env.storage,
            &out.bug,
            BugLabel {
                label: SUBSYSTEM_LABEL.to_string(),
                value: "usb".to_string(),
                set_by: Some("dev@example.com".to_string()),
                link: None,
            },
        )
        .unwrap();
        let classifier = PrefixClassifier { revision: 1 };
        assert!(!refresh_subsystems(&env.ctx, &mut env.storage, &out.bug, &classifier).unwrap());
    }
}
