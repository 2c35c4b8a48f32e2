//! Crash evidence ledger.
//!
//! Reference updates are transactions on a single Crash record, so consumers
//! working on different crashes never contend with each other or with the
//! owning bug.

use crate::identity::BugKey;
use crate::models::{Crash, CrashReference, ReferenceKind};
use crate::storage::records::crash_key;
use crate::storage::{Storage, TX_ATTEMPTS};
use crate::Result;
use chrono::{DateTime, Utc};

/// Mark crash `id` of `bug` as needed by `kind`/`key` as of `now`.
pub fn add_crash_reference(
    storage: &mut Storage,
    bug: &BugKey,
    id: i64,
    kind: ReferenceKind,
    key: &str,
    now: DateTime<Utc>,
) -> Result<Crash> {
    let crash_key = crash_key(bug, id);
    let crash = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut crash: Crash = tx.must_get(&crash_key)?;
        crash.add_reference(CrashReference::new(kind, key, now));
        tx.put(&crash_key, Some(bug.as_str()), &crash)?;
        Ok(crash)
    })?;
    tracing::debug!(crash = %crash_key, %kind, key, "crash reference added");
    Ok(crash)
}

/// Drop the `kind`/`key` reference from crash `id` of `bug`.
///
/// Removing a reference that is not there leaves the crash unchanged.
pub fn remove_crash_reference(
    storage: &mut Storage,
    bug: &BugKey,
    id: i64,
    kind: ReferenceKind,
    key: &str,
) -> Result<Crash> {
    let crash_key = crash_key(bug, id);
    let crash = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut crash: Crash = tx.must_get(&crash_key)?;
        let before = crash.references.len();
        crash.clear_reference(kind, key);
        if crash.references.len() != before {
            tx.put(&crash_key, Some(bug.as_str()), &crash)?;
        }
        Ok(crash)
    })?;
    tracing::debug!(crash = %crash_key, %kind, key, reported = ?crash.reported, "crash reference removed");
    Ok(crash)
}

pub fn load_crash(storage: &Storage, bug: &BugKey, id: i64) -> Result<Crash> {
    let key = crash_key(bug, id);
    storage
        .get(&key)?
        .ok_or_else(|| crate::Error::NotFound(format!("crash not found: {}", key)))
}

/// All saved crashes of `bug`.
pub fn crashes_of(storage: &Storage, bug: &BugKey) -> Result<Vec<Crash>> {
    Ok(storage
        .children::<Crash>(bug.as_str())?
        .into_iter()
        .map(|(_, crash)| crash)
        .collect())
}
