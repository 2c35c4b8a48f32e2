//! Fuzzing manager records and their per-day statistics.
//!
//! [`update_manager`] is the only way either record is written: the manager
//! and its stats for the current day change together in one transaction.

use crate::context::Context;
use crate::models::{Manager, ManagerStats, time_date};
use crate::storage::records::{TERM_NAMESPACE, manager_key, manager_stats_key};
use crate::storage::{Storage, TX_ATTEMPTS};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Load-or-create manager `name` and today's stats, apply `f` to both and
/// write them back, retrying on conflict.
///
/// `f` may run several times; it must derive its changes from the records
/// it is given.
pub fn update_manager<F>(
    ctx: &Context,
    storage: &mut Storage,
    namespace: &str,
    name: &str,
    mut f: F,
) -> Result<(Manager, ManagerStats)>
where
    F: FnMut(&mut Manager, &mut ManagerStats) -> Result<()>,
{
    ctx.namespace(namespace)?;
    if name.is_empty() {
        return Err(Error::InvalidInput("manager name must not be empty".to_string()));
    }
    let date = time_date(ctx.now());
    let mgr_key = manager_key(namespace, name);
    let stats_key = manager_stats_key(namespace, name, date);
    storage.run_in_transaction(TX_ATTEMPTS, |tx| {
        let mut manager: Manager = tx
            .get(&mgr_key)?
            .unwrap_or_else(|| Manager::new(namespace, name));
        let mut stats: ManagerStats = tx
            .get(&stats_key)?
            .unwrap_or_else(|| ManagerStats::new(date));
        f(&mut manager, &mut stats)?;
        tx.put(&mgr_key, None, &manager)?;
        tx.put(&stats_key, Some(&mgr_key), &stats)?;
        Ok((manager, stats))
    })
}

/// Periodic status report of a running manager. Counters are deltas since
/// the previous heartbeat; `corpus`, `pcs`, `cover` and `crash_types` are
/// current totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Heartbeat {
    pub link: Option<String>,
    pub build: Option<String>,
    pub up_time_secs: u64,
    pub fuzzing_time_secs: u64,
    pub corpus: i64,
    pub pcs: i64,
    pub cover: i64,
    pub crashes: i64,
    pub crash_types: i64,
    pub suppressed_crashes: i64,
    pub execs: i64,
}

pub fn manager_heartbeat(
    ctx: &Context,
    storage: &mut Storage,
    namespace: &str,
    name: &str,
    beat: &Heartbeat,
) -> Result<(Manager, ManagerStats)> {
    let now = ctx.now();
    let result = update_manager(ctx, storage, namespace, name, |manager, stats| {
        if beat.link.is_some() {
            manager.link = beat.link.clone();
        }
        if beat.build.is_some() {
            manager.current_build = beat.build.clone();
        }
        manager.last_alive = Some(now);
        manager.current_up_time_secs = beat.up_time_secs;

        stats.max_corpus = stats.max_corpus.max(beat.corpus);
        stats.max_pcs = stats.max_pcs.max(beat.pcs);
        stats.max_cover = stats.max_cover.max(beat.cover);
        stats.crash_types = stats.crash_types.max(beat.crash_types);
        stats.total_fuzzing_time_secs += beat.fuzzing_time_secs;
        stats.total_crashes += beat.crashes;
        stats.suppressed_crashes += beat.suppressed_crashes;
        stats.total_execs += beat.execs;
        Ok(())
    })?;
    tracing::debug!(namespace, manager = name, date = result.1.date, "manager heartbeat");
    Ok(result)
}

pub fn load_manager(storage: &Storage, namespace: &str, name: &str) -> Result<Manager> {
    storage
        .get(&manager_key(namespace, name))?
        .ok_or_else(|| Error::NotFound(format!("manager not found: {}/{}", namespace, name)))
}

/// Daily stats of a manager, oldest first.
pub fn stats_history(storage: &Storage, namespace: &str, name: &str) -> Result<Vec<ManagerStats>> {
    let mut history: Vec<ManagerStats> = storage
        .children::<ManagerStats>(&manager_key(namespace, name))?
        .into_iter()
        .map(|(_, stats)| stats)
        .collect();
    history.sort_by_key(|s| s.date);
    Ok(history)
}

/// Managers that ever reported in `namespace`.
pub fn managers_of(storage: &Storage, namespace: &str) -> Result<Vec<Manager>> {
    Ok(storage
        .lookup::<Manager>(TERM_NAMESPACE, namespace)?
        .into_iter()
        .map(|(_, manager)| manager)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FixedClock;
    use crate::test_utils::{NS, TestEnv, t0, test_config};
    use chrono::Duration;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn beat(crashes: i64, corpus: i64) -> Heartbeat {
        Heartbeat {
            crashes,
            corpus,
            fuzzing_time_secs: 60,
            ..Default::default()
        }
    }

    #[test]
    fn test_heartbeat_creates_and_accumulates() {
        let mut env = TestEnv::new();
        let (manager, stats) =
            manager_heartbeat(&env.ctx, &mut env.storage, NS, "ci-upstream", &beat(2, 100)).unwrap();
        assert_eq!(manager.last_alive, Some(t0()));
        assert_eq!(stats.date, 20240603);

        let (_, stats) = manager_heartbeat(&env.ctx, &mut env.storage, NS, "ci-upstream", &beat(3, 80)).unwrap();
        assert_eq!(stats.total_crashes, 5);
        assert_eq!(stats.max_corpus, 100);
        assert_eq!(stats.total_fuzzing_time_secs, 120);
        assert_eq!(managers_of(&env.storage, NS).unwrap().len(), 1);
    }

    #[test]
    fn test_new_day_starts_new_stats() {
        let mut env = TestEnv::new();
        manager_heartbeat(&env.ctx, &mut env.storage, NS, "ci", &beat(2, 100)).unwrap();
        env.clock.advance(Duration::days(1));
        let mut next = beat(1, 50);
        next.build = Some("build-2".to_string());
        let (manager, stats) = manager_heartbeat(&env.ctx, &mut env.storage, NS, "ci", &next).unwrap();
        assert_eq!(stats.total_crashes, 1);
        assert_eq!(stats.max_corpus, 50);
        assert_eq!(manager.current_build.as_deref(), Some("build-2"));

        let history = stats_history(&env.storage, NS, "ci").unwrap();
        let dates: Vec<_> = history.iter().map(|s| s.date).collect();
        assert_eq!(dates, vec![20240603, 20240604]);
    }

    #[test]
    fn test_mutator_error_writes_nothing() {
        let mut env = TestEnv::new();
        let result = update_manager(&env.ctx, &mut env.storage, NS, "ci", |m, _| {
            m.link = Some("http://x".to_string());
            Err(Error::Other("rejected".to_string()))
        });
        assert!(result.is_err());
        assert!(matches!(load_manager(&env.storage, NS, "ci"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_unknown_namespace_rejected() {
        let mut env = TestEnv::new();
        let result = manager_heartbeat(&env.ctx, &mut env.storage, "nope", "ci", &beat(1, 1));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_concurrent_updates_lose_nothing() {
        let temp = TempDir::new().unwrap();
        Storage::init(temp.path()).unwrap();
        let ctx = Context::new(test_config(), Arc::new(FixedClock::new(t0())));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = temp.path().to_path_buf();
                let ctx = ctx.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut storage = Storage::open(&path).unwrap();
                    let mut first = true;
                    update_manager(&ctx, &mut storage, NS, "ci", |_, stats| {
                        if first {
                            // Both threads read before either commits.
                            first = false;
                            barrier.wait();
                        }
                        stats.total_crashes += 1;
                        Ok(())
                    })
                    .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let storage = Storage::open(temp.path()).unwrap();
        let history = stats_history(&storage, NS, "ci").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].total_crashes, 2);
    }
}
