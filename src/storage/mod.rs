//! Storage layer for bugledger records.
//!
//! Every entity is a JSON document in a single SQLite table keyed by
//! `(kind, key)`, with an optional parent key for child records (crashes and
//! jobs under a bug, stats under a manager). Embedded arrays such as reporting
//! stages and daily stats live inside the owning document.
//!
//! ## Transactions
//!
//! Mutation goes through [`Storage::run_in_transaction`]. A [`Txn`] remembers
//! the version of every record it reads and buffers its writes; commit
//! re-checks those versions under an immediate SQLite transaction and fails
//! with [`Error::TransactionConflict`] if any record changed in between. Only
//! records the transaction touched take part, so updates to different bugs,
//! crashes or managers never conflict. Conflicts are retried a fixed number of
//! times and then surfaced.
//!
//! ## Layout
//!
//! - `records` - the documents (`kind`, `key`, `parent`, `version`, `body`)
//! - `record_index` - secondary lookup terms maintained on every write
//! - `id_alloc` - monotonic ids for child records
//! - `blobs` - compressed logs, reports and reproducers

pub mod migrate;
pub mod records;

use crate::{Error, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of attempts for a transaction before a conflict is surfaced.
pub const TX_ATTEMPTS: usize = 10;

/// How long a writer waits for the database lock.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "BL_DATA_DIR";

const DB_FILE: &str = "ledger.db";

/// A document type persisted in the record store.
pub trait Record: Serialize + DeserializeOwned {
    /// Table partition the record lives in.
    const KIND: &'static str;

    /// Secondary lookup terms as `(term, value)` pairs.
    fn index_terms(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// Decode a stored document. Record types with legacy layouts upgrade
    /// them here, once, before any business logic sees the value.
    fn load(raw: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(raw)?)
    }
}

fn decode<T: Record>(body: &str) -> Result<T> {
    let raw: serde_json::Value = serde_json::from_str(body)?;
    T::load(raw)
}

/// Storage manager for one data directory.
pub struct Storage {
    /// Directory holding the database
    pub root: PathBuf,
    conn: Connection,
}

impl Storage {
    /// Open existing storage in `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join(DB_FILE);
        if !db_path.exists() {
            return Err(Error::NotInitialized);
        }
        let conn = Connection::open(&db_path)?;
        Self::configure(&conn)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            root: data_dir.to_path_buf(),
            conn,
        })
    }

    /// Initialize storage in `data_dir`, creating it if needed.
    pub fn init(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join(DB_FILE))?;
        Self::configure(&conn)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            root: data_dir.to_path_buf(),
            conn,
        })
    }

    /// Check if storage exists in `data_dir`.
    pub fn exists(data_dir: &Path) -> bool {
        data_dir.join(DB_FILE).exists()
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            root: PathBuf::from(":memory:"),
            conn,
        })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Ok(())
    }

    /// Initialize the SQLite schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                parent TEXT,
                version INTEGER NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (kind, key)
            );

            CREATE INDEX IF NOT EXISTS idx_records_parent ON records(kind, parent);

            CREATE TABLE IF NOT EXISTS record_index (
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                term TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (kind, key, term, value)
            );

            CREATE INDEX IF NOT EXISTS idx_record_index_lookup ON record_index(kind, term, value);

            CREATE TABLE IF NOT EXISTS id_alloc (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                allocated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS blobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                size INTEGER NOT NULL,
                data BLOB NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` as one optimistic transaction, retrying on conflict.
    ///
    /// `f` may run up to `attempts` times and must not have side effects
    /// outside the transaction. Errors returned by `f` abort immediately.
    pub fn run_in_transaction<T, F>(&mut self, attempts: usize, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Txn<'_>) -> Result<T>,
    {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            let mut txn = Txn::new(&mut self.conn);
            let value = f(&mut txn)?;
            match txn.commit() {
                Ok(()) => return Ok(value),
                Err(Error::TransactionConflict { keys }) if attempt < attempts => {
                    tracing::debug!(attempt, ?keys, "transaction conflict, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    if let Error::TransactionConflict { keys } = &e {
                        tracing::warn!(attempts, ?keys, "transaction retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Read a record outside of any transaction.
    pub fn get<T: Record>(&self, key: &str) -> Result<Option<T>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM records WHERE kind = ?1 AND key = ?2",
                params![T::KIND, key],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| decode(&b)).transpose()
    }

    /// Records of type `T` that carry index term `term = value`, ordered by key.
    pub fn lookup<T: Record>(&self, term: &str, value: &str) -> Result<Vec<(String, T)>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.key, r.body FROM record_index i
             JOIN records r ON r.kind = i.kind AND r.key = i.key
             WHERE i.kind = ?1 AND i.term = ?2 AND i.value = ?3
             ORDER BY r.key",
        )?;
        let rows = stmt
            .query_map(params![T::KIND, term, value], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(key, body)| Ok((key, decode(&body)?)))
            .collect()
    }

    /// Child records of type `T` under `parent`, ordered by key.
    pub fn children<T: Record>(&self, parent: &str) -> Result<Vec<(String, T)>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, body FROM records WHERE kind = ?1 AND parent = ?2 ORDER BY key",
        )?;
        let rows = stmt
            .query_map(params![T::KIND, parent], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(key, body)| Ok((key, decode(&body)?)))
            .collect()
    }

    /// Current version of a record; 0 if absent.
    pub fn version<T: Record>(&self, key: &str) -> Result<i64> {
        read_version(&self.conn, T::KIND, key)
    }

    /// Allocate a fresh id for a child record of `kind`.
    pub fn allocate_id(&self, kind: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO id_alloc (kind, allocated_at) VALUES (?1, ?2)",
            params![kind, Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Write raw JSON for a record, bypassing the model types, to plant
    /// documents in the shape older versions wrote.
    #[cfg(test)]
    pub fn put_raw(&mut self, kind: &str, key: &str, parent: Option<&str>, body: &str) -> Result<()> {
        let _: serde_json::Value = serde_json::from_str(body)?;
        self.conn.execute(
            "INSERT INTO records (kind, key, parent, version, body, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)
             ON CONFLICT(kind, key) DO UPDATE SET
                parent = excluded.parent,
                body = excluded.body,
                version = records.version + 1,
                updated_at = excluded.updated_at",
            params![kind, key, parent, body, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn read_version(conn: &Connection, kind: &str, key: &str) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM records WHERE kind = ?1 AND key = ?2",
            params![kind, key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct RecordId {
    kind: &'static str,
    key: String,
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

struct PendingWrite {
    parent: Option<String>,
    body: String,
    terms: Vec<(&'static str, String)>,
}

/// An optimistic transaction over the record store.
pub struct Txn<'a> {
    conn: &'a mut Connection,
    /// Version observed at first read; 0 for absent records.
    reads: HashMap<RecordId, i64>,
    writes: BTreeMap<RecordId, PendingWrite>,
}

impl<'a> Txn<'a> {
    fn new(conn: &'a mut Connection) -> Self {
        Self {
            conn,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
        }
    }

    /// Read a record. The version seen here is validated at commit.
    pub fn get<T: Record>(&mut self, key: &str) -> Result<Option<T>> {
        let id = RecordId {
            kind: T::KIND,
            key: key.to_string(),
        };
        if let Some(pending) = self.writes.get(&id) {
            return decode(&pending.body).map(Some);
        }
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT version, body FROM records WHERE kind = ?1 AND key = ?2",
                params![T::KIND, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (version, body) = match row {
            Some((version, body)) => (version, Some(body)),
            None => (0, None),
        };
        self.reads.entry(id).or_insert(version);
        body.map(|b| decode(&b)).transpose()
    }

    /// Like [`Txn::get`], but a missing record is an error.
    pub fn must_get<T: Record>(&mut self, key: &str) -> Result<T> {
        self.get(key)?
            .ok_or_else(|| Error::NotFound(format!("{} not found: {}", T::KIND, key)))
    }

    /// Buffer a write; nothing reaches the store until commit.
    pub fn put<T: Record>(&mut self, key: &str, parent: Option<&str>, value: &T) -> Result<()> {
        let id = RecordId {
            kind: T::KIND,
            key: key.to_string(),
        };
        let pending = PendingWrite {
            parent: parent.map(str::to_string),
            body: serde_json::to_string(value)?,
            terms: value.index_terms(),
        };
        self.writes.insert(id, pending);
        Ok(())
    }

    fn commit(self) -> Result<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut conflicts: Vec<String> = Vec::new();
        for (id, observed) in &self.reads {
            if read_version(&tx, id.kind, &id.key)? != *observed {
                conflicts.push(id.to_string());
            }
        }
        if !conflicts.is_empty() {
            conflicts.sort();
            // Dropping `tx` rolls back.
            return Err(Error::TransactionConflict { keys: conflicts });
        }

        let now = Utc::now().to_rfc3339();
        for (id, write) in &self.writes {
            tx.execute(
                "INSERT INTO records (kind, key, parent, version, body, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5)
                 ON CONFLICT(kind, key) DO UPDATE SET
                    parent = excluded.parent,
                    body = excluded.body,
                    version = records.version + 1,
                    updated_at = excluded.updated_at",
                params![id.kind, id.key, write.parent, write.body, now],
            )?;
            tx.execute(
                "DELETE FROM record_index WHERE kind = ?1 AND key = ?2",
                params![id.kind, id.key],
            )?;
            for (term, value) in &write.terms {
                tx.execute(
                    "INSERT OR IGNORE INTO record_index (kind, key, term, value) VALUES (?1, ?2, ?3, ?4)",
                    params![id.kind, id.key, term, value],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

/// Resolve the data directory.
///
/// Priority: explicit path > `BL_DATA_DIR` > `<platform data dir>/bugledger`.
pub fn resolve_data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let data_dir = dirs::data_dir()
        .ok_or_else(|| Error::Other("Could not determine data directory".to_string()))?;
    Ok(data_dir.join("bugledger"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        name: String,
        value: i64,
    }

    impl Record for Counter {
        const KIND: &'static str = "Counter";

        fn index_terms(&self) -> Vec<(&'static str, String)> {
            vec![("name", self.name.clone())]
        }
    }

    fn bump(storage: &mut Storage, key: &str) -> Result<i64> {
        storage.run_in_transaction(TX_ATTEMPTS, |tx| {
            let mut c: Counter = tx.get(key)?.unwrap_or_default();
            c.name = key.to_string();
            c.value += 1;
            tx.put(key, None, &c)?;
            Ok(c.value)
        })
    }

    #[test]
    fn test_storage_init_and_open() {
        let temp = TempDir::new().unwrap();
        assert!(!Storage::exists(temp.path()));
        assert!(matches!(Storage::open(temp.path()), Err(Error::NotInitialized)));
        Storage::init(temp.path()).unwrap();
        assert!(Storage::exists(temp.path()));
        Storage::open(temp.path()).unwrap();
    }

    #[test]
    fn test_transaction_put_and_get() {
        let mut storage = Storage::open_in_memory().unwrap();
        assert_eq!(bump(&mut storage, "a").unwrap(), 1);
        assert_eq!(bump(&mut storage, "a").unwrap(), 2);
        let c: Counter = storage.get("a").unwrap().unwrap();
        assert_eq!(c.value, 2);
        assert_eq!(storage.version::<Counter>("a").unwrap(), 2);
        assert_eq!(storage.version::<Counter>("missing").unwrap(), 0);
    }

    #[test]
    fn test_reads_see_own_writes() {
        let mut storage = Storage::open_in_memory().unwrap();
        let seen = storage
            .run_in_transaction(1, |tx| {
                tx.put("k", None, &Counter { name: "k".into(), value: 9 })?;
                Ok(tx.get::<Counter>("k")?.map(|c| c.value))
            })
            .unwrap();
        assert_eq!(seen, Some(9));
    }

    #[test]
    fn test_error_in_transaction_discards_writes() {
        let mut storage = Storage::open_in_memory().unwrap();
        let result: Result<()> = storage.run_in_transaction(TX_ATTEMPTS, |tx| {
            tx.put("k", None, &Counter::default())?;
            Err(Error::InvalidInput("nope".to_string()))
        });
        assert!(result.is_err());
        assert!(storage.get::<Counter>("k").unwrap().is_none());
    }

    #[test]
    fn test_must_get_missing_is_not_found() {
        let mut storage = Storage::open_in_memory().unwrap();
        let result = storage.run_in_transaction(1, |tx| tx.must_get::<Counter>("nope"));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_lookup_and_children() {
        let mut storage = Storage::open_in_memory().unwrap();
        storage
            .run_in_transaction(1, |tx| {
                tx.put("p/1", Some("p"), &Counter { name: "x".into(), value: 1 })?;
                tx.put("p/2", Some("p"), &Counter { name: "y".into(), value: 2 })?;
                tx.put("q/1", Some("q"), &Counter { name: "x".into(), value: 3 })
            })
            .unwrap();
        let kids: Vec<_> = storage.children::<Counter>("p").unwrap();
        assert_eq!(kids.len(), 2);
        let xs: Vec<_> = storage
            .lookup::<Counter>("name", "x")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(xs, vec!["p/1", "q/1"]);

        // Index terms follow the latest write.
        storage
            .run_in_transaction(1, |tx| {
                tx.put("p/1", Some("p"), &Counter { name: "z".into(), value: 1 })
            })
            .unwrap();
        assert_eq!(storage.lookup::<Counter>("name", "x").unwrap().len(), 1);
    }

    #[test]
    fn test_stale_read_conflicts_and_retries() {
        let temp = TempDir::new().unwrap();
        let mut storage = Storage::init(temp.path()).unwrap();
        let mut other = Storage::open(temp.path()).unwrap();
        bump(&mut storage, "c").unwrap();

        let mut calls = 0;
        let value = storage
            .run_in_transaction(TX_ATTEMPTS, |tx| {
                calls += 1;
                let mut c: Counter = tx.must_get("c")?;
                if calls == 1 {
                    // A concurrent writer commits after our read.
                    bump(&mut other, "c")?;
                }
                c.value += 10;
                tx.put("c", None, &c)?;
                Ok(c.value)
            })
            .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(value, 12);
    }

    #[test]
    fn test_conflict_surfaces_after_attempts() {
        let temp = TempDir::new().unwrap();
        let mut storage = Storage::init(temp.path()).unwrap();
        let mut other = Storage::open(temp.path()).unwrap();
        bump(&mut storage, "c").unwrap();

        let result = storage.run_in_transaction(3, |tx| {
            let c: Counter = tx.must_get("c")?;
            bump(&mut other, "c")?;
            tx.put("c", None, &c)
        });
        assert!(matches!(result, Err(Error::TransactionConflict { .. })));
    }

    #[test]
    fn test_unrelated_records_do_not_conflict() {
        let temp = TempDir::new().unwrap();
        let mut storage = Storage::init(temp.path()).unwrap();
        let mut other = Storage::open(temp.path()).unwrap();

        let mut calls = 0;
        storage
            .run_in_transaction(1, |tx| {
                calls += 1;
                let mut c: Counter = tx.get("mine")?.unwrap_or_default();
                bump(&mut other, "theirs")?;
                c.value += 1;
                tx.put("mine", None, &c)
            })
            .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_concurrent_writers_lose_no_updates() {
        let temp = TempDir::new().unwrap();
        Storage::init(temp.path()).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = temp.path().to_path_buf();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut storage = Storage::open(&path).unwrap();
                    let mut first = true;
                    storage
                        .run_in_transaction(TX_ATTEMPTS, |tx| {
                            let mut c: Counter = tx.get("shared")?.unwrap_or_default();
                            if first {
                                // Both threads read before either commits.
                                first = false;
                                barrier.wait();
                            }
                            c.value += 1;
                            tx.put("shared", None, &c)
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let storage = Storage::open(temp.path()).unwrap();
        let c: Counter = storage.get("shared").unwrap().unwrap();
        assert_eq!(c.value, 2);
    }

    #[test]
    fn test_allocate_id_is_monotonic() {
        let storage = Storage::open_in_memory().unwrap();
        let a = storage.allocate_id("Crash").unwrap();
        let b = storage.allocate_id("Crash").unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_resolve_data_dir_explicit_wins() {
        let temp = TempDir::new().unwrap();
        assert_eq!(resolve_data_dir(Some(temp.path())).unwrap(), temp.path());
    }
}
