//! Command implementations for the `bl` CLI.
//!
//! Each command opens what it needs through a [`Session`], calls into the
//! library and returns a result type implementing [`Output`]. Commands are
//! organized by entity:
//! - `bug` - crash intake and bug status
//! - `report` - staged reporting
//! - `job` - patch tests and bisections
//! - `manager` - manager heartbeats and discussions

mod bug;
mod job;
mod manager;
mod report;

pub use bug::*;
pub use job::*;
pub use manager::*;
pub use report::*;

use crate::config::{self, Config};
use crate::context::Context;
use crate::bugs;
use crate::identity::{BugKey, STAGE_ID_LEN};
use crate::storage::Storage;
use crate::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output {
    fn to_json(&self) -> String;

    fn to_human(&self) -> String;
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }).to_string())
}

/// An opened data directory plus the context commands run in.
pub struct Session {
    pub data_dir: PathBuf,
    pub storage: Storage,
    pub ctx: Context,
}

impl Session {
    pub fn open(data_dir: &Path, config: Config) -> Result<Self> {
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            storage: Storage::open(data_dir)?,
            ctx: Context::system(config),
        })
    }
}

/// A bug key, or the short stage ID of one of the bug's reports.
fn parse_bug(storage: &Storage, raw: &str) -> Result<BugKey> {
    let raw = raw.trim();
    if raw.len() == STAGE_ID_LEN {
        return Ok(bugs::bug_by_stage_id(storage, raw)?.0);
    }
    BugKey::parse(raw)
}

/// Read an optional input file; absent means empty.
fn read_input(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path).map_err(|e| {
            Error::InvalidInput(format!("cannot read {}: {}", path.display(), e))
        }),
        None => Ok(Vec::new()),
    }
}

#[derive(Serialize)]
pub struct InitResult {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub config_created: bool,
}

impl Output for InitResult {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!("Initialized ledger in {}", self.data_dir.display())];
        if self.config_created {
            lines.push(format!(
                "Wrote default config to {}; set the namespace key before reporting crashes.",
                self.config_path.display()
            ));
        } else {
            lines.push(format!("Using existing config {}", self.config_path.display()));
        }
        lines.join("\n")
    }
}

/// Create the data directory, database schema and default config.
/// Running it again is harmless.
pub fn init(data_dir: &Path, config_path: &Path) -> Result<InitResult> {
    Storage::init(data_dir)?;
    let config_created = config::write_default(config_path)?;
    // Fail early on a hand-edited config that does not parse.
    config::load(config_path)?;
    Ok(InitResult {
        data_dir: data_dir.to_path_buf(),
        config_path: config_path.to_path_buf(),
        config_created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("data");
        let config_path = data.join("config.kdl");

        let first = init(&data, &config_path).unwrap();
        assert!(first.config_created);
        assert!(Storage::exists(&data));

        let second = init(&data, &config_path).unwrap();
        assert!(!second.config_created);
        assert!(second.to_human().contains("existing config"));
    }

    #[test]
    fn test_session_requires_init() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            Session::open(temp.path(), Config::default()),
            Err(Error::NotInitialized)
        ));
    }

    #[test]
    fn test_read_input_missing_file() {
        let err = read_input(Some(Path::new("/nonexistent/console.log"))).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
        assert!(read_input(None).unwrap().is_empty());
    }
}
