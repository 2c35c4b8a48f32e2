//! Common test utilities for bugledger integration tests.
//!
//! Provides `TestEnv` for isolated test environments that don't pollute
//! the user's `~/.local/share/bugledger/` directory.

#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
pub use tempfile::TempDir;

/// Namespace configured by [`TestEnv::init`].
pub const NS: &str = "upstream";

/// A moderation stage followed by a public stage that takes one new
/// report per day.
pub const TEST_CONFIG: &str = r#"
output-format "json"

namespace "upstream" {
    key "integration-salt"
    similarity-domain "linux"
    reporting "moderation" {
        moderation #true
    }
    reporting "public" {
        daily-limit 1
    }
}
"#;

/// A test environment with isolated data storage.
///
/// The `bl()` method returns a `Command` that sets `BL_DATA_DIR`
/// per-invocation, making tests parallel-safe.
pub struct TestEnv {
    pub data_dir: TempDir,
}

impl TestEnv {
    /// Create a new test environment without running `bl init`.
    pub fn new() -> Self {
        Self {
            data_dir: TempDir::new().unwrap(),
        }
    }

    /// Create a test environment, run `bl init` and install [`TEST_CONFIG`].
    pub fn init() -> Self {
        let env = Self::new();
        env.bl().arg("init").assert().success();
        env.write_config(TEST_CONFIG);
        env
    }

    /// Get a Command for the bl binary with isolated data directory.
    pub fn bl(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_bl"));
        cmd.current_dir(self.data_dir.path());
        cmd.env("BL_DATA_DIR", self.data_dir.path());
        cmd.env_remove("BL_CONFIG");
        cmd.env_remove("RUST_LOG");
        cmd
    }

    /// Run `bl` with `args`, require success and parse stdout as JSON.
    pub fn json(&self, args: &[&str]) -> serde_json::Value {
        let output = self.bl().args(args).output().unwrap();
        assert!(
            output.status.success(),
            "bl {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }

    /// Record a crash from manager "ci" and return the outcome.
    pub fn crash(&self, title: &str) -> serde_json::Value {
        self.json(&["crash", "report", "--ns", NS, "--manager", "ci", "--title", title])
    }

    /// Record a crash and return the key of the bug it landed in.
    pub fn crash_bug(&self, title: &str) -> String {
        self.crash(title)["bug"].as_str().unwrap().to_string()
    }

    pub fn write_config(&self, content: &str) {
        std::fs::write(self.config_path(), content).unwrap();
    }

    /// Write `content` to a file in the data directory and return its path.
    pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.data_dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.path().join("config.kdl")
    }

    /// Get the path to the data directory.
    pub fn data_path(&self) -> &Path {
        self.data_dir.path()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
