//! Bugledger - defect lifecycle tracking for a continuous fuzzing pipeline.
//!
//! This library provides the core functionality for the `bl` CLI tool:
//! stable bug identities, duplicate resolution, crash evidence retention,
//! staged external reporting, patch-test/bisection jobs and manager stats,
//! all mutated through optimistic transactions against the record store.

pub mod action_log;
pub mod blob;
pub mod bugs;
pub mod cli;
pub mod commands;
pub mod config;
pub mod context;
pub mod discussions;
pub mod external;
pub mod identity;
pub mod jobs;
pub mod ledger;
pub mod models;
pub mod reporting;
pub mod stats;
pub mod storage;

/// Test utilities for isolated test environments.
#[cfg(test)]
pub(crate) mod test_utils {
    use crate::bugs::{CrashOutcome, NewCrash, report_crash};
    use crate::config::{Config, NamespaceConfig, StageConfig};
    use crate::context::{Context, FixedClock};
    use crate::external::{Delivery, RenderedReport, ReportTransport};
    use crate::storage::Storage;
    use chrono::{DateTime, TimeZone, Utc};
    use std::cell::RefCell;
    use std::sync::Arc;

    pub const NS: &str = "upstream";

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap()
    }

    /// Namespace with a moderation stage followed by a public stage.
    pub fn test_config() -> Config {
        Config {
            namespaces: vec![NamespaceConfig {
                name: NS.to_string(),
                key: "test-salt".to_string(),
                similarity_domain: Some("linux".to_string()),
                reporting: vec![
                    StageConfig {
                        moderation: true,
                        ..StageConfig::new("moderation")
                    },
                    StageConfig {
                        daily_limit: 2,
                        ..StageConfig::new("public")
                    },
                ],
            }],
            ..Config::default()
        }
    }

    /// Test environment with in-memory storage and a fixed clock.
    pub struct TestEnv {
        pub storage: Storage,
        pub clock: Arc<FixedClock>,
        pub ctx: Context,
    }

    impl TestEnv {
        pub fn new() -> Self {
            Self::with_config(test_config())
        }

        pub fn with_config(config: Config) -> Self {
            let clock = Arc::new(FixedClock::new(t0()));
            Self {
                storage: Storage::open_in_memory().unwrap(),
                ctx: Context::new(config, clock.clone()),
                clock,
            }
        }
    }

    /// Report a plain crash titled `title` from manager "ci".
    pub fn observe(env: &mut TestEnv, title: &str) -> CrashOutcome {
        report_crash(&env.ctx, &mut env.storage, &NewCrash::new(NS, "ci", title)).unwrap()
    }

    /// Transport that keeps every report it is given.
    #[derive(Default)]
    pub struct RecordingTransport {
        sent: RefCell<Vec<RenderedReport>>,
    }

    impl RecordingTransport {
        pub fn sent(&self) -> Vec<RenderedReport> {
            self.sent.borrow().clone()
        }
    }

    impl ReportTransport for RecordingTransport {
        fn send(&self, report: &RenderedReport) -> crate::Result<Delivery> {
            self.sent.borrow_mut().push(report.clone());
            let ext_id = match &report.ext_id {
                Some(thread) if report.is_update => thread.clone(),
                _ => format!("<{}@test>", report.stage_id),
            };
            Ok(Delivery { ext_id, link: None })
        }
    }

    /// Transport whose every delivery fails.
    pub struct FailingTransport;

    impl ReportTransport for FailingTransport {
        fn send(&self, _report: &RenderedReport) -> crate::Result<Delivery> {
            Err(crate::Error::Other("mailer unavailable".to_string()))
        }
    }
}

/// Library-level error type for Bugledger operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Not initialized: run `bl init` first")]
    NotInitialized,

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Stored data breaks an invariant (e.g. a duplicate chain that never
    /// terminates). Never repaired automatically.
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Transaction conflict on {}", keys.join(", "))]
    TransactionConflict { keys: Vec<String> },

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Bugledger operations.
pub type Result<T> = std::result::Result<T, Error>;
