//! Action logging for `bl` commands.
//!
//! Every command invocation is appended to a JSONL file so operators can
//! reconstruct who closed, merged or reported what, and when.

use crate::config::ActionLogConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOG_FILE: &str = "action.log";
const MAX_STRING_LEN: usize = 100;
const MAX_ARRAY_LEN: usize = 10;

/// Represents a single action log entry.
#[derive(Debug, Serialize, Deserialize)]
pub struct ActionLog {
    pub timestamp: DateTime<Utc>,

    /// Data directory the command ran against
    pub data_dir: String,

    /// Command name (e.g., "bug dup", "report send")
    pub command: String,

    pub args: serde_json::Value,

    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub duration_ms: u64,

    /// User who executed the command
    pub user: String,
}

/// Append an entry for one command to the action log.
///
/// Logging problems are reported on stderr and never fail the command.
pub fn log_action(
    config: &ActionLogConfig,
    data_dir: &Path,
    command: &str,
    args: serde_json::Value,
    success: bool,
    error: Option<String>,
    duration_ms: u64,
) {
    if !config.enabled {
        return;
    }
    let log_path = log_path(config, data_dir);
    let args = if config.sanitize { sanitize_args(&args) } else { args };
    let entry = ActionLog {
        timestamp: Utc::now(),
        data_dir: data_dir.to_string_lossy().to_string(),
        command: command.to_string(),
        args,
        success,
        error,
        duration_ms,
        user: current_user(),
    };
    if let Err(e) = write_log_entry(&log_path, &entry) {
        tracing::warn!(path = %log_path.display(), error = %e, "failed to write action log");
    }
}

/// Configured log path, or `<data dir>/action.log`.
pub fn log_path(config: &ActionLogConfig, data_dir: &Path) -> PathBuf {
    match &config.path {
        Some(path) => expand_home(Path::new(path)),
        None => data_dir.join(LOG_FILE),
    }
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

fn write_log_entry(path: &Path, entry: &ActionLog) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(entry)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", json)
}

fn is_sensitive(key: &str) -> bool {
    let key = key.to_lowercase();
    ["password", "token", "secret", "salt"]
        .iter()
        .any(|word| key.contains(word))
}

/// Local file paths; job keys and repository URLs also contain slashes.
fn looks_like_path(s: &str) -> bool {
    s.starts_with('/')
        || s.starts_with("./")
        || s.starts_with("../")
        || s.starts_with("~/")
        || s.contains('\\')
}

/// Strip secrets, local paths and bulk data from logged arguments.
fn sanitize_args(args: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match args {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let value = if is_sensitive(key) {
                        Value::String("[REDACTED]".to_string())
                    } else {
                        sanitize_args(value)
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        Value::Array(arr) if arr.len() > MAX_ARRAY_LEN => {
            Value::String(format!("[Array with {} items]", arr.len()))
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sanitize_args).collect()),
        Value::String(s) => {
            let s = if looks_like_path(s) {
                s.rsplit(['/', '\\']).next().unwrap_or(s)
            } else {
                s.as_str()
            };
            let len = s.chars().count();
            if len > MAX_STRING_LEN {
                let head: String = s.chars().take(MAX_STRING_LEN - 3).collect();
                Value::String(format!("{}... ({} chars)", head, len))
            } else {
                Value::String(s.to_string())
            }
        }
        _ => args.clone(),
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_file_path() {
        assert_eq!(sanitize_args(&json!("/var/log/console.log")), json!("console.log"));
        assert_eq!(sanitize_args(&json!("C:\\Users\\test\\repro.c")), json!("repro.c"));
    }

    #[test]
    fn test_job_keys_and_urls_kept() {
        let job = format!("{}/12", "a".repeat(40));
        assert_eq!(sanitize_args(&json!(job)), json!(job));
        assert_eq!(sanitize_args(&json!("git://tree/linux.git")), json!("git://tree/linux.git"));
    }

    #[test]
    fn test_sanitize_long_string() {
        let sanitized = sanitize_args(&json!("é".repeat(150)));
        let s = sanitized.as_str().unwrap();
        assert!(s.ends_with("... (150 chars)"));
        assert!(s.starts_with(&"é".repeat(97)));
    }

    #[test]
    fn test_sanitize_sensitive_keys() {
        let sanitized = sanitize_args(&json!({
            "namespace": "upstream",
            "salt": "s3cr3t",
            "api_token": "abc123",
            "title": "WARNING in foo"
        }));
        assert_eq!(sanitized["namespace"], "upstream");
        assert_eq!(sanitized["salt"], "[REDACTED]");
        assert_eq!(sanitized["api_token"], "[REDACTED]");
        assert_eq!(sanitized["title"], "WARNING in foo");
    }

    #[test]
    fn test_sanitize_arrays() {
        let large: Vec<i32> = (0..15).collect();
        assert_eq!(sanitize_args(&json!(large)), json!("[Array with 15 items]"));
        assert_eq!(sanitize_args(&json!([1, 2, 3])), json!([1, 2, 3]));
    }

    #[test]
    fn test_log_action_appends_entries() {
        let temp = TempDir::new().unwrap();
        let config = ActionLogConfig::default();
        log_action(&config, temp.path(), "bug dup", json!({"bug": "x"}), true, None, 3);
        log_action(&config, temp.path(), "bug dup", json!({}), false, Some("boom".into()), 1);

        let content = fs::read_to_string(temp.path().join(LOG_FILE)).unwrap();
        let entries: Vec<ActionLog> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].command, "bug dup");
        assert!(entries[0].success);
        assert_eq!(entries[1].error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_disabled_log_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let config = ActionLogConfig {
            enabled: false,
            ..Default::default()
        };
        log_action(&config, temp.path(), "init", json!({}), true, None, 0);
        assert!(!temp.path().join(LOG_FILE).exists());
    }

    #[test]
    fn test_custom_path() {
        let config = ActionLogConfig {
            path: Some("/tmp/bl-actions.log".to_string()),
            ..Default::default()
        };
        assert_eq!(log_path(&config, Path::new("/data")), PathBuf::from("/tmp/bl-actions.log"));
    }
}
