//! Configuration for bugledger.
//!
//! ## config.kdl
//!
//! Located at `<data dir>/config.kdl` unless `--config` / `BL_CONFIG` point
//! elsewhere. Contains:
//! - `output-format` - "json" or "human"
//! - `action-log` block - enabled, sanitize, path
//! - `namespace` blocks - salt, similarity domain and ordered reporting stages
//!
//! ## Precedence
//!
//! For output format: CLI flag > config.kdl > JSON.

pub mod schema;

pub use schema::{
    ActionLogConfig, Config, DEFAULT_CONFIG_KDL, NamespaceConfig, OutputFormat, StageConfig,
};

use crate::{Error, Result};
use kdl::KdlDocument;
use std::path::{Path, PathBuf};

/// Environment variable overriding the config path.
pub const CONFIG_ENV: &str = "BL_CONFIG";

const CONFIG_FILE: &str = "config.kdl";

/// Resolve the config path: explicit path > `BL_CONFIG` > `<data dir>/config.kdl`.
pub fn config_path(explicit: Option<&Path>, data_dir: &Path) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => data_dir.join(CONFIG_FILE),
    }
}

/// Load and validate a config file.
///
/// A missing file yields the empty config, which has no namespaces.
pub fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse(&content).map_err(|e| match e {
        Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

/// Parse and validate config text.
pub fn parse(content: &str) -> Result<Config> {
    let doc: KdlDocument = content
        .parse()
        .map_err(|e| Error::Config(format!("Failed to parse KDL: {}", e)))?;
    let config = Config::from_kdl(&doc)?;
    config.validate()?;
    Ok(config)
}

/// Write the default template to `path` unless a file already exists.
///
/// Returns true if the file was created.
pub fn write_default(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_KDL)?;
    Ok(true)
}
