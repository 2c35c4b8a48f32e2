//! KDL schema for config.kdl.
//!
//! This module provides:
//! - Rust structs representing the KDL schema
//! - Parsing from and conversion to KDL documents
//! - Validation
//! - The template written by `bl init`

use crate::{Error, Result};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};

/// Output format preference for CLI commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// JSON output (default, machine-readable)
    #[default]
    Json,
    /// Human-readable output
    Human,
}

impl OutputFormat {
    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(OutputFormat::Json),
            "human" => Some(OutputFormat::Human),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Human => "human",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One external reporting stage of a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    /// Reports per day through this stage; 0 means unlimited.
    pub daily_limit: u32,
    /// Reports here are reviewed before moving on to the next stage.
    pub moderation: bool,
    /// Hold reports until the bug is at least this many hours old.
    pub embargo_hours: u32,
}

impl StageConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// Per-namespace settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub name: String,
    /// Salt for bug key derivation. Changing it orphans every existing bug.
    pub key: String,
    /// Namespaces sharing a domain are searched together for similar bugs.
    pub similarity_domain: Option<String>,
    /// Reporting stages in order.
    pub reporting: Vec<StageConfig>,
}

/// Action log settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLogConfig {
    pub enabled: bool,
    pub sanitize: bool,
    /// Defaults to `<data dir>/action.log`.
    pub path: Option<String>,
}

impl Default for ActionLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sanitize: true,
            path: None,
        }
    }
}

/// Contents of config.kdl.
///
/// # KDL Schema
///
/// ```kdl
/// output-format "human"
/// action-log {
///     enabled #true
///     path "~/.local/share/bugledger/action.log"
/// }
/// namespace "upstream" {
///     key "per-namespace-salt"
///     similarity-domain "linux"
///     reporting "moderation" {
///         moderation #true
///     }
///     reporting "public" {
///         daily-limit 10
///         embargo-hours 24
///     }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub output_format: Option<OutputFormat>,
    pub action_log: ActionLogConfig,
    pub namespaces: Vec<NamespaceConfig>,
}

/// Written by `bl init` when no config exists.
pub const DEFAULT_CONFIG_KDL: &str = r#"// bugledger configuration
output-format "json"

namespace "default" {
    key "change-me"
    reporting "public" {
        daily-limit 0
    }
}
"#;

impl Config {
    pub fn namespace(&self, name: &str) -> Option<&NamespaceConfig> {
        self.namespaces.iter().find(|n| n.name == name)
    }

    /// Namespaces sharing `ns`'s similarity domain, `ns` included.
    pub fn similarity_namespaces<'a>(&'a self, ns: &'a str) -> Vec<&'a str> {
        let Some(domain) = self.namespace(ns).and_then(|n| n.similarity_domain.as_deref()) else {
            return vec![ns];
        };
        self.namespaces
            .iter()
            .filter(|n| n.name == ns || n.similarity_domain.as_deref() == Some(domain))
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Validate the config values.
    pub fn validate(&self) -> Result<()> {
        let mut seen: Vec<&str> = Vec::new();
        for ns in &self.namespaces {
            if ns.name.is_empty() {
                return Err(Error::Config("namespace name must not be empty".to_string()));
            }
            if seen.contains(&ns.name.as_str()) {
                return Err(Error::Config(format!("duplicate namespace {}", ns.name)));
            }
            seen.push(&ns.name);
            if ns.key.is_empty() {
                return Err(Error::Config(format!("namespace {}: key is required", ns.name)));
            }
            if ns.reporting.is_empty() {
                return Err(Error::Config(format!(
                    "namespace {}: at least one reporting stage is required",
                    ns.name
                )));
            }
            let mut stages: Vec<&str> = Vec::new();
            for stage in &ns.reporting {
                if stages.contains(&stage.name.as_str()) {
                    return Err(Error::Config(format!(
                        "namespace {}: duplicate reporting stage {}",
                        ns.name, stage.name
                    )));
                }
                stages.push(&stage.name);
            }
            let moderation: Vec<usize> = ns
                .reporting
                .iter()
                .enumerate()
                .filter(|(_, s)| s.moderation)
                .map(|(i, _)| i)
                .collect();
            if moderation.len() > 1 {
                return Err(Error::Config(format!(
                    "namespace {}: more than one moderation stage",
                    ns.name
                )));
            }
            if moderation.first() == Some(&(ns.reporting.len() - 1)) {
                return Err(Error::Config(format!(
                    "namespace {}: moderation stage cannot be the last stage",
                    ns.name
                )));
            }
        }
        Ok(())
    }

    /// Parse config from a KDL document.
    pub fn from_kdl(doc: &KdlDocument) -> Result<Self> {
        let mut config = Self::default();

        if let Some(node) = doc.get("output-format") {
            if let Some(s) = get_string_arg(node) {
                config.output_format = OutputFormat::parse(&s);
            }
        }

        if let Some(node) = doc.get("action-log") {
            if let Some(children) = node.children() {
                for child in children.nodes() {
                    match child.name().value() {
                        "enabled" => {
                            if let Some(val) = get_bool_arg(child) {
                                config.action_log.enabled = val;
                            }
                        }
                        "sanitize" => {
                            if let Some(val) = get_bool_arg(child) {
                                config.action_log.sanitize = val;
                            }
                        }
                        "path" => config.action_log.path = get_string_arg(child),
                        _ => {}
                    }
                }
            }
        }

        for node in doc.nodes() {
            if node.name().value() == "namespace" {
                config.namespaces.push(parse_namespace_node(node)?);
            }
        }

        Ok(config)
    }
}

fn parse_namespace_node(node: &KdlNode) -> Result<NamespaceConfig> {
    let name = get_string_arg(node)
        .ok_or_else(|| Error::Config("namespace node must have a name argument".to_string()))?;
    let mut ns = NamespaceConfig {
        name,
        ..Default::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "key" => ns.key = get_string_arg(child).unwrap_or_default(),
                "similarity-domain" => ns.similarity_domain = get_string_arg(child),
                "reporting" => ns.reporting.push(parse_stage_node(child, &ns.name)?),
                _ => {
                    // Ignore unknown fields for forward compatibility
                }
            }
        }
    }

    Ok(ns)
}

fn parse_stage_node(node: &KdlNode, ns: &str) -> Result<StageConfig> {
    let name = get_string_arg(node).ok_or_else(|| {
        Error::Config(format!("namespace {}: reporting node must have a name", ns))
    })?;
    let mut stage = StageConfig::new(&name);

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "daily-limit" => stage.daily_limit = get_u32_arg(child, ns, &name)?,
                "embargo-hours" => stage.embargo_hours = get_u32_arg(child, ns, &name)?,
                "moderation" => stage.moderation = get_bool_arg(child).unwrap_or(false),
                _ => {}
            }
        }
    }

    Ok(stage)
}

fn get_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .first()
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries().first().and_then(|e| e.value().as_bool())
}

fn get_u32_arg(node: &KdlNode, ns: &str, stage: &str) -> Result<u32> {
    node.entries()
        .first()
        .and_then(|e| e.value().as_integer())
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| {
            Error::Config(format!(
                "namespace {} stage {}: {} must be a non-negative integer",
                ns,
                stage,
                node.name().value()
            ))
        })
}
