//! Upgrades applied to stored documents as they are decoded.
//!
//! Each step runs once per load and produces the current shape; business
//! logic never sees the legacy layouts.

use crate::Result;
use crate::models::{Bug, BugLabel, Crash, CrashReference, ReferenceKind, SUBSYSTEM_LABEL};
use serde::Deserialize;
use serde_json::Value;

/// Subsystem tag as stored before labels were unified.
#[derive(Debug, Deserialize)]
struct LegacySubsystem {
    name: String,
    #[serde(default)]
    set_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyTags {
    #[serde(default)]
    subsystems: Vec<LegacySubsystem>,
}

/// Decode a Bug document.
///
/// - `tags.subsystems` entries become subsystem labels
/// - a missing `head_repro_level` is taken from `repro_level`
pub fn load_bug(mut raw: Value) -> Result<Bug> {
    let mut legacy_labels = Vec::new();
    if let Some(obj) = raw.as_object_mut() {
        if let Some(tags) = obj.remove("tags") {
            let tags: LegacyTags = serde_json::from_value(tags)?;
            legacy_labels = tags
                .subsystems
                .into_iter()
                .map(|s| BugLabel {
                    label: SUBSYSTEM_LABEL.to_string(),
                    value: s.name,
                    set_by: s.set_by.filter(|by| !by.is_empty()),
                    link: None,
                })
                .collect();
        }
        if !obj.contains_key("head_repro_level") {
            if let Some(level) = obj.get("repro_level").cloned() {
                obj.insert("head_repro_level".to_string(), level);
            }
        }
    }

    let mut bug: Bug = serde_json::from_value(raw)?;
    for label in legacy_labels {
        if !bug
            .labels
            .iter()
            .any(|l| l.label == label.label && l.value == label.value)
        {
            bug.labels.push(label);
        }
    }
    Ok(bug)
}

/// Decode a Crash document.
///
/// A crash reported before references were tracked gets one `Unknown`
/// reference at its `reported` time so it keeps being retained.
pub fn load_crash(raw: Value) -> Result<Crash> {
    let mut crash: Crash = serde_json::from_value(raw)?;
    if let Some(reported) = crash.reported {
        if crash.references.is_empty() {
            crash
                .references
                .push(CrashReference::new(ReferenceKind::Unknown, "", reported));
        }
    }
    Ok(crash)
}
