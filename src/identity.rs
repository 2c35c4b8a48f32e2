//! Deterministic identities for bugs and reporting stages.
//!
//! Keys are derived by hashing, so they are stable across restarts and
//! never need to be looked up in a side table:
//! - `BugKey` - SHA-256 of `"{salt}-{namespace}-{title}-{seq}"`
//! - stage IDs - first 20 chars of SHA-256 of `"{bug key}-{stage}"`
//!
//! Display titles append ` (N)` for bugs with `seq > 0`, where `N = seq + 1`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a full hash string (hex chars). Older stage IDs used this length.
pub const HASH_LEN: usize = 40;

/// Stage IDs appear in commit trailers, so they are kept short.
pub const STAGE_ID_LEN: usize = 20;

/// Largest sequence suffix accepted by [`parse_display_title`].
pub const MAX_DISPLAY_SEQ: i64 = 1_000_000;

/// Hash arbitrary data into a hex string of [`HASH_LEN`] chars.
pub fn hash_string(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let hash_hex = format!("{:x}", hasher.finalize());
    hash_hex[..HASH_LEN].to_string()
}

/// Opaque, deterministic key of a Bug record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BugKey(String);

impl BugKey {
    /// Derive the key of bug `(namespace, title, seq)` using the namespace salt.
    pub fn derive(salt: &str, namespace: &str, title: &str, seq: i64) -> Self {
        let seed = format!("{}-{}-{}-{}", salt, namespace, title, seq);
        Self(hash_string(seed.as_bytes()))
    }

    /// Wrap a key received from outside (CLI, stored references).
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() != HASH_LEN || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::MalformedInput(format!(
                "bug key must be {} hex characters, got: {}",
                HASH_LEN, raw
            )));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BugKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Externally visible ID of a bug within one reporting stage.
pub fn stage_id(bug: &BugKey, stage: &str) -> String {
    let seed = format!("{}-{}", bug, stage);
    hash_string(seed.as_bytes())[..STAGE_ID_LEN].to_string()
}

/// Full-length stage ID handed out before IDs were shortened.
pub fn legacy_stage_id(bug: &BugKey, stage: &str) -> String {
    let seed = format!("{}-{}", bug, stage);
    hash_string(seed.as_bytes())
}

/// Best-effort check that an echoed-back ID is one of ours.
///
/// Current IDs are 20 chars; IDs handed out before the shortening are 40.
pub fn looks_like_stage_id(id: &str) -> bool {
    (id.len() == STAGE_ID_LEN || id.len() == HASH_LEN)
        && id.chars().all(|c| c.is_ascii_hexdigit())
}

/// Render the title shown to users for bug `(title, seq)`.
pub fn format_display_title(title: &str, seq: i64) -> String {
    if seq == 0 {
        return title.to_string();
    }
    format!("{} ({})", title, seq + 1)
}

/// Split a display title back into `(title, seq)`.
///
/// A title without a trailing ` (N)` suffix has seq 0. A suffix outside
/// `1..=1_000_000` is malformed.
pub fn parse_display_title(display: &str) -> Result<(String, i64)> {
    let Some((title, suffix)) = split_numeric_suffix(display) else {
        return Ok((display.to_string(), 0));
    };
    let seq: i64 = suffix.parse().map_err(|e| {
        Error::MalformedInput(format!("failed to parse bug title {:?}: {}", display, e))
    })?;
    if seq <= 0 || seq > MAX_DISPLAY_SEQ {
        return Err(Error::MalformedInput(format!(
            "failed to parse bug title {:?}: seq={}",
            display, seq
        )));
    }
    Ok((title.to_string(), seq - 1))
}

/// Match `^(.*) \(([0-9]+)\)$`.
fn split_numeric_suffix(display: &str) -> Option<(&str, &str)> {
    let inner = display.strip_suffix(')')?;
    let open = inner.rfind(" (")?;
    let digits = &inner[open + 2..];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((&inner[..open], digits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bug_key_is_deterministic() {
        let a = BugKey::derive("salt", "upstream", "KASAN: use-after-free in foo", 0);
        let b = BugKey::derive("salt", "upstream", "KASAN: use-after-free in foo", 0);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), HASH_LEN);
    }

    #[test]
    fn test_bug_key_depends_on_every_component() {
        let base = BugKey::derive("salt", "upstream", "title", 0);
        assert_ne!(base, BugKey::derive("pepper", "upstream", "title", 0));
        assert_ne!(base, BugKey::derive("salt", "stable", "title", 0));
        assert_ne!(base, BugKey::derive("salt", "upstream", "other", 0));
        assert_ne!(base, BugKey::derive("salt", "upstream", "title", 1));
    }

    #[test]
    fn test_bug_key_parse() {
        let key = BugKey::derive("s", "ns", "t", 0);
        assert_eq!(BugKey::parse(key.as_str()).unwrap(), key);
        assert!(BugKey::parse("xyz").is_err());
    }

    #[test]
    fn test_stage_id_is_short_and_recognized() {
        let key = BugKey::derive("s", "ns", "t", 0);
        let id = stage_id(&key, "public");
        assert_eq!(id.len(), STAGE_ID_LEN);
        assert!(looks_like_stage_id(&id));
        assert_ne!(id, stage_id(&key, "moderation"));
    }

    #[test]
    fn test_legacy_stage_id_extends_current() {
        let key = BugKey::derive("salt", "upstream", "t", 0);
        let legacy = legacy_stage_id(&key, "public");
        assert_eq!(legacy.len(), HASH_LEN);
        assert!(legacy.starts_with(&stage_id(&key, "public")));
    }

    #[test]
    fn test_looks_like_stage_id_accepts_legacy_length() {
        assert!(looks_like_stage_id(&"a".repeat(HASH_LEN)));
        assert!(!looks_like_stage_id(&"a".repeat(32)));
        assert!(!looks_like_stage_id("zzzzzzzzzzzzzzzzzzzz"));
    }

    #[test]
    fn test_display_title_round_trip() {
        let titles = ["WARNING in foo", "bar (baz)", "title (2) tail", ""];
        for title in titles {
            for seq in [0, 1, 2, 9, 999_999] {
                let display = format_display_title(title, seq);
                let (parsed, parsed_seq) = parse_display_title(&display).unwrap();
                assert_eq!((parsed.as_str(), parsed_seq), (title, seq), "{:?}", display);
            }
        }
    }

    #[test]
    fn test_display_title_formats() {
        assert_eq!(format_display_title("crash", 0), "crash");
        assert_eq!(format_display_title("crash", 1), "crash (2)");
    }

    #[test]
    fn test_parse_display_title_without_suffix() {
        assert_eq!(parse_display_title("crash").unwrap(), ("crash".to_string(), 0));
        assert_eq!(
            parse_display_title("crash (abc)").unwrap(),
            ("crash (abc)".to_string(), 0)
        );
    }

    #[test]
    fn test_parse_display_title_rejects_out_of_range() {
        assert!(parse_display_title("crash (0)").is_err());
        assert!(parse_display_title("crash (1000001)").is_err());
        assert!(parse_display_title("crash (99999999999999999999)").is_err());
        assert_eq!(
            parse_display_title("crash (1000000)").unwrap(),
            ("crash".to_string(), 999_999)
        );
    }
}
