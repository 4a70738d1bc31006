//! Capability bit vector and the probed snapshot that carries it.
//!
//! `CapSet` is mutable only through `&mut self`; the prober builds one in a
//! single pass and hands it out inside `Arc<HelperCaps>`, after which no
//! exclusive reference exists and the set is immutable for all consumers.
//! That ownership rule is the write-once contract: there is no runtime
//! "finalized" flag to check.

use crate::flags::{CapBits, CapFlag};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;

/// One bit per known capability flag, all false on construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapSet {
    bits: CapBits,
}

impl CapSet {
    /// A set with every flag false.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `flag` is set. O(1), no side effects.
    pub fn get(&self, flag: CapFlag) -> bool {
        self.bits & (1 << flag.index()) != 0
    }

    /// Set `flag` to true. Idempotent.
    ///
    /// Intended for the prober's construction pass; once the set is shared
    /// no `&mut` access exists and this cannot be called.
    pub fn set(&mut self, flag: CapFlag) {
        self.bits |= 1 << flag.index();
    }

    /// Whether no flag is set.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Number of set flags.
    pub fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Set flags in bit order.
    pub fn iter(&self) -> impl Iterator<Item = CapFlag> + '_ {
        CapFlag::ALL.into_iter().filter(|f| self.get(*f))
    }
}

impl std::fmt::Display for CapSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for flag in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(flag.name())?;
            first = false;
        }
        if first {
            f.write_str("(none)")?;
        }
        Ok(())
    }
}

impl FromIterator<CapFlag> for CapSet {
    fn from_iter<I: IntoIterator<Item = CapFlag>>(iter: I) -> Self {
        let mut set = CapSet::new();
        for flag in iter {
            set.set(flag);
        }
        set
    }
}

// Serialized as the list of set flag names, so snapshots stay readable and
// stable across flag additions.
impl Serialize for CapSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for CapSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let flags = Vec::<CapFlag>::deserialize(deserializer)?;
        Ok(flags.into_iter().collect())
    }
}

/// The probed feature set of one specific helper binary instance.
///
/// Produced exactly once per probe and shared read-only via `Arc` among all
/// callers making feature-gated decisions about that binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HelperCaps {
    /// Path of the binary that was probed.
    pub path: PathBuf,

    /// Helper version self-report, if one could be parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// The probed capability bits.
    pub caps: CapSet,

    /// ISO 8601 timestamp of when the probe ran.
    pub probed_at: String,
}

impl HelperCaps {
    /// Create a snapshot stamped with the current time.
    pub fn new(path: PathBuf, version: Option<String>, caps: CapSet) -> Self {
        Self {
            path,
            version,
            caps,
            probed_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Whether the probed binary supports `flag`.
    pub fn get(&self, flag: CapFlag) -> bool {
        self.caps.get(flag)
    }

    /// One-line summary for logging.
    pub fn summary(&self) -> String {
        format!(
            "{} | version: {} | caps: {}",
            self.path.display(),
            self.version.as_deref().unwrap_or("unknown"),
            self.caps
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_set_is_all_false() {
        let set = CapSet::new();
        for flag in CapFlag::ALL {
            assert!(!set.get(flag));
        }
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_set_is_idempotent() {
        let mut set = CapSet::new();
        set.set(CapFlag::PluginCurl);
        let once = set;
        set.set(CapFlag::PluginCurl);
        assert_eq!(set, once);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_no_cross_flag_interference() {
        let mut set = CapSet::new();
        set.set(CapFlag::PluginSsh);

        assert!(set.get(CapFlag::PluginSsh));
        for flag in CapFlag::ALL {
            if flag != CapFlag::PluginSsh {
                assert!(!set.get(flag), "{flag} leaked");
            }
        }
    }

    #[test]
    fn test_iter_in_bit_order() {
        let mut set = CapSet::new();
        set.set(CapFlag::FilterReadahead);
        set.set(CapFlag::PluginCurl);

        let flags: Vec<_> = set.iter().collect();
        assert_eq!(flags, vec![CapFlag::PluginCurl, CapFlag::FilterReadahead]);
    }

    #[test]
    fn test_display() {
        let mut set = CapSet::new();
        assert_eq!(set.to_string(), "(none)");

        set.set(CapFlag::PluginCurl);
        set.set(CapFlag::FilterReadahead);
        assert_eq!(set.to_string(), "plugin-curl, filter-readahead");
    }

    #[test]
    fn test_serde_as_name_list() {
        let set: CapSet = [CapFlag::PluginCurl, CapFlag::FilterReadahead]
            .into_iter()
            .collect();

        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["plugin-curl","filter-readahead"]"#);

        let parsed: CapSet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, set);
    }

    #[test]
    fn test_helper_caps_snapshot() {
        let caps: CapSet = [CapFlag::PluginSsh].into_iter().collect();
        let snapshot = HelperCaps::new(
            PathBuf::from("/usr/sbin/helper"),
            Some("1.36.2".to_string()),
            caps,
        );

        assert!(snapshot.get(CapFlag::PluginSsh));
        assert!(!snapshot.get(CapFlag::PluginCurl));
        assert!(!snapshot.probed_at.is_empty());

        let summary = snapshot.summary();
        assert!(summary.contains("/usr/sbin/helper"));
        assert!(summary.contains("1.36.2"));
        assert!(summary.contains("plugin-ssh"));
    }

    #[test]
    fn test_helper_caps_serde_roundtrip() {
        let snapshot = HelperCaps::new(
            PathBuf::from("/usr/sbin/helper"),
            None,
            [CapFlag::PluginCurl].into_iter().collect(),
        );

        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: HelperCaps = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
        // None version is omitted from the wire form entirely.
        assert!(!json.contains("version"));
    }
}
