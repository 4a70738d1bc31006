//! The closed set of helper features the prober knows how to detect.
//!
//! Flags are appended, never renumbered, so a flag's bit position is stable
//! across versions of this crate. Each flag is bound to exactly one listing
//! and one exact token within it; a flag is reported as present only when
//! that token appears in that listing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Self-description outputs the helper can be asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Listing {
    /// Available network-transport plugins, one name per line.
    Plugins,
    /// Available I/O filters, one name per line.
    Filters,
    /// Version/build self-report.
    Version,
}

impl Listing {
    /// Arguments that ask the helper for this listing.
    pub fn args(&self) -> &'static [&'static str] {
        match self {
            Listing::Plugins => &["--list-plugins"],
            Listing::Filters => &["--list-filters"],
            Listing::Version => &["--version"],
        }
    }
}

/// One named boolean feature a helper build may or may not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(usize)]
pub enum CapFlag {
    /// curl-based remote-file transport plugin.
    PluginCurl = 0,
    /// SSH transport plugin.
    PluginSsh,
    /// Read-ahead caching filter.
    FilterReadahead,
}

/// Backing storage for capability bits.
pub(crate) type CapBits = u64;

// The bit vector must cover the whole enumeration.
const _: () = assert!(CapFlag::COUNT <= CapBits::BITS as usize);

impl CapFlag {
    /// Number of known flags; sizes the capability bit vector.
    pub const COUNT: usize = 3;

    /// All flags in declaration (bit) order.
    pub const ALL: [CapFlag; Self::COUNT] = [
        CapFlag::PluginCurl,
        CapFlag::PluginSsh,
        CapFlag::FilterReadahead,
    ];

    /// Stable bit position of this flag.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stable human-readable name, used for logging and serialization.
    pub fn name(self) -> &'static str {
        match self {
            CapFlag::PluginCurl => "plugin-curl",
            CapFlag::PluginSsh => "plugin-ssh",
            CapFlag::FilterReadahead => "filter-readahead",
        }
    }

    /// Look a flag up by its stable name.
    pub fn from_name(name: &str) -> Result<Self, UnknownFlagName> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.name() == name)
            .ok_or_else(|| UnknownFlagName(name.to_string()))
    }

    /// The single listing consulted for this flag.
    pub fn listing(self) -> Listing {
        match self {
            CapFlag::PluginCurl | CapFlag::PluginSsh => Listing::Plugins,
            CapFlag::FilterReadahead => Listing::Filters,
        }
    }

    /// The exact token that must appear in the listing for this flag.
    pub fn token(self) -> &'static str {
        match self {
            CapFlag::PluginCurl => "curl",
            CapFlag::PluginSsh => "ssh",
            CapFlag::FilterReadahead => "readahead",
        }
    }
}

impl std::fmt::Display for CapFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A flag name that does not match any known capability flag.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown capability flag name: {0}")]
pub struct UnknownFlagName(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_contiguous() {
        for (i, flag) in CapFlag::ALL.iter().enumerate() {
            assert_eq!(flag.index(), i);
        }
    }

    #[test]
    fn test_name_roundtrip() {
        for flag in CapFlag::ALL {
            assert_eq!(CapFlag::from_name(flag.name()), Ok(flag));
        }
    }

    #[test]
    fn test_from_name_unknown() {
        let err = CapFlag::from_name("plugin-gopher").unwrap_err();
        assert_eq!(err, UnknownFlagName("plugin-gopher".to_string()));
    }

    #[test]
    fn test_serde_names_match_name_table() {
        for flag in CapFlag::ALL {
            let json = serde_json::to_string(&flag).unwrap();
            assert_eq!(json, format!("\"{}\"", flag.name()));
            let parsed: CapFlag = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, flag);
        }
    }

    #[test]
    fn test_every_flag_has_exactly_one_listing() {
        for flag in CapFlag::ALL {
            let listing = flag.listing();
            assert!(matches!(listing, Listing::Plugins | Listing::Filters));
        }
    }

    #[test]
    fn test_listing_args() {
        assert_eq!(Listing::Plugins.args(), &["--list-plugins"]);
        assert_eq!(Listing::Filters.args(), &["--list-filters"]);
        assert_eq!(Listing::Version.args(), &["--version"]);
    }
}
