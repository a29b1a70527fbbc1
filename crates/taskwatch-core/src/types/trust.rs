//! Trust classification and the merge rule that keeps it monotonic.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TaskwatchError;

/// How much an item is trusted.
///
/// Ordered by specificity, not by goodness:
/// `Unknown < TrustedPlatform = TrustedThirdParty < Untrusted < Flagged`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Not classified yet
    #[default]
    Unknown,
    /// Shipped by the OS vendor / distribution
    TrustedPlatform,
    /// Signed by an independent distribution channel
    TrustedThirdParty,
    /// No valid signature
    Untrusted,
    /// Reported malicious by the reputation service
    Flagged,
}

impl TrustLevel {
    /// Every level, least specific first.
    pub const ALL: [Self; 5] = [
        Self::Unknown,
        Self::TrustedPlatform,
        Self::TrustedThirdParty,
        Self::Untrusted,
        Self::Flagged,
    ];

    /// Rank used by [`merge_trust`]. Both trusted levels share a rank.
    #[must_use]
    pub const fn specificity(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::TrustedPlatform | Self::TrustedThirdParty => 1,
            Self::Untrusted => 2,
            Self::Flagged => 3,
        }
    }

    /// True once a check has produced an answer.
    #[must_use]
    pub const fn is_definitive(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Stable lowercase label, matching the serde representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::TrustedPlatform => "trusted_platform",
            Self::TrustedThirdParty => "trusted_third_party",
            Self::Untrusted => "untrusted",
            Self::Flagged => "flagged",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustLevel {
    type Err = TaskwatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "unknown" => Ok(Self::Unknown),
            "platform" | "trusted_platform" => Ok(Self::TrustedPlatform),
            "third_party" | "trusted_third_party" => Ok(Self::TrustedThirdParty),
            "untrusted" | "unsigned" => Ok(Self::Untrusted),
            "flagged" | "malicious" => Ok(Self::Flagged),
            other => Err(TaskwatchError::Config(format!(
                "unknown trust level '{other}' (expected unknown, platform, third_party, untrusted, flagged)"
            ))),
        }
    }
}

/// Combine the current classification with a newly observed one.
///
/// The result is never less specific than `current`, so a `Flagged` item
/// stays flagged and a classified item never reverts to `Unknown`.
#[must_use]
pub const fn merge_trust(current: TrustLevel, new: TrustLevel) -> TrustLevel {
    if new.specificity() > current.specificity() {
        new
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_never_decreases_specificity() {
        for current in TrustLevel::ALL {
            for new in TrustLevel::ALL {
                let merged = merge_trust(current, new);
                assert!(merged.specificity() >= current.specificity());
                assert!(merged.specificity() >= new.specificity());
            }
        }
    }

    #[test]
    fn flagged_is_absorbing() {
        for new in TrustLevel::ALL {
            assert_eq!(merge_trust(TrustLevel::Flagged, new), TrustLevel::Flagged);
        }
        let mut level = TrustLevel::Unknown;
        for new in [
            TrustLevel::TrustedThirdParty,
            TrustLevel::Flagged,
            TrustLevel::Unknown,
            TrustLevel::TrustedPlatform,
            TrustLevel::Untrusted,
        ] {
            level = merge_trust(level, new);
        }
        assert_eq!(level, TrustLevel::Flagged);
    }

    #[test]
    fn equal_rank_keeps_current() {
        assert_eq!(
            merge_trust(TrustLevel::TrustedPlatform, TrustLevel::TrustedThirdParty),
            TrustLevel::TrustedPlatform
        );
        assert_eq!(
            merge_trust(TrustLevel::Untrusted, TrustLevel::Unknown),
            TrustLevel::Untrusted
        );
    }

    #[test]
    fn parses_cli_spellings() {
        assert_eq!("Flagged".parse::<TrustLevel>().unwrap(), TrustLevel::Flagged);
        assert_eq!(
            "third-party".parse::<TrustLevel>().unwrap(),
            TrustLevel::TrustedThirdParty
        );
        assert!("bogus".parse::<TrustLevel>().is_err());
    }
}
