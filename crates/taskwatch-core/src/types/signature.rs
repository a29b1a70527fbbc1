//! Code-signing status of a binary.

use serde::{Deserialize, Serialize};

use super::trust::TrustLevel;

/// Outcome of a signature check on a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignatureStatus {
    /// Owned by the platform (distribution package database)
    PlatformSigned {
        /// Owning package
        package: String,
    },
    /// Shipped through a signed third-party channel
    ThirdPartySigned {
        /// Signing authority, e.g. `snap:firefox`
        signer: String,
    },
    /// No signature found
    Unsigned,
    /// A signature exists but does not hold for the file on disk
    Invalid {
        /// Why validation failed
        reason: String,
    },
}

impl SignatureStatus {
    /// Trust implied by the signature alone.
    #[must_use]
    pub const fn trust(&self) -> TrustLevel {
        match self {
            Self::PlatformSigned { .. } => TrustLevel::TrustedPlatform,
            Self::ThirdPartySigned { .. } => TrustLevel::TrustedThirdParty,
            Self::Unsigned | Self::Invalid { .. } => TrustLevel::Untrusted,
        }
    }

    /// Name of the signing authority, if any.
    #[must_use]
    pub fn signer(&self) -> Option<&str> {
        match self {
            Self::PlatformSigned { package } => Some(package),
            Self::ThirdPartySigned { signer } => Some(signer),
            Self::Unsigned | Self::Invalid { .. } => None,
        }
    }

    /// Whether the signature holds.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(
            self,
            Self::PlatformSigned { .. } | Self::ThirdPartySigned { .. }
        )
    }

    /// Whether the OS vendor vouches for this file.
    #[must_use]
    pub const fn is_platform(&self) -> bool {
        matches!(self, Self::PlatformSigned { .. })
    }
}
