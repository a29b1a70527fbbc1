//! Reputation verdicts returned by the external service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::trust::TrustLevel;

/// The service's opinion on a hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Service has no answer (hash unknown, or the lookup failed)
    #[default]
    Unknown,
    /// Known and not detected by any engine
    Clean,
    /// Detected as malicious
    Flagged,
}

impl Verdict {
    /// Trust implied by the verdict. A clean result adds nothing over the
    /// signature check.
    #[must_use]
    pub const fn trust(self) -> TrustLevel {
        match self {
            Self::Flagged => TrustLevel::Flagged,
            Self::Unknown | Self::Clean => TrustLevel::Unknown,
        }
    }
}

/// Detection counters reported alongside a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detections {
    /// Engines flagging the file
    pub positives: u32,
    /// Engines that looked at it
    pub total: u32,
}

/// Full reputation answer for one hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationVerdict {
    /// Summary verdict
    pub verdict: Verdict,
    /// Detection ratio, when the service reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detections: Option<Detections>,
    /// Link to the service's report page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,
    /// When the service last analysed the file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_analysis: Option<DateTime<Utc>>,
}

impl ReputationVerdict {
    /// Verdict with no metadata.
    #[must_use]
    pub const fn unknown() -> Self {
        Self {
            verdict: Verdict::Unknown,
            detections: None,
            permalink: None,
            last_analysis: None,
        }
    }

    /// Bare verdict without counters.
    #[must_use]
    pub const fn from_verdict(verdict: Verdict) -> Self {
        Self {
            verdict,
            detections: None,
            permalink: None,
            last_analysis: None,
        }
    }

    /// Build from detection counters; any positive engine flags the file.
    #[must_use]
    pub const fn from_detections(positives: u32, total: u32) -> Self {
        let verdict = if positives > 0 {
            Verdict::Flagged
        } else {
            Verdict::Clean
        };
        Self {
            verdict,
            detections: Some(Detections { positives, total }),
            permalink: None,
            last_analysis: None,
        }
    }

    /// Trust implied by the summary verdict.
    #[must_use]
    pub const fn trust(&self) -> TrustLevel {
        self.verdict.trust()
    }
}
