//! The seam between the client and a concrete reputation service.

use async_trait::async_trait;
use taskwatch_core::{ReputationVerdict, Result};

/// Per-hash answer from a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashReport {
    /// Hash as sent in the request
    pub hash: String,
    /// What the provider knows about it
    pub verdict: ReputationVerdict,
}

impl HashReport {
    pub fn new(hash: impl Into<String>, verdict: ReputationVerdict) -> Self {
        Self {
            hash: hash.into(),
            verdict,
        }
    }
}

/// An external reputation service.
///
/// Implementations report throttling as [`TaskwatchError::Throttled`] and bad
/// credentials as [`TaskwatchError::Unauthorized`]; the client handles
/// backoff, retries and caching.
///
/// [`TaskwatchError::Throttled`]: taskwatch_core::TaskwatchError::Throttled
/// [`TaskwatchError::Unauthorized`]: taskwatch_core::TaskwatchError::Unauthorized
#[async_trait]
pub trait ReputationProvider: Send + Sync + 'static {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    /// How many hashes one request may carry
    fn max_batch_size(&self) -> usize {
        1
    }

    /// Look up every hash in `hashes`. Hashes missing from the returned list
    /// are treated as unanswered.
    async fn query(&self, hashes: &[String]) -> Result<Vec<HashReport>>;
}
