//! Scan configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TaskwatchError};

/// Options recognised by the scanning engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Query the reputation service for non-platform binaries.
    #[serde(default = "default_true")]
    pub reputation_enabled: bool,

    /// Maximum concurrent reputation requests.
    #[serde(default = "default_worker_budget")]
    pub vt_worker_budget: usize,

    /// Optional request quota on top of the worker budget.
    #[serde(default)]
    pub vt_requests_per_minute: Option<u32>,

    /// How long a cached verdict stays valid (seconds).
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Cache size ceiling (entries).
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// Also submit platform-signed binaries to the reputation service.
    #[serde(default, alias = "include_platform_signed_in_reputation")]
    pub include_apple_signed_in_reputation: bool,

    /// Concurrent hash/signature workers.
    #[serde(default = "default_hash_workers")]
    pub hash_workers: usize,

    /// Per-request timeout for the reputation service (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// On-disk reputation cache, loaded before and saved after a scan.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            reputation_enabled: true,
            vt_worker_budget: default_worker_budget(),
            vt_requests_per_minute: None,
            cache_ttl_secs: default_cache_ttl(),
            cache_max_entries: default_cache_max_entries(),
            include_apple_signed_in_reputation: false,
            hash_workers: default_hash_workers(),
            request_timeout_secs: default_request_timeout(),
            cache_path: None,
        }
    }
}

impl ScanConfig {
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.vt_worker_budget == 0 {
            return Err(TaskwatchError::Config(
                "vt_worker_budget must be at least 1".into(),
            ));
        }
        if self.hash_workers == 0 {
            return Err(TaskwatchError::Config(
                "hash_workers must be at least 1".into(),
            ));
        }
        if self.cache_max_entries == 0 {
            return Err(TaskwatchError::Config(
                "cache_max_entries must be at least 1".into(),
            ));
        }
        if self.vt_requests_per_minute == Some(0) {
            return Err(TaskwatchError::Config(
                "vt_requests_per_minute must be at least 1 when set".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(TaskwatchError::Config(
                "request_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// Default value functions for serde.
const fn default_true() -> bool {
    true
}

const fn default_worker_budget() -> usize {
    4
}

const fn default_cache_ttl() -> u64 {
    24 * 60 * 60
}

const fn default_cache_max_entries() -> usize {
    10_000
}

const fn default_hash_workers() -> usize {
    4
}

const fn default_request_timeout() -> u64 {
    30
}
