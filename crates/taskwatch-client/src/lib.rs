//! Reputation lookups for taskwatch.
//!
//! [`ReputationClient`] wraps a [`ReputationProvider`] with a shared
//! [`ReputationCache`], in-flight de-duplication, a bounded worker pool and
//! client-wide throttling backoff. [`VirusTotalProvider`] is the bundled
//! provider.

mod backoff;
mod cache;
mod client;
mod config;
mod provider;
mod virustotal;

pub use cache::{ReputationCache, ReputationRecord};
pub use client::{ClientStats, ReputationClient, ReputationClientBuilder};
pub use config::RetryConfig;
pub use provider::{HashReport, ReputationProvider};
pub use taskwatch_core::{Result, TaskwatchError};
pub use virustotal::{VirusTotalProvider, VirusTotalProviderBuilder};
