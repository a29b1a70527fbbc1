//! Core types and errors for taskwatch.
//!
//! This crate provides the foundational types shared by the scanner, the
//! reputation client and the command-line front end:
//!
//! - **Types**: tasks, items (binaries, files, connections) and the trust model
//! - **Config**: [`ScanConfig`], the options the engine recognises
//! - **Errors**: [`TaskwatchError`] and the [`Result`] alias
//!
//! # Example
//!
//! ```rust
//! use taskwatch_core::{merge_trust, TrustLevel};
//!
//! let level = merge_trust(TrustLevel::Untrusted, TrustLevel::Flagged);
//! assert_eq!(merge_trust(level, TrustLevel::TrustedPlatform), TrustLevel::Flagged);
//! ```

mod config;
mod error;
pub mod types;

pub use config::ScanConfig;
pub use error::{Result, TaskwatchError};
pub use types::*;
