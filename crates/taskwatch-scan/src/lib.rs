//! # taskwatch-scan
//!
//! Scanning engine: enumerate running processes, classify the code they
//! run and keep a filterable task table up to date while classification
//! is still in flight.
//!
//! ## Data Flow
//!
//! ```text
//! Phase 1: Enumeration (blocking thread)
//!   ProcessSource::list_processes() -> TaskEnumerator
//!   -> executable, libraries, open files, sockets per process
//!
//! Phase 2: Classification (async, bounded)
//!   sha256_file() + SignatureVerifier::verify() on blocking workers
//!   -> ReputationClient::lookup() for anything not platform-signed
//!
//! Phase 3: Publication (single writer)
//!   Discovery + ItemUpdate -> Snapshot (watch) + ScanEvent (stream)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use taskwatch_core::{ScanConfig, TrustLevel};
//! use taskwatch_scan::{Scanner, TrustFilter, ViewQuery};
//!
//! # async fn run() {
//! let handle = Scanner::new(ScanConfig::default()).start();
//! let snapshot = handle.wait().await;
//! let query = ViewQuery::default().trust(TrustFilter::only(TrustLevel::Flagged));
//! for row in snapshot.view(&query) {
//!     println!("{} {}", row.task.pid, row.task.name);
//! }
//! # }
//! ```

pub mod cancel;
pub mod discovery;
pub mod filter;
pub mod hash;
pub mod inspect;
mod pipeline;
pub mod session;
pub mod signature;

#[cfg(test)]
mod testing;

pub use cancel::CancelToken;
pub use discovery::{
    Discovery, ProcessEntry, ProcessSource, ProcfsSource, SocketTable, TaskEnumerator, Tasks,
};
pub use filter::{view, view_items, SortKey, TaskRow, TrustFilter, ViewQuery};
pub use hash::{sha256_bytes, sha256_file};
pub use inspect::{CodeInspector, FileInspector, Inspection};
pub use session::{ScanEvent, ScanHandle, Scanner, Snapshot};
pub use signature::{PackageDbVerifier, PackageSources, SignatureVerifier};
