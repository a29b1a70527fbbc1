//! Hash and signature inspection of a path on disk.

use std::path::Path;
use std::sync::Arc;

use taskwatch_core::{Result, SignatureStatus};

use crate::hash::sha256_file;
use crate::signature::{PackageDbVerifier, SignatureVerifier};

/// What inspection learned about a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    /// Lowercase hex SHA-256 of the contents
    pub hash: String,
    pub signature: SignatureStatus,
}

/// Produces an [`Inspection`] for a path.
///
/// Implementations are called from blocking workers, possibly many at once.
/// A path that disappeared is reported as `TaskwatchError::NotFound`.
pub trait CodeInspector: Send + Sync + 'static {
    fn inspect(&self, path: &Path) -> Result<Inspection>;
}

/// Hashes the file and asks a [`SignatureVerifier`] about it.
#[derive(Clone)]
pub struct FileInspector {
    verifier: Arc<dyn SignatureVerifier>,
}

impl Default for FileInspector {
    fn default() -> Self {
        Self::new(Arc::new(PackageDbVerifier::default()))
    }
}

impl FileInspector {
    #[must_use]
    pub fn new(verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self { verifier }
    }
}

impl CodeInspector for FileInspector {
    fn inspect(&self, path: &Path) -> Result<Inspection> {
        let hash = sha256_file(path)?;
        let signature = self.verifier.verify(path)?;
        Ok(Inspection { hash, signature })
    }
}
