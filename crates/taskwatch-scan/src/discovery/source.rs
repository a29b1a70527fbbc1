//! The OS introspection boundary.

use std::path::PathBuf;

use taskwatch_core::{Connection, Result};

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: i32,
    pub ppid: i32,
    /// Process name (comm)
    pub name: String,
    /// Executable path, when readable
    pub path: Option<PathBuf>,
}

impl ProcessEntry {
    pub fn new(pid: i32, ppid: i32, name: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self {
            pid,
            ppid,
            name: name.into(),
            path,
        }
    }
}

/// Read access to the live process table.
///
/// All calls are blocking. Per-process calls fail with
/// `TaskwatchError::PermissionDenied` when the caller may not inspect the
/// process and `TaskwatchError::ProcessGone` when it has exited.
pub trait ProcessSource: Send + Sync + 'static {
    /// Take any per-scan snapshots (socket tables and the like). Called once
    /// at the start of every enumeration.
    fn refresh(&self) -> Result<()> {
        Ok(())
    }

    /// Point-in-time listing of every process.
    fn list_processes(&self) -> Result<Vec<ProcessEntry>>;

    /// Shared objects mapped into the process, excluding its executable.
    fn list_loaded_libraries(&self, pid: i32) -> Result<Vec<PathBuf>>;

    /// Filesystem paths behind the process's open descriptors.
    fn list_open_files(&self, pid: i32) -> Result<Vec<PathBuf>>;

    /// Sockets held by the process.
    fn list_sockets(&self, pid: i32) -> Result<Vec<Connection>>;

    fn is_alive(&self, pid: i32) -> bool;
}
