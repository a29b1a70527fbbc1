//! Process discovery via `/proc` filesystem.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use procfs::net::{TcpState, UdpState};
use procfs::process::{FDTarget, MMapPath, Process};
use procfs::ProcError;
use taskwatch_core::{Connection, ConnectionState, Result, TaskwatchError, Transport};
use tracing::debug;

use super::source::{ProcessEntry, ProcessSource};

/// Every socket in the system's inet tables, keyed by inode.
#[derive(Debug, Clone, Default)]
pub struct SocketTable {
    by_inode: HashMap<u64, Connection>,
}

impl SocketTable {
    /// Read `/proc/net/{tcp,tcp6,udp,udp6}`. A table that cannot be read
    /// (IPv6 disabled, for instance) is skipped.
    #[must_use]
    pub fn current() -> Self {
        let mut table = Self::default();

        match procfs::net::tcp() {
            Ok(entries) => table.extend_tcp(entries),
            Err(e) => debug!(error = %e, "skipping tcp table"),
        }
        match procfs::net::tcp6() {
            Ok(entries) => table.extend_tcp(entries),
            Err(e) => debug!(error = %e, "skipping tcp6 table"),
        }
        match procfs::net::udp() {
            Ok(entries) => table.extend_udp(entries),
            Err(e) => debug!(error = %e, "skipping udp table"),
        }
        match procfs::net::udp6() {
            Ok(entries) => table.extend_udp(entries),
            Err(e) => debug!(error = %e, "skipping udp6 table"),
        }

        debug!(sockets = table.len(), "socket table loaded");
        table
    }

    fn extend_tcp(&mut self, entries: Vec<procfs::net::TcpNetEntry>) {
        for e in entries {
            self.insert(Connection::new(
                e.local_address,
                e.remote_address,
                Transport::Tcp,
                tcp_state(&e.state),
                e.inode,
            ));
        }
    }

    fn extend_udp(&mut self, entries: Vec<procfs::net::UdpNetEntry>) {
        for e in entries {
            self.insert(Connection::new(
                e.local_address,
                e.remote_address,
                Transport::Udp,
                udp_state(&e.state),
                e.inode,
            ));
        }
    }

    pub fn insert(&mut self, connection: Connection) {
        // inode 0 marks sockets in TIME_WAIT that no process owns
        if connection.inode != 0 {
            self.by_inode.insert(connection.inode, connection);
        }
    }

    #[must_use]
    pub fn get(&self, inode: u64) -> Option<&Connection> {
        self.by_inode.get(&inode)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_inode.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_inode.is_empty()
    }
}

const fn tcp_state(state: &TcpState) -> ConnectionState {
    match state {
        TcpState::Established => ConnectionState::Established,
        TcpState::SynSent => ConnectionState::SynSent,
        TcpState::SynRecv => ConnectionState::SynRecv,
        TcpState::FinWait1 => ConnectionState::FinWait1,
        TcpState::FinWait2 => ConnectionState::FinWait2,
        TcpState::TimeWait => ConnectionState::TimeWait,
        TcpState::Close => ConnectionState::Close,
        TcpState::CloseWait => ConnectionState::CloseWait,
        TcpState::LastAck => ConnectionState::LastAck,
        TcpState::Listen => ConnectionState::Listen,
        TcpState::Closing => ConnectionState::Closing,
        #[allow(unreachable_patterns)]
        _ => ConnectionState::Unknown,
    }
}

const fn udp_state(state: &UdpState) -> ConnectionState {
    match state {
        UdpState::Established => ConnectionState::Established,
        UdpState::Close => ConnectionState::Close,
    }
}

/// Map a procfs error for `pid` onto our taxonomy.
fn proc_error(pid: i32, what: &'static str, e: ProcError) -> TaskwatchError {
    match e {
        ProcError::PermissionDenied(_) => TaskwatchError::PermissionDenied { pid, what },
        ProcError::NotFound(_) => TaskwatchError::ProcessGone { pid },
        other => TaskwatchError::Procfs(other.to_string()),
    }
}

/// The kernel appends " (deleted)" to links whose target was unlinked.
fn clean_path(path: PathBuf) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_suffix(" (deleted)")) {
        Some(stripped) => PathBuf::from(stripped),
        None => path,
    }
}

/// `libfoo.so`, `libfoo.so.6`, `libfoo-2.0.so.0.1`
fn is_shared_object(path: &std::path::Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.ends_with(".so") || name.contains(".so."))
}

/// [`ProcessSource`] backed by the `procfs` crate.
pub struct ProcfsSource {
    sockets: RwLock<Arc<SocketTable>>,
}

impl Default for ProcfsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sockets: RwLock::new(Arc::new(SocketTable::default())),
        }
    }

    fn sockets(&self) -> Arc<SocketTable> {
        Arc::clone(&self.sockets.read().unwrap_or_else(PoisonError::into_inner))
    }
}

fn open(pid: i32, what: &'static str) -> Result<Process> {
    Process::new(pid).map_err(|e| proc_error(pid, what, e))
}

impl ProcessSource for ProcfsSource {
    fn refresh(&self) -> Result<()> {
        let table = Arc::new(SocketTable::current());
        *self.sockets.write().unwrap_or_else(PoisonError::into_inner) = table;
        Ok(())
    }

    fn list_processes(&self) -> Result<Vec<ProcessEntry>> {
        let all_procs =
            procfs::process::all_processes().map_err(|e| TaskwatchError::Procfs(e.to_string()))?;

        let mut entries = Vec::new();
        for entry in all_procs {
            let proc = match entry {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "skipping inaccessible process");
                    continue;
                }
            };
            let stat = match proc.stat() {
                Ok(s) => s,
                Err(e) => {
                    debug!(pid = proc.pid(), error = %e, "skipping process");
                    continue;
                }
            };
            // Kernel threads and other users' processes have no readable exe
            let path = proc.exe().ok().map(clean_path);
            entries.push(ProcessEntry::new(stat.pid, stat.ppid, stat.comm, path));
        }

        Ok(entries)
    }

    fn list_loaded_libraries(&self, pid: i32) -> Result<Vec<PathBuf>> {
        const WHAT: &str = "memory maps";
        let proc = open(pid, WHAT)?;
        let exe = proc.exe().ok().map(clean_path);
        let maps = proc.maps().map_err(|e| proc_error(pid, WHAT, e))?;

        let mut seen = HashSet::new();
        let mut libraries = Vec::new();
        for map in maps {
            let MMapPath::Path(path) = map.pathname else {
                continue;
            };
            let path = clean_path(path);
            if exe.as_ref() == Some(&path) || !is_shared_object(&path) {
                continue;
            }
            if seen.insert(path.clone()) {
                libraries.push(path);
            }
        }
        Ok(libraries)
    }

    fn list_open_files(&self, pid: i32) -> Result<Vec<PathBuf>> {
        const WHAT: &str = "open files";
        let proc = open(pid, WHAT)?;
        let fds = proc.fd().map_err(|e| proc_error(pid, WHAT, e))?;

        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for fd in fds {
            match fd {
                Ok(info) => {
                    if let FDTarget::Path(path) = info.target {
                        let path = clean_path(path);
                        if seen.insert(path.clone()) {
                            files.push(path);
                        }
                    }
                }
                // Descriptor closed between listing and readlink
                Err(e) => debug!(pid, error = %e, "skipping descriptor"),
            }
        }
        Ok(files)
    }

    fn list_sockets(&self, pid: i32) -> Result<Vec<Connection>> {
        const WHAT: &str = "sockets";
        let proc = open(pid, WHAT)?;
        let fds = proc.fd().map_err(|e| proc_error(pid, WHAT, e))?;
        let table = self.sockets();

        let mut seen = HashSet::new();
        let mut sockets = Vec::new();
        for info in fds.flatten() {
            if let FDTarget::Socket(inode) = info.target {
                // Unix-domain and netlink sockets are not in the inet tables
                if let Some(conn) = table.get(inode) {
                    if seen.insert(inode) {
                        sockets.push(conn.clone());
                    }
                }
            }
        }
        Ok(sockets)
    }

    fn is_alive(&self, pid: i32) -> bool {
        Process::new(pid).is_ok_and(|p| p.is_alive())
    }
}
