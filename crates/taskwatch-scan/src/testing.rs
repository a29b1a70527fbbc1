//! In-memory stand-ins for the OS, the inspector and the reputation service.

use std::collections::HashMap;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use taskwatch_client::{HashReport, ReputationProvider};
use taskwatch_core::{
    Connection, ReputationVerdict, Result, SignatureStatus, TaskwatchError, Verdict,
};

use crate::cancel::CancelToken;
use crate::discovery::{ProcessEntry, ProcessSource};
use crate::hash::sha256_bytes;
use crate::inspect::{CodeInspector, Inspection};

pub struct FakeProcess {
    entry: ProcessEntry,
    libraries: Vec<PathBuf>,
    files: Vec<PathBuf>,
    sockets: Vec<Connection>,
    denied: bool,
    gone: bool,
}

impl FakeProcess {
    pub fn new(pid: i32, ppid: i32, name: &str) -> Self {
        Self {
            entry: ProcessEntry::new(pid, ppid, name, Some(PathBuf::from(format!("/usr/bin/{name}")))),
            libraries: Vec::new(),
            files: Vec::new(),
            sockets: Vec::new(),
            denied: false,
            gone: false,
        }
    }

    pub fn kernel(pid: i32, name: &str) -> Self {
        let mut p = Self::new(pid, 2, name);
        p.entry.path = None;
        p
    }

    pub fn library(mut self, path: &str) -> Self {
        self.libraries.push(path.into());
        self
    }

    pub fn file(mut self, path: &str) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn socket(mut self, connection: Connection) -> Self {
        self.sockets.push(connection);
        self
    }

    pub const fn denied(mut self) -> Self {
        self.denied = true;
        self
    }

    pub const fn gone(mut self) -> Self {
        self.gone = true;
        self
    }
}

/// Static process table.
pub struct FakeSource {
    processes: Vec<FakeProcess>,
    cancel_after: Option<(usize, CancelToken)>,
    finished: AtomicUsize,
}

impl FakeSource {
    pub fn new(processes: Vec<FakeProcess>) -> Self {
        Self {
            processes,
            cancel_after: None,
            finished: AtomicUsize::new(0),
        }
    }

    /// Cancel `token` while the `n`th process is being enumerated.
    pub fn cancel_after(mut self, n: usize, token: CancelToken) -> Self {
        self.cancel_after = Some((n, token));
        self
    }

    fn find(&self, pid: i32, what: &'static str) -> Result<&FakeProcess> {
        let p = self
            .processes
            .iter()
            .find(|p| p.entry.pid == pid)
            .ok_or(TaskwatchError::ProcessGone { pid })?;
        if p.gone {
            return Err(TaskwatchError::ProcessGone { pid });
        }
        if p.denied {
            return Err(TaskwatchError::PermissionDenied { pid, what });
        }
        Ok(p)
    }
}

impl ProcessSource for FakeSource {
    fn list_processes(&self) -> Result<Vec<ProcessEntry>> {
        Ok(self.processes.iter().map(|p| p.entry.clone()).collect())
    }

    fn list_loaded_libraries(&self, pid: i32) -> Result<Vec<PathBuf>> {
        Ok(self.find(pid, "memory maps")?.libraries.clone())
    }

    fn list_open_files(&self, pid: i32) -> Result<Vec<PathBuf>> {
        Ok(self.find(pid, "open files")?.files.clone())
    }

    fn list_sockets(&self, pid: i32) -> Result<Vec<Connection>> {
        let result = self.find(pid, "sockets").map(|p| p.sockets.clone());
        let finished = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((n, token)) = &self.cancel_after {
            if finished == *n {
                token.cancel();
            }
        }
        result
    }

    fn is_alive(&self, pid: i32) -> bool {
        self.processes
            .iter()
            .any(|p| p.entry.pid == pid && !p.gone)
    }
}

/// Inspector with scripted results. Unknown paths hash to the SHA-256 of the
/// path itself and are unsigned.
#[derive(Default)]
pub struct FakeInspector {
    scripted: HashMap<PathBuf, Inspection>,
    missing: Vec<PathBuf>,
    calls: Mutex<Vec<PathBuf>>,
}

impl FakeInspector {
    pub fn with(mut self, path: &str, hash: &str, signature: SignatureStatus) -> Self {
        self.scripted.insert(
            path.into(),
            Inspection {
                hash: hash.into(),
                signature,
            },
        );
        self
    }

    pub fn missing(mut self, path: &str) -> Self {
        self.missing.push(path.into());
        self
    }

    pub fn calls_for(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_path() == Path::new(path))
            .count()
    }

    pub fn hash_of(path: &str) -> String {
        sha256_bytes(Path::new(path).as_os_str().as_bytes())
    }
}

impl CodeInspector for FakeInspector {
    fn inspect(&self, path: &Path) -> Result<Inspection> {
        self.calls.lock().unwrap().push(path.to_path_buf());
        if self.missing.iter().any(|m| m == path) {
            return Err(TaskwatchError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Ok(self.scripted.get(path).cloned().unwrap_or_else(|| Inspection {
            hash: sha256_bytes(path.as_os_str().as_bytes()),
            signature: SignatureStatus::Unsigned,
        }))
    }
}

/// Provider answering from a fixed table; anything else is clean.
#[derive(Default)]
pub struct FakeProvider {
    flagged: Vec<String>,
    reject_key: AtomicBool,
    queried: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl FakeProvider {
    pub fn flagging(hashes: &[&str]) -> Self {
        Self {
            flagged: hashes.iter().map(|h| (*h).to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn rejecting_key() -> Self {
        let p = Self::default();
        p.reject_key.store(true, Ordering::SeqCst);
        p
    }

    /// Answers every batch only after `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn queried(&self) -> Vec<String> {
        self.queried.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReputationProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn query(&self, hashes: &[String]) -> Result<Vec<HashReport>> {
        self.queried.lock().unwrap().extend(hashes.iter().cloned());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.reject_key.load(Ordering::SeqCst) {
            return Err(TaskwatchError::Unauthorized);
        }
        Ok(hashes
            .iter()
            .map(|h| {
                let verdict = if self.flagged.contains(h) {
                    ReputationVerdict::from_detections(40, 70)
                } else {
                    ReputationVerdict::from_verdict(Verdict::Clean)
                };
                HashReport::new(h.clone(), verdict)
            })
            .collect())
    }
}
