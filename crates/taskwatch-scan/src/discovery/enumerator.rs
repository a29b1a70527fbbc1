//! Walks a process-table snapshot, one task at a time.

use std::sync::Arc;

use taskwatch_core::{Item, ItemCategory, Result, Task, TaskHandle, TaskwatchError};
use tracing::{debug, info, warn};

use super::source::{ProcessEntry, ProcessSource};
use crate::cancel::CancelToken;

/// One step of enumeration, in the order it happens.
#[derive(Debug, Clone)]
pub enum Discovery {
    /// A process was reached; only its identity and executable are filled in.
    Task(Task),
    /// One item collection of a task finished.
    Items {
        task: TaskHandle,
        category: ItemCategory,
        items: Vec<Item>,
        partial: bool,
    },
    /// The process exited while it was being enumerated.
    Stale(TaskHandle),
}

/// Produces [`Tasks`] from a [`ProcessSource`].
pub struct TaskEnumerator {
    source: Arc<dyn ProcessSource>,
    cancel: CancelToken,
}

impl TaskEnumerator {
    pub fn new(source: Arc<dyn ProcessSource>, cancel: CancelToken) -> Self {
        Self { source, cancel }
    }

    /// Snapshot the process table. Blocking.
    pub fn enumerate(&self) -> Result<Tasks> {
        self.source.refresh()?;
        let entries = self.source.list_processes()?;
        info!(processes = entries.len(), "process table snapshot taken");
        Ok(Tasks {
            source: Arc::clone(&self.source),
            cancel: self.cancel.clone(),
            entries: entries.into_iter(),
            next_handle: 0,
            cancelled: false,
        })
    }
}

/// Lazy, finite sequence of tasks over one process-table snapshot.
///
/// Each process is visited exactly once. Cancellation is checked before each
/// process, never in the middle of one.
pub struct Tasks {
    source: Arc<dyn ProcessSource>,
    cancel: CancelToken,
    entries: std::vec::IntoIter<ProcessEntry>,
    next_handle: usize,
    cancelled: bool,
}

impl Tasks {
    /// Processes not yet visited.
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }

    /// Tasks produced so far.
    pub const fn produced(&self) -> usize {
        self.next_handle
    }

    pub const fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Enumerate the next process, reporting each step through `emit`.
    ///
    /// Returns the finished task, or `None` once the snapshot is exhausted
    /// or the scan was cancelled.
    pub fn advance(&mut self, mut emit: impl FnMut(Discovery)) -> Option<Task> {
        if self.cancel.is_cancelled() {
            if !self.cancelled {
                debug!(skipped = self.entries.len(), "enumeration cancelled");
            }
            self.cancelled = true;
            self.entries = Vec::new().into_iter();
            return None;
        }

        let entry = self.entries.next()?;
        let handle = TaskHandle(self.next_handle);
        self.next_handle += 1;

        let pid = entry.pid;
        let mut task = Task::new(handle, pid, entry.ppid, entry.name, entry.path);
        emit(Discovery::Task(task.clone()));

        let mut gone = false;
        for category in ItemCategory::ALL {
            let (items, partial) = if gone {
                (Vec::new(), true)
            } else {
                self.collect_items(handle, pid, category, &mut gone)
            };
            task.append_items(category, items.iter().cloned(), partial);
            emit(Discovery::Items {
                task: handle,
                category,
                items,
                partial,
            });
        }

        if !gone && !self.source.is_alive(pid) {
            gone = true;
        }
        if gone {
            debug!(pid, "process exited during enumeration");
            task.mark_stale();
            emit(Discovery::Stale(handle));
        }

        Some(task)
    }

    fn collect_items(
        &self,
        handle: TaskHandle,
        pid: i32,
        category: ItemCategory,
        gone: &mut bool,
    ) -> (Vec<Item>, bool) {
        let result = match category {
            ItemCategory::Libraries => self.source.list_loaded_libraries(pid).map(|paths| {
                paths
                    .into_iter()
                    .map(|p| Item::binary(handle, p))
                    .collect()
            }),
            ItemCategory::Files => self
                .source
                .list_open_files(pid)
                .map(|paths| paths.into_iter().map(|p| Item::file(handle, p)).collect()),
            ItemCategory::Connections => self.source.list_sockets(pid).map(|conns| {
                conns
                    .into_iter()
                    .map(|c| Item::connection(handle, c))
                    .collect()
            }),
        };

        match result {
            Ok(items) => (items, false),
            Err(TaskwatchError::ProcessGone { .. }) => {
                *gone = true;
                (Vec::new(), true)
            }
            Err(e) => {
                warn!(pid, category = %category, error = %e, "sub-enumeration failed");
                (Vec::new(), true)
            }
        }
    }
}

impl Iterator for Tasks {
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        self.advance(|_| {})
    }
}
