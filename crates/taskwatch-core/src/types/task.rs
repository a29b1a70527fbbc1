//! Process snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::item::{Item, ItemCategory, ItemSlot, ItemUpdate};
use super::trust::{merge_trust, TrustLevel};

/// Index of a task in its session's task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(pub usize);

impl TaskHandle {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which sub-enumerations of a task hit a recoverable failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFlags {
    pub libraries: bool,
    pub files: bool,
    pub connections: bool,
}

impl PartialFlags {
    #[must_use]
    pub const fn any(self) -> bool {
        self.libraries || self.files || self.connections
    }

    #[must_use]
    pub const fn get(self, category: ItemCategory) -> bool {
        match category {
            ItemCategory::Libraries => self.libraries,
            ItemCategory::Files => self.files,
            ItemCategory::Connections => self.connections,
        }
    }

    pub fn set(&mut self, category: ItemCategory) {
        match category {
            ItemCategory::Libraries => self.libraries = true,
            ItemCategory::Files => self.files = true,
            ItemCategory::Connections => self.connections = true,
        }
    }
}

/// One live process and the items it holds.
///
/// Identity (`pid`, `path`) is fixed at creation; item collections are
/// append-only while the owning scan runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Position in the session's task table
    pub handle: TaskHandle,
    /// Process ID
    pub pid: i32,
    /// Parent process ID
    pub ppid: i32,
    /// Process name (comm)
    pub name: String,
    /// Path to the executable (None for kernel threads)
    pub path: Option<PathBuf>,
    executable: Option<Item>,
    libraries: Vec<Item>,
    files: Vec<Item>,
    connections: Vec<Item>,
    partial: PartialFlags,
    stale: bool,
}

impl Task {
    #[must_use]
    pub fn new(
        handle: TaskHandle,
        pid: i32,
        ppid: i32,
        name: impl Into<String>,
        path: Option<PathBuf>,
    ) -> Self {
        let executable = path.as_ref().map(|p| Item::binary(handle, p.clone()));
        Self {
            handle,
            pid,
            ppid,
            name: name.into(),
            path,
            executable,
            libraries: Vec::new(),
            files: Vec::new(),
            connections: Vec::new(),
            partial: PartialFlags::default(),
            stale: false,
        }
    }

    /// The main executable as a binary item.
    #[must_use]
    pub const fn executable(&self) -> Option<&Item> {
        self.executable.as_ref()
    }

    #[must_use]
    pub fn items(&self, category: ItemCategory) -> &[Item] {
        match category {
            ItemCategory::Libraries => &self.libraries,
            ItemCategory::Files => &self.files,
            ItemCategory::Connections => &self.connections,
        }
    }

    #[must_use]
    pub fn item(&self, slot: ItemSlot) -> Option<&Item> {
        match slot {
            ItemSlot::Executable => self.executable.as_ref(),
            ItemSlot::Library(i) => self.libraries.get(i),
            ItemSlot::File(i) => self.files.get(i),
            ItemSlot::Connection(i) => self.connections.get(i),
        }
    }

    /// Executable first, then libraries, files and connections.
    pub fn all_items(&self) -> impl Iterator<Item = &Item> {
        self.executable
            .iter()
            .chain(&self.libraries)
            .chain(&self.files)
            .chain(&self.connections)
    }

    #[must_use]
    pub const fn partial(&self) -> PartialFlags {
        self.partial
    }

    #[must_use]
    pub const fn is_stale(&self) -> bool {
        self.stale
    }

    /// Append a batch of items. Returns the index of the first appended item.
    pub fn append_items(
        &mut self,
        category: ItemCategory,
        items: impl IntoIterator<Item = Item>,
        partial: bool,
    ) -> usize {
        let target = match category {
            ItemCategory::Libraries => &mut self.libraries,
            ItemCategory::Files => &mut self.files,
            ItemCategory::Connections => &mut self.connections,
        };
        let start = target.len();
        target.extend(items);
        if partial {
            self.partial.set(category);
        }
        start
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Apply a classification result to the addressed item.
    pub fn apply_update(&mut self, update: &ItemUpdate) -> bool {
        let item = match update.item.slot {
            ItemSlot::Executable => self.executable.as_mut(),
            ItemSlot::Library(i) => self.libraries.get_mut(i),
            ItemSlot::File(i) => self.files.get_mut(i),
            ItemSlot::Connection(i) => self.connections.get_mut(i),
        };
        item.is_some_and(|item| item.apply(update))
    }

    /// Most specific trust across every item of the task.
    #[must_use]
    pub fn aggregate_trust(&self) -> TrustLevel {
        self.all_items()
            .fold(TrustLevel::Unknown, |acc, item| merge_trust(acc, item.trust()))
    }

    /// Items still waiting for classification (binaries only).
    #[must_use]
    pub fn pending_items(&self) -> usize {
        self.executable
            .iter()
            .chain(&self.libraries)
            .filter(|i| !i.trust().is_definitive())
            .count()
    }
}
