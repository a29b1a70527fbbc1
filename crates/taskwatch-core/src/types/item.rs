//! Items discovered inside a task: binaries, open files and sockets.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use super::connection::Connection;
use super::reputation::{ReputationVerdict, Verdict};
use super::signature::SignatureStatus;
use super::task::TaskHandle;
use super::trust::{merge_trust, TrustLevel};

/// Which collection of a task an item lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemCategory {
    Libraries,
    Files,
    Connections,
}

impl ItemCategory {
    pub const ALL: [Self; 3] = [Self::Libraries, Self::Files, Self::Connections];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Libraries => "libraries",
            Self::Files => "files",
            Self::Connections => "connections",
        }
    }
}

impl fmt::Display for ItemCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of an item inside its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "slot", content = "index", rename_all = "lowercase")]
pub enum ItemSlot {
    /// The task's main executable
    Executable,
    Library(usize),
    File(usize),
    Connection(usize),
}

impl ItemSlot {
    /// Slot for the `index`th item of `category`.
    #[must_use]
    pub const fn in_category(category: ItemCategory, index: usize) -> Self {
        match category {
            ItemCategory::Libraries => Self::Library(index),
            ItemCategory::Files => Self::File(index),
            ItemCategory::Connections => Self::Connection(index),
        }
    }
}

/// Stable address of an item within a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    pub task: TaskHandle,
    pub slot: ItemSlot,
}

/// A loaded binary: executable or shared library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binary {
    /// Absolute path on disk
    pub path: PathBuf,
    /// File name component
    pub name: String,
    /// False once the file is known to have vanished
    pub exists: bool,
    /// Signature check result (None until inspected)
    pub signature: Option<SignatureStatus>,
}

impl Binary {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: file_name(&path),
            path,
            exists: true,
            signature: None,
        }
    }

    /// Signing authority, if the binary is signed.
    #[must_use]
    pub fn signer(&self) -> Option<&str> {
        self.signature.as_ref().and_then(SignatureStatus::signer)
    }

    /// Whether the signature was checked and found valid.
    #[must_use]
    pub fn is_signature_valid(&self) -> bool {
        self.signature.as_ref().is_some_and(SignatureStatus::is_valid)
    }

    /// Whether the platform vouches for the binary.
    #[must_use]
    pub fn is_platform(&self) -> bool {
        self.signature
            .as_ref()
            .is_some_and(SignatureStatus::is_platform)
    }
}

/// An open file that is listed but not classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileItem {
    pub path: PathBuf,
    pub name: String,
    pub exists: bool,
}

impl FileItem {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: file_name(&path),
            path,
            exists: true,
        }
    }
}

/// Variant payload of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ItemKind {
    Binary(Binary),
    File(FileItem),
    Connection(Connection),
}

/// Any artifact belonging to a task.
///
/// Trust and reputation only ever become more informative; the hash is set
/// at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    owner: TaskHandle,
    #[serde(flatten)]
    kind: ItemKind,
    trust: TrustLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reputation: Option<ReputationVerdict>,
}

impl Item {
    #[must_use]
    pub const fn new(owner: TaskHandle, kind: ItemKind) -> Self {
        Self {
            owner,
            kind,
            trust: TrustLevel::Unknown,
            hash: None,
            reputation: None,
        }
    }

    #[must_use]
    pub fn binary(owner: TaskHandle, path: impl Into<PathBuf>) -> Self {
        Self::new(owner, ItemKind::Binary(Binary::new(path)))
    }

    #[must_use]
    pub fn file(owner: TaskHandle, path: impl Into<PathBuf>) -> Self {
        Self::new(owner, ItemKind::File(FileItem::new(path)))
    }

    #[must_use]
    pub const fn connection(owner: TaskHandle, connection: Connection) -> Self {
        Self::new(owner, ItemKind::Connection(connection))
    }

    /// Handle of the owning task (lookup only).
    #[must_use]
    pub const fn owner(&self) -> TaskHandle {
        self.owner
    }

    #[must_use]
    pub const fn kind(&self) -> &ItemKind {
        &self.kind
    }

    #[must_use]
    pub const fn trust(&self) -> TrustLevel {
        self.trust
    }

    #[must_use]
    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    #[must_use]
    pub const fn reputation(&self) -> Option<&ReputationVerdict> {
        self.reputation.as_ref()
    }

    #[must_use]
    pub const fn as_binary(&self) -> Option<&Binary> {
        match &self.kind {
            ItemKind::Binary(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_connection(&self) -> Option<&Connection> {
        match &self.kind {
            ItemKind::Connection(c) => Some(c),
            _ => None,
        }
    }

    /// Filesystem path for binaries and files.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.kind {
            ItemKind::Binary(b) => Some(&b.path),
            ItemKind::File(f) => Some(&f.path),
            ItemKind::Connection(_) => None,
        }
    }

    /// Short name shown in listings.
    #[must_use]
    pub fn display_name(&self) -> Cow<'_, str> {
        match &self.kind {
            ItemKind::Binary(b) => Cow::Borrowed(&b.name),
            ItemKind::File(f) => Cow::Borrowed(&f.name),
            ItemKind::Connection(c) => Cow::Owned(c.descriptor()),
        }
    }

    /// Full identity: path for files, descriptor for sockets.
    #[must_use]
    pub fn identity(&self) -> Cow<'_, str> {
        match &self.kind {
            ItemKind::Binary(b) => b.path.to_string_lossy(),
            ItemKind::File(f) => f.path.to_string_lossy(),
            ItemKind::Connection(c) => Cow::Owned(c.descriptor()),
        }
    }

    /// Fold a classification result into this item. Returns true if anything
    /// changed.
    pub fn apply(&mut self, update: &ItemUpdate) -> bool {
        let mut changed = false;

        if self.hash.is_none() {
            if let Some(hash) = &update.hash {
                self.hash = Some(hash.clone());
                changed = true;
            }
        }

        match &mut self.kind {
            ItemKind::Binary(bin) => {
                if bin.signature.is_none() {
                    if let Some(sig) = &update.signature {
                        bin.signature = Some(sig.clone());
                        changed = true;
                    }
                }
                if update.vanished && bin.exists {
                    bin.exists = false;
                    changed = true;
                }
            }
            ItemKind::File(file) => {
                if update.vanished && file.exists {
                    file.exists = false;
                    changed = true;
                }
            }
            ItemKind::Connection(_) => {}
        }

        if let Some(rep) = &update.reputation {
            let replace = self
                .reputation
                .as_ref()
                .map_or(true, |current| current.verdict == Verdict::Unknown);
            if replace && self.reputation.as_ref() != Some(rep) {
                self.reputation = Some(rep.clone());
                changed = true;
            }
        }

        let merged = merge_trust(self.trust, update.trust);
        if merged != self.trust {
            self.trust = merged;
            changed = true;
        }

        changed
    }
}

/// Classification result for one item, produced by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemUpdate {
    pub item: ItemRef,
    /// Content hash, if computed
    pub hash: Option<String>,
    /// Signature result, if checked
    pub signature: Option<SignatureStatus>,
    /// Reputation verdict, if looked up
    pub reputation: Option<ReputationVerdict>,
    /// Trust to merge into the item
    pub trust: TrustLevel,
    /// The file disappeared before it could be inspected
    pub vanished: bool,
}

impl ItemUpdate {
    /// Update carrying nothing but a trust level.
    #[must_use]
    pub const fn trust(item: ItemRef, trust: TrustLevel) -> Self {
        Self {
            item,
            hash: None,
            signature: None,
            reputation: None,
            trust,
            vanished: false,
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.to_string_lossy().into_owned(),
        |n| n.to_string_lossy().into_owned(),
    )
}
