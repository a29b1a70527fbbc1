//! Core types for the scanning engine.

pub mod connection;
pub mod item;
pub mod reputation;
pub mod signature;
pub mod task;
pub mod trust;

pub use connection::{Connection, ConnectionState, SocketFamily, Transport};
pub use item::{Binary, FileItem, Item, ItemCategory, ItemKind, ItemRef, ItemSlot, ItemUpdate};
pub use reputation::{Detections, ReputationVerdict, Verdict};
pub use signature::SignatureStatus;
pub use task::{PartialFlags, Task, TaskHandle};
pub use trust::{merge_trust, TrustLevel};
