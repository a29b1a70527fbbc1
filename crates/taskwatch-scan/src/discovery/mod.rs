//! Process discovery: the OS boundary and the enumerator built on it.

pub mod enumerator;
pub mod linux;
pub mod source;

pub use enumerator::{Discovery, TaskEnumerator, Tasks};
pub use linux::{ProcfsSource, SocketTable};
pub use source::{ProcessEntry, ProcessSource};
