//! Host-side virtual filesystems for the sqlbox sandbox.
//!
//! The SQLite engine running inside the WebAssembly sandbox has no access to
//! real storage. Every file operation it performs is forwarded to the host,
//! which dispatches it to an implementation of the [`Vfs`] and [`VfsFile`]
//! traits defined here.
//!
//! Two implementations are provided:
//!
//! - [`MemoryVfs`]: named files kept entirely in host memory. Clones share
//!   the same storage, so several connections (or the host itself) can see
//!   the same database.
//! - [`DirectoryVfs`]: files stored beneath a single host directory, opened
//!   through a `cap-std` directory capability so paths cannot escape it.
//!
//! Both implement the five-level SQLite locking protocol through a shared
//! [`LockTable`]. Locks are process-local: two processes opening the same
//! directory are not coordinated.

mod directory;
mod error;
mod flags;
mod lock;
mod memory;
pub mod services;
mod vfs;

pub use directory::DirectoryVfs;
pub use error::{VfsError, VfsResult};
pub use flags::{AccessCheck, DeviceCharacteristics, LockLevel, OpenFlags, SyncFlags};
pub use lock::{FileLock, LockTable};
pub use memory::MemoryVfs;
pub use vfs::{OpenedFile, Vfs, VfsFile};
