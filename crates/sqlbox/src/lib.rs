//! # sqlbox
//!
//! Run a SQLite engine compiled to WebAssembly inside a wasmtime sandbox.
//!
//! The engine gets no direct access to the host: all of its storage goes
//! through host-side virtual filesystems (see [`sqlbox_vfs`]), its memory is
//! capped by [`ResourceLimits`], and every value crossing the boundary is
//! copied in or out of its linear memory by this crate.
//!
//! - [`SqliteModule`] compiles the engine once.
//! - [`Instance`] is one running copy with its own memory and VFS table.
//! - [`Connection`] and [`Statement`] wrap the usual database and statement
//!   handles, with errors translated into [`SqliteError`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sqlbox::{Connection, Instance, SqliteModule, Value};
//!
//! fn main() -> Result<(), sqlbox::Error> {
//!     let module = SqliteModule::from_file("sqlite3.wasm")?;
//!     let instance = Instance::new(&module)?;
//!     let db = Connection::open(&instance, "app.db")?;
//!
//!     db.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)")?;
//!     if let Some(mut stmt) = db.prepare("INSERT INTO notes (body) VALUES (?)")? {
//!         stmt.bind(&[Value::from("hello")])?;
//!         stmt.step()?;
//!         stmt.finalize()?;
//!     }
//!
//!     for row in db.execute("SELECT id, body FROM notes")? {
//!         println!("{row:?}");
//!     }
//!     db.close()
//! }
//! ```
//!
//! The engine build must export the standard SQLite API plus the
//! `sqlite3_ext_*` shim entry points, and import the VFS callbacks from the
//! `imports` module.

#![forbid(unsafe_code)]

mod bridge;
mod codes;
mod connection;
mod error;
mod exec;
mod handle;
mod host;
mod instance;
mod memory;
mod module;
mod statement;
#[cfg(test)]
mod testing;
mod value;

pub use bridge::MAX_VFS;
pub use codes::{ColumnType, ResultCode, default_message, deserialize, ioerr, serialize};
pub use connection::Connection;
pub use error::{Error, Result, SqliteError};
pub use handle::{FileId, SandboxPtr, VfsId};
pub use instance::{DEFAULT_VFS_NAME, Instance, InstanceBuilder, ResourceLimits};
pub use module::SqliteModule;
pub use statement::Statement;
pub use value::{ExecRow, RowEntry, Value};

// Re-export the storage layer so callers need only one dependency.
pub use sqlbox_vfs;
pub use sqlbox_vfs::{DirectoryVfs, MemoryVfs, OpenFlags, Vfs, VfsError, VfsFile};
