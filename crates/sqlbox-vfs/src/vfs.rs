//! The storage contract the engine's file operations are dispatched to.

use std::time::Duration;

use crate::error::VfsResult;
use crate::flags::{AccessCheck, DeviceCharacteristics, LockLevel, OpenFlags, SyncFlags};
use crate::services;

/// A file successfully opened by [`Vfs::open`].
pub struct OpenedFile {
    /// The open file.
    pub file: Box<dyn VfsFile>,
    /// The flags the file was actually opened with (reported back to the
    /// engine through `pOutFlags`).
    pub flags: OpenFlags,
}

impl std::fmt::Debug for OpenedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedFile")
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// A virtual filesystem the sandboxed engine performs storage I/O through.
///
/// All calls are synchronous and happen while the engine is suspended inside
/// a host import, so implementations must not call back into the instance
/// that is using them.
///
/// Randomness, sleep and time have default implementations backed by the
/// host; override them to make a VFS deterministic.
pub trait Vfs: Send {
    /// Open (and possibly create) a file.
    ///
    /// `name` is `None` when the engine wants an anonymous temporary file.
    fn open(&mut self, name: Option<&str>, flags: OpenFlags) -> VfsResult<OpenedFile>;

    /// Delete a file. `sync_dir` asks for the directory entry removal to be
    /// made durable before returning.
    fn delete(&mut self, name: &str, sync_dir: bool) -> VfsResult<()>;

    /// Answer an access question about `name`.
    fn access(&mut self, name: &str, check: AccessCheck) -> VfsResult<bool>;

    /// Canonical form of `name`. The engine derives journal names from it.
    fn full_pathname(&mut self, name: &str) -> VfsResult<String> {
        Ok(name.to_string())
    }

    /// Fill `buf` with random bytes.
    fn randomness(&mut self, buf: &mut [u8]) {
        services::fill_random(buf);
    }

    /// Sleep for `duration`, returning the time actually slept.
    fn sleep(&mut self, duration: Duration) -> Duration {
        services::sleep(duration)
    }

    /// Current time as a Julian day number.
    fn current_time(&mut self) -> f64 {
        services::julian_day_now()
    }
}

/// An open file belonging to a [`Vfs`].
pub trait VfsFile: Send {
    /// Read into `buf` starting at `offset`, returning the number of bytes
    /// read. Fewer than `buf.len()` bytes means the read hit end of file.
    fn read(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize>;

    /// Write all of `data` at `offset`, extending the file if needed.
    fn write(&mut self, data: &[u8], offset: u64) -> VfsResult<()>;

    /// Truncate (or extend) the file to `size` bytes.
    fn truncate(&mut self, size: u64) -> VfsResult<()>;

    /// Flush the file to durable storage.
    fn sync(&mut self, flags: SyncFlags) -> VfsResult<()>;

    /// Current file size in bytes.
    fn file_size(&mut self) -> VfsResult<u64>;

    /// Raise the lock on this file to `level`.
    fn lock(&mut self, level: LockLevel) -> VfsResult<()>;

    /// Lower the lock on this file to `level`.
    fn unlock(&mut self, level: LockLevel) -> VfsResult<()>;

    /// Whether any handle holds a `RESERVED` or stronger lock on the file.
    fn check_reserved_lock(&mut self) -> VfsResult<bool>;

    /// Handle a file-control opcode. Return `Ok(false)` for opcodes the
    /// file does not understand.
    fn file_control(&mut self, _op: i32) -> VfsResult<bool> {
        Ok(false)
    }

    /// Sector size of the underlying storage.
    fn sector_size(&self) -> u32 {
        4096
    }

    /// Characteristics of the underlying storage.
    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::empty()
    }

    /// Close the file. The handle is dropped afterwards whatever the result.
    fn close(&mut self) -> VfsResult<()> {
        Ok(())
    }
}
