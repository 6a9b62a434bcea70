//! Host side of the engine's VFS imports.
//!
//! The engine holds only `(vfs id, file id)` pairs; the objects they name
//! live in a [`VfsTable`] owned by the instance's store. Every entry point
//! here returns a result code and never fails on the host side: a bad id,
//! a bad pointer or a VFS error all become the engine's own failure code.

use std::collections::HashMap;
use std::time::Duration;

use sqlbox_vfs::{AccessCheck, LockLevel, OpenFlags, SyncFlags, Vfs, VfsError, VfsFile};

use crate::codes::{
    SQLITE_BUSY, SQLITE_CANTOPEN, SQLITE_FULL, SQLITE_IOERR, SQLITE_NOTFOUND, SQLITE_OK,
    SQLITE_READONLY, ioerr,
};
use crate::handle::{FileId, SandboxPtr, VfsId};
use crate::memory;

/// Maximum number of simultaneous VFS registrations per instance. Matches
/// the engine shim's own table.
pub const MAX_VFS: usize = 32;

const DEFAULT_SECTOR_SIZE: i32 = 4096;

struct Registration {
    name: String,
    vfs: Box<dyn Vfs>,
    files: HashMap<i32, Box<dyn VfsFile>>,
    next_file_id: i32,
    last_error: Option<(i32, String)>,
}

impl Registration {
    fn fail(&mut self, code: i32, message: String) -> i32 {
        tracing::debug!(vfs = %self.name, code, error = %message, "VFS operation failed");
        self.last_error = Some((code, message));
        code
    }

    /// Hand out a fresh file id. Ids start at 1 and are never reused.
    fn allocate_file_id(&mut self) -> i32 {
        let id = self.next_file_id;
        self.next_file_id = self.next_file_id.wrapping_add(1).max(1);
        id
    }
}

/// Pick the engine code for a VFS failure. Conditions the engine handles
/// specially keep their own code; anything else becomes `fallback`.
fn code_for(err: &VfsError, fallback: i32) -> i32 {
    match err {
        VfsError::Busy(_) => SQLITE_BUSY,
        VfsError::Full(_) => SQLITE_FULL,
        VfsError::ReadOnly(_) => SQLITE_READONLY,
        _ => fallback,
    }
}

/// The VFS registrations of one instance and the files they have open.
pub(crate) struct VfsTable {
    slots: Vec<Option<Registration>>,
}

impl std::fmt::Debug for VfsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.slots.iter().flatten().map(|r| &r.name))
            .finish()
    }
}

impl Default for VfsTable {
    fn default() -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(MAX_VFS).collect(),
        }
    }
}

impl VfsTable {
    fn slot(&mut self, id: VfsId) -> Option<&mut Registration> {
        usize::try_from(id.0)
            .ok()
            .and_then(|i| self.slots.get_mut(i))
            .and_then(Option::as_mut)
    }

    /// Whether another registration fits.
    pub(crate) fn has_capacity(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    pub(crate) fn is_registered(&self, id: VfsId) -> bool {
        usize::try_from(id.0)
            .ok()
            .and_then(|i| self.slots.get(i))
            .is_some_and(Option::is_some)
    }

    /// Number of files the engine still has open through `id`.
    pub(crate) fn open_files(&self, id: VfsId) -> usize {
        usize::try_from(id.0)
            .ok()
            .and_then(|i| self.slots.get(i))
            .and_then(Option::as_ref)
            .map_or(0, |r| r.files.len())
    }

    /// Install `vfs` under the id the engine assigned. Returns the VFS back
    /// if the slot is out of range or taken.
    pub(crate) fn insert(
        &mut self,
        id: VfsId,
        name: &str,
        vfs: Box<dyn Vfs>,
    ) -> Result<(), Box<dyn Vfs>> {
        let Some(slot) = usize::try_from(id.0).ok().and_then(|i| self.slots.get_mut(i)) else {
            return Err(vfs);
        };
        if slot.is_some() {
            return Err(vfs);
        }
        *slot = Some(Registration {
            name: name.to_string(),
            vfs,
            files: HashMap::new(),
            next_file_id: 1,
            last_error: None,
        });
        Ok(())
    }

    /// Remove a registration, returning its VFS.
    pub(crate) fn remove(&mut self, id: VfsId) -> Option<Box<dyn Vfs>> {
        let slot = usize::try_from(id.0).ok().and_then(|i| self.slots.get_mut(i))?;
        slot.take().map(|r| r.vfs)
    }

    /// Look up an open file, recording `fallback` as the failure if the
    /// registration or file does not exist.
    fn with_file(
        &mut self,
        vfs: VfsId,
        file: FileId,
        fallback: i32,
        op: impl FnOnce(&mut dyn VfsFile) -> Result<i32, VfsError>,
    ) -> i32 {
        let Some(reg) = self.slot(vfs) else {
            tracing::warn!(vfs = vfs.0, file = file.0, "I/O on unregistered VFS");
            return fallback;
        };
        let Some(handle) = reg.files.get_mut(&file.0) else {
            return reg.fail(fallback, format!("file {} is not open", file.0));
        };
        match op(handle.as_mut()) {
            Ok(code) => code,
            Err(e) => {
                let code = code_for(&e, fallback);
                reg.fail(code, e.to_string())
            }
        }
    }

    pub(crate) fn io_close(&mut self, vfs: VfsId, file: FileId) -> i32 {
        let Some(reg) = self.slot(vfs) else {
            return ioerr::CLOSE;
        };
        let Some(mut handle) = reg.files.remove(&file.0) else {
            return reg.fail(ioerr::CLOSE, format!("file {} is not open", file.0));
        };
        tracing::trace!(vfs = %reg.name, file = file.0, "Closing file");
        match handle.close() {
            Ok(()) => SQLITE_OK,
            Err(e) => reg.fail(ioerr::CLOSE, e.to_string()),
        }
    }

    /// Read into the engine's buffer. A read past end of file zero-fills
    /// the remainder and reports a short read.
    pub(crate) fn io_read(
        &mut self,
        mem: &mut [u8],
        vfs: VfsId,
        file: FileId,
        buf: SandboxPtr,
        amount: i32,
        offset: i32,
    ) -> i32 {
        let Ok(amount) = usize::try_from(amount) else {
            return ioerr::READ;
        };
        let offset = u64::from(offset as u32);
        self.with_file(vfs, file, ioerr::READ, |f| {
            let Ok(dst) = memory::bytes_mut(mem, buf, amount) else {
                return Ok(ioerr::READ);
            };
            let n = f.read(dst, offset)?;
            tracing::trace!(vfs = vfs.0, file = file.0, offset, amount, read = n, "read");
            if n < amount {
                dst[n..].fill(0);
                Ok(ioerr::SHORT_READ)
            } else {
                Ok(SQLITE_OK)
            }
        })
    }

    pub(crate) fn io_write(
        &mut self,
        mem: &[u8],
        vfs: VfsId,
        file: FileId,
        buf: SandboxPtr,
        amount: i32,
        offset: i32,
    ) -> i32 {
        let Ok(amount) = usize::try_from(amount) else {
            return ioerr::WRITE;
        };
        let offset = u64::from(offset as u32);
        self.with_file(vfs, file, ioerr::WRITE, |f| {
            let Ok(src) = memory::bytes(mem, buf, amount) else {
                return Ok(ioerr::WRITE);
            };
            tracing::trace!(vfs = vfs.0, file = file.0, offset, amount, "write");
            f.write(src, offset)?;
            Ok(SQLITE_OK)
        })
    }

    pub(crate) fn io_truncate(&mut self, vfs: VfsId, file: FileId, size: i32) -> i32 {
        let size = u64::from(size as u32);
        self.with_file(vfs, file, ioerr::TRUNCATE, |f| {
            f.truncate(size)?;
            Ok(SQLITE_OK)
        })
    }

    pub(crate) fn io_sync(&mut self, vfs: VfsId, file: FileId, flags: i32) -> i32 {
        let flags = SyncFlags::from_bits(flags as u32);
        self.with_file(vfs, file, ioerr::FSYNC, |f| {
            f.sync(flags)?;
            Ok(SQLITE_OK)
        })
    }

    /// The shim's size slot is a 32-bit `int`; larger files cannot be
    /// reported and fail with `IOERR_FSTAT`.
    pub(crate) fn io_file_size(
        &mut self,
        mem: &mut [u8],
        vfs: VfsId,
        file: FileId,
        out: SandboxPtr,
    ) -> i32 {
        self.with_file(vfs, file, ioerr::FSTAT, |f| {
            let size = f.file_size()?;
            let Ok(size) = i32::try_from(size) else {
                return Ok(ioerr::FSTAT);
            };
            Ok(match memory::write_i32(mem, out, size) {
                Ok(()) => SQLITE_OK,
                Err(_) => ioerr::FSTAT,
            })
        })
    }

    pub(crate) fn io_lock(&mut self, vfs: VfsId, file: FileId, level: i32) -> i32 {
        let Some(level) = LockLevel::from_raw(level) else {
            return ioerr::LOCK;
        };
        self.with_file(vfs, file, ioerr::LOCK, |f| {
            f.lock(level)?;
            Ok(SQLITE_OK)
        })
    }

    pub(crate) fn io_unlock(&mut self, vfs: VfsId, file: FileId, level: i32) -> i32 {
        let Some(level) = LockLevel::from_raw(level) else {
            return ioerr::UNLOCK;
        };
        self.with_file(vfs, file, ioerr::UNLOCK, |f| {
            f.unlock(level)?;
            Ok(SQLITE_OK)
        })
    }

    pub(crate) fn io_check_reserved_lock(
        &mut self,
        mem: &mut [u8],
        vfs: VfsId,
        file: FileId,
        out: SandboxPtr,
    ) -> i32 {
        self.with_file(vfs, file, ioerr::CHECKRESERVEDLOCK, |f| {
            let reserved = f.check_reserved_lock()?;
            Ok(match memory::write_i32(mem, out, i32::from(reserved)) {
                Ok(()) => SQLITE_OK,
                Err(_) => ioerr::CHECKRESERVEDLOCK,
            })
        })
    }

    /// Opcodes the file does not handle answer `SQLITE_NOTFOUND`, which the
    /// engine treats as "not supported".
    pub(crate) fn io_file_control(&mut self, vfs: VfsId, file: FileId, op: i32) -> i32 {
        self.with_file(vfs, file, SQLITE_IOERR, |f| {
            Ok(if f.file_control(op)? {
                SQLITE_OK
            } else {
                SQLITE_NOTFOUND
            })
        })
    }

    pub(crate) fn io_sector_size(&mut self, vfs: VfsId, file: FileId) -> i32 {
        self.slot(vfs)
            .and_then(|reg| reg.files.get(&file.0))
            .map_or(DEFAULT_SECTOR_SIZE, |f| {
                i32::try_from(f.sector_size()).unwrap_or(DEFAULT_SECTOR_SIZE)
            })
    }

    pub(crate) fn io_device_characteristics(&mut self, vfs: VfsId, file: FileId) -> i32 {
        self.slot(vfs)
            .and_then(|reg| reg.files.get(&file.0))
            .map_or(0, |f| f.device_characteristics().bits() as i32)
    }

    /// Open a file and write its id to `out_file`.
    ///
    /// The shim reports `SQLITE_MISUSE` whenever the id slot is left at zero,
    /// whatever the result code. A failed open therefore still consumes a
    /// fresh id (mapped to no file) so the real failure code reaches the
    /// engine.
    pub(crate) fn vfs_open(
        &mut self,
        mem: &mut [u8],
        vfs: VfsId,
        name: SandboxPtr,
        out_file: SandboxPtr,
        flags: i32,
        out_flags: SandboxPtr,
    ) -> i32 {
        let Some(reg) = self.slot(vfs) else {
            tracing::warn!(vfs = vfs.0, "open on unregistered VFS");
            return SQLITE_CANTOPEN;
        };
        let name = match memory::read_opt_c_str(mem, name) {
            Ok(name) => name,
            Err(e) => return reg.fail(SQLITE_CANTOPEN, e.to_string()),
        };
        let flags = OpenFlags::from_bits(flags as u32);
        let id = reg.allocate_file_id();

        let rc = match reg.vfs.open(name.as_deref(), flags) {
            Ok(opened) => {
                tracing::debug!(
                    vfs = %reg.name,
                    file = id,
                    name = name.as_deref().unwrap_or("<temp>"),
                    flags = ?opened.flags,
                    "Opened file"
                );
                let written = out_flags.is_null()
                    || memory::write_i32(mem, out_flags, opened.flags.bits() as i32).is_ok();
                if written {
                    reg.files.insert(id, opened.file);
                    SQLITE_OK
                } else {
                    reg.fail(SQLITE_CANTOPEN, "output flags pointer out of bounds".into())
                }
            }
            Err(e) => {
                let code = code_for(&e, SQLITE_CANTOPEN);
                reg.fail(code, e.to_string())
            }
        };
        match memory::write_i32(mem, out_file, id) {
            Ok(()) => rc,
            Err(e) => {
                reg.files.remove(&id);
                reg.fail(SQLITE_CANTOPEN, e.to_string())
            }
        }
    }

    pub(crate) fn vfs_delete(
        &mut self,
        mem: &[u8],
        vfs: VfsId,
        name: SandboxPtr,
        sync_dir: i32,
    ) -> i32 {
        let Some(reg) = self.slot(vfs) else {
            return ioerr::DELETE;
        };
        let name = match memory::read_c_str(mem, name) {
            Ok(name) => name,
            Err(e) => return reg.fail(ioerr::DELETE, e.to_string()),
        };
        tracing::trace!(vfs = %reg.name, name = %name, "Deleting file");
        match reg.vfs.delete(&name, sync_dir != 0) {
            Ok(()) => SQLITE_OK,
            Err(e @ VfsError::NotFound(_)) => reg.fail(ioerr::DELETE_NOENT, e.to_string()),
            Err(e) => {
                let code = code_for(&e, ioerr::DELETE);
                reg.fail(code, e.to_string())
            }
        }
    }

    pub(crate) fn vfs_access(
        &mut self,
        mem: &mut [u8],
        vfs: VfsId,
        name: SandboxPtr,
        flags: i32,
        out: SandboxPtr,
    ) -> i32 {
        let Some(reg) = self.slot(vfs) else {
            return ioerr::ACCESS;
        };
        let Some(check) = AccessCheck::from_raw(flags) else {
            return reg.fail(ioerr::ACCESS, format!("unknown access check {flags}"));
        };
        let name = match memory::read_c_str(mem, name) {
            Ok(name) => name,
            Err(e) => return reg.fail(ioerr::ACCESS, e.to_string()),
        };
        match reg.vfs.access(&name, check) {
            Ok(answer) => match memory::write_i32(mem, out, i32::from(answer)) {
                Ok(()) => SQLITE_OK,
                Err(e) => reg.fail(ioerr::ACCESS, e.to_string()),
            },
            Err(e) => reg.fail(ioerr::ACCESS, e.to_string()),
        }
    }

    /// Write the canonical name into a buffer of `capacity` bytes. Names
    /// that do not fit with their terminator fail with `SQLITE_CANTOPEN`.
    pub(crate) fn vfs_full_pathname(
        &mut self,
        mem: &mut [u8],
        vfs: VfsId,
        name: SandboxPtr,
        capacity: i32,
        out: SandboxPtr,
    ) -> i32 {
        let Some(reg) = self.slot(vfs) else {
            return SQLITE_CANTOPEN;
        };
        let full = memory::read_c_str(mem, name)
            .map_err(|e| e.to_string())
            .and_then(|name| reg.vfs.full_pathname(&name).map_err(|e| e.to_string()));
        let full = match full {
            Ok(full) => full,
            Err(message) => return reg.fail(SQLITE_CANTOPEN, message),
        };
        if usize::try_from(capacity).map_or(true, |cap| full.len() + 1 > cap) {
            return reg.fail(SQLITE_CANTOPEN, format!("path too long: {full}"));
        }
        match memory::write_c_str(mem, out, &full) {
            Ok(()) => SQLITE_OK,
            Err(e) => reg.fail(SQLITE_CANTOPEN, e.to_string()),
        }
    }

    /// Fill the engine's buffer with random bytes; returns the byte count.
    pub(crate) fn vfs_randomness(
        &mut self,
        mem: &mut [u8],
        vfs: VfsId,
        len: i32,
        out: SandboxPtr,
    ) -> i32 {
        let Ok(n) = usize::try_from(len) else {
            return 0;
        };
        let Ok(dst) = memory::bytes_mut(mem, out, n) else {
            return 0;
        };
        match self.slot(vfs) {
            Some(reg) => reg.vfs.randomness(dst),
            None => {
                sqlbox_vfs::services::fill_random(dst);
            }
        }
        len
    }

    /// Sleep and return the microseconds actually slept.
    pub(crate) fn vfs_sleep(&mut self, vfs: VfsId, micros: i32) -> i32 {
        let requested = Duration::from_micros(u64::from(micros.max(0) as u32));
        let slept = match self.slot(vfs) {
            Some(reg) => reg.vfs.sleep(requested),
            None => sqlbox_vfs::services::sleep(requested),
        };
        i32::try_from(slept.as_micros()).unwrap_or(i32::MAX)
    }

    pub(crate) fn vfs_current_time(&mut self, mem: &mut [u8], vfs: VfsId, out: SandboxPtr) -> i32 {
        let now = match self.slot(vfs) {
            Some(reg) => reg.vfs.current_time(),
            None => sqlbox_vfs::services::julian_day_now(),
        };
        match memory::write_f64(mem, out, now) {
            Ok(()) => SQLITE_OK,
            Err(_) => SQLITE_IOERR,
        }
    }

    /// Copy the most recent failure message (truncated to fit `capacity`
    /// with its terminator) and return its code, or `SQLITE_OK` if none.
    pub(crate) fn vfs_get_last_error(
        &mut self,
        mem: &mut [u8],
        vfs: VfsId,
        capacity: i32,
        out: SandboxPtr,
    ) -> i32 {
        let (code, message) = self
            .slot(vfs)
            .and_then(|reg| reg.last_error.clone())
            .unwrap_or((SQLITE_OK, String::new()));
        if let Ok(cap) = usize::try_from(capacity)
            && cap > 0
        {
            let mut end = message.len().min(cap - 1);
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            let _ = memory::write_c_str(mem, out, &message[..end]);
        }
        code
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sqlbox_vfs::MemoryVfs;

    const VFS: VfsId = VfsId(3);
    const NAME: SandboxPtr = SandboxPtr(16);
    const OUT_ID: SandboxPtr = SandboxPtr(64);
    const OUT_FLAGS: SandboxPtr = SandboxPtr(68);
    const BUF: SandboxPtr = SandboxPtr(128);

    fn setup(vfs: MemoryVfs) -> (Vec<u8>, VfsTable) {
        let mut table = VfsTable::default();
        assert!(table.insert(VFS, "mem", Box::new(vfs)).is_ok());
        (vec![0u8; 1024], table)
    }

    fn open(mem: &mut [u8], table: &mut VfsTable, name: &str, flags: OpenFlags) -> (i32, FileId) {
        memory::write_c_str(mem, NAME, name).unwrap();
        let rc = table.vfs_open(mem, VFS, NAME, OUT_ID, flags.bits() as i32, OUT_FLAGS);
        (rc, FileId(memory::read_i32(mem, OUT_ID).unwrap()))
    }

    #[test]
    fn test_open_write_read_close() {
        let vfs = MemoryVfs::new();
        let (mut mem, mut table) = setup(vfs.clone());
        let (rc, file) = open(&mut mem, &mut table, "main.db", OpenFlags::default_open());
        assert_eq!(rc, SQLITE_OK);
        assert_eq!(file, FileId(1));
        assert_eq!(
            memory::read_i32(&mem, OUT_FLAGS).unwrap(),
            OpenFlags::default_open().bits() as i32
        );

        memory::write_bytes(&mut mem, BUF, b"abcdef").unwrap();
        assert_eq!(table.io_write(&mem, VFS, file, BUF, 6, 10), SQLITE_OK);
        assert_eq!(vfs.read_file("main.db").unwrap().len(), 16);

        assert_eq!(table.io_read(&mut mem, VFS, file, BUF, 4, 12), SQLITE_OK);
        assert_eq!(&mem[128..132], b"cdef");

        assert_eq!(table.io_file_size(&mut mem, VFS, file, SandboxPtr(72)), SQLITE_OK);
        assert_eq!(memory::read_i32(&mem, SandboxPtr(72)).unwrap(), 16);

        assert_eq!(table.io_close(VFS, file), SQLITE_OK);
        assert_eq!(table.open_files(VFS), 0);
    }

    #[test]
    fn test_short_read_zero_fills() {
        let (mut mem, mut table) = setup(MemoryVfs::new());
        let (_, file) = open(&mut mem, &mut table, "a.db", OpenFlags::default_open());
        memory::write_bytes(&mut mem, BUF, b"xy").unwrap();
        table.io_write(&mem, VFS, file, BUF, 2, 0);

        mem[128..136].fill(0xaa);
        assert_eq!(table.io_read(&mut mem, VFS, file, BUF, 8, 0), ioerr::SHORT_READ);
        assert_eq!(&mem[128..136], b"xy\0\0\0\0\0\0");
    }

    #[test]
    fn test_closed_or_unknown_file_is_an_io_error() {
        let (mut mem, mut table) = setup(MemoryVfs::new());
        let (_, file) = open(&mut mem, &mut table, "a.db", OpenFlags::default_open());
        assert_eq!(table.io_close(VFS, file), SQLITE_OK);

        assert_eq!(table.io_read(&mut mem, VFS, file, BUF, 4, 0), ioerr::READ);
        assert_eq!(table.io_write(&mem, VFS, file, BUF, 4, 0), ioerr::WRITE);
        assert_eq!(table.io_close(VFS, file), ioerr::CLOSE);
        assert_eq!(table.io_lock(VfsId(9), FileId(1), 1), ioerr::LOCK);
        assert_eq!(table.io_sync(VfsId(-1), FileId(1), 2), ioerr::FSYNC);

        assert_eq!(
            table.vfs_get_last_error(&mut mem, VFS, 64, BUF),
            ioerr::CLOSE
        );
        assert_eq!(
            memory::read_c_str(&mem, BUF).unwrap(),
            format!("file {} is not open", file.0)
        );
    }

    #[test]
    fn test_failed_open_keeps_real_code_and_nonzero_id() {
        let (mut mem, mut table) = setup(MemoryVfs::new());
        let (rc, file) = open(&mut mem, &mut table, "missing.db", OpenFlags::READWRITE);
        assert_eq!(rc, SQLITE_CANTOPEN);
        assert_ne!(file.0, 0);
        assert_eq!(table.open_files(VFS), 0);

        // Ids are not reused after a failure or a close.
        let (rc, next) = open(&mut mem, &mut table, "new.db", OpenFlags::default_open());
        assert_eq!(rc, SQLITE_OK);
        assert!(next.0 > file.0);
    }

    #[test]
    fn test_lock_contention_reports_busy() {
        let (mut mem, mut table) = setup(MemoryVfs::new());
        let (_, a) = open(&mut mem, &mut table, "db", OpenFlags::default_open());
        let (_, b) = open(&mut mem, &mut table, "db", OpenFlags::default_open());

        assert_eq!(table.io_lock(VFS, a, LockLevel::Exclusive as i32), SQLITE_OK);
        assert_eq!(table.io_lock(VFS, b, LockLevel::Shared as i32), SQLITE_BUSY);
        assert_eq!(
            table.io_check_reserved_lock(&mut mem, VFS, b, SandboxPtr(80)),
            SQLITE_OK
        );
        assert_eq!(memory::read_i32(&mem, SandboxPtr(80)).unwrap(), 1);

        assert_eq!(table.io_unlock(VFS, a, LockLevel::None as i32), SQLITE_OK);
        assert_eq!(table.io_lock(VFS, b, LockLevel::Shared as i32), SQLITE_OK);
    }

    #[test]
    fn test_delete_and_access() {
        let vfs = MemoryVfs::new();
        vfs.insert_file("j.db-journal", vec![1]).unwrap();
        let (mut mem, mut table) = setup(vfs);
        memory::write_c_str(&mut mem, NAME, "j.db-journal").unwrap();

        assert_eq!(table.vfs_access(&mut mem, VFS, NAME, 0, SandboxPtr(80)), SQLITE_OK);
        assert_eq!(memory::read_i32(&mem, SandboxPtr(80)).unwrap(), 1);

        assert_eq!(table.vfs_delete(&mem, VFS, NAME, 0), SQLITE_OK);
        assert_eq!(table.vfs_delete(&mem, VFS, NAME, 0), ioerr::DELETE_NOENT);

        assert_eq!(table.vfs_access(&mut mem, VFS, NAME, 0, SandboxPtr(80)), SQLITE_OK);
        assert_eq!(memory::read_i32(&mem, SandboxPtr(80)).unwrap(), 0);
        assert_eq!(
            table.vfs_access(&mut mem, VFS, NAME, 7, SandboxPtr(80)),
            ioerr::ACCESS
        );
    }

    #[test]
    fn test_full_pathname_respects_capacity() {
        let (mut mem, mut table) = setup(MemoryVfs::new());
        memory::write_c_str(&mut mem, NAME, "dir/../test.db").unwrap();
        assert_eq!(
            table.vfs_full_pathname(&mut mem, VFS, NAME, 64, BUF),
            SQLITE_OK
        );
        assert_eq!(memory::read_c_str(&mem, BUF).unwrap(), "/test.db");

        // "/test.db" needs 9 bytes with its terminator.
        assert_eq!(
            table.vfs_full_pathname(&mut mem, VFS, NAME, 8, BUF),
            SQLITE_CANTOPEN
        );
        assert_eq!(
            table.vfs_full_pathname(&mut mem, VFS, NAME, 9, BUF),
            SQLITE_OK
        );
    }

    #[test]
    fn test_os_services() {
        let (mut mem, mut table) = setup(MemoryVfs::new());
        assert_eq!(table.vfs_randomness(&mut mem, VFS, 32, BUF), 32);
        assert!(mem[128..160].iter().any(|&b| b != 0));

        assert_eq!(table.vfs_current_time(&mut mem, VFS, SandboxPtr(200)), SQLITE_OK);
        let now = memory::read_f64(&mem, SandboxPtr(200)).unwrap();
        assert!(now > sqlbox_vfs::services::UNIX_EPOCH_JULIAN_DAY + 19_000.0);

        assert_eq!(table.vfs_sleep(VFS, 1_000), 1_000);
    }

    #[test]
    fn test_file_control_and_device_queries() {
        let (mut mem, mut table) = setup(MemoryVfs::new());
        let (_, file) = open(&mut mem, &mut table, "db", OpenFlags::default_open());
        assert_eq!(table.io_file_control(VFS, file, 18), SQLITE_NOTFOUND);
        assert_eq!(table.io_file_control(VFS, FileId(99), 18), SQLITE_IOERR);
        assert_eq!(table.io_file_control(VfsId(7), file, 18), SQLITE_IOERR);
        assert_eq!(table.io_close(VFS, file), SQLITE_OK);
        assert_eq!(table.io_file_control(VFS, file, 18), SQLITE_IOERR);
        assert_eq!(table.io_sector_size(VFS, file), 4096);
        assert_ne!(table.io_device_characteristics(VFS, file), 0);
        assert_eq!(table.io_device_characteristics(VFS, FileId(99)), 0);
    }

    #[test]
    fn test_registration_slots() {
        let mut table = VfsTable::default();
        for i in 0..MAX_VFS as i32 {
            assert!(table.insert(VfsId(i), "m", Box::new(MemoryVfs::new())).is_ok());
        }
        assert!(!table.has_capacity());
        assert!(table.insert(VfsId(0), "dup", Box::new(MemoryVfs::new())).is_err());
        assert!(table.insert(VfsId(40), "big", Box::new(MemoryVfs::new())).is_err());
        assert!(table.remove(VfsId(5)).is_some());
        assert!(table.has_capacity());
        assert!(!table.is_registered(VfsId(5)));
        assert!(table.remove(VfsId(5)).is_none());
    }
}
