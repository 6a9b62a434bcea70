//! VFS backed by a host directory.
//!
//! Files are opened through a `cap_std::fs::Dir` capability, so every path
//! the engine asks for resolves beneath the directory and cannot escape it
//! via `..` or absolute paths.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::error::{VfsError, VfsResult};
use crate::flags::{AccessCheck, LockLevel, OpenFlags, SyncFlags};
use crate::lock::{FileLock, LockTable};
use crate::memory::{MemoryVfs, normalize_path};
use crate::vfs::{OpenedFile, Vfs, VfsFile};

/// A VFS that stores files beneath one host directory.
///
/// Anonymous temporary files (opened with no name) are kept in memory.
/// Locks are tracked per process; separate processes sharing the directory
/// are not coordinated.
#[derive(Clone)]
pub struct DirectoryVfs {
    root: Arc<cap_std::fs::Dir>,
    locks: LockTable,
    temp: MemoryVfs,
}

impl std::fmt::Debug for DirectoryVfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryVfs").finish_non_exhaustive()
    }
}

impl DirectoryVfs {
    /// Create a VFS rooted at an already-opened directory capability.
    pub fn new(dir: cap_std::fs::Dir) -> Self {
        Self {
            root: Arc::new(dir),
            locks: LockTable::new(),
            temp: MemoryVfs::new(),
        }
    }

    /// Open a host directory by path and root the VFS there.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be opened.
    pub fn open_ambient(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let dir = cap_std::fs::Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        Ok(Self::new(dir))
    }

    /// Normalized path (`/a/b.db`) and its root-relative form (`a/b.db`).
    fn resolve(name: &str) -> VfsResult<(String, String)> {
        let path = normalize_path(name)?;
        let relative = path.trim_start_matches('/').to_string();
        Ok((path, relative))
    }

    fn open_options(flags: OpenFlags) -> cap_std::fs::OpenOptions {
        let readonly = flags.contains(OpenFlags::READONLY);
        let create = flags.contains(OpenFlags::CREATE) && !readonly;
        let mut opts = cap_std::fs::OpenOptions::new();
        opts.read(true).write(!readonly);
        if create && flags.contains(OpenFlags::EXCLUSIVE) {
            opts.create_new(true);
        } else {
            opts.create(create);
        }
        opts
    }
}

impl Vfs for DirectoryVfs {
    fn open(&mut self, name: Option<&str>, flags: OpenFlags) -> VfsResult<OpenedFile> {
        let Some(name) = name else {
            return self.temp.open(None, flags);
        };
        let (path, relative) = Self::resolve(name)?;

        let (file, out_flags) = match self.root.open_with(&relative, &Self::open_options(flags)) {
            Ok(file) => (file, flags),
            // Fall back to read-only when the file exists but cannot be
            // written, and report that through the output flags.
            Err(e)
                if e.kind() == std::io::ErrorKind::PermissionDenied
                    && flags.contains(OpenFlags::READWRITE) =>
            {
                let downgraded = flags.without(OpenFlags::READWRITE | OpenFlags::CREATE)
                    | OpenFlags::READONLY;
                let file = self
                    .root
                    .open_with(&relative, &Self::open_options(downgraded))
                    .map_err(|e| VfsError::from_io(&path, e))?;
                tracing::debug!(path = %path, "Opened read-only after permission denied");
                (file, downgraded)
            }
            Err(e) => return Err(VfsError::from_io(&path, e)),
        };

        tracing::trace!(path = %path, flags = ?out_flags, "Opening directory file");
        let delete_on_close = flags
            .contains(OpenFlags::DELETE_ON_CLOSE)
            .then(|| (self.root.clone(), relative));
        let file = DirectoryFile {
            lock: self.locks.handle(&path),
            path,
            file,
            readonly: out_flags.contains(OpenFlags::READONLY),
            delete_on_close,
        };
        Ok(OpenedFile {
            file: Box::new(file),
            flags: out_flags,
        })
    }

    fn delete(&mut self, name: &str, _sync_dir: bool) -> VfsResult<()> {
        let (path, relative) = Self::resolve(name)?;
        self.root
            .remove_file(&relative)
            .map_err(|e| VfsError::from_io(&path, e))
    }

    fn access(&mut self, name: &str, check: AccessCheck) -> VfsResult<bool> {
        let (path, relative) = Self::resolve(name)?;
        match self.root.metadata(&relative) {
            Ok(meta) => Ok(match check {
                AccessCheck::Exists | AccessCheck::Read => true,
                AccessCheck::ReadWrite => !meta.permissions().readonly(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VfsError::from_io(&path, e)),
        }
    }

    fn full_pathname(&mut self, name: &str) -> VfsResult<String> {
        normalize_path(name)
    }
}

/// An open handle to a file beneath a [`DirectoryVfs`] root.
#[derive(Debug)]
struct DirectoryFile {
    path: String,
    file: cap_std::fs::File,
    lock: FileLock,
    readonly: bool,
    delete_on_close: Option<(Arc<cap_std::fs::Dir>, String)>,
}

impl VfsFile for DirectoryFile {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(VfsError::Io(e)),
            }
        }
        Ok(filled)
    }

    fn write(&mut self, data: &[u8], offset: u64) -> VfsResult<()> {
        if self.readonly {
            return Err(VfsError::ReadOnly(self.path.clone()));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data).map_err(|e| match e.kind() {
            std::io::ErrorKind::StorageFull => VfsError::Full(self.path.clone()),
            _ => VfsError::Io(e),
        })
    }

    fn truncate(&mut self, size: u64) -> VfsResult<()> {
        if self.readonly {
            return Err(VfsError::ReadOnly(self.path.clone()));
        }
        self.file.set_len(size)?;
        Ok(())
    }

    fn sync(&mut self, flags: SyncFlags) -> VfsResult<()> {
        if flags.data_only() {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn file_size(&mut self) -> VfsResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn lock(&mut self, level: LockLevel) -> VfsResult<()> {
        self.lock.lock(level)
    }

    fn unlock(&mut self, level: LockLevel) -> VfsResult<()> {
        self.lock.unlock(level)
    }

    fn check_reserved_lock(&mut self) -> VfsResult<bool> {
        Ok(self.lock.check_reserved())
    }

    fn close(&mut self) -> VfsResult<()> {
        if let Some((root, relative)) = self.delete_on_close.take() {
            match root.remove_file(&relative) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(VfsError::from_io(&self.path, e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn vfs() -> (tempfile::TempDir, DirectoryVfs) {
        let dir = tempfile::tempdir().unwrap();
        let vfs = DirectoryVfs::open_ambient(dir.path()).unwrap();
        (dir, vfs)
    }

    #[test]
    fn test_round_trip_through_host_file() {
        let (dir, mut vfs) = vfs();
        let mut file = vfs
            .open(Some("data.db"), OpenFlags::default_open())
            .unwrap()
            .file;
        file.write(b"page-one", 0).unwrap();
        file.sync(SyncFlags::NORMAL).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf, 5).unwrap(), 3);
        assert_eq!(&buf[..3], b"one");
        assert_eq!(file.file_size().unwrap(), 8);

        let on_disk = std::fs::read(dir.path().join("data.db")).unwrap();
        assert_eq!(on_disk, b"page-one");

        assert_eq!(vfs.locks.tracked_paths(), 1);
        drop(file);
        assert_eq!(vfs.locks.tracked_paths(), 0);
    }

    #[test]
    fn test_missing_file_without_create() {
        let (_dir, mut vfs) = vfs();
        let err = vfs.open(Some("nope.db"), OpenFlags::READWRITE).unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)));
        assert!(!vfs.access("nope.db", AccessCheck::Exists).unwrap());
    }

    #[test]
    fn test_cannot_escape_root() {
        let (_dir, mut vfs) = vfs();
        assert!(matches!(
            vfs.open(Some("../outside.db"), OpenFlags::default_open()),
            Err(VfsError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_delete_and_delete_on_close() {
        let (dir, mut vfs) = vfs();
        let mut journal = vfs
            .open(
                Some("data.db-journal"),
                OpenFlags::default_open() | OpenFlags::DELETE_ON_CLOSE,
            )
            .unwrap()
            .file;
        journal.write(b"j", 0).unwrap();
        assert!(dir.path().join("data.db-journal").exists());
        journal.close().unwrap();
        assert!(!dir.path().join("data.db-journal").exists());

        vfs.open(Some("gone.db"), OpenFlags::default_open()).unwrap();
        vfs.delete("gone.db", false).unwrap();
        assert!(matches!(
            vfs.delete("gone.db", false),
            Err(VfsError::NotFound(_))
        ));
    }

    #[test]
    fn test_temp_files_stay_in_memory() {
        let (dir, mut vfs) = vfs();
        let mut temp = vfs.open(None, OpenFlags::default_open()).unwrap().file;
        temp.write(b"scratch", 0).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
