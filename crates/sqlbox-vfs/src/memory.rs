//! In-memory VFS.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{VfsError, VfsResult};
use crate::flags::{AccessCheck, DeviceCharacteristics, LockLevel, OpenFlags, SyncFlags};
use crate::lock::{FileLock, LockTable};
use crate::vfs::{OpenedFile, Vfs, VfsFile};

type FileData = Arc<Mutex<Vec<u8>>>;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Normalize a path (ensure a leading slash, handle `.` and `..`).
pub(crate) fn normalize_path(path: &str) -> VfsResult<String> {
    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if components.is_empty() {
                    return Err(VfsError::InvalidPath("path escapes root".to_string()));
                }
                components.pop();
            }
            c => components.push(c),
        }
    }

    if components.is_empty() {
        Err(VfsError::InvalidPath(format!("empty file name: {path:?}")))
    } else {
        Ok(format!("/{}", components.join("/")))
    }
}

/// A VFS that keeps every file in host memory.
///
/// Clones share the same files and locks, so the host can keep one handle
/// to inspect or preload databases while the engine uses another.
#[derive(Debug, Clone, Default)]
pub struct MemoryVfs {
    files: Arc<Mutex<HashMap<String, FileData>>>,
    locks: LockTable,
    temp_counter: Arc<AtomicU64>,
}

impl MemoryVfs {
    /// Create an empty in-memory VFS.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all stored files, sorted.
    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = guard(&self.files).keys().cloned().collect();
        names.sort();
        names
    }

    /// Copy of a stored file's contents.
    #[must_use]
    pub fn read_file(&self, name: &str) -> Option<Vec<u8>> {
        let path = normalize_path(name).ok()?;
        let data = guard(&self.files).get(&path)?.clone();
        let bytes = guard(&data).clone();
        Some(bytes)
    }

    /// Store `contents` under `name`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a valid path.
    pub fn insert_file(&self, name: &str, contents: Vec<u8>) -> VfsResult<()> {
        let path = normalize_path(name)?;
        guard(&self.files).insert(path, Arc::new(Mutex::new(contents)));
        Ok(())
    }
}

impl Vfs for MemoryVfs {
    fn open(&mut self, name: Option<&str>, flags: OpenFlags) -> VfsResult<OpenedFile> {
        let Some(name) = name else {
            let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
            let path = format!("/.temp-{n}");
            tracing::trace!(path = %path, "Opening anonymous temp file");
            let file = MemoryFile {
                lock: self.locks.handle(&path),
                path,
                data: Arc::new(Mutex::new(Vec::new())),
                readonly: false,
                owner: None,
            };
            return Ok(OpenedFile {
                file: Box::new(file),
                flags,
            });
        };

        let path = normalize_path(name)?;
        let data = {
            let mut files = guard(&self.files);
            match files.get(&path).cloned() {
                Some(_) if flags.contains(OpenFlags::EXCLUSIVE | OpenFlags::CREATE) => {
                    return Err(VfsError::AlreadyExists(path));
                }
                Some(data) => data,
                None if flags.contains(OpenFlags::CREATE) => {
                    let data: FileData = Arc::new(Mutex::new(Vec::new()));
                    files.insert(path.clone(), data.clone());
                    data
                }
                None => return Err(VfsError::NotFound(path)),
            }
        };

        tracing::trace!(path = %path, flags = ?flags, "Opening memory file");
        let owner = flags
            .contains(OpenFlags::DELETE_ON_CLOSE)
            .then(|| self.files.clone());
        let file = MemoryFile {
            lock: self.locks.handle(&path),
            path,
            data,
            readonly: flags.contains(OpenFlags::READONLY),
            owner,
        };
        Ok(OpenedFile {
            file: Box::new(file),
            flags,
        })
    }

    fn delete(&mut self, name: &str, _sync_dir: bool) -> VfsResult<()> {
        let path = normalize_path(name)?;
        match guard(&self.files).remove(&path) {
            Some(_) => Ok(()),
            None => Err(VfsError::NotFound(path)),
        }
    }

    fn access(&mut self, name: &str, _check: AccessCheck) -> VfsResult<bool> {
        let path = normalize_path(name)?;
        Ok(guard(&self.files).contains_key(&path))
    }

    fn full_pathname(&mut self, name: &str) -> VfsResult<String> {
        normalize_path(name)
    }
}

/// An open handle to an in-memory file.
#[derive(Debug)]
struct MemoryFile {
    path: String,
    data: FileData,
    lock: FileLock,
    readonly: bool,
    /// Set when the file must be removed from this map on close.
    owner: Option<Arc<Mutex<HashMap<String, FileData>>>>,
}

impl VfsFile for MemoryFile {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let data = guard(&self.data);
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= data.len() {
            return Ok(0);
        }
        let end = (offset + buf.len()).min(data.len());
        let n = end - offset;
        buf[..n].copy_from_slice(&data[offset..end]);
        Ok(n)
    }

    fn write(&mut self, bytes: &[u8], offset: u64) -> VfsResult<()> {
        if self.readonly {
            return Err(VfsError::ReadOnly(self.path.clone()));
        }
        let offset = usize::try_from(offset).map_err(|_| VfsError::Full(self.path.clone()))?;
        let end = offset + bytes.len();
        let mut data = guard(&self.data);
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> VfsResult<()> {
        if self.readonly {
            return Err(VfsError::ReadOnly(self.path.clone()));
        }
        let size = usize::try_from(size).map_err(|_| VfsError::Full(self.path.clone()))?;
        guard(&self.data).resize(size, 0);
        Ok(())
    }

    fn sync(&mut self, _flags: SyncFlags) -> VfsResult<()> {
        Ok(())
    }

    fn file_size(&mut self) -> VfsResult<u64> {
        Ok(guard(&self.data).len() as u64)
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

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::SAFE_APPEND
            | DeviceCharacteristics::SEQUENTIAL
            | DeviceCharacteristics::POWERSAFE_OVERWRITE
    }

    fn close(&mut self) -> VfsResult<()> {
        if let Some(owner) = self.owner.take() {
            let mut files = guard(&owner);
            // Only remove the entry if it still refers to this file.
            if files
                .get(&self.path)
                .is_some_and(|data| Arc::ptr_eq(data, &self.data))
            {
                files.remove(&self.path);
            }
        }
        Ok(())
    }
}
