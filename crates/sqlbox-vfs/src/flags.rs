//! Flag and level types shared between the engine and VFS implementations.
//!
//! The numeric values match the engine's C constants bit for bit, since
//! they travel across the sandbox boundary unchanged.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Flags passed to `sqlite3_open_v2` and to [`Vfs::open`](crate::Vfs::open).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Open read-only.
    pub const READONLY: Self = Self(0x0000_0001);
    /// Open for reading and writing.
    pub const READWRITE: Self = Self(0x0000_0002);
    /// Create the file if it does not exist.
    pub const CREATE: Self = Self(0x0000_0004);
    /// Delete the file when it is closed.
    pub const DELETE_ON_CLOSE: Self = Self(0x0000_0008);
    /// Fail if the file already exists (used together with `CREATE`).
    pub const EXCLUSIVE: Self = Self(0x0000_0010);
    /// Interpret the filename as a URI.
    pub const URI: Self = Self(0x0000_0040);
    /// Open an in-memory database.
    pub const MEMORY: Self = Self(0x0000_0080);
    /// The file is a main database.
    pub const MAIN_DB: Self = Self(0x0000_0100);
    /// The file is a temporary database.
    pub const TEMP_DB: Self = Self(0x0000_0200);
    /// The file is a transient database.
    pub const TRANSIENT_DB: Self = Self(0x0000_0400);
    /// The file is a main rollback journal.
    pub const MAIN_JOURNAL: Self = Self(0x0000_0800);
    /// The file is a temporary journal.
    pub const TEMP_JOURNAL: Self = Self(0x0000_1000);
    /// The file is a statement sub-journal.
    pub const SUBJOURNAL: Self = Self(0x0000_2000);
    /// The file is a super-journal.
    pub const SUPER_JOURNAL: Self = Self(0x0000_4000);
    /// Open without per-connection mutexes.
    pub const NO_MUTEX: Self = Self(0x0000_8000);
    /// The file is a write-ahead log.
    pub const WAL: Self = Self(0x0008_0000);
    /// Refuse to follow symbolic links.
    pub const NO_FOLLOW: Self = Self(0x0100_0000);
    /// Report extended result codes.
    pub const EXTENDED_RESULT_CODE: Self = Self(0x0200_0000);

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build flags from the raw engine value.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw engine value.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Clear the bits of `other`.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Default flags for opening a database: read/write, create if missing.
    #[must_use]
    pub const fn default_open() -> Self {
        Self(Self::READWRITE.0 | Self::CREATE.0)
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpenFlags({:#x})", self.0)
    }
}

/// The question asked by `xAccess`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCheck {
    /// Does the path exist?
    Exists,
    /// Is the path readable and writable?
    ReadWrite,
    /// Is the path readable?
    Read,
}

impl AccessCheck {
    /// Decode the engine's `SQLITE_ACCESS_*` value.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Exists),
            1 => Some(Self::ReadWrite),
            2 => Some(Self::Read),
            _ => None,
        }
    }
}

/// File lock levels, in increasing order of exclusivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LockLevel {
    /// No lock held.
    #[default]
    None = 0,
    /// Reading is allowed; any number of handles may hold this.
    Shared = 1,
    /// The holder intends to write; only one handle at a time.
    Reserved = 2,
    /// The holder is waiting for readers to drain before writing.
    Pending = 3,
    /// The holder is writing; no other lock may be held.
    Exclusive = 4,
}

impl LockLevel {
    /// Decode the engine's `SQLITE_LOCK_*` value.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Shared),
            2 => Some(Self::Reserved),
            3 => Some(Self::Pending),
            4 => Some(Self::Exclusive),
            _ => None,
        }
    }
}

/// Flags passed to `xSync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncFlags(u32);

impl SyncFlags {
    /// Normal sync.
    pub const NORMAL: Self = Self(0x02);
    /// Full sync (macOS `F_FULLFSYNC` semantics).
    pub const FULL: Self = Self(0x03);
    /// Only the file data needs to reach storage, not its metadata.
    pub const DATA_ONLY: Self = Self(0x10);

    /// Build flags from the raw engine value.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Whether only the data (not metadata) needs to be synced.
    #[must_use]
    pub const fn data_only(self) -> bool {
        self.0 & Self::DATA_ONLY.0 != 0
    }
}

/// Device characteristics reported by `xDeviceCharacteristics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCharacteristics(u32);

impl DeviceCharacteristics {
    /// Writes of any size are atomic.
    pub const ATOMIC: Self = Self(0x0000_0001);
    /// Data is appended before the file size is updated.
    pub const SAFE_APPEND: Self = Self(0x0000_0200);
    /// Writes are not reordered.
    pub const SEQUENTIAL: Self = Self(0x0000_0400);
    /// Deleted files cannot be opened again.
    pub const UNDELETABLE_WHEN_OPEN: Self = Self(0x0000_0800);
    /// Reads past the end of a recently written region return zeroes.
    pub const POWERSAFE_OVERWRITE: Self = Self(0x0000_1000);

    /// No characteristics.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The raw engine value.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for DeviceCharacteristics {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags_combine_and_clear() {
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::DELETE_ON_CLOSE;
        assert!(flags.contains(OpenFlags::CREATE));
        assert!(!flags.without(OpenFlags::CREATE).contains(OpenFlags::CREATE));
        assert_eq!(OpenFlags::default_open().bits(), 0x6);
    }

    #[test]
    fn lock_levels_are_ordered() {
        assert!(LockLevel::Shared < LockLevel::Reserved);
        assert!(LockLevel::Pending < LockLevel::Exclusive);
        assert_eq!(LockLevel::from_raw(4), Some(LockLevel::Exclusive));
        assert_eq!(LockLevel::from_raw(9), None);
    }

    #[test]
    fn access_check_decodes_engine_values() {
        assert_eq!(AccessCheck::from_raw(0), Some(AccessCheck::Exists));
        assert_eq!(AccessCheck::from_raw(1), Some(AccessCheck::ReadWrite));
        assert_eq!(AccessCheck::from_raw(3), None);
    }
}
