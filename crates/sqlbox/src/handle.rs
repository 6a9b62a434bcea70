//! Distinct integer handles for values that cross the sandbox boundary.
//!
//! Every one of these is a plain `i32` on the wire. Wrapping each role in
//! its own type keeps a file id from being passed where an address is
//! expected.

/// An address in the sandbox's linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SandboxPtr(pub u32);

impl SandboxPtr {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Reinterpret a wasm `i32` argument as an address.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw as u32)
    }

    /// The value to pass as a wasm `i32` argument.
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0 as i32
    }

    /// Whether this is the null address.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Byte offset into linear memory.
    #[must_use]
    pub const fn offset(self) -> usize {
        self.0 as usize
    }

    /// The address `bytes` past this one.
    #[must_use]
    pub const fn add(self, bytes: u32) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl std::fmt::Display for SandboxPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifier of a VFS registration inside one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VfsId(pub i32);

/// Identifier of an open file within one VFS registration. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub i32);

/// Address of a `sqlite3` connection object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct DbPtr(pub(crate) SandboxPtr);

/// Address of a `sqlite3_stmt` object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StmtPtr(pub(crate) SandboxPtr);

impl StmtPtr {
    /// Marks a finalized statement.
    pub(crate) const FINALIZED: Self = Self(SandboxPtr::NULL);

    pub(crate) const fn is_finalized(self) -> bool {
        self.0.is_null()
    }
}
