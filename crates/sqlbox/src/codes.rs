//! Numeric constants shared with the engine: result codes, extended I/O
//! codes, column types and flag bits.

/// Primary result codes.
///
/// Values outside the known set decode as [`ResultCode::Error`]; the raw
/// value is kept in [`crate::SqliteError::extended_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
#[allow(missing_docs)]
pub enum ResultCode {
    Ok = 0,
    Error = 1,
    Internal = 2,
    Perm = 3,
    Abort = 4,
    Busy = 5,
    Locked = 6,
    NoMem = 7,
    ReadOnly = 8,
    Interrupt = 9,
    IoErr = 10,
    Corrupt = 11,
    NotFound = 12,
    Full = 13,
    CantOpen = 14,
    Protocol = 15,
    Empty = 16,
    Schema = 17,
    TooBig = 18,
    Constraint = 19,
    Mismatch = 20,
    Misuse = 21,
    NoLfs = 22,
    Auth = 23,
    Format = 24,
    Range = 25,
    NotADb = 26,
    Notice = 27,
    Warning = 28,
    Row = 100,
    Done = 101,
}

impl ResultCode {
    /// Decode the primary code from a (possibly extended) raw code.
    #[must_use]
    pub const fn from_raw(code: i32) -> Self {
        match code & 0xff {
            0 => Self::Ok,
            2 => Self::Internal,
            3 => Self::Perm,
            4 => Self::Abort,
            5 => Self::Busy,
            6 => Self::Locked,
            7 => Self::NoMem,
            8 => Self::ReadOnly,
            9 => Self::Interrupt,
            10 => Self::IoErr,
            11 => Self::Corrupt,
            12 => Self::NotFound,
            13 => Self::Full,
            14 => Self::CantOpen,
            15 => Self::Protocol,
            16 => Self::Empty,
            17 => Self::Schema,
            18 => Self::TooBig,
            19 => Self::Constraint,
            20 => Self::Mismatch,
            21 => Self::Misuse,
            22 => Self::NoLfs,
            23 => Self::Auth,
            24 => Self::Format,
            25 => Self::Range,
            26 => Self::NotADb,
            27 => Self::Notice,
            28 => Self::Warning,
            100 => Self::Row,
            101 => Self::Done,
            _ => Self::Error,
        }
    }

    /// The raw numeric value.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    /// `OK`, `ROW` and `DONE` are not failures.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Row | Self::Done)
    }

    /// The engine's built-in description of this code.
    #[must_use]
    pub fn default_message(self) -> &'static str {
        default_message(self.as_raw())
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "SQLITE_OK",
            Self::Error => "SQLITE_ERROR",
            Self::Internal => "SQLITE_INTERNAL",
            Self::Perm => "SQLITE_PERM",
            Self::Abort => "SQLITE_ABORT",
            Self::Busy => "SQLITE_BUSY",
            Self::Locked => "SQLITE_LOCKED",
            Self::NoMem => "SQLITE_NOMEM",
            Self::ReadOnly => "SQLITE_READONLY",
            Self::Interrupt => "SQLITE_INTERRUPT",
            Self::IoErr => "SQLITE_IOERR",
            Self::Corrupt => "SQLITE_CORRUPT",
            Self::NotFound => "SQLITE_NOTFOUND",
            Self::Full => "SQLITE_FULL",
            Self::CantOpen => "SQLITE_CANTOPEN",
            Self::Protocol => "SQLITE_PROTOCOL",
            Self::Empty => "SQLITE_EMPTY",
            Self::Schema => "SQLITE_SCHEMA",
            Self::TooBig => "SQLITE_TOOBIG",
            Self::Constraint => "SQLITE_CONSTRAINT",
            Self::Mismatch => "SQLITE_MISMATCH",
            Self::Misuse => "SQLITE_MISUSE",
            Self::NoLfs => "SQLITE_NOLFS",
            Self::Auth => "SQLITE_AUTH",
            Self::Format => "SQLITE_FORMAT",
            Self::Range => "SQLITE_RANGE",
            Self::NotADb => "SQLITE_NOTADB",
            Self::Notice => "SQLITE_NOTICE",
            Self::Warning => "SQLITE_WARNING",
            Self::Row => "SQLITE_ROW",
            Self::Done => "SQLITE_DONE",
        };
        f.write_str(name)
    }
}

pub(crate) const SQLITE_OK: i32 = 0;
pub(crate) const SQLITE_ERROR: i32 = 1;
pub(crate) const SQLITE_ABORT: i32 = 4;
pub(crate) const SQLITE_BUSY: i32 = 5;
pub(crate) const SQLITE_NOMEM: i32 = 7;
pub(crate) const SQLITE_READONLY: i32 = 8;
pub(crate) const SQLITE_IOERR: i32 = 10;
pub(crate) const SQLITE_NOTFOUND: i32 = 12;
pub(crate) const SQLITE_FULL: i32 = 13;
pub(crate) const SQLITE_CANTOPEN: i32 = 14;
pub(crate) const SQLITE_TOOBIG: i32 = 18;
pub(crate) const SQLITE_MISUSE: i32 = 21;
pub(crate) const SQLITE_RANGE: i32 = 25;
pub(crate) const SQLITE_ROW: i32 = 100;
pub(crate) const SQLITE_DONE: i32 = 101;

pub(crate) const SQLITE_ABORT_ROLLBACK: i32 = SQLITE_ABORT | (2 << 8);

/// Extended I/O error codes returned by the VFS bridge.
pub mod ioerr {
    #![allow(missing_docs)]
    use super::SQLITE_IOERR;

    pub const READ: i32 = SQLITE_IOERR | (1 << 8);
    pub const SHORT_READ: i32 = SQLITE_IOERR | (2 << 8);
    pub const WRITE: i32 = SQLITE_IOERR | (3 << 8);
    pub const FSYNC: i32 = SQLITE_IOERR | (4 << 8);
    pub const TRUNCATE: i32 = SQLITE_IOERR | (6 << 8);
    pub const FSTAT: i32 = SQLITE_IOERR | (7 << 8);
    pub const UNLOCK: i32 = SQLITE_IOERR | (8 << 8);
    pub const RDLOCK: i32 = SQLITE_IOERR | (9 << 8);
    pub const DELETE: i32 = SQLITE_IOERR | (10 << 8);
    pub const NOMEM: i32 = SQLITE_IOERR | (12 << 8);
    pub const ACCESS: i32 = SQLITE_IOERR | (13 << 8);
    pub const CHECKRESERVEDLOCK: i32 = SQLITE_IOERR | (14 << 8);
    pub const LOCK: i32 = SQLITE_IOERR | (15 << 8);
    pub const CLOSE: i32 = SQLITE_IOERR | (16 << 8);
    pub const DELETE_NOENT: i32 = SQLITE_IOERR | (23 << 8);
}

/// Fundamental column storage classes reported by `sqlite3_column_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// 64-bit signed integer.
    Integer,
    /// 64-bit IEEE float.
    Float,
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Blob,
    /// SQL `NULL`.
    Null,
}

impl ColumnType {
    pub(crate) const fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::Integer,
            2 => Self::Float,
            3 => Self::Text,
            4 => Self::Blob,
            _ => Self::Null,
        }
    }
}

/// Destructor sentinel telling the engine to copy bound data immediately.
pub(crate) const SQLITE_TRANSIENT: i32 = -1;

/// `sqlite3_deserialize` flag bits.
pub mod deserialize {
    /// The engine frees the buffer when the connection closes.
    pub const FREE_ON_CLOSE: u32 = 1;
    /// The engine may grow the buffer with `sqlite3_realloc`.
    pub const RESIZEABLE: u32 = 2;
    /// The database is read-only.
    pub const READ_ONLY: u32 = 4;
}

/// `sqlite3_serialize` flag bits.
pub mod serialize {
    /// Return a pointer to the engine's own copy instead of a fresh buffer.
    pub const NO_COPY: u32 = 1;
}

/// The engine's default description for a result code.
///
/// Extended codes are reduced to their primary code, except for the few
/// that carry their own text. Unknown codes read `"unknown error"`.
#[must_use]
pub fn default_message(code: i32) -> &'static str {
    match code {
        SQLITE_ABORT_ROLLBACK => return "abort due to ROLLBACK",
        SQLITE_ROW => return "another row available",
        SQLITE_DONE => return "no more rows available",
        _ => {}
    }
    match code & 0xff {
        0 => "not an error",
        1 => "SQL logic error",
        3 => "access permission denied",
        4 => "query aborted",
        5 => "database is locked",
        6 => "database table is locked",
        7 => "out of memory",
        8 => "attempt to write a readonly database",
        9 => "interrupted",
        10 => "disk I/O error",
        11 => "database disk image is malformed",
        12 => "unknown operation",
        13 => "database or disk is full",
        14 => "unable to open database file",
        15 => "locking protocol",
        17 => "database schema has changed",
        18 => "string or blob too big",
        19 => "constraint failed",
        20 => "datatype mismatch",
        21 => "bad parameter or other API misuse",
        22 => "large file support is disabled",
        23 => "authorization denied",
        25 => "column index out of range",
        26 => "file is not a database",
        27 => "notification message",
        28 => "warning message",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_codes_reduce_to_primary() {
        assert_eq!(ResultCode::from_raw(ioerr::SHORT_READ), ResultCode::IoErr);
        assert_eq!(ResultCode::from_raw(19 | (8 << 8)), ResultCode::Constraint);
        assert_eq!(ResultCode::from_raw(SQLITE_DONE), ResultCode::Done);
        assert_eq!(ResultCode::from_raw(99), ResultCode::Error);
    }

    #[test]
    fn test_default_messages() {
        assert_eq!(default_message(SQLITE_MISUSE), "bad parameter or other API misuse");
        assert_eq!(default_message(SQLITE_CANTOPEN), "unable to open database file");
        assert_eq!(default_message(ioerr::SHORT_READ), "disk I/O error");
        assert_eq!(default_message(SQLITE_ABORT_ROLLBACK), "abort due to ROLLBACK");
        assert_eq!(default_message(2), "unknown error");
        assert_eq!(default_message(1234), "unknown error");
    }

    #[test]
    fn test_success_codes() {
        assert!(ResultCode::Row.is_success());
        assert!(ResultCode::Done.is_success());
        assert!(!ResultCode::Busy.is_success());
        assert_eq!(ResultCode::Misuse.to_string(), "SQLITE_MISUSE");
    }
}
