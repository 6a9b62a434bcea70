//! Error types for sqlbox.

use crate::codes::ResultCode;

/// A failure reported by the engine.
///
/// Carries the primary code, the extended code (equal to the primary code
/// when the engine reports no extension) and a message. When the engine
/// has no message the text comes from [`crate::default_message`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[error("{message} ({code}, extended code {extended_code})")]
pub struct SqliteError {
    /// Primary result code.
    pub code: ResultCode,
    /// Extended result code.
    pub extended_code: i32,
    /// Human-readable description.
    pub message: String,
}

impl SqliteError {
    /// Build an error for `code` with the engine's default message.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        Self {
            code: ResultCode::from_raw(code),
            extended_code: code,
            message: crate::codes::default_message(code).to_string(),
        }
    }

    /// Build an error for `code` with a custom message.
    #[must_use]
    pub fn with_message(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: ResultCode::from_raw(code),
            extended_code: code,
            message: message.into(),
        }
    }

    pub(crate) fn misuse(message: impl Into<String>) -> Self {
        Self::with_message(crate::codes::SQLITE_MISUSE, message)
    }
}

/// Errors that can occur while loading the engine or using a connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The WebAssembly module failed to compile or link.
    #[error("WebAssembly module error: {0}")]
    WasmModule(String),

    /// The wasmtime engine could not be configured, or the module does not
    /// export what the host needs.
    #[error("WebAssembly engine error: {0}")]
    WasmEngine(String),

    /// `sqlite3_initialize` reported failure.
    #[error("engine initialization failed: {0}")]
    Initialization(SqliteError),

    /// The engine returned a failure code.
    #[error(transparent)]
    Sqlite(#[from] SqliteError),

    /// A host value has no SQL counterpart.
    #[error("unsupported value type: {0}")]
    UnsupportedType(String),

    /// A sandbox address or length fell outside linear memory.
    #[error("sandbox memory access out of bounds: {len} bytes at {ptr:#x}")]
    OutOfBounds {
        /// Start address.
        ptr: u32,
        /// Number of bytes accessed.
        len: usize,
    },

    /// Reading the module from disk failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine trapped. The instance should be discarded.
    #[error("engine trapped: {0}")]
    Trap(String),

    /// A previous caller panicked while holding the instance.
    #[error("instance lock poisoned")]
    Poisoned,

    /// The background instantiation task failed.
    #[error("instantiation task failed: {0}")]
    Join(String),
}

impl Error {
    /// The engine error, if this is one.
    #[must_use]
    pub fn as_sqlite(&self) -> Option<&SqliteError> {
        match self {
            Self::Sqlite(e) | Self::Initialization(e) => Some(e),
            _ => None,
        }
    }

    /// The primary result code, if this is an engine error.
    #[must_use]
    pub fn code(&self) -> Option<ResultCode> {
        self.as_sqlite().map(|e| e.code)
    }
}

/// Result type for sqlbox operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
