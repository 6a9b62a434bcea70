//! Error types for VFS operations.

/// Errors raised by VFS implementations.
///
/// The bridge in the host crate turns these into the engine's numeric
/// result codes, choosing the extended I/O code that matches the operation
/// that failed.
#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// File already exists and exclusive creation was requested.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Write attempted on a file opened read-only.
    #[error("read-only: {0}")]
    ReadOnly(String),

    /// A lock could not be acquired because another handle holds a
    /// conflicting one.
    #[error("busy: {0}")]
    Busy(String),

    /// The backing storage has no room left.
    #[error("storage full: {0}")]
    Full(String),

    /// The path is malformed or escapes the VFS root.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Access to the path is not permitted.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Underlying host I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for VFS operations.
pub type VfsResult<T> = Result<T, VfsError>;

impl VfsError {
    /// Classify a host I/O error for `path`.
    pub fn from_io(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            _ => Self::Io(err),
        }
    }
}
