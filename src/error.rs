//! StratoFS Error Types

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias for StratoFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// StratoFS error types
#[derive(Error, Debug)]
pub enum Error {
    // Namespace errors, surfaced to the kernel as errno values
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Another call is changing the same name or node remotely
    #[error("Busy: {0}")]
    Busy(String),

    /// Also used for "not ready yet": content not confirmed remotely
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Illegal seek: offset {offset} is past end of file ({size} bytes)")]
    IllegalSeek { offset: u64, size: u64 },

    // Remote store errors
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    // Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Chunk ledger error: {0}")]
    Ledger(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convert to libc error code for FUSE
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            Error::Busy(_) => libc::EBUSY,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::IllegalSeek { .. } => libc::ESPIPE,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// Check if this error came from the remote store
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote(_))
    }
}
