//! Error types for nestfs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("not found")]
    NotFound,

    #[error("entry already exists")]
    AlreadyExists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backing store error: {0}")]
    BackingStore(String),

    #[error("thumbnail unavailable: {0}")]
    ThumbnailUnavailable(String),
}

impl LibraryError {
    /// Errno for the FUSE reply surface.
    pub fn errno(&self) -> libc::c_int {
        match self {
            LibraryError::NotFound => libc::ENOENT,
            LibraryError::AlreadyExists => libc::EEXIST,
            LibraryError::NotEmpty => libc::ENOTEMPTY,
            LibraryError::InvalidArgument(_) => libc::EINVAL,
            LibraryError::BackingStore(_) => libc::EIO,
            LibraryError::ThumbnailUnavailable(_) => libc::EIO,
        }
    }
}

impl From<std::io::Error> for LibraryError {
    fn from(e: std::io::Error) -> Self {
        // A vanished file is a normal race with the external writer, not a
        // backing-store fault.
        if e.kind() == std::io::ErrorKind::NotFound {
            LibraryError::NotFound
        } else {
            LibraryError::BackingStore(e.to_string())
        }
    }
}

impl From<serde_json::Error> for LibraryError {
    fn from(e: serde_json::Error) -> Self {
        LibraryError::BackingStore(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LibraryError>;
