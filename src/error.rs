//! Crate-wide error taxonomy.
//!
//! Mirrors the error classes a real kernel would map onto `errno` values
//! (see the resource-exhaustion / not-found / invalid-argument / hardware
//! split in the top-level design notes), but expressed as an ordinary
//! [`std::error::Error`] since this crate targets `std` rather than a
//! freestanding kernel binary.

use thiserror::Error;

/// The single error type returned by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No such file, directory, or sector mapping.
    #[error("no such entry")]
    NoSuchEntry,
    /// The underlying block device reported a failure.
    #[error("i/o error: {0}")]
    Io(String),
    /// A physical page or host allocation could not be satisfied.
    #[error("out of memory")]
    NoMemory,
    /// The free-sector map or swap area has no room left.
    #[error("no space left on device")]
    NoSpace,
    /// A caller-supplied argument was out of range or malformed.
    #[error("invalid argument")]
    InvalidArgument,
    /// The requested resource is in use and cannot be mutated right now.
    #[error("resource busy")]
    Busy,
    /// On-disk metadata failed a structural check (bad magic, zero inode
    /// number where one was required, …).
    #[error("filesystem corrupted: {0}")]
    FilesystemCorrupted(&'static str),
    /// The target of a lookup is not a directory.
    #[error("not a directory")]
    NotDirectory,
    /// The target of an operation that requires a file is a directory.
    #[error("is a directory")]
    IsDirectory,
    /// `remove` was attempted on a non-empty directory.
    #[error("directory not empty")]
    DirectoryNotEmpty,
    /// A directory or file name exceeded the 14-byte limit.
    #[error("name too long")]
    NameTooLong,
    /// `create` targeted a name that already exists.
    #[error("file exists")]
    FileExist,
    /// The requested mapping collides with an existing one.
    #[error("mapping already exists")]
    MappingExist,
    /// Operation not supported in this configuration.
    #[error("operation not supported")]
    NotSupported,
}

pub type Result<T> = core::result::Result<T, CoreError>;
