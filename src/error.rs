//! Error type shared by every module in this crate.

use std::{fmt, io, num::TryFromIntError, result};

/// Result alias used throughout the crate.
pub type Result<T> = result::Result<T, Error>;

/// The error kinds a container, schema, partition, object, or index
/// operation can fail with. Mirrors the POSIX errno taxonomy named in
/// the design (EINVAL, EEXIST, ENOENT, ENOMEM/ENOSPC, ENOSYS) without
/// tying the API to raw integers.
#[derive(Debug)]
pub enum Error {
    /// Bad argument: malformed path, wrong key type, type mismatch.
    InvalidArgument(String),
    /// Caller lacks permission to perform the requested mutation.
    PermissionDenied(String),
    /// Schema name/id, partition name, or index entry does not exist.
    NotFound(String),
    /// Container directory, partition name, or schema name collides
    /// with an existing one.
    AlreadyExists(String),
    /// Allocator or filesystem ran out of room.
    ResourceExhausted(String),
    /// On-disk signature or version did not match what was expected.
    Corruption(String),
    /// Operation intentionally unimplemented (e.g. container_delete).
    Unimplemented(String),
    /// Propagated I/O error from the underlying file.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidArgument(s) => write!(f, "invalid argument: {}", s),
            Error::PermissionDenied(s) => write!(f, "permission denied: {}", s),
            Error::NotFound(s) => write!(f, "not found: {}", s),
            Error::AlreadyExists(s) => write!(f, "already exists: {}", s),
            Error::ResourceExhausted(s) => write!(f, "resource exhausted: {}", s),
            Error::Corruption(s) => write!(f, "corrupt store: {}", s),
            Error::Unimplemented(s) => write!(f, "unimplemented: {}", s),
            Error::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Error {
        Error::InvalidArgument(format!("integer conversion: {}", err))
    }
}

impl Error {
    /// The POSIX errno this variant corresponds to (§7), for tools
    /// that report failures as a process exit code.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => 22,   // EINVAL
            Error::PermissionDenied(_) => 1,    // EPERM
            Error::NotFound(_) => 2,            // ENOENT
            Error::AlreadyExists(_) => 17,      // EEXIST
            Error::ResourceExhausted(_) => 12,  // ENOMEM
            Error::Corruption(_) => 22,         // EINVAL
            Error::Unimplemented(_) => 38,      // ENOSYS
            Error::Io(err) => err.raw_os_error().unwrap_or(5), // EIO fallback
        }
    }
}
