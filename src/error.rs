//! Error taxonomy used internally by the tree, inode table and handle table.
//!
//! Handler implementations never see `std::io::Error` or raw `libc` constants; they
//! return `Result<T, Error>`, and [`Error::to_errno`] maps each variant onto the kernel
//! errno the [`crate::bridge::Bridge`] sends back on the wire.

use crate::ll::Errno;

/// Failure of a filesystem operation, independent of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No such file or directory.
    NotFound,
    /// The entry already exists.
    AlreadyExists,
    /// Operation not permitted for the caller.
    PermissionDenied,
    /// Path component is not a directory where one was expected.
    NotADirectory,
    /// Directory given where a non-directory was expected, or directory not empty.
    IsADirectory,
    /// Directory is not empty (`RMDIR`/`RENAME` onto a non-empty directory).
    DirectoryNotEmpty,
    /// The filesystem (or this handler) does not support mutation.
    ReadOnly,
    /// Operation is valid in general, but not supported by this handler.
    NotSupported,
    /// Handler chose not to implement this operation at all.
    NotImplemented,
    /// Argument was structurally invalid (bad offset, bad flags, oversize name, ...).
    InvalidArgument,
    /// Name exceeds `NAME_MAX`.
    NameTooLong,
    /// No space left to complete the operation.
    NoSpace,
    /// Extended attribute does not exist.
    NoAttribute,
    /// Stale node id: the node this request addressed has since been forgotten.
    Stale,
    /// A concurrent structural change prevented this operation from completing after
    /// repeated optimistic retries.
    Busy,
    /// Operation was interrupted by a kernel `FUSE_INTERRUPT` or by a deadline.
    Interrupted,
    /// Catch-all for I/O failures the handler wants to surface without a specific code.
    Io,
}

impl Error {
    /// Map this error onto the kernel errno sent in the reply header.
    pub fn to_errno(self) -> Errno {
        match self {
            Error::NotFound => Errno::ENOENT,
            Error::AlreadyExists => Errno::EEXIST,
            Error::PermissionDenied => Errno::EACCES,
            Error::NotADirectory => Errno::ENOTDIR,
            Error::IsADirectory => Errno::EISDIR,
            Error::DirectoryNotEmpty => Errno::ENOTEMPTY,
            Error::ReadOnly => Errno::EROFS,
            Error::NotSupported => Errno::ENOTSUP,
            Error::NotImplemented => Errno::ENOSYS,
            Error::InvalidArgument => Errno::EINVAL,
            Error::NameTooLong => Errno::ENAMETOOLONG,
            Error::NoSpace => Errno::ENOSPC,
            Error::NoAttribute => Errno::ENODATA,
            Error::Stale => Errno::ENOENT,
            Error::Busy => Errno::EBUSY,
            Error::Interrupted => Errno::EAGAIN,
            Error::Io => Errno::EIO,
        }
    }

    /// Build an `Error` from a raw positive errno value, falling back to `Io` for codes
    /// that don't have a named variant.
    pub fn from_errno(raw: i32) -> Error {
        match raw {
            libc::ENOENT => Error::NotFound,
            libc::EEXIST => Error::AlreadyExists,
            libc::EACCES | libc::EPERM => Error::PermissionDenied,
            libc::ENOTDIR => Error::NotADirectory,
            libc::EISDIR => Error::IsADirectory,
            libc::ENOTEMPTY => Error::DirectoryNotEmpty,
            libc::EROFS => Error::ReadOnly,
            libc::ENOTSUP => Error::NotSupported,
            libc::ENOSYS => Error::NotImplemented,
            libc::EINVAL => Error::InvalidArgument,
            libc::ENAMETOOLONG => Error::NameTooLong,
            libc::ENOSPC => Error::NoSpace,
            libc::ENODATA => Error::NoAttribute,
            libc::EBUSY => Error::Busy,
            libc::EAGAIN => Error::Interrupted,
            _ => Error::Io,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Error::NotFound => "no such file or directory",
            Error::AlreadyExists => "entry already exists",
            Error::PermissionDenied => "permission denied",
            Error::NotADirectory => "not a directory",
            Error::IsADirectory => "is a directory",
            Error::DirectoryNotEmpty => "directory not empty",
            Error::ReadOnly => "read-only filesystem",
            Error::NotSupported => "operation not supported",
            Error::NotImplemented => "operation not implemented",
            Error::InvalidArgument => "invalid argument",
            Error::NameTooLong => "name too long",
            Error::NoSpace => "no space left on device",
            Error::NoAttribute => "no such extended attribute",
            Error::Stale => "stale node",
            Error::Busy => "resource busy, retries exhausted",
            Error::Interrupted => "operation interrupted",
            Error::Io => "I/O error",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_errno() {
        for e in [
            Error::NotFound,
            Error::AlreadyExists,
            Error::PermissionDenied,
            Error::ReadOnly,
            Error::Busy,
        ] {
            let raw: i32 = e.to_errno().into();
            assert_eq!(Error::from_errno(raw).to_errno(), e.to_errno());
        }
    }

    #[test]
    fn unknown_errno_maps_to_io() {
        assert_eq!(Error::from_errno(12345), Error::Io);
    }
}
