//! Low-level types shared by the wire codec, the request parser and the reply builder.
//!
//! Everything here is a thin newtype over the raw integers that cross the `/dev/fuse`
//! boundary. Keeping them as distinct types (rather than passing `u64`s around) prevents
//! mixing up an inode number with a file handle or a lock owner at the call sites in
//! [`crate::tree`], [`crate::handle`] and [`crate::bridge`].

pub(crate) mod argument;
pub(crate) mod errno;
pub(crate) mod flags;
pub(crate) mod fuse_abi;
pub(crate) mod notify;
pub(crate) mod reply;
pub(crate) mod request;

use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroI32;
use std::time::SystemTime;

/// Unique identifier of a request, as assigned by the kernel driver.
///
/// The kernel may reuse a unique id once the request it was assigned to has been replied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<RequestId> for u64 {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

/// The node id the kernel uses to address an inode, as opposed to the filesystem's own
/// content-derived identity for that inode (see [`crate::inode_table`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct INodeNo(pub(crate) u64);

impl INodeNo {
    /// The node id the kernel always uses to refer to the mount's root directory.
    pub const ROOT: INodeNo = INodeNo(fuse_abi::FUSE_ROOT_ID);
}

impl fmt::Display for INodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<INodeNo> for u64 {
    fn from(ino: INodeNo) -> Self {
        ino.0
    }
}

impl From<u64> for INodeNo {
    fn from(ino: u64) -> Self {
        INodeNo(ino)
    }
}

/// Generation number paired with a node id to disambiguate a reused id after it has been
/// forgotten and the underlying inode's storage slot was recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Generation(pub(crate) u64);

impl From<u64> for Generation {
    fn from(r#gen: u64) -> Self {
        Generation(r#gen)
    }
}

impl From<Generation> for u64 {
    fn from(r#gen: Generation) -> Self {
        r#gen.0
    }
}

/// Opaque file handle returned from `open`/`opendir`/`create` and echoed back by the kernel
/// on every subsequent operation against that open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(pub(crate) u64);

impl From<u64> for FileHandle {
    fn from(fh: u64) -> Self {
        FileHandle(fh)
    }
}

impl From<FileHandle> for u64 {
    fn from(fh: FileHandle) -> Self {
        fh.0
    }
}

/// Identifier of the lock owner for POSIX record locks, scoped to a single open file
/// description on the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockOwner(pub(crate) u64);

impl From<u64> for LockOwner {
    fn from(owner: u64) -> Self {
        LockOwner(owner)
    }
}

/// A POSIX record lock range together with its type and owning pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock {
    pub(crate) range: (u64, u64),
    pub(crate) typ: i32,
    pub(crate) pid: u32,
}

impl Lock {
    pub(crate) fn new(range: (u64, u64), typ: i32, pid: u32) -> Self {
        Self { range, typ, pid }
    }

    /// `(start, end)` byte range covered by the lock, inclusive.
    pub fn range(&self) -> (u64, u64) {
        self.range
    }

    /// `F_RDLCK`/`F_WRLCK`/`F_UNLCK` as defined by `libc`.
    pub fn typ(&self) -> i32 {
        self.typ
    }

    /// Pid of the process that owns the lock, as reported by the client kernel.
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Negotiated protocol version (`major.minor`) exchanged during `FUSE_INIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub(crate) u32, pub(crate) u32);

impl Version {
    pub fn major(&self) -> u32 {
        self.0
    }

    pub fn minor(&self) -> u32 {
        self.1
    }
}

/// Either a concrete timestamp or a request to set the timestamp to "now" on the server,
/// mirroring the kernel's `FATTR_*_NOW` setattr flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrNow {
    SpecificTime(SystemTime),
    Now,
}

/// Kernel errno, always non-zero: `Errno(0)` would mean "success" and is represented as
/// `None` by the reply layer instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub(crate) NonZeroI32);

macro_rules! errno_consts {
    ($($name:ident = $val:ident),* $(,)?) => {
        impl Errno {
            $(
                pub const $name: Errno = Errno(match NonZeroI32::new(libc::$val) {
                    Some(v) => v,
                    None => panic!("errno constant must be non-zero"),
                });
            )*
        }
    };
}

errno_consts! {
    EPERM = EPERM,
    ENOENT = ENOENT,
    EIO = EIO,
    EAGAIN = EAGAIN,
    ENOMEM = ENOMEM,
    EACCES = EACCES,
    EEXIST = EEXIST,
    ENOTDIR = ENOTDIR,
    EISDIR = EISDIR,
    EINVAL = EINVAL,
    ENOSPC = ENOSPC,
    EROFS = EROFS,
    ENOSYS = ENOSYS,
    ENOTEMPTY = ENOTEMPTY,
    ENOTSUP = ENOTSUP,
    ENODATA = ENODATA,
    ERANGE = ERANGE,
    ENOATTR = ENODATA,
    EBUSY = EBUSY,
    ENAMETOOLONG = ENAMETOOLONG,
    EOPNOTSUPP = EOPNOTSUPP,
}

impl Errno {
    /// Build an `Errno` from a raw, known-nonzero `libc` error code.
    ///
    /// Returns `None` if `raw` is zero or out of the range a kernel reply can encode.
    pub fn from_i32(raw: i32) -> Option<Errno> {
        NonZeroI32::new(raw).map(Errno)
    }

    pub fn code(&self) -> i32 {
        self.0.get()
    }
}

impl From<Errno> for i32 {
    fn from(e: Errno) -> Self {
        e.0.get()
    }
}

impl TryFrom<i32> for Errno {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        NonZeroI32::new(value).map(Errno).ok_or(())
    }
}

/// Forces the byte buffers used in unit tests of the wire codec onto an 8-byte boundary,
/// matching the alignment the real kernel uses for `/dev/fuse` reads.
#[cfg(test)]
pub(crate) mod test {
    #[repr(align(8))]
    pub(crate) struct AlignedData<T>(pub(crate) T);

    impl<T, Idx> std::ops::Index<Idx> for AlignedData<T>
    where
        T: std::ops::Index<Idx>,
    {
        type Output = T::Output;

        fn index(&self, index: Idx) -> &Self::Output {
            &self.0[index]
        }
    }

    impl<T> std::ops::Deref for AlignedData<T> {
        type Target = T;

        fn deref(&self) -> &T {
            &self.0
        }
    }

    pub(crate) fn ioslice_to_vec(slices: &[std::io::IoSlice<'_>]) -> Vec<u8> {
        slices.iter().flat_map(|s| s.to_vec()).collect()
    }
}
