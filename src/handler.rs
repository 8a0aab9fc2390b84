//! The trait family a filesystem implementation provides: one object-safe [`Node`] trait
//! plus a handful of small capability traits queried from it by interface, rather than one
//! god-trait every filesystem must implement in full.
//!
//! A concrete node type implements [`Node`] and overrides whichever `as_*` accessor exposes
//! the capability it supports; the default accessor returns `None`, and [`crate::bridge::Bridge`]
//! falls back to the default policy for that opcode (§4.8: `EROFS` for mutations, `ENOTSUP`
//! for handle-specific operations, `ENOSYS` for unimplemented extended attributes). This
//! mirrors the capability-trait-family pattern used by `easy_fuser`'s `FuseHandler` and by
//! `polyfuse`'s per-inode operation dispatch, without committing every implementation to a
//! single trait with forty methods.

use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::time::Duration;

use crate::context::Call;
use crate::error::Result;
use crate::reply::{FileAttr, Lock as LockReply, Open, Statfs, Xattr};

/// A freshly created or looked-up child: the object the bridge will register in the node
/// tree and inode table, plus the attributes it reports back to the kernel.
///
/// `persistent` marks a node the bridge must not garbage-collect even once the kernel's
/// `lookup_count` for it drops to zero and it has no children (e.g. a root-adjacent node a
/// handler pre-populated via [`crate::bridge::Bridge::attach`] before the session loop
/// started, which the kernel may never `LOOKUP` at all). Kernel-initiated creations are
/// never persistent and start with `lookup_count` 1; a persistent node starts at 0, since no
/// `FORGET` is coming to balance a lookup count it never asked for.
pub struct NewChild {
    pub node: Arc<dyn Node>,
    pub attr: FileAttr,
    pub persistent: bool,
}

impl NewChild {
    /// An ordinary, kernel-visible child: garbage-collected once unreachable.
    pub fn new(node: Arc<dyn Node>, attr: FileAttr) -> Self {
        Self { node, attr, persistent: false }
    }

    /// A child that must survive even with a zero lookup count and no parent edge, e.g. one
    /// a handler pre-populated before the kernel ever `LOOKUP`ed it.
    pub fn persistent(node: Arc<dyn Node>, attr: FileAttr) -> Self {
        Self { node, attr, persistent: true }
    }
}

/// The object-safe base every filesystem node implements. Everything else is an optional
/// capability queried through one of the `as_*` accessors.
pub trait Node: Send + Sync {
    /// Current attributes, as `GETATTR` and every reply that embeds an `Attr` block need.
    fn getattr(&self, ctx: &Call) -> Result<FileAttr>;

    /// An opaque identity used to recognize "the same underlying object" across distinct
    /// parent edges (hard links) or repeat lookups. Nodes that don't need content-addressed
    /// dedup (most synthetic filesystems) can return `None`.
    fn content_key(&self) -> Option<crate::inode_table::ContentKey> {
        None
    }

    fn as_lookup(&self) -> Option<&dyn Lookup> {
        None
    }
    fn as_mutable(&self) -> Option<&dyn Mutable> {
        None
    }
    fn as_linker(&self) -> Option<&dyn Linker> {
        None
    }
    fn as_file_io(&self) -> Option<&dyn FileIo> {
        None
    }
    fn as_dir_io(&self) -> Option<&dyn DirIo> {
        None
    }
    fn as_xattr_io(&self) -> Option<&dyn XattrIo> {
        None
    }
    fn as_locking(&self) -> Option<&dyn Locking> {
        None
    }
    fn as_filesystem_root(&self) -> Option<&dyn FilesystemRoot> {
        None
    }
}

/// Directories implement this to resolve a child by name.
pub trait Lookup: Node {
    fn lookup(&self, ctx: &Call, name: &OsStr) -> Result<NewChild>;
}

/// Anything the handler allows the kernel to mutate: attribute changes and namespace
/// mutation under a directory. Absence of this capability on a node makes every mutating
/// opcode targeting it fail with `Error::ReadOnly` (§4.8's default policy).
pub trait Mutable: Node {
    fn setattr(&self, ctx: &Call, attr: SetAttrRequest) -> Result<FileAttr>;
    fn mknod(&self, ctx: &Call, name: &OsStr, mode: u32, rdev: u32) -> Result<NewChild>;
    fn mkdir(&self, ctx: &Call, name: &OsStr, mode: u32) -> Result<NewChild>;
    fn create(&self, ctx: &Call, name: &OsStr, mode: u32, flags: i32) -> Result<(NewChild, Open)>;
    fn symlink(&self, ctx: &Call, name: &OsStr, target: &OsStr) -> Result<NewChild>;
    fn readlink(&self, ctx: &Call) -> Result<OsString> {
        let _ = ctx;
        Err(crate::error::Error::InvalidArgument)
    }
    fn unlink(&self, ctx: &Call, name: &OsStr) -> Result<()>;
    fn rmdir(&self, ctx: &Call, name: &OsStr) -> Result<()>;
    /// Rename `name` (a child of `self`) to `new_name` under `new_parent`.
    /// `flags` carries `RenameFlags::RENAME_EXCHANGE`/`RENAME_NOREPLACE` when present.
    fn rename(
        &self,
        ctx: &Call,
        name: &OsStr,
        new_parent: &dyn Node,
        new_name: &OsStr,
        flags: crate::rename_flags::RenameFlags,
    ) -> Result<()>;
}

/// Hard-linking an existing node under a new name in a (possibly different) directory.
pub trait Linker: Node {
    fn link(&self, ctx: &Call, existing: &Arc<dyn Node>, name: &OsStr) -> Result<NewChild>;
}

/// Regular-file content I/O against an open handle.
pub trait FileIo: Node {
    fn open(&self, ctx: &Call, flags: i32) -> Result<Open>;
    fn read(&self, ctx: &Call, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>>;
    fn write(&self, ctx: &Call, fh: u64, offset: i64, data: &[u8]) -> Result<u32>;
    fn flush(&self, ctx: &Call, fh: u64) -> Result<()> {
        let _ = (ctx, fh);
        Ok(())
    }
    fn release(&self, ctx: &Call, fh: u64) -> Result<()> {
        let _ = (ctx, fh);
        Ok(())
    }
    fn fsync(&self, ctx: &Call, fh: u64, datasync: bool) -> Result<()> {
        let _ = (ctx, fh, datasync);
        Ok(())
    }
    fn fallocate(&self, ctx: &Call, fh: u64, offset: i64, length: i64, mode: i32) -> Result<()> {
        let _ = (ctx, fh, offset, length, mode);
        Err(crate::error::Error::NotSupported)
    }
    fn lseek(&self, ctx: &Call, fh: u64, offset: i64, whence: i32) -> Result<i64> {
        let _ = (ctx, fh, whence);
        Ok(offset)
    }
    fn copy_file_range(
        &self,
        ctx: &Call,
        fh_in: u64,
        offset_in: i64,
        dst: &dyn FileIo,
        fh_out: u64,
        offset_out: i64,
        len: u64,
    ) -> Result<u32> {
        let data = self.read(ctx, fh_in, offset_in, len as u32)?;
        dst.write(ctx, fh_out, offset_out, &data)
    }
}

/// Directory enumeration against an open handle.
pub trait DirIo: Node {
    fn opendir(&self, ctx: &Call, flags: i32) -> Result<Open>;
    /// A complete, offset-indexed snapshot of the directory's entries (see `dirstream`).
    fn readdir(&self, ctx: &Call, fh: u64) -> Result<Vec<crate::dirstream::Entry>>;
    fn releasedir(&self, ctx: &Call, fh: u64) -> Result<()> {
        let _ = (ctx, fh);
        Ok(())
    }
    fn fsyncdir(&self, ctx: &Call, fh: u64, datasync: bool) -> Result<()> {
        let _ = (ctx, fh, datasync);
        Ok(())
    }
}

/// Extended attribute access.
pub trait XattrIo: Node {
    fn getxattr(&self, ctx: &Call, name: &OsStr, size: u32) -> Result<Xattr>;
    fn setxattr(&self, ctx: &Call, name: &OsStr, value: &[u8], flags: i32) -> Result<()>;
    fn listxattr(&self, ctx: &Call, size: u32) -> Result<Xattr>;
    fn removexattr(&self, ctx: &Call, name: &OsStr) -> Result<()>;
}

/// POSIX advisory locking.
pub trait Locking: Node {
    fn getlk(&self, ctx: &Call, fh: u64, owner: u64, lock: LockReply) -> Result<LockReply>;
    fn setlk(&self, ctx: &Call, fh: u64, owner: u64, lock: LockReply, sleep: bool) -> Result<()>;
}

/// Implemented only by the tree root, for the handful of operations that address the whole
/// mount rather than one node (`STATFS`, and the `on_add` pre-population hook in `MountConfig`
/// runs against the concrete root type directly, not through this trait).
pub trait FilesystemRoot: Node {
    fn statfs(&self, ctx: &Call) -> Result<Statfs>;
}

/// The subset of `SETATTR`'s bitmask-selected fields the kernel actually requested a change
/// to; fields left `None` must be left untouched by the handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<crate::ll::TimeOrNow>,
    pub mtime: Option<crate::ll::TimeOrNow>,
    pub ctime: Option<std::time::SystemTime>,
    pub fh: Option<u64>,
    pub flags: Option<u32>,
}

impl SetAttrRequest {
    pub fn entry_ttl_hint(&self) -> Duration {
        Duration::from_secs(1)
    }
}
