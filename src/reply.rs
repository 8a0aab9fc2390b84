//! Filesystem operation reply types, and the reply handle that guarantees exactly one
//! reply is ever sent for a request.
//!
//! A [`ReplyHandler`] is handed to the bridge for each dispatched request. Either the
//! dispatch logic calls one of its self-consuming methods, or, if the handler is dropped
//! without having done so (a handler callback panicked, or a code path forgot), `Drop`
//! sends `EIO` so the kernel is never left waiting on a `unique` id forever.

use std::fmt;
use std::io::IoSlice;
use std::time::{Duration, SystemTime};

use log::warn;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

use crate::dirstream::{self, EntryPlus};
use crate::error::Error;
use crate::ll;
use crate::ll::reply::Attr;

/// Generic reply callback used to hand a framed reply to the device.
pub(crate) trait ReplySender: Send + Sync + 'static {
    fn send(&self, data: &[IoSlice<'_>]) -> std::io::Result<()>;
}

impl fmt::Debug for Box<dyn ReplySender> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Box<dyn ReplySender>")
    }
}

/// Holds the identifiers needed to reply to one request. Owning it is what proves a reply
/// has not been sent yet; consuming it by calling one of its methods is what proves it has.
#[derive(Debug)]
pub(crate) struct ReplyHandler {
    unique: ll::RequestId,
    sender: Option<Box<dyn ReplySender>>,
}

impl ReplyHandler {
    pub(crate) fn new<S: ReplySender>(unique: ll::RequestId, sender: S) -> Self {
        Self {
            unique,
            sender: Some(Box::new(sender)),
        }
    }

    fn send_ll(mut self, response: &ll::reply::Response<'_>) {
        let sender = self.sender.take().expect("reply already sent");
        if let Err(err) = response.with_iovec(self.unique, |iov| sender.send(iov)) {
            warn!("failed to send FUSE reply for request {}: {err}", self.unique);
        }
    }

    pub fn ok(self) {
        self.send_ll(&ll::reply::Response::new_empty());
    }

    /// `FORGET`/`BATCH_FORGET`/`NOTIFY_REPLY` are void on the wire: the kernel does not read
    /// a reply for them at all, so sending one (even an empty success) would desynchronize
    /// the next read from `/dev/fuse`. This discards the handler without writing anything.
    pub fn no_reply(mut self) {
        self.sender.take();
    }

    pub fn error(self, err: Error) {
        self.send_ll(&ll::reply::Response::new_error(err.to_errno()));
    }

    pub fn data(self, data: &[u8]) {
        self.send_ll(&ll::reply::Response::new_slice(data));
    }

    pub fn entry(self, entry: Entry) {
        self.send_ll(&ll::reply::Response::new_entry(
            ll::INodeNo(entry.ino),
            ll::Generation(entry.generation),
            &Attr::from(entry.attr),
            entry.attr_ttl,
            entry.entry_ttl,
        ));
    }

    /// A `LOOKUP` miss the kernel may cache for `ttl` instead of re-querying on the next
    /// lookup of the same name. `None` falls back to a plain `ENOENT`.
    pub fn negative_entry(self, ttl: Option<Duration>) {
        match ttl {
            Some(ttl) => self.send_ll(&ll::reply::Response::new_negative_entry(ttl)),
            None => self.error(Error::NotFound),
        }
    }

    pub fn attr(self, attr: FileAttr, ttl: Duration) {
        self.send_ll(&ll::reply::Response::new_attr(&ttl, &Attr::from(attr)));
    }

    pub fn opened(self, open: Open) {
        self.send_ll(&ll::reply::Response::new_open(
            ll::FileHandle(open.fh),
            open.flags,
            0,
        ));
    }

    pub fn written(self, size: u32) {
        self.send_ll(&ll::reply::Response::new_write(size));
    }

    pub fn statfs(self, statfs: Statfs) {
        self.send_ll(&ll::reply::Response::new_statfs(
            statfs.blocks,
            statfs.bfree,
            statfs.bavail,
            statfs.files,
            statfs.ffree,
            statfs.bsize,
            statfs.namelen,
            statfs.frsize,
        ));
    }

    pub fn created(self, entry: Entry, open: Open) {
        self.send_ll(&ll::reply::Response::new_create(
            &entry.entry_ttl,
            &Attr::from(entry.attr),
            ll::Generation(entry.generation),
            ll::FileHandle(open.fh),
            open.flags,
            0,
        ));
    }

    pub fn locked(self, lock: Lock) {
        self.send_ll(&ll::reply::Response::new_lock(&ll::Lock::new(
            (lock.start, lock.end),
            lock.typ,
            lock.pid,
        )));
    }

    pub fn xattr_size(self, size: u32) {
        self.send_ll(&ll::reply::Response::new_xattr_size(size));
    }

    pub fn xattr_data(self, data: &[u8]) {
        self.send_ll(&ll::reply::Response::new_slice(data));
    }

    pub fn lseek(self, offset: i64) {
        self.send_ll(&ll::reply::Response::new_lseek(offset));
    }

    /// Fill and send a plain `READDIR` buffer from a full directory snapshot, honouring the
    /// kernel-provided starting `offset` and output buffer `size`.
    pub fn dir(self, entries: &[dirstream::Entry], offset: i64, size: usize) {
        match dirstream::fill_dir(entries, offset, size) {
            Ok(list) => self.send_ll(&ll::reply::Response::from(list)),
            Err(err) => self.error(err),
        }
    }

    /// Same, for `READDIRPLUS`.
    pub fn dirplus(self, entries: &[EntryPlus], offset: i64, size: usize) {
        match dirstream::fill_dir_plus(entries, offset, size) {
            Ok(list) => self.send_ll(&ll::reply::Response::from(list)),
            Err(err) => self.error(err),
        }
    }
}

impl Drop for ReplyHandler {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            warn!(
                "reply not sent for request {}, replying with I/O error",
                self.unique
            );
            let response = ll::reply::Response::new_error(ll::Errno::EIO);
            if let Err(err) = response.with_iovec(self.unique, |iov| sender.send(iov)) {
                warn!("failed to send fallback FUSE reply: {err}");
            }
        }
    }
}

/// A file's type. The kernel caches this once reported; [`FileAttr::kind`] must never
/// change across the node's lifetime (protocol invariant I3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum FileType {
    NamedPipe,
    CharDevice,
    BlockDevice,
    Directory,
    RegularFile,
    Symlink,
    Socket,
}

/// File attributes, as reported to the kernel by `GETATTR`/`LOOKUP`/`CREATE`/...
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct FileAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub kind: FileType,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub flags: u32,
}

/// A fully resolved directory entry, as returned to the kernel's cache by `LOOKUP`,
/// `CREATE`, `MKDIR`, `MKNOD`, `SYMLINK` and `LINK`.
#[derive(Clone, Copy, Debug)]
pub struct Entry {
    pub ino: u64,
    pub generation: u64,
    pub attr: FileAttr,
    pub entry_ttl: Duration,
    pub attr_ttl: Duration,
}

/// An opened file or directory handle.
#[derive(Clone, Copy, Debug)]
pub struct Open {
    pub fh: u64,
    pub flags: ll::flags::fopen_flags::FopenFlags,
}

/// `STATFS` reply data.
#[derive(Clone, Copy, Debug)]
pub struct Statfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// `GETLK`/`SETLK` reply data.
#[derive(Clone, Copy, Debug)]
pub struct Lock {
    pub start: u64,
    pub end: u64,
    pub typ: i32,
    pub pid: u32,
}

/// `GETXATTR`/`LISTXATTR` reply data: either the attribute's size (when the kernel probed
/// with a zero-sized buffer) or its contents.
#[derive(Clone, Debug)]
pub enum Xattr {
    Size(u32),
    Data(Vec<u8>),
}
