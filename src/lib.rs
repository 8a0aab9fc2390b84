//! A node-oriented FUSE filesystem runtime.
//!
//! This crate implements the FUSE kernel-protocol boundary: a worker thread pool reads
//! requests from `/dev/fuse` ([`session`]), decodes them against the wire ABI
//! ([`ll`]), routes them through a node tree that understands hard links, rename and
//! lookup-count refcounting ([`tree`], [`inode_table`], [`handle`]), and dispatches each
//! opcode against a small family of capability traits a filesystem implementation provides
//! ([`handler`]). The only thing this crate relies on from libfuse itself is the mount and
//! unmount syscalls needed to establish a connection to the kernel driver.
//!
//! A filesystem implementation provides one [`handler::Node`] for its root (implementing
//! [`handler::FilesystemRoot`] for `STATFS`) plus whichever capability traits its nodes
//! support, and drives the mount with [`Session::mount`].

#![warn(missing_debug_implementations, rust_2018_idioms)]

mod bridge;
mod channel;
mod context;
mod dev_fuse;
mod dirstream;
mod error;
mod forget_one;
mod handle;
mod handler;
mod inode_table;
mod ll;
mod mnt;
mod notify;
mod rename_flags;
mod reply;
mod request_param;
mod session;
mod timeouts;
mod tree;

pub use crate::bridge::Bridge;
pub use crate::context::{Call, CancelSignal, RequestContext};
pub use crate::dirstream::{Entry as DirEntry, EntryPlus as DirEntryPlus};
pub use crate::error::{Error, Result};
pub use crate::handle::HandleKind;
pub use crate::handler::{
    DirIo, FileIo, FilesystemRoot, Linker, Locking, Lookup, Mutable, NewChild, Node,
    SetAttrRequest, XattrIo,
};
pub use crate::inode_table::ContentKey;
pub use crate::ll::flags::fopen_flags::FopenFlags;
pub use crate::ll::{Errno, FileHandle, Generation, INodeNo, RequestId, TimeOrNow};
pub use crate::mnt::mount_options::MountOption;
pub use crate::rename_flags::RenameFlags;
pub use crate::reply::{Entry, FileAttr, FileType, Lock, Open, Statfs, Xattr};
pub use crate::session::{BackgroundSession, Session, SessionACL};
pub use crate::timeouts::{MountConfig, Timeouts};
pub use crate::tree::NodeKey;
