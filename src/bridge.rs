//! The dispatcher: turns a parsed kernel request into a call against a [`crate::handler::Node`]
//! tree, and the result back into a wire reply.
//!
//! [`Bridge`] owns every piece of server-side bookkeeping (the node tree, the inode table, the
//! handle table, the per-request cancellation registry) and is the one place that knows both the
//! FUSE wire format and the handler trait family. A handler never sees a `fuse_in_header` or an
//! `Operation`; `Bridge` is what stands between them, applying the default policies from the
//! capability tables (`EROFS` for a mutation the node doesn't support, `ENOTSUP` for a
//! handle-specific operation the node doesn't support, `ENOSYS` for unimplemented extended
//! attributes) whenever a node doesn't implement the capability trait an opcode needs.

use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use log::{trace, warn};
use zerocopy::IntoBytes;

use crate::context::{CancelTable, Call, RequestContext};
use crate::dirstream::{Entry as DirEntry, EntryPlus as DirEntryPlus};
use crate::error::{Error, Result};
use crate::handle::{HandleKind, HandleTable};
use crate::handler::{Node, SetAttrRequest};
use crate::inode_table::InodeTable;
use crate::ll::flags::fattr_flags::FattrFlags;
use crate::ll::flags::fopen_flags::FopenFlags;
use crate::ll::flags::init_flags::InitFlags;
use crate::ll::request::{Operation, Request};
use crate::ll::{self, FileHandle, Generation, INodeNo, RequestId, TimeOrNow, fuse_abi};
use crate::rename_flags::RenameFlags;
use crate::reply::{Entry, FileAttr, Lock as LockReply, Open, ReplyHandler, Statfs, Xattr};
use crate::timeouts::{MountConfig, Timeouts};
use crate::tree::{Node as ArenaNode, NodeKey, NodeTree, TwoNodeLocks};

/// Negotiated with the kernel during `INIT`; conservative but enough to run correctly rather
/// than to saturate throughput (a handler that wants larger transfers can be layered on top).
pub(crate) const MAX_WRITE_SIZE: u32 = 128 * 1024;
const MAX_READAHEAD: u32 = 128 * 1024;
const MAX_BACKGROUND: u16 = 16;
const CONGESTION_THRESHOLD: u16 = 12;

/// Aggregate server-side state and the kernel-protocol entry point into a handler tree.
pub struct Bridge {
    tree: NodeTree,
    inodes: InodeTable,
    handles: HandleTable,
    objects: DashMap<NodeKey, Arc<dyn Node>>,
    cancel: CancelTable,
    timeouts: Timeouts,
    debug: bool,
}

impl Bridge {
    /// Build a bridge rooted at `root`. Runs `config.on_add`, if set, before returning, so a
    /// handler can pre-populate persistent nodes before the session loop starts reading requests.
    pub fn new(root: Arc<dyn Node>, mut config: MountConfig) -> Self {
        let objects = DashMap::new();
        objects.insert(NodeKey::ROOT, root);
        let bridge = Self {
            tree: NodeTree::new(),
            inodes: InodeTable::new(config.first_auto_ino),
            handles: HandleTable::new(),
            objects,
            cancel: CancelTable::new(),
            timeouts: config.timeouts,
            debug: config.debug,
        };
        if let Some(on_add) = config.on_add.take() {
            on_add(&bridge);
        }
        bridge
    }

    /// Attach a node under an already-attached directory, the way `LOOKUP`/`MKNOD`/... would,
    /// without going through a kernel request. Meant for `MountConfig::on_add`.
    pub fn attach(&self, parent: NodeKey, name: &OsStr, node: Arc<dyn Node>) -> Result<Entry> {
        let attr = node.getattr(&Call::new(RequestContext::new(RequestId(0), 0, 0, 0), Default::default(), None))?;
        self.insert_child(parent, name, crate::handler::NewChild::persistent(node, attr))
    }

    /// The key the tree root was registered at; useful alongside [`Bridge::attach`].
    pub fn root_key(&self) -> NodeKey {
        NodeKey::ROOT
    }

    fn node(&self, key: NodeKey) -> Result<Arc<dyn Node>> {
        self.objects.get(&key).map(|e| e.clone()).ok_or(Error::Stale)
    }

    fn resolve(&self, ino: INodeNo) -> Result<(NodeKey, Arc<dyn Node>)> {
        let key = self.inodes.peek(ino).ok_or(Error::Stale)?;
        let node = self.node(key)?;
        Ok((key, node))
    }

    /// Insert a freshly produced child into the tree and inode table, deduplicating onto an
    /// existing node id when the handler's `content_key` says this is a hard link onto a node
    /// that's already registered.
    fn insert_child(&self, parent_key: NodeKey, name: &OsStr, new: crate::handler::NewChild) -> Result<Entry> {
        let directory = new.attr.kind == crate::reply::FileType::Directory;
        let content_key = new.node.content_key();
        let parent = self.tree.get(parent_key);
        let node_key = match &content_key {
            Some(key) => self
                .inodes
                .node_for_content(key)
                .unwrap_or_else(|| self.tree.alloc(directory).key()),
            None => self.tree.alloc(directory).key(),
        };
        let child = self.tree.get(node_key);
        self.tree.link(&parent, &child, name)?;
        self.objects.entry(node_key).or_insert(new.node);
        let (ino, generation, _) = self.inodes.register(node_key, content_key, new.persistent);
        let mut attr = new.attr;
        attr.ino = ino.into();
        Ok(Entry {
            ino: ino.into(),
            generation: generation.into(),
            attr,
            entry_ttl: self.timeouts.entry_timeout,
            attr_ttl: self.timeouts.attr_timeout,
        })
    }

    /// Forget an id may leave a node with no parent edges and no remaining lookup count; once
    /// both are true it is unreachable and its arena slot is tombstoned.
    fn maybe_tombstone(&self, key: NodeKey) {
        if self.inodes.ino_of(key).is_some() {
            return;
        }
        let node = self.tree.get(key);
        if self.tree.parent_edges(&node).is_empty() {
            self.tree.tombstone(&node);
            self.objects.remove(&key);
        }
    }

    // ---- the kernel-facing entry point ------------------------------------------------

    /// Parse one framed request out of `data` and dispatch it, writing its reply (if any)
    /// through `sender`. Malformed frames are dropped with a warning: there's no unique id to
    /// reply to.
    pub(crate) fn handle(&self, data: &[u8], sender: impl crate::reply::ReplySender) {
        let request = match Request::try_from(data) {
            Ok(r) => r,
            Err(err) => {
                warn!("dropping unparsable FUSE request: {err}");
                return;
            }
        };
        if self.debug {
            trace!("{request}");
        }
        let unique = request.unique();
        let reply = ReplyHandler::new(unique, sender);
        let signal = self.cancel.register(unique);
        let ctx = RequestContext::new(unique, request.uid(), request.gid(), request.pid());
        let call = Call::new(ctx, signal, None);
        self.dispatch(&request, &call, reply);
        self.cancel.complete(unique);
    }

    fn dispatch(&self, request: &Request<'_>, call: &Call, reply: ReplyHandler) {
        let nodeid = request.nodeid();
        match request.operation() {
            Operation::Init(op) => reply.data(&self.init_reply(op.arg)),
            Operation::Destroy(_) => reply.ok(),
            Operation::Lookup(op) => self.finish_lookup(call, nodeid, op.name, reply),
            Operation::Forget(op) => {
                self.forget(nodeid, op.arg.nlookup);
                reply.no_reply();
            }
            #[cfg(feature = "abi-7-16")]
            Operation::BatchForget(op) => {
                for node in crate::forget_one::ForgetOne::slice_from_inner(op.nodes) {
                    self.forget(node.nodeid(), node.nlookup());
                }
                reply.no_reply();
            }
            Operation::GetAttr(_) => finish(reply, self.getattr(call, nodeid), |r, (a, ttl)| r.attr(a, ttl)),
            Operation::SetAttr(op) => {
                let req = setattr_request(op.arg);
                finish(reply, self.setattr(call, nodeid, req), |r, (a, ttl)| r.attr(a, ttl))
            }
            Operation::ReadLink(_) => finish(reply, self.readlink(call, nodeid), |r, target| {
                r.data(os_str_bytes(&target))
            }),
            Operation::SymLink(op) => finish(
                reply,
                self.symlink(call, nodeid, op.name, op.link),
                |r, e| r.entry(e),
            ),
            Operation::MkNod(op) => finish(
                reply,
                self.mknod(call, nodeid, op.name, op.arg.mode, op.arg.rdev),
                |r, e| r.entry(e),
            ),
            Operation::MkDir(op) => finish(
                reply,
                self.mkdir(call, nodeid, op.name, op.arg.mode),
                |r, e| r.entry(e),
            ),
            Operation::Unlink(op) => finish(reply, self.unlink(call, nodeid, op.name, false), |r, ()| r.ok()),
            Operation::RmDir(op) => finish(reply, self.unlink(call, nodeid, op.name, true), |r, ()| r.ok()),
            Operation::Rename(op) => finish(
                reply,
                self.rename(call, nodeid, op.name, INodeNo(op.arg.newdir), op.newname, RenameFlags::empty()),
                |r, ()| r.ok(),
            ),
            #[cfg(feature = "abi-7-23")]
            Operation::Rename2(op) => finish(
                reply,
                self.rename(
                    call,
                    nodeid,
                    op.name,
                    INodeNo(op.arg.newdir),
                    op.newname,
                    RenameFlags::from_bits_truncate(op.arg.flags),
                ),
                |r, ()| r.ok(),
            ),
            Operation::Link(op) => finish(
                reply,
                self.link(call, nodeid, INodeNo(op.arg.oldnodeid), op.name),
                |r, e| r.entry(e),
            ),
            Operation::Open(op) => finish(reply, self.open(call, nodeid, op.arg.flags), |r, o| r.opened(o)),
            Operation::Read(op) => finish(
                reply,
                self.read(call, FileHandle(op.arg.fh), op.arg.offset, op.arg.size),
                |r, data| r.data(&data),
            ),
            Operation::Write(op) => finish(
                reply,
                self.write(call, FileHandle(op.arg.fh), op.arg.offset, op.data),
                |r, n| r.written(n),
            ),
            Operation::Flush(op) => finish(reply, self.flush(call, FileHandle(op.arg.fh)), |r, ()| r.ok()),
            Operation::Release(op) => finish(reply, self.release(call, FileHandle(op.arg.fh)), |r, ()| r.ok()),
            Operation::FSync(op) => finish(
                reply,
                self.fsync(call, FileHandle(op.arg.fh), op.arg.fsync_flags & 1 != 0),
                |r, ()| r.ok(),
            ),
            Operation::OpenDir(op) => finish(reply, self.opendir(call, nodeid, op.arg.flags), |r, o| r.opened(o)),
            Operation::ReadDir(op) => finish(
                reply,
                self.readdir(call, nodeid, FileHandle(op.arg.fh)),
                |r, entries| r.dir(&entries, op.arg.offset, op.arg.size as usize),
            ),
            #[cfg(feature = "abi-7-21")]
            Operation::ReadDirPlus(op) => finish(
                reply,
                self.readdirplus(call, nodeid, FileHandle(op.arg.fh)),
                |r, entries| r.dirplus(&entries, op.arg.offset, op.arg.size as usize),
            ),
            Operation::ReleaseDir(op) => {
                finish(reply, self.release(call, FileHandle(op.arg.fh)), |r, ()| r.ok())
            }
            Operation::FSyncDir(op) => finish(
                reply,
                self.fsync(call, FileHandle(op.arg.fh), op.arg.fsync_flags & 1 != 0),
                |r, ()| r.ok(),
            ),
            Operation::StatFs(_) => finish(reply, self.statfs(call), |r, s| r.statfs(s)),
            Operation::SetXAttr(op) => finish(
                reply,
                self.setxattr(call, nodeid, op.name, op.value, op.arg.flags),
                |r, ()| r.ok(),
            ),
            Operation::GetXAttr(op) => finish(reply, self.getxattr(call, nodeid, op.name, op.arg.size), |r, x| {
                reply_xattr(r, x)
            }),
            Operation::ListXAttr(op) => finish(reply, self.listxattr(call, nodeid, op.arg.size), |r, x| {
                reply_xattr(r, x)
            }),
            Operation::RemoveXAttr(op) => finish(reply, self.removexattr(call, nodeid, op.name), |r, ()| r.ok()),
            Operation::Access(op) => {
                // Matches libfuse's own default for filesystems without an `access`
                // implementation: permission checking is left entirely to `getattr`-derived
                // mode bits at the VFS layer, so the call always succeeds here.
                let _ = op;
                reply.ok()
            }
            Operation::Create(op) => finish(
                reply,
                self.create(call, nodeid, op.name, op.arg.mode, op.arg.flags),
                |r, (e, o)| r.created(e, o),
            ),
            Operation::GetLk(op) => finish(
                reply,
                self.getlk(call, FileHandle(op.arg.fh), op.arg.owner, lock_from_arg(&op.arg.lk)),
                |r, l| r.locked(l),
            ),
            Operation::SetLk(op) => finish(
                reply,
                self.setlk(call, FileHandle(op.arg.fh), op.arg.owner, lock_from_arg(&op.arg.lk), false),
                |r, ()| r.ok(),
            ),
            Operation::SetLkW(op) => finish(
                reply,
                self.setlk(call, FileHandle(op.arg.fh), op.arg.owner, lock_from_arg(&op.arg.lk), true),
                |r, ()| r.ok(),
            ),
            Operation::Interrupt(op) => {
                self.cancel.interrupt(RequestId(op.arg.unique));
                reply.no_reply();
            }
            Operation::BMap(_) => reply.error(Error::NotSupported),
            #[cfg(feature = "abi-7-19")]
            Operation::FAllocate(op) => finish(
                reply,
                self.fallocate(call, FileHandle(op.arg.fh), op.arg.offset, op.arg.length, op.arg.mode),
                |r, ()| r.ok(),
            ),
            #[cfg(feature = "abi-7-24")]
            Operation::Lseek(op) => finish(
                reply,
                self.lseek(call, FileHandle(op.arg.fh), op.arg.offset, op.arg.whence),
                |r, off| r.lseek(off),
            ),
            #[cfg(feature = "abi-7-28")]
            Operation::CopyFileRange(op) => finish(
                reply,
                self.copy_file_range(
                    call,
                    FileHandle(op.arg.fh_in),
                    op.arg.off_in,
                    INodeNo(op.arg.nodeid_out),
                    FileHandle(op.arg.fh_out),
                    op.arg.off_out,
                    op.arg.len,
                ),
                |r, n| r.written(n),
            ),
            // POLL/IOCTL, the notify-reply half of server-initiated invalidation, and the
            // macOS/CUSE-only opcodes are out of scope (see SPEC_FULL.md's scope notes);
            // report them the same way a real kernel build without those opcodes would see an
            // old filesystem respond.
            _ => reply.error(Error::NotSupported),
        }
    }

    fn init_reply(&self, arg: &fuse_abi::fuse_init_in) -> Vec<u8> {
        let wanted = InitFlags::from_bits_truncate(u64::from(arg.flags));
        let negotiated = wanted
            & (InitFlags::FUSE_ASYNC_READ
                | InitFlags::FUSE_BIG_WRITES
                | InitFlags::FUSE_DO_READDIRPLUS
                | InitFlags::FUSE_READDIRPLUS_AUTO
                | InitFlags::FUSE_ATOMIC_O_TRUNC
                | InitFlags::FUSE_AUTO_INVAL_DATA
                | InitFlags::FUSE_PARALLEL_DIROPS
                | InitFlags::FUSE_HANDLE_KILLPRIV);
        let (flags, _flags2) = negotiated.pair();
        let out = fuse_abi::fuse_init_out {
            major: fuse_abi::FUSE_KERNEL_VERSION,
            minor: fuse_abi::FUSE_KERNEL_MINOR_VERSION,
            max_readahead: arg.max_readahead.min(MAX_READAHEAD),
            flags,
            max_background: MAX_BACKGROUND,
            congestion_threshold: CONGESTION_THRESHOLD,
            max_write: MAX_WRITE_SIZE,
            #[cfg(feature = "abi-7-23")]
            time_gran: 1,
            #[cfg(all(feature = "abi-7-23", not(feature = "abi-7-28")))]
            reserved: [0; 9],
            #[cfg(feature = "abi-7-28")]
            max_pages: ((MAX_WRITE_SIZE as usize).div_ceil(page_size::get()) as u16).max(1),
            #[cfg(feature = "abi-7-28")]
            unused2: 0,
            #[cfg(all(feature = "abi-7-28", not(feature = "abi-7-36")))]
            reserved: [0; 8],
            #[cfg(feature = "abi-7-36")]
            flags2: _flags2,
            #[cfg(all(feature = "abi-7-36", not(feature = "abi-7-40")))]
            reserved: [0; 7],
            #[cfg(feature = "abi-7-40")]
            max_stack_depth: 1,
            #[cfg(feature = "abi-7-40")]
            reserved: [0; 6],
        };
        out.as_bytes().to_vec()
    }

    // ---- namespace ---------------------------------------------------------------------

    /// `LOOKUP` is handled outside [`finish`] because a miss isn't just an error reply: if
    /// `self.timeouts.negative_entry_timeout` is set, the kernel should cache the ENOENT
    /// rather than re-asking on every subsequent lookup of the same name.
    fn finish_lookup(&self, call: &Call, parent: INodeNo, name: &OsStr, reply: ReplyHandler) {
        match self.lookup(call, parent, name) {
            Ok(entry) => reply.entry(entry),
            Err(Error::NotFound) => reply.negative_entry(self.timeouts.negative_entry_timeout),
            Err(err) => reply.error(err),
        }
    }

    fn lookup(&self, call: &Call, parent: INodeNo, name: &OsStr) -> Result<Entry> {
        let (parent_key, parent_node) = self.resolve(parent)?;
        if let Some(existing) = self.tree.lookup(parent_key, name) {
            let node = self.node(existing.key())?;
            let attr = node.getattr(call)?;
            let (ino, generation, _) = self.inodes.register(existing.key(), node.content_key(), false);
            return Ok(Entry {
                ino: ino.into(),
                generation: generation.into(),
                attr,
                entry_ttl: self.timeouts.entry_timeout,
                attr_ttl: self.timeouts.attr_timeout,
            });
        }
        let lookup = parent_node.as_lookup().ok_or(Error::NotFound)?;
        let child = lookup.lookup(call, name)?;
        self.insert_child(parent_key, name, child)
    }

    fn forget(&self, ino: INodeNo, nlookup: u64) {
        let Some(key) = self.inodes.peek(ino) else {
            return;
        };
        if self.inodes.forget(ino, nlookup) {
            self.maybe_tombstone(key);
        }
    }

    fn getattr(&self, call: &Call, ino: INodeNo) -> Result<(FileAttr, Duration)> {
        let (_, node) = self.resolve(ino)?;
        Ok((node.getattr(call)?, self.timeouts.attr_timeout))
    }

    fn setattr(&self, call: &Call, ino: INodeNo, req: SetAttrRequest) -> Result<(FileAttr, Duration)> {
        let (_, node) = self.resolve(ino)?;
        let mutable = node.as_mutable().ok_or(Error::ReadOnly)?;
        Ok((mutable.setattr(call, req)?, self.timeouts.attr_timeout))
    }

    fn readlink(&self, call: &Call, ino: INodeNo) -> Result<OsString> {
        let (_, node) = self.resolve(ino)?;
        node.as_mutable().ok_or(Error::InvalidArgument)?.readlink(call)
    }

    fn symlink(&self, call: &Call, parent: INodeNo, name: &OsStr, target: &OsStr) -> Result<Entry> {
        let (parent_key, node) = self.resolve(parent)?;
        let child = node.as_mutable().ok_or(Error::ReadOnly)?.symlink(call, name, target)?;
        self.insert_child(parent_key, name, child)
    }

    fn mknod(&self, call: &Call, parent: INodeNo, name: &OsStr, mode: u32, rdev: u32) -> Result<Entry> {
        let (parent_key, node) = self.resolve(parent)?;
        let child = node.as_mutable().ok_or(Error::ReadOnly)?.mknod(call, name, mode, rdev)?;
        self.insert_child(parent_key, name, child)
    }

    fn mkdir(&self, call: &Call, parent: INodeNo, name: &OsStr, mode: u32) -> Result<Entry> {
        let (parent_key, node) = self.resolve(parent)?;
        let child = node.as_mutable().ok_or(Error::ReadOnly)?.mkdir(call, name, mode)?;
        self.insert_child(parent_key, name, child)
    }

    fn create(&self, call: &Call, parent: INodeNo, name: &OsStr, mode: u32, flags: i32) -> Result<(Entry, Open)> {
        let (parent_key, node) = self.resolve(parent)?;
        let (child, open) = node.as_mutable().ok_or(Error::ReadOnly)?.create(call, name, mode, flags)?;
        let entry = self.insert_child(parent_key, name, child)?;
        let (entry_key, _) = self.resolve(INodeNo(entry.ino))?;
        let kind = HandleKind::File;
        let fh = self.handles.allocate(entry_key, INodeNo(entry.ino), kind, open.fh);
        Ok((entry, Open { fh: fh.into(), flags: open.flags }))
    }

    fn unlink(&self, call: &Call, parent: INodeNo, name: &OsStr, is_dir: bool) -> Result<()> {
        let (parent_key, node) = self.resolve(parent)?;
        let mutable = node.as_mutable().ok_or(Error::ReadOnly)?;
        if is_dir {
            mutable.rmdir(call, name)?;
        } else {
            mutable.unlink(call, name)?;
        }
        let parent_arena = self.tree.get(parent_key);
        let child = self.tree.unlink(&parent_arena, name, !is_dir)?;
        if self.tree.parent_edges(&child).is_empty() {
            self.maybe_tombstone(child.key());
        }
        Ok(())
    }

    fn rename(
        &self,
        call: &Call,
        parent: INodeNo,
        name: &OsStr,
        new_parent: INodeNo,
        new_name: &OsStr,
        flags: RenameFlags,
    ) -> Result<()> {
        let (parent_key, parent_node) = self.resolve(parent)?;
        let (new_parent_key, new_parent_node) = self.resolve(new_parent)?;
        let mutable = parent_node.as_mutable().ok_or(Error::ReadOnly)?;
        mutable.rename(call, name, new_parent_node.as_ref(), new_name, flags)?;
        self.tree.with_two_nodes(parent_key, new_parent_key, |p, np, locks| {
            rename_edges(&self.tree, p, np, locks, name, new_name, flags)
        })
    }

    fn link(&self, call: &Call, new_parent: INodeNo, existing: INodeNo, new_name: &OsStr) -> Result<Entry> {
        let (parent_key, parent_node) = self.resolve(new_parent)?;
        let (_, existing_node) = self.resolve(existing)?;
        let linker = parent_node.as_linker().ok_or(Error::ReadOnly)?;
        let child = linker.link(call, &existing_node, new_name)?;
        self.insert_child(parent_key, new_name, child)
    }

    // ---- file/dir I/O -------------------------------------------------------------------

    fn open(&self, call: &Call, ino: INodeNo, flags: i32) -> Result<Open> {
        let (key, node) = self.resolve(ino)?;
        let open = node.as_file_io().ok_or(Error::NotSupported)?.open(call, flags)?;
        let fh = self.handles.allocate(key, ino, HandleKind::File, open.fh);
        Ok(Open { fh: fh.into(), flags: open.flags })
    }

    fn opendir(&self, call: &Call, ino: INodeNo, flags: i32) -> Result<Open> {
        let (key, node) = self.resolve(ino)?;
        let open = node.as_dir_io().ok_or(Error::NotSupported)?.opendir(call, flags)?;
        let fh = self.handles.allocate(key, ino, HandleKind::Directory, open.fh);
        Ok(Open { fh: fh.into(), flags: open.flags })
    }

    fn read(&self, call: &Call, fh: FileHandle, offset: i64, size: u32) -> Result<Vec<u8>> {
        let (key, _, kind, handler_fh, _guard) = self.handles.begin(fh).ok_or(Error::Stale)?;
        if kind != HandleKind::File {
            return Err(Error::InvalidArgument);
        }
        let node = self.node(key)?;
        node.as_file_io().ok_or(Error::NotSupported)?.read(call, handler_fh, offset, size)
    }

    fn write(&self, call: &Call, fh: FileHandle, offset: i64, data: &[u8]) -> Result<u32> {
        let (key, _, kind, handler_fh, _guard) = self.handles.begin(fh).ok_or(Error::Stale)?;
        if kind != HandleKind::File {
            return Err(Error::InvalidArgument);
        }
        let node = self.node(key)?;
        node.as_file_io().ok_or(Error::ReadOnly)?.write(call, handler_fh, offset, data)
    }

    fn flush(&self, call: &Call, fh: FileHandle) -> Result<()> {
        let (key, _, kind, handler_fh, _guard) = self.handles.begin(fh).ok_or(Error::Stale)?;
        if kind != HandleKind::File {
            return Ok(());
        }
        self.node(key)?.as_file_io().ok_or(Error::NotSupported)?.flush(call, handler_fh)
    }

    fn release(&self, call: &Call, fh: FileHandle) -> Result<()> {
        let Some((key, kind, handler_fh)) = self.handles.release(fh) else {
            return Err(Error::Stale);
        };
        let node = self.node(key)?;
        match kind {
            HandleKind::File => {
                if let Some(file) = node.as_file_io() {
                    return file.release(call, handler_fh);
                }
            }
            HandleKind::Directory => {
                if let Some(dir) = node.as_dir_io() {
                    return dir.releasedir(call, handler_fh);
                }
            }
        }
        Ok(())
    }

    fn fsync(&self, call: &Call, fh: FileHandle, datasync: bool) -> Result<()> {
        let (key, _, kind, handler_fh, _guard) = self.handles.begin(fh).ok_or(Error::Stale)?;
        let node = self.node(key)?;
        match kind {
            HandleKind::File => node.as_file_io().ok_or(Error::NotSupported)?.fsync(call, handler_fh, datasync),
            HandleKind::Directory => node
                .as_dir_io()
                .ok_or(Error::NotSupported)?
                .fsyncdir(call, handler_fh, datasync),
        }
    }

    fn readdir(&self, call: &Call, ino: INodeNo, fh: FileHandle) -> Result<Vec<DirEntry>> {
        let (key, _, kind, handler_fh, _guard) = self.handles.begin(fh).ok_or(Error::Stale)?;
        if kind != HandleKind::Directory {
            return Err(Error::NotADirectory);
        }
        let _ = ino;
        self.node(key)?.as_dir_io().ok_or(Error::NotSupported)?.readdir(call, handler_fh)
    }

    fn readdirplus(&self, call: &Call, ino: INodeNo, fh: FileHandle) -> Result<Vec<DirEntryPlus>> {
        let entries = self.readdir(call, ino, fh)?;
        let mut plus = Vec::with_capacity(entries.len());
        for entry in entries {
            let looked_up = self.lookup(call, ino, &entry.name)?;
            plus.push(DirEntryPlus {
                ino: INodeNo(looked_up.ino),
                generation: Generation(looked_up.generation),
                kind: entry.kind,
                name: entry.name,
                attr: looked_up.attr,
                attr_valid: looked_up.attr_ttl,
                entry_valid: looked_up.entry_ttl,
            });
        }
        Ok(plus)
    }

    fn statfs(&self, call: &Call) -> Result<Statfs> {
        let root = self.node(NodeKey::ROOT)?;
        root.as_filesystem_root().ok_or(Error::NotSupported)?.statfs(call)
    }

    fn setxattr(&self, call: &Call, ino: INodeNo, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        let (_, node) = self.resolve(ino)?;
        node.as_xattr_io().ok_or(Error::NotImplemented)?.setxattr(call, name, value, flags)
    }

    fn getxattr(&self, call: &Call, ino: INodeNo, name: &OsStr, size: u32) -> Result<Xattr> {
        let (_, node) = self.resolve(ino)?;
        node.as_xattr_io().ok_or(Error::NotImplemented)?.getxattr(call, name, size)
    }

    fn listxattr(&self, call: &Call, ino: INodeNo, size: u32) -> Result<Xattr> {
        let (_, node) = self.resolve(ino)?;
        node.as_xattr_io().ok_or(Error::NotImplemented)?.listxattr(call, size)
    }

    fn removexattr(&self, call: &Call, ino: INodeNo, name: &OsStr) -> Result<()> {
        let (_, node) = self.resolve(ino)?;
        node.as_xattr_io().ok_or(Error::NotImplemented)?.removexattr(call, name)
    }

    fn getlk(&self, call: &Call, fh: FileHandle, owner: u64, lock: LockReply) -> Result<LockReply> {
        let (key, _, _, handler_fh, _guard) = self.handles.begin(fh).ok_or(Error::Stale)?;
        self.node(key)?.as_locking().ok_or(Error::NotSupported)?.getlk(call, handler_fh, owner, lock)
    }

    fn setlk(&self, call: &Call, fh: FileHandle, owner: u64, lock: LockReply, sleep: bool) -> Result<()> {
        let (key, _, _, handler_fh, _guard) = self.handles.begin(fh).ok_or(Error::Stale)?;
        self.node(key)?
            .as_locking()
            .ok_or(Error::NotSupported)?
            .setlk(call, handler_fh, owner, lock, sleep)
    }

    fn fallocate(&self, call: &Call, fh: FileHandle, offset: i64, length: i64, mode: i32) -> Result<()> {
        let (key, _, _, handler_fh, _guard) = self.handles.begin(fh).ok_or(Error::Stale)?;
        self.node(key)?
            .as_file_io()
            .ok_or(Error::NotSupported)?
            .fallocate(call, handler_fh, offset, length, mode)
    }

    fn lseek(&self, call: &Call, fh: FileHandle, offset: i64, whence: i32) -> Result<i64> {
        let (key, _, _, handler_fh, _guard) = self.handles.begin(fh).ok_or(Error::Stale)?;
        self.node(key)?.as_file_io().ok_or(Error::NotSupported)?.lseek(call, handler_fh, offset, whence)
    }

    fn copy_file_range(
        &self,
        call: &Call,
        fh_in: FileHandle,
        offset_in: i64,
        ino_out: INodeNo,
        fh_out: FileHandle,
        offset_out: i64,
        len: u64,
    ) -> Result<u32> {
        let (key_in, _, _, handler_fh_in, _guard_in) = self.handles.begin(fh_in).ok_or(Error::Stale)?;
        let (key_out, _, _, handler_fh_out, _guard_out) = self.handles.begin(fh_out).ok_or(Error::Stale)?;
        let _ = ino_out;
        let src = self.node(key_in)?;
        let dst = self.node(key_out)?;
        let src_io = src.as_file_io().ok_or(Error::NotSupported)?;
        let dst_io = dst.as_file_io().ok_or(Error::NotSupported)?;
        src_io.copy_file_range(call, handler_fh_in, offset_in, dst_io, handler_fh_out, offset_out, len)
    }
}

fn finish<T>(reply: ReplyHandler, result: Result<T>, on_ok: impl FnOnce(ReplyHandler, T)) {
    match result {
        Ok(value) => on_ok(reply, value),
        Err(err) => reply.error(err),
    }
}

fn reply_xattr(reply: ReplyHandler, value: Xattr) {
    match value {
        Xattr::Size(size) => reply.xattr_size(size),
        Xattr::Data(data) => reply.xattr_data(&data),
    }
}

fn os_str_bytes(s: &OsStr) -> &[u8] {
    use std::os::unix::ffi::OsStrExt;
    s.as_bytes()
}

fn lock_from_arg(lk: &fuse_abi::fuse_file_lock) -> LockReply {
    LockReply { start: lk.start, end: lk.end, typ: lk.typ, pid: lk.pid }
}

fn system_time_from_secs_nsecs(secs: i64, nsecs: u32) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0) + Duration::new(0, nsecs)
    }
}

fn setattr_request(arg: &fuse_abi::fuse_setattr_in) -> SetAttrRequest {
    let valid = FattrFlags::from_bits_truncate(arg.valid);
    SetAttrRequest {
        mode: valid.contains(FattrFlags::FATTR_MODE).then_some(arg.mode),
        uid: valid.contains(FattrFlags::FATTR_UID).then_some(arg.uid),
        gid: valid.contains(FattrFlags::FATTR_GID).then_some(arg.gid),
        size: valid.contains(FattrFlags::FATTR_SIZE).then_some(arg.size),
        atime: valid.contains(FattrFlags::FATTR_ATIME).then(|| {
            if arg.atime_now() {
                TimeOrNow::Now
            } else {
                TimeOrNow::SpecificTime(system_time_from_secs_nsecs(arg.atime, arg.atimensec))
            }
        }),
        mtime: valid.contains(FattrFlags::FATTR_MTIME).then(|| {
            if arg.mtime_now() {
                TimeOrNow::Now
            } else {
                TimeOrNow::SpecificTime(system_time_from_secs_nsecs(arg.mtime, arg.mtimensec))
            }
        }),
        ctime: ctime_field(arg, valid),
        fh: valid.contains(FattrFlags::FATTR_FH).then_some(arg.fh),
        flags: None,
    }
}

#[cfg(feature = "abi-7-23")]
fn ctime_field(arg: &fuse_abi::fuse_setattr_in, valid: FattrFlags) -> Option<SystemTime> {
    valid
        .contains(FattrFlags::FATTR_CTIME)
        .then(|| system_time_from_secs_nsecs(arg.ctime, arg.ctimensec))
}

#[cfg(not(feature = "abi-7-23"))]
fn ctime_field(_arg: &fuse_abi::fuse_setattr_in, _valid: FattrFlags) -> Option<SystemTime> {
    None
}

/// Move `name` from `p` to `new_name` under `np`, honouring `RENAME_EXCHANGE`/`RENAME_NOREPLACE`.
/// Runs with both directories' states already locked via `locks` (held by the caller's
/// [`NodeTree::with_two_nodes`] for this whole call), so a concurrent [`NodeTree::lookup`]
/// can never observe a moment where neither `p/name` nor `np/new_name` resolves.
fn rename_edges(
    tree: &NodeTree,
    p: &ArenaNode,
    np: &ArenaNode,
    locks: &mut TwoNodeLocks<'_>,
    name: &OsStr,
    new_name: &OsStr,
    flags: RenameFlags,
) -> Result<()> {
    if flags.contains(RenameFlags::RENAME_EXCHANGE) {
        let a = tree.unlink_locked(p, locks.state_a(), name, true)?;
        let b = tree.unlink_locked(np, locks.state_b(), new_name, true)?;
        tree.link_locked(np, locks.state_b(), &a, new_name)?;
        tree.link_locked(p, locks.state_a(), &b, name)?;
        return Ok(());
    }
    if flags.contains(RenameFlags::RENAME_NOREPLACE)
        && NodeTree::lookup_locked(locks.state_b(), new_name).is_some()
    {
        return Err(Error::AlreadyExists);
    }
    let child = tree.unlink_locked(p, locks.state_a(), name, true)?;
    // Replacing an existing target: the handler's own `rename` call already authorized this
    // (or rejected it, e.g. a non-empty directory target), so the tree edge is just dropped.
    let _ = tree.unlink_locked(np, locks.state_b(), new_name, true);
    tree.link_locked(np, locks.state_b(), &child, new_name)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{FilesystemRoot, Linker, Lookup, Mutable, NewChild};
    use crate::reply::FileType;
    use std::sync::Mutex;

    /// A minimal in-memory tree used to exercise the dispatcher end to end: a root directory
    /// that can hold child files created by `MKNOD`, and plain files that support `read`/`write`.
    struct MemDir {
        children: Mutex<Vec<(OsString, Arc<dyn Node>)>>,
    }

    struct MemFile {
        data: Mutex<Vec<u8>>,
    }

    impl Node for MemDir {
        fn getattr(&self, _ctx: &Call) -> Result<FileAttr> {
            Ok(dir_attr())
        }
        fn as_lookup(&self) -> Option<&dyn Lookup> {
            Some(self)
        }
        fn as_mutable(&self) -> Option<&dyn Mutable> {
            Some(self)
        }
        fn as_filesystem_root(&self) -> Option<&dyn FilesystemRoot> {
            Some(self)
        }
        fn as_linker(&self) -> Option<&dyn Linker> {
            Some(self)
        }
    }

    impl Linker for MemDir {
        fn link(&self, ctx: &Call, existing: &Arc<dyn Node>, name: &OsStr) -> Result<NewChild> {
            let attr = existing.getattr(ctx)?;
            self.children.lock().unwrap().push((name.to_owned(), existing.clone()));
            Ok(NewChild::new(existing.clone(), attr))
        }
    }

    impl Lookup for MemDir {
        fn lookup(&self, ctx: &Call, name: &OsStr) -> Result<NewChild> {
            let children = self.children.lock().unwrap();
            let (_, node) = children.iter().find(|(n, _)| n == name).ok_or(Error::NotFound)?;
            Ok(NewChild::new(node.clone(), node.getattr(ctx)?))
        }
    }

    impl Mutable for MemDir {
        fn setattr(&self, _ctx: &Call, _attr: SetAttrRequest) -> Result<FileAttr> {
            Ok(dir_attr())
        }
        fn mknod(&self, _ctx: &Call, name: &OsStr, _mode: u32, _rdev: u32) -> Result<NewChild> {
            let file: Arc<dyn Node> = Arc::new(MemFile { data: Mutex::new(Vec::new()) });
            self.children.lock().unwrap().push((name.to_owned(), file.clone()));
            Ok(NewChild::new(file, file_attr(0)))
        }
        fn mkdir(&self, _ctx: &Call, _name: &OsStr, _mode: u32) -> Result<NewChild> {
            Err(Error::NotSupported)
        }
        fn create(&self, ctx: &Call, name: &OsStr, mode: u32, _flags: i32) -> Result<(NewChild, Open)> {
            let child = self.mknod(ctx, name, mode, 0)?;
            Ok((child, Open { fh: 0, flags: FopenFlags::empty() }))
        }
        fn symlink(&self, _ctx: &Call, _name: &OsStr, _target: &OsStr) -> Result<NewChild> {
            Err(Error::NotSupported)
        }
        fn unlink(&self, _ctx: &Call, name: &OsStr) -> Result<()> {
            let mut children = self.children.lock().unwrap();
            let before = children.len();
            children.retain(|(n, _)| n != name);
            if children.len() == before { Err(Error::NotFound) } else { Ok(()) }
        }
        fn rmdir(&self, _ctx: &Call, _name: &OsStr) -> Result<()> {
            Err(Error::NotADirectory)
        }
        fn rename(
            &self,
            _ctx: &Call,
            _name: &OsStr,
            _new_parent: &dyn Node,
            _new_name: &OsStr,
            _flags: RenameFlags,
        ) -> Result<()> {
            Ok(())
        }
    }

    impl FilesystemRoot for MemDir {
        fn statfs(&self, _ctx: &Call) -> Result<Statfs> {
            Ok(Statfs { blocks: 1, bfree: 1, bavail: 1, files: 1, ffree: 1, bsize: 512, namelen: 255, frsize: 512 })
        }
    }

    impl Node for MemFile {
        fn getattr(&self, _ctx: &Call) -> Result<FileAttr> {
            Ok(file_attr(self.data.lock().unwrap().len()))
        }
        fn as_file_io(&self) -> Option<&dyn crate::handler::FileIo> {
            Some(self)
        }
    }

    impl crate::handler::FileIo for MemFile {
        fn open(&self, _ctx: &Call, _flags: i32) -> Result<Open> {
            Ok(Open { fh: 0, flags: FopenFlags::empty() })
        }
        fn read(&self, _ctx: &Call, _fh: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
            let data = self.data.lock().unwrap();
            let start = (offset as usize).min(data.len());
            let end = (start + size as usize).min(data.len());
            Ok(data[start..end].to_vec())
        }
        fn write(&self, _ctx: &Call, _fh: u64, offset: i64, buf: &[u8]) -> Result<u32> {
            let mut data = self.data.lock().unwrap();
            let start = offset as usize;
            if data.len() < start + buf.len() {
                data.resize(start + buf.len(), 0);
            }
            data[start..start + buf.len()].copy_from_slice(buf);
            Ok(buf.len() as u32)
        }
    }

    fn dir_attr() -> FileAttr {
        FileAttr {
            ino: 1,
            size: 0,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn file_attr(size: usize) -> FileAttr {
        FileAttr { kind: FileType::RegularFile, size: size as u64, perm: 0o644, nlink: 1, ..dir_attr() }
    }

    fn call() -> Call {
        Call::new(RequestContext::new(RequestId(1), 0, 0, 0), Default::default(), None)
    }

    fn bridge() -> Bridge {
        let root = Arc::new(MemDir { children: Mutex::new(Vec::new()) });
        Bridge::new(root, MountConfig::default())
    }

    #[test]
    fn lookup_of_unknown_name_is_not_found() {
        let b = bridge();
        assert_eq!(b.lookup(&call(), INodeNo::ROOT, OsStr::new("missing")), Err(Error::NotFound));
    }

    #[test]
    fn mknod_then_lookup_resolve_the_same_node() {
        let b = bridge();
        let root = b.node(NodeKey::ROOT).unwrap();
        root.as_mutable().unwrap().mknod(&call(), OsStr::new("a"), 0o644, 0).unwrap();
        let entry = b.lookup(&call(), INodeNo::ROOT, OsStr::new("a")).unwrap();
        assert_eq!(entry.attr.kind, FileType::RegularFile);
        // A second lookup resolves through the tree cache, not the handler, and agrees.
        let again = b.lookup(&call(), INodeNo::ROOT, OsStr::new("a")).unwrap();
        assert_eq!(entry.ino, again.ino);
    }

    #[test]
    fn write_then_read_round_trips_through_a_handle() {
        let b = bridge();
        let root = b.node(NodeKey::ROOT).unwrap();
        root.as_mutable().unwrap().mknod(&call(), OsStr::new("a"), 0o644, 0).unwrap();
        let entry = b.lookup(&call(), INodeNo::ROOT, OsStr::new("a")).unwrap();
        let open = b.open(&call(), INodeNo(entry.ino), 0).unwrap();
        let fh = FileHandle::from(open.fh);
        assert_eq!(b.write(&call(), fh, 0, b"hello").unwrap(), 5);
        assert_eq!(b.read(&call(), fh, 0, 5).unwrap(), b"hello");
    }

    #[test]
    fn unlink_removes_the_tree_edge() {
        let b = bridge();
        let root = b.node(NodeKey::ROOT).unwrap();
        root.as_mutable().unwrap().mknod(&call(), OsStr::new("a"), 0o644, 0).unwrap();
        b.lookup(&call(), INodeNo::ROOT, OsStr::new("a")).unwrap();
        b.unlink(&call(), INodeNo::ROOT, OsStr::new("a"), false).unwrap();
        assert_eq!(b.lookup(&call(), INodeNo::ROOT, OsStr::new("a")), Err(Error::NotFound));
    }

    #[test]
    fn forget_without_outstanding_parent_edge_tombstones_the_node() {
        let b = bridge();
        let root = b.node(NodeKey::ROOT).unwrap();
        root.as_mutable().unwrap().mknod(&call(), OsStr::new("a"), 0o644, 0).unwrap();
        let entry = b.lookup(&call(), INodeNo::ROOT, OsStr::new("a")).unwrap();
        b.unlink(&call(), INodeNo::ROOT, OsStr::new("a"), false).unwrap();
        b.forget(INodeNo(entry.ino), 1);
        assert!(b.inodes.peek(INodeNo(entry.ino)).is_none());
    }

    #[test]
    fn statfs_reaches_the_root() {
        let b = bridge();
        let statfs = b.statfs(&call()).unwrap();
        assert_eq!(statfs.bsize, 512);
    }

    #[test]
    fn link_resolves_to_the_same_inode_from_either_name() {
        let b = bridge();
        let root = b.node(NodeKey::ROOT).unwrap();
        root.as_mutable().unwrap().mknod(&call(), OsStr::new("a"), 0o644, 0).unwrap();
        let a = b.lookup(&call(), INodeNo::ROOT, OsStr::new("a")).unwrap();

        let linked = b.link(&call(), INodeNo::ROOT, INodeNo(a.ino), OsStr::new("b")).unwrap();
        assert_eq!(linked.ino, a.ino);

        let b_entry = b.lookup(&call(), INodeNo::ROOT, OsStr::new("b")).unwrap();
        assert_eq!(b_entry.ino, a.ino);
    }

    #[test]
    fn rename_moves_the_name_without_disturbing_the_inode() {
        let b = bridge();
        let root = b.node(NodeKey::ROOT).unwrap();
        root.as_mutable().unwrap().mknod(&call(), OsStr::new("hello"), 0o644, 0).unwrap();
        let before = b.lookup(&call(), INodeNo::ROOT, OsStr::new("hello")).unwrap();

        b.rename(
            &call(),
            INodeNo::ROOT,
            OsStr::new("hello"),
            INodeNo::ROOT,
            OsStr::new("bye"),
            RenameFlags::empty(),
        )
        .unwrap();

        assert_eq!(b.lookup(&call(), INodeNo::ROOT, OsStr::new("hello")), Err(Error::NotFound));
        let after = b.lookup(&call(), INodeNo::ROOT, OsStr::new("bye")).unwrap();
        assert_eq!(after.ino, before.ino);
    }

    #[test]
    fn rename_exchange_swaps_both_names_in_place() {
        let b = bridge();
        let root = b.node(NodeKey::ROOT).unwrap();
        root.as_mutable().unwrap().mknod(&call(), OsStr::new("x"), 0o644, 0).unwrap();
        root.as_mutable().unwrap().mknod(&call(), OsStr::new("y"), 0o644, 0).unwrap();
        let x = b.lookup(&call(), INodeNo::ROOT, OsStr::new("x")).unwrap();
        let y = b.lookup(&call(), INodeNo::ROOT, OsStr::new("y")).unwrap();

        b.rename(
            &call(),
            INodeNo::ROOT,
            OsStr::new("x"),
            INodeNo::ROOT,
            OsStr::new("y"),
            RenameFlags::RENAME_EXCHANGE,
        )
        .unwrap();

        let new_x = b.lookup(&call(), INodeNo::ROOT, OsStr::new("x")).unwrap();
        let new_y = b.lookup(&call(), INodeNo::ROOT, OsStr::new("y")).unwrap();
        assert_eq!(new_x.ino, y.ino);
        assert_eq!(new_y.ino, x.ino);
    }

    #[test]
    fn unlink_does_not_invalidate_an_already_open_handle() {
        let b = bridge();
        let root = b.node(NodeKey::ROOT).unwrap();
        root.as_mutable().unwrap().mknod(&call(), OsStr::new("a"), 0o644, 0).unwrap();
        let entry = b.lookup(&call(), INodeNo::ROOT, OsStr::new("a")).unwrap();
        let open = b.open(&call(), INodeNo(entry.ino), 0).unwrap();
        let fh = FileHandle::from(open.fh);
        b.write(&call(), fh, 0, b"world").unwrap();

        b.unlink(&call(), INodeNo::ROOT, OsStr::new("a"), false).unwrap();
        assert_eq!(b.lookup(&call(), INodeNo::ROOT, OsStr::new("a")), Err(Error::NotFound));

        assert_eq!(b.read(&call(), fh, 0, 5).unwrap(), b"world");
    }
}
