//! Open file/directory handle table.
//!
//! An `OPEN`/`OPENDIR`/`CREATE` reply hands the kernel an opaque [`FileHandle`] that every
//! `READ`/`WRITE`/`READDIR`/`FLUSH`/`RELEASE` for that descriptor echoes back. The table's
//! `release` drains any operations still in flight against a handle before it is dropped,
//! so a handler's `release` callback never races a `read` that started just before it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::ll::{FileHandle, INodeNo};
use crate::tree::NodeKey;

/// What kind of object a handle was opened against, so the bridge can reject e.g. a
/// `READDIR` against a handle opened by `OPEN` without consulting the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Directory,
}

struct Entry {
    node: NodeKey,
    ino: INodeNo,
    kind: HandleKind,
    /// The handle the filesystem implementation itself returned from `open`/`opendir`/
    /// `create`, echoed back on every call into the handler for this handle so it can find
    /// its own open-file bookkeeping. Opaque to the table itself.
    handler_fh: u64,
    /// Count of operations currently dispatched against this handle.
    inflight: AtomicU64,
    /// Bumped and notified when `inflight` reaches zero while a release is waiting.
    drained: Condvar,
    drained_lock: Mutex<()>,
}

/// Table of open handles, keyed by an opaque counter (not reused while a handle with that
/// number could still be outstanding on the wire).
pub struct HandleTable {
    next: AtomicU64,
    entries: Mutex<HashMap<u64, Arc<Entry>>>,
}

/// RAII guard marking one operation as in flight against a handle; `release` waits for all
/// guards for a handle to drop before returning the handle to the caller.
pub struct InFlight(Arc<Entry>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.0.drained_lock.lock();
            self.0.drained.notify_all();
        }
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a new handle for `node`/`ino`, wrapping the handler's own `handler_fh`.
    pub fn allocate(&self, node: NodeKey, ino: INodeNo, kind: HandleKind, handler_fh: u64) -> FileHandle {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            node,
            ino,
            kind,
            handler_fh,
            inflight: AtomicU64::new(0),
            drained: Condvar::new(),
            drained_lock: Mutex::new(()),
        });
        self.entries.lock().insert(fh, entry);
        FileHandle(fh)
    }

    /// Look up a handle and mark one operation in flight against it. Returns `None` for an
    /// unknown or already-released handle.
    pub fn begin(&self, fh: FileHandle) -> Option<(NodeKey, INodeNo, HandleKind, u64, InFlight)> {
        let entry = self.entries.lock().get(&fh.0).cloned()?;
        entry.inflight.fetch_add(1, Ordering::AcqRel);
        Some((entry.node, entry.ino, entry.kind, entry.handler_fh, InFlight(entry)))
    }

    /// Remove the handle and block until every [`InFlight`] guard issued for it has
    /// dropped, then return its node, kind and handler-assigned fh so the caller (the
    /// bridge, on behalf of a handler's `release`/`releasedir`) can call back into the
    /// handler with the same value it originally returned from `open`/`opendir`/`create`.
    pub fn release(&self, fh: FileHandle) -> Option<(NodeKey, HandleKind, u64)> {
        let entry = self.entries.lock().remove(&fh.0)?;
        let mut guard = entry.drained_lock.lock();
        while entry.inflight.load(Ordering::Acquire) > 0 {
            entry.drained.wait(&mut guard);
        }
        Some((entry.node, entry.kind, entry.handler_fh))
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_begin_then_release() {
        let table = HandleTable::new();
        let fh = table.allocate(NodeKey::ROOT, INodeNo::ROOT, HandleKind::File, 7);
        let (node, ino, kind, handler_fh, guard) = table.begin(fh).unwrap();
        assert_eq!(node, NodeKey::ROOT);
        assert_eq!(ino, INodeNo::ROOT);
        assert_eq!(kind, HandleKind::File);
        assert_eq!(handler_fh, 7);
        drop(guard);
        assert_eq!(table.release(fh), Some((NodeKey::ROOT, HandleKind::File, 7)));
    }

    #[test]
    fn begin_after_release_fails() {
        let table = HandleTable::new();
        let fh = table.allocate(NodeKey::ROOT, INodeNo::ROOT, HandleKind::Directory, 0);
        table.release(fh);
        assert!(table.begin(fh).is_none());
    }

    #[test]
    fn release_waits_for_inflight_operations() {
        use std::sync::Arc as StdArc;
        use std::thread;
        use std::time::Duration;

        let table = StdArc::new(HandleTable::new());
        let fh = table.allocate(NodeKey::ROOT, INodeNo::ROOT, HandleKind::File, 0);
        let (_, _, _, _, guard) = table.begin(fh).unwrap();

        let table2 = table.clone();
        let released = thread::spawn(move || table2.release(fh));

        thread::sleep(Duration::from_millis(50));
        assert!(!released.is_finished());
        drop(guard);
        assert_eq!(released.join().unwrap(), Some((NodeKey::ROOT, HandleKind::File, 0)));
    }
}
