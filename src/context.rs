//! Per-request context handed to every handler call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use dashmap::DashMap;

use crate::ll::RequestId;

/// Cancellation flag for one in-flight request.
///
/// A clone is registered in the [`CancelTable`] under the request's unique id for the
/// duration of the call; `FUSE_INTERRUPT` for that id flips the flag. Handlers that do
/// blocking work are expected to poll [`CancelSignal::is_cancelled`] at natural
/// checkpoints (e.g. between chunks of a large read) and return [`crate::error::Error::Interrupted`].
#[derive(Clone, Debug, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Registry mapping in-flight request ids to their cancellation flag.
///
/// `DashMap` gives O(1) lookup for the `FUSE_INTERRUPT` fast path without taking a single
/// global lock shared with the request dispatch loop.
#[derive(Default)]
pub struct CancelTable(DashMap<RequestId, CancelSignal>);

impl CancelTable {
    pub fn new() -> Self {
        Self(DashMap::new())
    }

    /// Register `id` for cancellation tracking and return its signal. Call
    /// [`CancelTable::complete`] once the request has been replied to.
    pub fn register(&self, id: RequestId) -> CancelSignal {
        let signal = CancelSignal::new();
        self.0.insert(id, signal.clone());
        signal
    }

    /// Mark `id` as interrupted, if it is still in flight. Returns `false` if the
    /// request had already completed (or was never registered), matching the kernel's
    /// tolerance for a race between `FUSE_INTERRUPT` and the original reply.
    pub fn interrupt(&self, id: RequestId) -> bool {
        match self.0.get(&id) {
            Some(signal) => {
                signal.cancel();
                true
            }
            None => false,
        }
    }

    pub fn complete(&self, id: RequestId) {
        self.0.remove(&id);
    }
}

/// Identity and environment of the process that issued a request.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    unique: RequestId,
    uid: u32,
    gid: u32,
    pid: u32,
}

impl RequestContext {
    pub fn new(unique: RequestId, uid: u32, gid: u32, pid: u32) -> Self {
        Self {
            unique,
            uid,
            gid,
            pid,
        }
    }

    pub fn unique(&self) -> RequestId {
        self.unique
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// A deadline-bearing wrapper around [`RequestContext`], threaded through handler calls
/// so long-running handlers can cooperate with `FUSE_INTERRUPT` and with bounded retries
/// in [`crate::tree::NodeTree`].
#[derive(Clone)]
pub struct Call {
    ctx: RequestContext,
    cancel: CancelSignal,
    deadline: Option<Instant>,
}

impl Call {
    pub fn new(ctx: RequestContext, cancel: CancelSignal, deadline: Option<Instant>) -> Self {
        Self {
            ctx,
            cancel,
            deadline,
        }
    }

    pub fn ctx(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_reaches_registered_signal() {
        let table = CancelTable::new();
        let id = RequestId(42);
        let signal = table.register(id);
        assert!(!signal.is_cancelled());
        assert!(table.interrupt(id));
        assert!(signal.is_cancelled());
    }

    #[test]
    fn interrupt_on_unknown_id_is_harmless() {
        let table = CancelTable::new();
        assert!(!table.interrupt(RequestId(7)));
    }

    #[test]
    fn complete_unregisters_the_signal() {
        let table = CancelTable::new();
        let id = RequestId(1);
        table.register(id);
        table.complete(id);
        assert!(!table.interrupt(id));
    }
}
