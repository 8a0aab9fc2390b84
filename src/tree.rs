//! The directory graph: parent/child edges between nodes, with the locking discipline
//! needed to mutate more than one node (rename, link, unlink) without deadlocking and
//! without tearing a concurrent reader's view of the tree.
//!
//! Nodes live in an arena (`Vec<Arc<Node>>`) rather than referencing each other through
//! `Rc`/`RefCell`, since the parent/child relationship is cyclic (a directory's children
//! point back at it) and arbitrary hard links make the graph genuinely not a tree. A
//! [`NodeKey`] is just the stable index of a node's arena slot; it orders nodes for
//! multi-node locking the same way a pointer address would, without the un-amusing parts
//! of comparing raw pointers.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// Stable index of a node's slot in the tree's arena. Never reused for the lifetime of the
/// tree (forgotten nodes leave a tombstone), which is what lets it double as a total order
/// for locking more than one node at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(pub(crate) usize);

impl NodeKey {
    pub const ROOT: NodeKey = NodeKey(0);
}

/// One parent edge: the directory that contains this node under `name`.
#[derive(Debug, Clone)]
struct ParentEdge {
    parent: NodeKey,
    name: OsString,
}

#[derive(Debug)]
enum Children {
    /// Not a directory: no children possible.
    None,
    /// Directory, lazily populated as entries are looked up or created.
    Some(HashMap<OsString, NodeKey>),
}

/// A node's directory-graph state. Exposed (as an opaque `pub(crate)` type) so that a caller
/// holding one via [`TwoNodeLocks`] can drive [`NodeTree::link_locked`]/[`NodeTree::unlink_locked`]
/// without this module having to re-acquire the lock on its behalf.
pub(crate) struct NodeState {
    parents: SmallVec<[ParentEdge; 1]>,
    children: Children,
}

/// A single node in the tree: its identity is its arena slot, not this struct's address,
/// since nodes are only ever reached through `Arc` clones handed out by [`NodeTree`].
pub struct Node {
    key: NodeKey,
    state: Mutex<NodeState>,
    /// Bumped on every structural change under this node (child added/removed/renamed).
    /// [`NodeTree::with_nodes`] snapshots this before validating a multi-node operation and
    /// retries if it moved underneath the caller.
    change_counter: AtomicU32,
    tombstoned: std::sync::atomic::AtomicBool,
}

impl Node {
    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.state.lock().children, Children::Some(_))
    }

    pub fn change_counter(&self) -> u32 {
        self.change_counter.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.change_counter.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned.load(Ordering::Acquire)
    }
}

const MAX_RETRIES: u32 = 5;

/// The directory graph itself.
pub struct NodeTree {
    arena: RwLock<Vec<Arc<Node>>>,
}

impl NodeTree {
    pub fn new() -> Self {
        let root = Arc::new(Node {
            key: NodeKey::ROOT,
            state: Mutex::new(NodeState {
                parents: SmallVec::new(),
                children: Children::Some(HashMap::new()),
            }),
            change_counter: AtomicU32::new(0),
            tombstoned: std::sync::atomic::AtomicBool::new(false),
        });
        Self {
            arena: RwLock::new(vec![root]),
        }
    }

    pub fn get(&self, key: NodeKey) -> Arc<Node> {
        self.arena.read()[key.0].clone()
    }

    /// Allocate a fresh node. `directory` selects whether it starts with a (possibly
    /// empty) child map or with no child map at all.
    pub fn alloc(&self, directory: bool) -> Arc<Node> {
        let mut arena = self.arena.write();
        let key = NodeKey(arena.len());
        let node = Arc::new(Node {
            key,
            state: Mutex::new(NodeState {
                parents: SmallVec::new(),
                children: if directory {
                    Children::Some(HashMap::new())
                } else {
                    Children::None
                },
            }),
            change_counter: AtomicU32::new(0),
            tombstoned: std::sync::atomic::AtomicBool::new(false),
        });
        arena.push(node.clone());
        node
    }

    /// Look up `name` under `parent`. Read-only; does not create anything.
    pub fn lookup(&self, parent: NodeKey, name: &OsStr) -> Option<Arc<Node>> {
        let parent = self.get(parent);
        let state = parent.state.lock();
        match &state.children {
            Children::Some(map) => map.get(name).map(|&k| self.get(k)),
            Children::None => None,
        }
    }

    /// Insert `child` under `parent` as `name`, recording the parent edge on the child
    /// (supporting hard links: a child may end up with more than one parent edge). Locks
    /// `parent`'s state itself; for a mutation that must be atomic across two directories
    /// (rename), use [`NodeTree::link_locked`] against a [`TwoNodeLocks`] instead.
    pub fn link(&self, parent: &Node, child: &Arc<Node>, name: &OsStr) -> Result<()> {
        let mut pstate = parent.state.lock();
        self.link_locked(parent, &mut pstate, child, name)
    }

    /// Same as [`NodeTree::link`], but `pstate` is already locked (held across a larger
    /// multi-node operation via [`TwoNodeLocks`]) rather than locked here.
    pub(crate) fn link_locked(
        &self,
        parent: &Node,
        pstate: &mut NodeState,
        child: &Arc<Node>,
        name: &OsStr,
    ) -> Result<()> {
        match &mut pstate.children {
            Children::Some(map) => {
                if map.contains_key(name) {
                    return Err(Error::AlreadyExists);
                }
                map.insert(name.to_owned(), child.key);
            }
            Children::None => return Err(Error::NotADirectory),
        }
        parent.bump();
        child
            .state
            .lock()
            .parents
            .push(ParentEdge {
                parent: parent.key,
                name: name.to_owned(),
            });
        Ok(())
    }

    /// Remove the `name` edge from `parent`, returning the child it pointed to. Errors if
    /// the entry is a non-empty directory and `allow_nonempty_dir` is false (`RMDIR` vs.
    /// `RENAME`-over semantics differ here, so the caller decides). Locks `parent`'s state
    /// itself; for a mutation that must be atomic across two directories (rename), use
    /// [`NodeTree::unlink_locked`] against a [`TwoNodeLocks`] instead.
    pub fn unlink(
        &self,
        parent: &Node,
        name: &OsStr,
        allow_nonempty_dir: bool,
    ) -> Result<Arc<Node>> {
        let mut pstate = parent.state.lock();
        self.unlink_locked(parent, &mut pstate, name, allow_nonempty_dir)
    }

    /// Same as [`NodeTree::unlink`], but `pstate` is already locked (held across a larger
    /// multi-node operation via [`TwoNodeLocks`]) rather than locked here.
    pub(crate) fn unlink_locked(
        &self,
        parent: &Node,
        pstate: &mut NodeState,
        name: &OsStr,
        allow_nonempty_dir: bool,
    ) -> Result<Arc<Node>> {
        let child_key = match &pstate.children {
            Children::Some(map) => *map.get(name).ok_or(Error::NotFound)?,
            Children::None => return Err(Error::NotADirectory),
        };
        let child = self.get(child_key);
        if !allow_nonempty_dir
            && let Children::Some(map) = &child.state.lock().children
            && !map.is_empty()
        {
            return Err(Error::DirectoryNotEmpty);
        }
        if let Children::Some(map) = &mut pstate.children {
            map.remove(name);
        }
        parent.bump();
        child
            .state
            .lock()
            .parents
            .retain(|e| !(e.parent == parent.key && e.name == name));
        Ok(child)
    }

    /// Look up `name` under an already-locked directory state, without taking any further
    /// lock. Used by multi-node operations (e.g. `RENAME_NOREPLACE`'s existence check) that
    /// already hold the directory's lock via [`TwoNodeLocks`] and would deadlock re-entering
    /// [`NodeTree::lookup`].
    pub(crate) fn lookup_locked(pstate: &NodeState, name: &OsStr) -> Option<NodeKey> {
        match &pstate.children {
            Children::Some(map) => map.get(name).copied(),
            Children::None => None,
        }
    }

    /// Snapshot the `(parent, name)` edges under which the kernel could validly reach
    /// `node`, newest first. A node with no remaining parent edge is unreachable and
    /// eligible for tombstoning once its kernel lookup count also drops to zero.
    pub fn parent_edges(&self, node: &Node) -> Vec<(NodeKey, OsString)> {
        node.state
            .lock()
            .parents
            .iter()
            .map(|e| (e.parent, e.name.clone()))
            .collect()
    }

    pub fn tombstone(&self, node: &Node) {
        node.tombstoned.store(true, Ordering::Release);
    }

    /// Run `op` against up to two nodes locked in a fixed order (by [`NodeKey`]) to avoid
    /// lock-order deadlocks, retrying with capped exponential backoff if either node's
    /// `change_counter` advances between the optimistic snapshot and the locked retry.
    /// Unlike a plain snapshot check, the locks handed to `op` via [`TwoNodeLocks`] stay
    /// held for `op`'s entire body, so a caller composing several edge mutations (rename's
    /// unlink-then-link) never exposes a window where a concurrent [`NodeTree::lookup`]
    /// sees neither the old nor the new edge. This is the building block `rename` and
    /// cross-directory `link` are built from.
    pub fn with_two_nodes<R>(
        &self,
        a: NodeKey,
        b: NodeKey,
        op: impl Fn(&Node, &Node, &mut TwoNodeLocks<'_>) -> Result<R>,
    ) -> Result<R> {
        let node_a = self.get(a);
        let node_b = self.get(b);
        if a == b {
            let mut locks = TwoNodeLocks {
                inner: TwoNodeLocksInner::Same(node_a.state.lock()),
            };
            return op(&node_a, &node_b, &mut locks);
        }
        let mut backoff = Duration::from_micros(100);
        for attempt in 0..MAX_RETRIES {
            let before_a = node_a.change_counter();
            let before_b = node_b.change_counter();
            let (first, second) = if a <= b {
                (&node_a, &node_b)
            } else {
                (&node_b, &node_a)
            };
            let g_first: MutexGuard<'_, NodeState> = first.state.lock();
            let g_second: MutexGuard<'_, NodeState> = second.state.lock();
            if node_a.change_counter() != before_a || node_b.change_counter() != before_b {
                drop(g_second);
                drop(g_first);
                if attempt + 1 == MAX_RETRIES {
                    return Err(Error::Busy);
                }
                std::thread::sleep(backoff);
                backoff *= 2;
                continue;
            }
            let mut locks = TwoNodeLocks {
                inner: if a <= b {
                    TwoNodeLocksInner::Different(g_first, g_second)
                } else {
                    TwoNodeLocksInner::Different(g_second, g_first)
                },
            };
            return op(&node_a, &node_b, &mut locks);
        }
        Err(Error::Busy)
    }
}

/// The locked state of the two nodes passed to a [`NodeTree::with_two_nodes`] operation,
/// held for as long as the operation runs. `state_a`/`state_b` always correspond to the `a`/
/// `b` the caller asked to lock, regardless of the order the two mutexes were acquired in to
/// avoid a lock-order deadlock. When `a == b` both accessors reborrow the single underlying
/// guard; callers must not try to hold both at once in that case (the borrow checker enforces
/// this for you).
pub(crate) struct TwoNodeLocks<'a> {
    inner: TwoNodeLocksInner<'a>,
}

enum TwoNodeLocksInner<'a> {
    Same(MutexGuard<'a, NodeState>),
    Different(MutexGuard<'a, NodeState>, MutexGuard<'a, NodeState>),
}

impl<'a> TwoNodeLocks<'a> {
    pub(crate) fn state_a(&mut self) -> &mut NodeState {
        match &mut self.inner {
            TwoNodeLocksInner::Same(g) => g,
            TwoNodeLocksInner::Different(a, _) => a,
        }
    }

    pub(crate) fn state_b(&mut self) -> &mut NodeState {
        match &mut self.inner {
            TwoNodeLocksInner::Same(g) => g,
            TwoNodeLocksInner::Different(_, b) => b,
        }
    }
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_starts_as_an_empty_directory() {
        let tree = NodeTree::new();
        let root = tree.get(NodeKey::ROOT);
        assert!(root.is_directory());
        assert!(tree.lookup(NodeKey::ROOT, OsStr::new("missing")).is_none());
    }

    #[test]
    fn link_then_lookup_then_unlink() {
        let tree = NodeTree::new();
        let root = tree.get(NodeKey::ROOT);
        let file = tree.alloc(false);
        tree.link(&root, &file, OsStr::new("a.txt")).unwrap();
        assert_eq!(
            tree.lookup(NodeKey::ROOT, OsStr::new("a.txt")).unwrap().key(),
            file.key()
        );
        let removed = tree.unlink(&root, OsStr::new("a.txt"), false).unwrap();
        assert_eq!(removed.key(), file.key());
        assert!(tree.lookup(NodeKey::ROOT, OsStr::new("a.txt")).is_none());
    }

    #[test]
    fn duplicate_link_name_is_rejected() {
        let tree = NodeTree::new();
        let root = tree.get(NodeKey::ROOT);
        let a = tree.alloc(false);
        let b = tree.alloc(false);
        tree.link(&root, &a, OsStr::new("x")).unwrap();
        assert_eq!(tree.link(&root, &b, OsStr::new("x")), Err(Error::AlreadyExists));
    }

    #[test]
    fn hardlink_gives_a_node_two_parent_edges() {
        let tree = NodeTree::new();
        let root = tree.get(NodeKey::ROOT);
        let dir = tree.alloc(true);
        tree.link(&root, &dir, OsStr::new("d")).unwrap();
        let file = tree.alloc(false);
        tree.link(&root, &file, OsStr::new("one")).unwrap();
        tree.link(&dir, &file, OsStr::new("two")).unwrap();
        let edges = tree.parent_edges(&file);
        assert_eq!(edges.len(), 2);
    }

    #[test]
    fn rmdir_refuses_nonempty_directory() {
        let tree = NodeTree::new();
        let root = tree.get(NodeKey::ROOT);
        let dir = tree.alloc(true);
        tree.link(&root, &dir, OsStr::new("d")).unwrap();
        let file = tree.alloc(false);
        tree.link(&dir, &file, OsStr::new("f")).unwrap();
        assert_eq!(
            tree.unlink(&root, OsStr::new("d"), false),
            Err(Error::DirectoryNotEmpty)
        );
    }

    #[test]
    fn with_two_nodes_locks_in_key_order_both_directions() {
        let tree = NodeTree::new();
        let a = tree.alloc(true);
        let b = tree.alloc(true);
        let result = tree.with_two_nodes(a.key(), b.key(), |_, _, _| Ok(1));
        assert_eq!(result, Ok(1));
        let result = tree.with_two_nodes(b.key(), a.key(), |_, _, _| Ok(2));
        assert_eq!(result, Ok(2));
    }

    #[test]
    fn with_two_nodes_hands_back_locks_matching_the_requested_order_not_the_lock_order() {
        // Request the pair in descending key order (b, a); the locked states handed to `op`
        // must still line up with the caller's (a, b) naming, not whichever mutex actually
        // got acquired first internally.
        let tree = NodeTree::new();
        let root = tree.get(NodeKey::ROOT);
        let a = tree.alloc(true);
        let b = tree.alloc(true);
        tree.link(&root, &a, OsStr::new("a")).unwrap();
        let file = tree.alloc(false);
        tree.link(&root, &file, OsStr::new("f")).unwrap();

        let moved = tree
            .with_two_nodes(b.key(), a.key(), |node_b, node_a, locks| {
                let child_key = NodeTree::lookup_locked(locks.state_a(), OsStr::new("f"))
                    .ok_or(Error::NotFound)?;
                assert_eq!(child_key, file.key());
                let moved = tree.unlink_locked(node_a, locks.state_a(), OsStr::new("f"), true)?;
                tree.link_locked(node_b, locks.state_b(), &moved, OsStr::new("f"))?;
                Ok(moved.key())
            })
            .unwrap();
        assert_eq!(moved, file.key());
        assert!(tree.lookup(a.key(), OsStr::new("f")).is_none());
        assert!(tree.lookup(b.key(), OsStr::new("f")).is_some());
    }

    #[test]
    fn with_two_nodes_same_key_reborrows_the_single_lock_for_both_roles() {
        let tree = NodeTree::new();
        let root = tree.get(NodeKey::ROOT);
        let file = tree.alloc(false);
        tree.link(&root, &file, OsStr::new("old")).unwrap();

        let result = tree.with_two_nodes(root.key(), root.key(), |node_a, node_b, locks| {
            let moved = tree.unlink_locked(node_a, locks.state_a(), OsStr::new("old"), true)?;
            tree.link_locked(node_b, locks.state_b(), &moved, OsStr::new("new"))?;
            Ok(())
        });
        assert!(result.is_ok());
        assert!(tree.lookup(root.key(), OsStr::new("old")).is_none());
        assert!(tree.lookup(root.key(), OsStr::new("new")).is_some());
    }
}
