//! Mapping between kernel node ids and the handler's own node identities.
//!
//! The kernel only ever addresses inodes by the `(nodeid, generation)` pair it was handed
//! in a previous `ENTRY` reply. [`InodeTable`] is the side of the bookkeeping that belongs
//! to that pair: it hands out node ids, tracks the kernel's outstanding lookup count for
//! each (so it knows when `FORGET` has brought it to zero and the slot can be recycled),
//! and deduplicates repeat lookups of the same underlying object onto the same node id via
//! a handler-supplied content key, which is how hard links end up sharing one node id.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::ll::{Generation, INodeNo};
use crate::tree::NodeKey;

/// Opaque identity the handler uses to recognize "the same object" across distinct parent
/// edges (hard links) or across repeated lookups of the same child. Handlers that don't
/// need content-addressing (most synthetic filesystems) can use the `NodeKey` itself,
/// re-exposed verbatim, as their own key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey(pub Box<[u8]>);

impl ContentKey {
    pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_u64(id: u64) -> Self {
        Self(id.to_ne_bytes().into())
    }
}

struct Slot {
    node: NodeKey,
    generation: Generation,
    lookup_count: u64,
    content_key: Option<ContentKey>,
    /// Exempts this id from [`InodeTable::forget`] freeing its slot at `lookup_count == 0`,
    /// for a node the handler pre-populated rather than the kernel discovering via `LOOKUP`.
    persistent: bool,
}

/// Registry of live node ids, guarded by a single mutex.
///
/// Per the crate's lock ordering rule, callers must never hold a node's own mutex
/// ([`crate::tree::Node`]) while taking this one: always resolve/register first, then lock
/// the node.
pub struct InodeTable {
    inner: Mutex<Inner>,
}

struct Inner {
    by_ino: HashMap<u64, Slot>,
    by_node: HashMap<NodeKey, u64>,
    by_content: HashMap<ContentKey, u64>,
    next_ino: u64,
    /// Freed ids paired with the generation they were last handed out under, so a reused id
    /// always comes back with a strictly greater generation (the kernel treats `(ino,
    /// generation)` as the real identity and will otherwise confuse a stale handle with a
    /// fresh one).
    free_list: Vec<(u64, Generation)>,
}

impl InodeTable {
    /// `first_auto_ino` is the first id handed out to a node the handler doesn't name
    /// itself; `1` (the root) is always reserved ahead of it.
    pub fn new(first_auto_ino: u64) -> Self {
        let mut by_ino = HashMap::new();
        by_ino.insert(
            1,
            Slot {
                node: NodeKey::ROOT,
                generation: Generation(0),
                lookup_count: 1,
                content_key: None,
                persistent: true,
            },
        );
        let mut by_node = HashMap::new();
        by_node.insert(NodeKey::ROOT, 1);
        Self {
            inner: Mutex::new(Inner {
                by_ino,
                by_node,
                by_content: HashMap::new(),
                next_ino: first_auto_ino.max(2),
                free_list: Vec::new(),
            }),
        }
    }

    /// Resolve a node id to its arena key, bumping the lookup count by one (the caller is
    /// about to hand this id back out in an `ENTRY` reply). Returns `None` for an id the
    /// kernel should not have been able to produce (a bridge/protocol bug, not a normal
    /// `Error::Stale`).
    pub fn resolve(&self, ino: INodeNo) -> Option<NodeKey> {
        let mut inner = self.inner.lock();
        let ino = ino.0;
        let slot = inner.by_ino.get_mut(&ino)?;
        slot.lookup_count += 1;
        Some(slot.node)
    }

    /// Look up a node id purely for reading (no lookup-count change), e.g. to translate a
    /// request's target node id into the node to lock.
    pub fn peek(&self, ino: INodeNo) -> Option<NodeKey> {
        self.inner.lock().by_ino.get(&ino.0).map(|s| s.node)
    }

    /// Register a node: finds its existing id if this exact [`NodeKey`] is already
    /// registered (a repeat `LOOKUP` of a name the tree already resolved, or a persistent
    /// node the kernel is discovering for the first time), falls back to `content_key`
    /// (a repeat lookup of a hard-linked name reaching the same object through a different
    /// [`NodeKey`]), and only then allocates a new id. `persistent` only matters on the
    /// allocate-a-new-id path: a persistent node starts at `lookup_count` 0 (no kernel
    /// `LOOKUP` produced this registration, so no `FORGET` will balance a count of 1) and is
    /// exempt from [`InodeTable::forget`] freeing its id. Returns `(ino, generation, is_new)`.
    pub fn register(
        &self,
        node: NodeKey,
        content_key: Option<ContentKey>,
        persistent: bool,
    ) -> (INodeNo, Generation, bool) {
        let mut inner = self.inner.lock();
        if let Some(&ino) = inner.by_node.get(&node) {
            let slot = inner.by_ino.get_mut(&ino).expect("by_node index out of sync");
            slot.lookup_count += 1;
            return (INodeNo(ino), slot.generation, false);
        }
        if let Some(key) = &content_key
            && let Some(&ino) = inner.by_content.get(key)
        {
            let slot = inner.by_ino.get_mut(&ino).expect("content index out of sync");
            slot.lookup_count += 1;
            return (INodeNo(ino), slot.generation, false);
        }
        let (ino, generation) = match inner.free_list.pop() {
            Some((ino, last_gen)) => (ino, Generation(last_gen.0 + 1)),
            None => {
                let ino = inner.next_ino;
                inner.next_ino += 1;
                (ino, Generation(0))
            }
        };
        inner.by_ino.insert(
            ino,
            Slot {
                node,
                generation,
                lookup_count: if persistent { 0 } else { 1 },
                content_key: content_key.clone(),
                persistent,
            },
        );
        inner.by_node.insert(node, ino);
        if let Some(key) = content_key {
            inner.by_content.insert(key, ino);
        }
        (INodeNo(ino), generation, true)
    }

    /// Apply a `FORGET`: drop `nlookup` from the id's lookup count. Returns `true` if the
    /// count reached zero and the id's slot (and its content-key entry, if any) was freed.
    /// A persistent id's slot is never freed here regardless of its lookup count; the caller
    /// is responsible for deciding whether the underlying node itself should be dropped from
    /// the tree (it may still be reachable by another parent edge).
    pub fn forget(&self, ino: INodeNo, nlookup: u64) -> bool {
        let mut inner = self.inner.lock();
        let ino = ino.0;
        let Some(slot) = inner.by_ino.get_mut(&ino) else {
            return false;
        };
        slot.lookup_count = slot.lookup_count.saturating_sub(nlookup);
        if slot.lookup_count > 0 || slot.persistent {
            return false;
        }
        let slot = inner.by_ino.remove(&ino).expect("just looked up");
        inner.by_node.remove(&slot.node);
        if let Some(key) = slot.content_key {
            inner.by_content.remove(&key);
        }
        inner.free_list.push((ino, slot.generation));
        true
    }

    /// Node id currently assigned to `node`, if it has been registered and not yet forgotten.
    pub fn ino_of(&self, node: NodeKey) -> Option<INodeNo> {
        self.inner.lock().by_node.get(&node).copied().map(INodeNo)
    }

    /// The arena node already registered under `content_key`, if any. Lets a caller that is
    /// about to create a hard-linked child reuse the existing node instead of allocating a
    /// fresh (and then orphaned) arena slot.
    pub fn node_for_content(&self, content_key: &ContentKey) -> Option<NodeKey> {
        let inner = self.inner.lock();
        let ino = *inner.by_content.get(content_key)?;
        inner.by_ino.get(&ino).map(|slot| slot.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_resolves_to_root_key() {
        let table = InodeTable::new(2);
        assert_eq!(table.resolve(INodeNo::ROOT), Some(NodeKey::ROOT));
    }

    #[test]
    fn register_allocates_increasing_ids() {
        let table = InodeTable::new(2);
        let (a, _, new_a) = table.register(NodeKey(1), None, false);
        let (b, _, new_b) = table.register(NodeKey(2), None, false);
        assert!(new_a && new_b);
        assert_ne!(a, b);
    }

    #[test]
    fn content_key_dedups_hardlinked_lookups() {
        let table = InodeTable::new(2);
        let key = ContentKey::from_u64(77);
        let (a, _, new_a) = table.register(NodeKey(1), Some(key.clone()), false);
        let (b, _, new_b) = table.register(NodeKey(5), Some(key), false);
        assert!(new_a && !new_b);
        assert_eq!(a, b);
    }

    #[test]
    fn forget_frees_slot_once_lookup_count_drains() {
        let table = InodeTable::new(2);
        let (ino, _, _) = table.register(NodeKey(1), None, false);
        table.resolve(ino); // lookup_count now 2
        assert!(!table.forget(ino, 1));
        assert!(table.forget(ino, 1));
        assert_eq!(table.peek(ino), None);
    }

    #[test]
    fn a_reused_id_comes_back_with_a_greater_generation() {
        let table = InodeTable::new(2);
        let (ino_a, gen_a, _) = table.register(NodeKey(1), None, false);
        assert!(table.forget(ino_a, 1));

        let (ino_b, gen_b, is_new) = table.register(NodeKey(2), None, false);
        assert!(is_new);
        assert_eq!(ino_a, ino_b, "the freed id should be recycled");
        assert!(gen_b.0 > gen_a.0);
    }

    #[test]
    fn repeat_registration_of_the_same_node_key_reuses_its_ino_even_without_a_content_key() {
        let table = InodeTable::new(2);
        let (first, gen_first, is_new) = table.register(NodeKey(9), None, false);
        assert!(is_new);
        let (second, gen_second, is_new) = table.register(NodeKey(9), None, false);
        assert!(!is_new);
        assert_eq!(first, second);
        assert_eq!(gen_first, gen_second);
    }

    #[test]
    fn persistent_node_starts_at_zero_lookups_and_survives_forget() {
        let table = InodeTable::new(2);
        let (ino, _, is_new) = table.register(NodeKey(1), None, true);
        assert!(is_new);
        // No lookup was ever handed out for this id, so a stray FORGET(ino, 1) must not
        // free the slot (and must not underflow the already-zero lookup count).
        assert!(!table.forget(ino, 1));
        assert_eq!(table.peek(ino), Some(NodeKey(1)));

        table.resolve(ino);
        assert!(!table.forget(ino, 1));
        assert_eq!(table.peek(ino), Some(NodeKey(1)), "persistent ids are never freed by forget");
    }
}
