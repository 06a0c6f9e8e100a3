//! Node allocation, deallocation, and deep copy.
//!
//! All node memory flows through [`NodeBuilder`], which keeps the global
//! allocation counters honest. Deallocation is poison-aware: a poisoned
//! node is freed without recursing into its children, because poisoned
//! nodes either borrow children still owned by live ancestors (uncommitted
//! speculations) or have had their children re-homed under a replacement
//! subtree (retired nodes). Only the unpoisoned teardown path (`clear`,
//! drop, deep-copy failure) walks children recursively.

use crate::nodes::representation::{
    is_absent, is_sentinel, ConcreteNodePtr, FullInterior, FullLeaf, ListInterior, ListLeaf,
    NodePtr, OpaqueNodePtr, SkipLeaf,
};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

static NODES_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static NODES_FREED: AtomicU64 = AtomicU64::new(0);

/// Number of nodes currently allocated across every map in the process.
///
/// Test instrumentation for leak checks; not part of the supported API.
#[doc(hidden)]
pub fn live_node_count() -> u64 {
    NODES_ALLOCATED
        .load(Ordering::SeqCst)
        .wrapping_sub(NODES_FREED.load(Ordering::SeqCst))
}

/// Typed constructor and destructor for every node variant.
pub(crate) struct NodeBuilder<V>(PhantomData<fn() -> V>);

impl<V> NodeBuilder<V> {
    pub(crate) fn new() -> Self {
        NodeBuilder(PhantomData)
    }

    fn record_alloc(&self) {
        NODES_ALLOCATED.fetch_add(1, Ordering::SeqCst);
    }

    fn record_free(&self) {
        NODES_FREED.fetch_add(1, Ordering::SeqCst);
    }

    /// A single-value leaf matching exactly `skip`.
    pub(crate) fn make_leaf_skip(&self, skip: &[u8], value: V) -> OpaqueNodePtr<V> {
        self.record_alloc();
        NodePtr::allocate(SkipLeaf::new(skip, value)).to_opaque()
    }

    /// A poisoned single-value tombstone adopting an already-boxed value.
    ///
    /// Used to push a value box removed in place through the node-only
    /// retired list.
    pub(crate) fn make_value_tombstone(&self, raw: *mut V) -> OpaqueNodePtr<V> {
        self.record_alloc();
        let node = NodePtr::allocate(SkipLeaf::adopting(&[], raw));
        node.to_opaque()
    }

    /// An empty 7-slot leaf.
    pub(crate) fn make_leaf_list(&self, skip: &[u8]) -> OpaqueNodePtr<V> {
        self.record_alloc();
        NodePtr::allocate(ListLeaf::new(skip)).to_opaque()
    }

    /// An empty dense leaf.
    pub(crate) fn make_leaf_full(&self, skip: &[u8]) -> OpaqueNodePtr<V> {
        self.record_alloc();
        NodePtr::allocate(FullLeaf::new(skip)).to_opaque()
    }

    /// An empty 7-slot interior.
    pub(crate) fn make_interior_list(&self, skip: &[u8]) -> OpaqueNodePtr<V> {
        self.record_alloc();
        NodePtr::allocate(ListInterior::new(skip)).to_opaque()
    }

    /// An empty dense interior.
    pub(crate) fn make_interior_full(&self, skip: &[u8]) -> OpaqueNodePtr<V> {
        self.record_alloc();
        NodePtr::allocate(FullInterior::new(skip)).to_opaque()
    }

    /// Free `node`, recursing into children only when it is unpoisoned.
    ///
    /// The sentinel is never freed.
    ///
    /// # Safety
    ///
    /// `node` must have been allocated by this builder's payload type `V`,
    /// must not be referenced again, and, when unpoisoned, must own its
    /// entire subtree (no borrowed children).
    pub(crate) unsafe fn dealloc_node(&self, node: OpaqueNodePtr<V>) {
        if is_sentinel(node.as_ptr()) {
            return;
        }
        // SAFETY: `node` is allocated per the function contract.
        let poisoned = unsafe { node.is_poisoned() };
        if !poisoned {
            // SAFETY: Unpoisoned nodes own their children per the function
            // contract; each child is freed exactly once.
            unsafe {
                match node.to_node_ptr() {
                    ConcreteNodePtr::ListInterior(interior) => {
                        let interior = interior.as_ref();
                        let view = interior.lanes();
                        for (index, _) in view.iter() {
                            let child =
                                interior.children[index].load(Ordering::Acquire);
                            if !is_absent(child) {
                                if let Some(child) = OpaqueNodePtr::from_ptr(child) {
                                    self.dealloc_node(child);
                                }
                            }
                        }
                    }
                    ConcreteNodePtr::FullInterior(interior) => {
                        let interior = interior.as_ref();
                        let bitmap = interior.bitmap();
                        let mut cursor = bitmap.first();
                        while let Some(label) = cursor {
                            let child = interior.child(label);
                            if !is_absent(child) {
                                if let Some(child) = OpaqueNodePtr::from_ptr(child) {
                                    self.dealloc_node(child);
                                }
                            }
                            cursor = bitmap.next_set(Some(label));
                        }
                    }
                    _ => {}
                }
            }
        }
        // SAFETY: Last reference; the variant matches the header kind.
        unsafe { self.free_single(node) };
    }

    /// Free exactly one node, never touching children.
    ///
    /// # Safety
    ///
    /// Same contract as [`NodeBuilder::dealloc_node`], minus the subtree
    /// ownership requirement.
    pub(crate) unsafe fn free_single(&self, node: OpaqueNodePtr<V>) {
        if is_sentinel(node.as_ptr()) {
            return;
        }
        // SAFETY: The kind bits name the variant the node was allocated
        // as, so the typed deallocation matches the allocation.
        unsafe {
            match node.to_node_ptr() {
                ConcreteNodePtr::SkipLeaf(n) => drop(n.deallocate()),
                ConcreteNodePtr::ListLeaf(n) => drop(n.deallocate()),
                ConcreteNodePtr::FullLeaf(n) => drop(n.deallocate()),
                ConcreteNodePtr::ListInterior(n) => drop(n.deallocate()),
                ConcreteNodePtr::FullInterior(n) => drop(n.deallocate()),
            }
        }
        self.record_free();
    }

    /// Clone an entire subtree into freshly allocated, fully owned nodes.
    ///
    /// Used by the map's copy constructor, which quiesces writers first.
    ///
    /// # Safety
    ///
    /// `node` must be a live, unpoisoned subtree of payload type `V`
    /// whose nodes stay allocated for the duration of the call.
    pub(crate) unsafe fn deep_copy(&self, node: OpaqueNodePtr<V>) -> OpaqueNodePtr<V>
    where
        V: Clone,
    {
        // SAFETY: Covered by the function contract.
        unsafe {
            match node.to_node_ptr() {
                ConcreteNodePtr::SkipLeaf(leaf) => {
                    let leaf = leaf.as_ref();
                    let value = leaf
                        .value
                        .read()
                        .expect("skip leaf lost its value");
                    self.make_leaf_skip(node.skip(), value)
                }
                ConcreteNodePtr::ListLeaf(leaf) => {
                    let copy = self.make_leaf_list(node.skip());
                    if let ConcreteNodePtr::ListLeaf(dst) = copy.to_node_ptr() {
                        leaf.as_ref().copy_values_to(dst.as_ref());
                    }
                    copy
                }
                ConcreteNodePtr::FullLeaf(leaf) => {
                    let copy = self.make_leaf_full(node.skip());
                    if let ConcreteNodePtr::FullLeaf(dst) = copy.to_node_ptr() {
                        leaf.as_ref().copy_values_to(dst.as_ref());
                    }
                    copy
                }
                ConcreteNodePtr::ListInterior(interior) => {
                    let copy = self.make_interior_list(node.skip());
                    if let ConcreteNodePtr::ListInterior(dst) = copy.to_node_ptr() {
                        let src = interior.as_ref();
                        let dst = dst.as_ref();
                        for (index, label) in src.lanes().iter() {
                            let child = src.children[index].load(Ordering::Acquire);
                            if let Some(child) = OpaqueNodePtr::from_ptr(child) {
                                dst.add_child(label, self.deep_copy(child).as_ptr());
                            }
                        }
                        if let Some(value) = src.eos.read() {
                            dst.eos.install(value);
                        }
                    }
                    copy
                }
                ConcreteNodePtr::FullInterior(interior) => {
                    let copy = self.make_interior_full(node.skip());
                    if let ConcreteNodePtr::FullInterior(dst) = copy.to_node_ptr() {
                        let src = interior.as_ref();
                        let dst = dst.as_ref();
                        let bitmap = src.bitmap();
                        let mut cursor = bitmap.first();
                        while let Some(label) = cursor {
                            if let Some(child) = OpaqueNodePtr::from_ptr(src.child(label)) {
                                dst.add_child(label, self.deep_copy(child).as_ptr());
                            }
                            cursor = bitmap.next_set(Some(label));
                        }
                        if let Some(value) = src.eos.read() {
                            dst.eos.install(value);
                        }
                    }
                    copy
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_balance() {
        let builder = NodeBuilder::<u32>::new();
        let before = live_node_count();
        let leaf = builder.make_leaf_skip(b"abc", 5);
        let list = builder.make_leaf_list(b"");
        let interior = builder.make_interior_full(b"xy");
        assert_eq!(live_node_count(), before + 3);
        // SAFETY: All three nodes were allocated above with payload u32
        // and have no children or other references.
        unsafe {
            builder.dealloc_node(leaf);
            builder.dealloc_node(list);
            builder.dealloc_node(interior);
        }
        assert_eq!(live_node_count(), before);
    }

    #[test]
    fn poisoned_dealloc_spares_borrowed_children() {
        let builder = NodeBuilder::<u32>::new();
        let child = builder.make_leaf_skip(b"c", 1);
        let parent = builder.make_interior_list(b"");
        // SAFETY: Nodes allocated just above with payload u32.
        unsafe {
            if let ConcreteNodePtr::ListInterior(p) = parent.to_node_ptr() {
                p.as_ref().add_child(b'c', child.as_ptr());
            }
            // Poisoned parent borrows `child`; freeing it must not touch
            // the child.
            parent.base().header.poison();
            builder.dealloc_node(parent);

            if let ConcreteNodePtr::SkipLeaf(leaf) = child.to_node_ptr() {
                assert_eq!(leaf.as_ref().value.read(), Some(1));
            } else {
                panic!("child was freed through a poisoned parent");
            }
            builder.dealloc_node(child);
        }
    }

    #[test]
    fn owned_dealloc_frees_subtree() {
        let builder = NodeBuilder::<u32>::new();
        let before = live_node_count();
        let child_a = builder.make_leaf_skip(b"", 1);
        let child_b = builder.make_leaf_skip(b"", 2);
        let parent = builder.make_interior_list(b"p");
        // SAFETY: Nodes allocated just above with payload u32; the parent
        // exclusively owns both children when deallocated.
        unsafe {
            if let ConcreteNodePtr::ListInterior(p) = parent.to_node_ptr() {
                p.as_ref()
                    .add_two_children(b'a', child_a.as_ptr(), b'b', child_b.as_ptr());
            }
            builder.dealloc_node(parent);
        }
        assert_eq!(live_node_count(), before);
    }

    #[test]
    fn deep_copy_is_independent() {
        let builder = NodeBuilder::<String>::new();
        let child = builder.make_leaf_skip(b"tail", "payload".to_string());
        let root = builder.make_interior_list(b"head");
        // SAFETY: Nodes allocated just above with payload String; the copy
        // owns its entire subtree.
        unsafe {
            if let ConcreteNodePtr::ListInterior(r) = root.to_node_ptr() {
                r.as_ref().add_child(b't', child.as_ptr());
                r.as_ref().eos.install("at-head".to_string());
            }
            let copy = builder.deep_copy(root);
            builder.dealloc_node(root);

            // The original is gone; the copy must still be whole.
            assert_eq!(copy.skip(), b"head");
            assert_eq!(copy.read_eos(), Some("at-head".to_string()));
            let copied_child = copy.child(b't');
            assert!(!copied_child.is_null());
            let copied_child = OpaqueNodePtr::<String>::from_ptr(copied_child).unwrap();
            match copied_child.to_node_ptr() {
                ConcreteNodePtr::SkipLeaf(leaf) => {
                    assert_eq!(leaf.as_ref().value.read(), Some("payload".to_string()));
                }
                _ => panic!("copied child has the wrong shape"),
            }
            builder.dealloc_node(copy);
        }
    }
}
