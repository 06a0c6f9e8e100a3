//! Trie node representation.
//!
//! Every node starts with a [`NodeBase`] prefix: the packed atomic header,
//! the skip string consumed at this node (path compression), and the
//! embedded retirement links that thread the node onto the per-map retired
//! list after replacement. The five concrete variants are `repr(C)` structs
//! sharing that prefix, so an [`OpaqueNodePtr`] can read the header and
//! skip without knowing the variant and downcast with a plain pointer cast
//! once the header's kind bits have been inspected.
//!
//! Payload values live behind [`ValueCell`]s, per-slot atomic pointers to
//! boxed values. A concurrent reader's lane load observes either the old or
//! the new box, both of which remain allocated for the reclamation grace
//! period, which is what makes the in-place mutations safe.

use crate::nodes::header::{Header, HeaderSnapshot, NodeKind};
use crate::packed::{BitSet256, BitSnapshot, ByteLanes, LaneSet, LANE_MAX};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::OnceLock;
use tinyvec::TinyVec;

/// Maximum number of labeled slots in a `LIST` node.
pub(crate) const LIST_MAX: usize = LANE_MAX;

/// Inline-capacity buffer for node skip strings.
pub(crate) type SkipBytes = TinyVec<[u8; 16]>;

/// Embedded fields reused to thread a retired node onto the per-map
/// retired list without a separate allocation.
#[repr(C)]
pub(crate) struct RetireLinks {
    /// Epoch at the moment of retirement.
    pub(crate) epoch: AtomicU64,
    /// Next retired node in the lock-free stack.
    pub(crate) next: AtomicPtr<NodeBase>,
}

impl RetireLinks {
    fn new() -> Self {
        RetireLinks {
            epoch: AtomicU64::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// The common prefix shared by every node variant.
#[repr(C)]
pub(crate) struct NodeBase {
    /// Packed kind/poison/version word.
    pub(crate) header: Header,
    /// The prefix consumed at this node. Immutable after construction;
    /// structural changes to a skip always allocate a replacement node.
    pub(crate) skip: SkipBytes,
    /// Retirement threading, see [`RetireLinks`].
    pub(crate) retire: RetireLinks,
}

impl NodeBase {
    pub(crate) fn new(kind: NodeKind, skip: &[u8]) -> Self {
        let mut skip_buf = SkipBytes::new();
        skip_buf.extend_from_slice(skip);
        NodeBase {
            header: Header::new(kind),
            skip: skip_buf,
            retire: RetireLinks::new(),
        }
    }
}

/// A single payload slot: an atomic pointer to a boxed value.
///
/// The cell owns its box. Slots that hand their box to the retirement
/// machinery are nulled first, so ownership is never shared.
#[repr(transparent)]
pub(crate) struct ValueCell<V>(AtomicPtr<V>);

impl<V> ValueCell<V> {
    /// An unoccupied slot.
    pub(crate) fn empty() -> Self {
        ValueCell(AtomicPtr::new(ptr::null_mut()))
    }

    /// A slot owning a freshly boxed `value`.
    pub(crate) fn with_value(value: V) -> Self {
        ValueCell(AtomicPtr::new(Box::into_raw(Box::new(value))))
    }

    /// Whether the slot currently holds a value.
    pub(crate) fn is_set(&self) -> bool {
        !self.0.load(Ordering::Acquire).is_null()
    }

    /// Copy the stored value out, if any.
    ///
    /// # Safety
    ///
    /// The loaded box must still be allocated. That holds whenever the
    /// owning node is reachable from a live root or sits on the retired
    /// list inside the caller's reclamation grace period.
    pub(crate) unsafe fn read(&self) -> Option<V>
    where
        V: Clone,
    {
        let value = self.0.load(Ordering::Acquire);
        if value.is_null() {
            None
        } else {
            // SAFETY: Non-null boxes stay allocated for the grace period
            // per the function contract, and stored values are never
            // mutated in place.
            Some(unsafe { (*value).clone() })
        }
    }

    /// Box `value` and publish it into an empty slot.
    pub(crate) fn install(&self, value: V) {
        let raw = Box::into_raw(Box::new(value));
        let prev = self.0.swap(raw, Ordering::Release);
        debug_assert!(prev.is_null(), "value slot was already occupied");
    }

    /// Adopt an already-boxed value into an empty slot.
    pub(crate) fn adopt(&self, raw: *mut V) {
        let prev = self.0.swap(raw, Ordering::Release);
        debug_assert!(prev.is_null(), "value slot was already occupied");
    }

    /// Empty the slot, returning the raw box for deferred destruction.
    pub(crate) fn clear(&self) -> *mut V {
        self.0.swap(ptr::null_mut(), Ordering::AcqRel)
    }
}

impl<V> Drop for ValueCell<V> {
    fn drop(&mut self) {
        let value = *self.0.get_mut();
        if !value.is_null() {
            // SAFETY: The cell owns its box; slots handed to the retired
            // list are nulled before the node is freed.
            unsafe { drop(Box::from_raw(value)) };
        }
    }
}

/// Leaf holding exactly one value; matches exactly the key `skip`.
#[repr(C)]
pub(crate) struct SkipLeaf<V> {
    pub(crate) base: NodeBase,
    pub(crate) value: ValueCell<V>,
}

/// Leaf with up to seven labeled value slots; matches `skip · b` for each
/// stored label `b`.
#[repr(C)]
pub(crate) struct ListLeaf<V> {
    pub(crate) base: NodeBase,
    pub(crate) lanes: ByteLanes,
    pub(crate) values: [ValueCell<V>; LIST_MAX],
}

/// Dense leaf: a 256-bit presence set with one value slot per byte.
#[repr(C)]
pub(crate) struct FullLeaf<V> {
    pub(crate) base: NodeBase,
    pub(crate) present: BitSet256,
    pub(crate) values: [ValueCell<V>; 256],
}

/// Interior with up to seven labeled children and an optional
/// end-of-string value (variable-length keys only).
#[repr(C)]
pub(crate) struct ListInterior<V> {
    pub(crate) base: NodeBase,
    pub(crate) lanes: ByteLanes,
    pub(crate) children: [AtomicPtr<NodeBase>; LIST_MAX],
    pub(crate) eos: ValueCell<V>,
}

/// Dense interior: child table indexed by byte, presence bitmap, optional
/// end-of-string value.
#[repr(C)]
pub(crate) struct FullInterior<V> {
    pub(crate) base: NodeBase,
    pub(crate) present: BitSet256,
    pub(crate) children: [AtomicPtr<NodeBase>; 256],
    pub(crate) eos: ValueCell<V>,
}

impl<V> SkipLeaf<V> {
    pub(crate) fn new(skip: &[u8], value: V) -> Self {
        SkipLeaf {
            base: NodeBase::new(NodeKind::SkipLeaf, skip),
            value: ValueCell::with_value(value),
        }
    }

    /// Build a leaf around an already-boxed value (retirement tombstones).
    pub(crate) fn adopting(skip: &[u8], raw: *mut V) -> Self {
        let leaf = SkipLeaf {
            base: NodeBase::new(NodeKind::SkipLeaf, skip),
            value: ValueCell::empty(),
        };
        leaf.value.adopt(raw);
        leaf
    }
}

impl<V> ListLeaf<V> {
    pub(crate) fn new(skip: &[u8]) -> Self {
        ListLeaf {
            base: NodeBase::new(NodeKind::ListLeaf, skip),
            lanes: ByteLanes::new(),
            values: std::array::from_fn(|_| ValueCell::empty()),
        }
    }

    pub(crate) fn lanes(&self) -> LaneSet {
        self.lanes.snapshot(Ordering::Acquire)
    }

    pub(crate) fn has(&self, label: u8) -> bool {
        self.lanes().has(label)
    }

    /// Append a labeled value. The slot is written before the lane word is
    /// published, so a concurrent reader sees either the old or the new
    /// occupancy.
    pub(crate) fn add_value(&self, label: u8, value: V) {
        let view = self.lanes.snapshot(Ordering::Relaxed);
        debug_assert!(view.count() < LIST_MAX, "list leaf is full");
        debug_assert!(view.find(label).is_none(), "label already present");
        self.values[view.count()].install(value);
        self.lanes.add(label);
    }

    /// Remove a labeled value in place, returning the box for deferred
    /// destruction. The caller bumps the node version first.
    pub(crate) fn remove_value(&self, label: u8) -> *mut V {
        let view = self.lanes.snapshot(Ordering::Relaxed);
        let index = match view.find(label) {
            Some(index) => index,
            None => return ptr::null_mut(),
        };
        let removed = self.values[index].clear();
        let count = view.count();
        for lane in index..count - 1 {
            let shifted = self.values[lane + 1].clear();
            self.values[lane].adopt(shifted);
        }
        self.lanes.remove_at(index);
        removed
    }

    /// Copy every labeled value into `dst`, which must be unpublished.
    ///
    /// # Safety
    ///
    /// Source boxes must be inside the caller's grace period (see
    /// [`ValueCell::read`]).
    pub(crate) unsafe fn copy_values_to(&self, dst: &ListLeaf<V>)
    where
        V: Clone,
    {
        let view = self.lanes();
        for (index, label) in view.iter() {
            // SAFETY: Covered by the function contract.
            if let Some(value) = unsafe { self.values[index].read() } {
                dst.add_value(label, value);
            }
        }
    }

    /// Copy every labeled value into a dense leaf under construction.
    ///
    /// # Safety
    ///
    /// Same contract as [`ListLeaf::copy_values_to`].
    pub(crate) unsafe fn copy_values_to_full(&self, dst: &FullLeaf<V>)
    where
        V: Clone,
    {
        let view = self.lanes();
        for (index, label) in view.iter() {
            // SAFETY: Covered by the function contract.
            if let Some(value) = unsafe { self.values[index].read() } {
                dst.add_value(label, value);
            }
        }
    }
}

impl<V> FullLeaf<V> {
    pub(crate) fn new(skip: &[u8]) -> Self {
        FullLeaf {
            base: NodeBase::new(NodeKind::FullLeaf, skip),
            present: BitSet256::new(),
            values: std::array::from_fn(|_| ValueCell::empty()),
        }
    }

    pub(crate) fn has(&self, label: u8) -> bool {
        self.present.test(label, Ordering::Acquire)
    }

    pub(crate) fn count(&self) -> usize {
        self.present.count()
    }

    pub(crate) fn bitmap(&self) -> BitSnapshot {
        self.present.snapshot(Ordering::Acquire)
    }

    /// Publish a labeled value: the slot is written before the presence bit
    /// so a reader that observes the bit also observes the value.
    pub(crate) fn add_value(&self, label: u8, value: V) {
        debug_assert!(!self.has(label), "label already present");
        self.values[usize::from(label)].install(value);
        self.present.set(label, Ordering::Release);
    }

    /// Remove a labeled value in place: presence bit first, then the slot.
    pub(crate) fn remove_value(&self, label: u8) -> *mut V {
        self.present.clear(label, Ordering::Release);
        self.values[usize::from(label)].clear()
    }

    /// Copy every labeled value into `dst`, which must be unpublished.
    ///
    /// # Safety
    ///
    /// Same contract as [`ListLeaf::copy_values_to`].
    pub(crate) unsafe fn copy_values_to(&self, dst: &FullLeaf<V>)
    where
        V: Clone,
    {
        self.bitmap().for_each_set(|label| {
            // SAFETY: Covered by the function contract.
            if let Some(value) = unsafe { self.values[usize::from(label)].read() } {
                dst.add_value(label, value);
            }
        });
    }
}

impl<V> ListInterior<V> {
    pub(crate) fn new(skip: &[u8]) -> Self {
        ListInterior {
            base: NodeBase::new(NodeKind::ListInterior, skip),
            lanes: ByteLanes::new(),
            children: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            eos: ValueCell::empty(),
        }
    }

    pub(crate) fn lanes(&self) -> LaneSet {
        self.lanes.snapshot(Ordering::Acquire)
    }

    pub(crate) fn has(&self, label: u8) -> bool {
        self.lanes().has(label)
    }

    pub(crate) fn child_count(&self) -> usize {
        self.lanes().count()
    }

    pub(crate) fn child(&self, label: u8) -> *mut NodeBase {
        match self.lanes().find(label) {
            Some(index) => self.children[index].load(Ordering::Acquire),
            None => ptr::null_mut(),
        }
    }

    /// The slot holding the child for `label`. Slot identity is only stable
    /// while the writer lock is held.
    pub(crate) fn child_slot(&self, label: u8) -> Option<&AtomicPtr<NodeBase>> {
        self.lanes().find(label).map(|index| &self.children[index])
    }

    /// The lowest-index occupied lane, as `(label, child)`.
    pub(crate) fn first_child(&self) -> Option<(u8, *mut NodeBase)> {
        let view = self.lanes();
        if view.count() == 0 {
            return None;
        }
        Some((view.char_at(0), self.children[0].load(Ordering::Acquire)))
    }

    /// Append a child: pointer slot first, lane word (with new count) last.
    pub(crate) fn add_child(&self, label: u8, child: *mut NodeBase) {
        let view = self.lanes.snapshot(Ordering::Relaxed);
        debug_assert!(view.count() < LIST_MAX, "list interior is full");
        debug_assert!(view.find(label).is_none(), "label already present");
        self.children[view.count()].store(child, Ordering::Release);
        self.lanes.add(label);
    }

    /// Construction-time helper for the split transitions.
    pub(crate) fn add_two_children(
        &self,
        label_a: u8,
        child_a: *mut NodeBase,
        label_b: u8,
        child_b: *mut NodeBase,
    ) {
        self.add_child(label_a, child_a);
        self.add_child(label_b, child_b);
    }

    /// Remove the child for `label` in place, returning it. The caller
    /// bumps the node version first.
    pub(crate) fn remove_child(&self, label: u8) -> *mut NodeBase {
        let view = self.lanes.snapshot(Ordering::Relaxed);
        let index = match view.find(label) {
            Some(index) => index,
            None => return ptr::null_mut(),
        };
        let removed = self.children[index].load(Ordering::Relaxed);
        let count = view.count();
        for lane in index..count - 1 {
            let shifted = self.children[lane + 1].load(Ordering::Relaxed);
            self.children[lane].store(shifted, Ordering::Release);
        }
        self.children[count - 1].store(ptr::null_mut(), Ordering::Release);
        self.lanes.remove_at(index);
        removed
    }

    /// Copy lanes, borrowed child pointers, and a cloned end-of-string
    /// value into `dst`, which must be unpublished.
    ///
    /// # Safety
    ///
    /// Value boxes must be inside the caller's grace period. The child
    /// pointers are borrowed, so `dst` must stay poisoned until commit.
    pub(crate) unsafe fn copy_interior_to(&self, dst: &ListInterior<V>)
    where
        V: Clone,
    {
        let view = self.lanes();
        for (index, label) in view.iter() {
            dst.add_child(label, self.children[index].load(Ordering::Acquire));
        }
        // SAFETY: Covered by the function contract.
        if let Some(value) = unsafe { self.eos.read() } {
            dst.eos.install(value);
        }
    }

    /// Same as [`ListInterior::copy_interior_to`], into a dense interior.
    ///
    /// # Safety
    ///
    /// Same contract as [`ListInterior::copy_interior_to`].
    pub(crate) unsafe fn copy_interior_to_full(&self, dst: &FullInterior<V>)
    where
        V: Clone,
    {
        let view = self.lanes();
        for (index, label) in view.iter() {
            dst.add_child(label, self.children[index].load(Ordering::Acquire));
        }
        // SAFETY: Covered by the function contract.
        if let Some(value) = unsafe { self.eos.read() } {
            dst.eos.install(value);
        }
    }
}

impl<V> FullInterior<V> {
    pub(crate) fn new(skip: &[u8]) -> Self {
        FullInterior {
            base: NodeBase::new(NodeKind::FullInterior, skip),
            present: BitSet256::new(),
            children: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            eos: ValueCell::empty(),
        }
    }

    pub(crate) fn has(&self, label: u8) -> bool {
        self.present.test(label, Ordering::Acquire)
    }

    pub(crate) fn child_count(&self) -> usize {
        self.present.count()
    }

    pub(crate) fn child(&self, label: u8) -> *mut NodeBase {
        self.children[usize::from(label)].load(Ordering::Acquire)
    }

    pub(crate) fn child_slot(&self, label: u8) -> &AtomicPtr<NodeBase> {
        &self.children[usize::from(label)]
    }

    pub(crate) fn bitmap(&self) -> BitSnapshot {
        self.present.snapshot(Ordering::Acquire)
    }

    pub(crate) fn first_child(&self) -> Option<(u8, *mut NodeBase)> {
        let label = self.bitmap().first()?;
        Some((label, self.child(label)))
    }

    /// Publish a child: slot first, presence bit last.
    pub(crate) fn add_child(&self, label: u8, child: *mut NodeBase) {
        debug_assert!(!self.has(label), "label already present");
        self.children[usize::from(label)].store(child, Ordering::Release);
        self.present.set(label, Ordering::Release);
    }

    /// Remove the child for `label` in place: presence bit first, slot
    /// second. The caller bumps the node version first.
    pub(crate) fn remove_child(&self, label: u8) -> *mut NodeBase {
        self.present.clear(label, Ordering::Release);
        self.children[usize::from(label)].swap(ptr::null_mut(), Ordering::AcqRel)
    }

    /// Copy the bitmap, borrowed child pointers, and a cloned
    /// end-of-string value into `dst`, which must be unpublished.
    ///
    /// # Safety
    ///
    /// Same contract as [`ListInterior::copy_interior_to`].
    pub(crate) unsafe fn copy_interior_to(&self, dst: &FullInterior<V>)
    where
        V: Clone,
    {
        self.bitmap().for_each_set(|label| {
            dst.add_child(label, self.child(label));
        });
        // SAFETY: Covered by the function contract.
        if let Some(value) = unsafe { self.eos.read() } {
            dst.eos.install(value);
        }
    }
}

pub(crate) mod private {
    /// Seals the [`super::Node`] trait to this crate's variants.
    pub trait Sealed {}

    impl<V> Sealed for super::SkipLeaf<V> {}
    impl<V> Sealed for super::ListLeaf<V> {}
    impl<V> Sealed for super::FullLeaf<V> {}
    impl<V> Sealed for super::ListInterior<V> {}
    impl<V> Sealed for super::FullInterior<V> {}
}

/// Implemented by every concrete node variant; ties the compile-time kind
/// tag to the runtime header bits.
pub(crate) trait Node: private::Sealed {
    /// The kind recorded in this variant's header.
    const KIND: NodeKind;
    /// The payload type.
    type Value;

    /// The shared node prefix.
    fn base(&self) -> &NodeBase;
}

macro_rules! impl_node {
    ($($ty:ident => $kind:expr),*) => {
        $(
            impl<V> Node for $ty<V> {
                const KIND: NodeKind = $kind;
                type Value = V;

                fn base(&self) -> &NodeBase {
                    &self.base
                }
            }
        )*
    };
}

impl_node!(
    SkipLeaf => NodeKind::SkipLeaf,
    ListLeaf => NodeKind::ListLeaf,
    FullLeaf => NodeKind::FullLeaf,
    ListInterior => NodeKind::ListInterior,
    FullInterior => NodeKind::FullInterior
);

/// A typed pointer to a concrete node variant.
#[repr(transparent)]
pub(crate) struct NodePtr<N: Node>(NonNull<N>);

impl<N: Node> NodePtr<N> {
    /// Wrap a raw node pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null, aligned, and valid for reads and writes of
    /// an `N` allocated by [`NodePtr::allocate`].
    pub(crate) unsafe fn new(ptr: *mut N) -> Self {
        // SAFETY: Non-null is required by the function contract.
        NodePtr(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// Move `node` to the heap and return its pointer.
    pub(crate) fn allocate(node: N) -> Self {
        // SAFETY: `Box::into_raw` yields a non-null, aligned, valid
        // pointer.
        unsafe { NodePtr::new(Box::into_raw(Box::new(node))) }
    }

    /// Reconstruct and drop the box behind this pointer.
    ///
    /// # Safety
    ///
    /// May only be called once per allocation, with no other live
    /// references to the node.
    pub(crate) unsafe fn deallocate(self) -> N {
        // SAFETY: Covered by the function contract.
        unsafe { *Box::from_raw(self.0.as_ptr()) }
    }

    /// Shared reference with a caller-chosen lifetime.
    ///
    /// # Safety
    ///
    /// The node must stay allocated for `'a` and must not be mutated
    /// through any path that bypasses its atomic fields.
    pub(crate) unsafe fn as_ref<'a>(self) -> &'a N {
        // SAFETY: Covered by the function contract.
        unsafe { self.0.as_ref() }
    }

    /// Erase the variant type.
    pub(crate) fn to_opaque(self) -> OpaqueNodePtr<N::Value> {
        OpaqueNodePtr(self.0.cast::<NodeBase>(), PhantomData)
    }
}

impl<N: Node> Clone for NodePtr<N> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<N: Node> Copy for NodePtr<N> {}

impl<N: Node> fmt::Debug for NodePtr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodePtr").field(&self.0).finish()
    }
}

/// A kind-erased pointer to some node whose payload type is `V`.
///
/// The header's variant bits select which downcast is valid; the downcast
/// itself is a pointer cast to the layout-compatible concrete struct.
#[repr(transparent)]
pub(crate) struct OpaqueNodePtr<V>(NonNull<NodeBase>, PhantomData<V>);

impl<V> Copy for OpaqueNodePtr<V> {}
impl<V> Clone for OpaqueNodePtr<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> PartialEq for OpaqueNodePtr<V> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<V> Eq for OpaqueNodePtr<V> {}

impl<V> fmt::Debug for OpaqueNodePtr<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OpaqueNodePtr").field(&self.0).finish()
    }
}

/// Downcast result carrying the concrete variant pointer.
pub(crate) enum ConcreteNodePtr<V> {
    /// Single-value leaf.
    SkipLeaf(NodePtr<SkipLeaf<V>>),
    /// 7-slot leaf.
    ListLeaf(NodePtr<ListLeaf<V>>),
    /// Dense leaf.
    FullLeaf(NodePtr<FullLeaf<V>>),
    /// 7-slot interior.
    ListInterior(NodePtr<ListInterior<V>>),
    /// Dense interior.
    FullInterior(NodePtr<FullInterior<V>>),
}

impl<V> OpaqueNodePtr<V> {
    /// Wrap a non-null base pointer.
    ///
    /// # Safety
    ///
    /// `raw` must point at a node whose payload type is `V` (or at the
    /// retry sentinel, which is never downcast).
    pub(crate) unsafe fn from_raw(raw: NonNull<NodeBase>) -> Self {
        OpaqueNodePtr(raw, PhantomData)
    }

    /// Wrap a possibly-null raw pointer.
    ///
    /// # Safety
    ///
    /// Same contract as [`OpaqueNodePtr::from_raw`].
    pub(crate) unsafe fn from_ptr(raw: *mut NodeBase) -> Option<Self> {
        // SAFETY: Covered by the function contract.
        NonNull::new(raw).map(|nn| unsafe { OpaqueNodePtr::from_raw(nn) })
    }

    /// The underlying base pointer.
    pub(crate) fn as_ptr(self) -> *mut NodeBase {
        self.0.as_ptr()
    }

    /// Shared reference to the common prefix.
    ///
    /// # Safety
    ///
    /// The node must stay allocated for `'a`.
    pub(crate) unsafe fn base<'a>(self) -> &'a NodeBase {
        // SAFETY: Covered by the function contract.
        unsafe { self.0.as_ref() }
    }

    /// One load of the header word.
    ///
    /// # Safety
    ///
    /// The node must still be allocated.
    pub(crate) unsafe fn header(self) -> HeaderSnapshot {
        // SAFETY: Covered by the function contract.
        unsafe { self.base() }.header.snapshot()
    }

    /// The node's skip string.
    ///
    /// # Safety
    ///
    /// The node must stay allocated for `'a`. Skips are immutable after
    /// construction, so no synchronization is needed beyond the pointer
    /// acquire that produced `self`.
    pub(crate) unsafe fn skip<'a>(self) -> &'a [u8] {
        // SAFETY: Covered by the function contract.
        unsafe { self.base() }.skip.as_slice()
    }

    /// Whether the node is poisoned.
    ///
    /// # Safety
    ///
    /// The node must still be allocated.
    pub(crate) unsafe fn is_poisoned(self) -> bool {
        // SAFETY: Covered by the function contract.
        unsafe { self.header() }.is_poisoned()
    }

    /// Current version counter.
    ///
    /// # Safety
    ///
    /// The node must still be allocated.
    pub(crate) unsafe fn version(self) -> u64 {
        // SAFETY: Covered by the function contract.
        unsafe { self.header() }.version()
    }

    /// Downcast to the concrete variant named by the header bits.
    ///
    /// # Safety
    ///
    /// The node must have been allocated with payload type `V`, must still
    /// be allocated, and must not be the retry sentinel.
    pub(crate) unsafe fn to_node_ptr(self) -> ConcreteNodePtr<V> {
        debug_assert!(!is_sentinel(self.as_ptr()), "downcast of the retry sentinel");
        // SAFETY: The kind bits were written at allocation time from the
        // variant's `Node::KIND`, so the cast target matches the
        // allocation; layouts share the `NodeBase` prefix via `repr(C)`.
        unsafe {
            match self.header().kind() {
                NodeKind::SkipLeaf => {
                    ConcreteNodePtr::SkipLeaf(NodePtr::new(self.as_ptr().cast()))
                }
                NodeKind::ListLeaf => {
                    ConcreteNodePtr::ListLeaf(NodePtr::new(self.as_ptr().cast()))
                }
                NodeKind::FullLeaf => {
                    ConcreteNodePtr::FullLeaf(NodePtr::new(self.as_ptr().cast()))
                }
                NodeKind::ListInterior => {
                    ConcreteNodePtr::ListInterior(NodePtr::new(self.as_ptr().cast()))
                }
                NodeKind::FullInterior => {
                    ConcreteNodePtr::FullInterior(NodePtr::new(self.as_ptr().cast()))
                }
            }
        }
    }

    /// Child lookup on an interior node; null when absent or when called
    /// on a leaf.
    ///
    /// # Safety
    ///
    /// Same contract as [`OpaqueNodePtr::to_node_ptr`].
    pub(crate) unsafe fn child(self, label: u8) -> *mut NodeBase {
        // SAFETY: Covered by the function contract.
        unsafe {
            match self.to_node_ptr() {
                ConcreteNodePtr::ListInterior(node) => node.as_ref().child(label),
                ConcreteNodePtr::FullInterior(node) => node.as_ref().child(label),
                _ => ptr::null_mut(),
            }
        }
    }

    /// Number of children of an interior node (0 for leaves).
    ///
    /// # Safety
    ///
    /// Same contract as [`OpaqueNodePtr::to_node_ptr`].
    pub(crate) unsafe fn child_count(self) -> usize {
        // SAFETY: Covered by the function contract.
        unsafe {
            match self.to_node_ptr() {
                ConcreteNodePtr::ListInterior(node) => node.as_ref().child_count(),
                ConcreteNodePtr::FullInterior(node) => node.as_ref().child_count(),
                _ => 0,
            }
        }
    }

    /// Whether an interior node carries an end-of-string value.
    ///
    /// # Safety
    ///
    /// Same contract as [`OpaqueNodePtr::to_node_ptr`].
    pub(crate) unsafe fn has_eos(self) -> bool {
        // SAFETY: Covered by the function contract.
        unsafe {
            match self.to_node_ptr() {
                ConcreteNodePtr::ListInterior(node) => node.as_ref().eos.is_set(),
                ConcreteNodePtr::FullInterior(node) => node.as_ref().eos.is_set(),
                _ => false,
            }
        }
    }

    /// Copy an interior node's end-of-string value out, if any.
    ///
    /// # Safety
    ///
    /// Same contract as [`OpaqueNodePtr::to_node_ptr`] plus the grace
    /// period requirement of [`ValueCell::read`].
    pub(crate) unsafe fn read_eos(self) -> Option<V>
    where
        V: Clone,
    {
        // SAFETY: Covered by the function contract.
        unsafe {
            match self.to_node_ptr() {
                ConcreteNodePtr::ListInterior(node) => node.as_ref().eos.read(),
                ConcreteNodePtr::FullInterior(node) => node.as_ref().eos.read(),
                _ => None,
            }
        }
    }

    /// First child of an interior node, as `(label, child)`.
    ///
    /// # Safety
    ///
    /// Same contract as [`OpaqueNodePtr::to_node_ptr`].
    pub(crate) unsafe fn first_child(self) -> Option<(u8, *mut NodeBase)> {
        // SAFETY: Covered by the function contract.
        unsafe {
            match self.to_node_ptr() {
                ConcreteNodePtr::ListInterior(node) => node.as_ref().first_child(),
                ConcreteNodePtr::FullInterior(node) => node.as_ref().first_child(),
                _ => None,
            }
        }
    }
}

struct SentinelCell(NodeBase);

// SAFETY: The sentinel's interior is only ever accessed through its atomic
// header; the skip and retire fields are written once at initialization.
unsafe impl Sync for SentinelCell {}
unsafe impl Send for SentinelCell {}

static RETRY_SENTINEL: OnceLock<SentinelCell> = OnceLock::new();

/// The statically allocated poisoned placeholder stored transiently into a
/// slot while a publish is in flight. Readers treat it exactly like any
/// poisoned node; writers compare addresses to skip it.
pub(crate) fn retry_sentinel() -> *mut NodeBase {
    let cell = RETRY_SENTINEL.get_or_init(|| {
        let base = NodeBase::new(NodeKind::SkipLeaf, &[]);
        base.header.poison();
        SentinelCell(base)
    });
    &cell.0 as *const NodeBase as *mut NodeBase
}

/// Whether `ptr` is the retry sentinel.
pub(crate) fn is_sentinel(ptr: *mut NodeBase) -> bool {
    !ptr.is_null() && ptr::eq(ptr, retry_sentinel())
}

/// Whether `ptr` is null or the retry sentinel, i.e. not a real node.
pub(crate) fn is_absent(ptr: *mut NodeBase) -> bool {
    ptr.is_null() || is_sentinel(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_cell_owns_its_box() {
        let cell = ValueCell::with_value(41u32);
        assert!(cell.is_set());
        // SAFETY: The cell was just created and owns a live box.
        assert_eq!(unsafe { cell.read() }, Some(41));
        let raw = cell.clear();
        assert!(!cell.is_set());
        // SAFETY: `clear` transferred ownership of the box to us.
        unsafe { drop(Box::from_raw(raw)) };
    }

    #[test]
    fn list_leaf_add_remove() {
        let leaf = ListLeaf::<u32>::new(b"pre");
        for (i, label) in [10u8, 20, 30].into_iter().enumerate() {
            leaf.add_value(label, u32::from(label) * 10);
            assert_eq!(leaf.lanes().count(), i + 1);
        }
        assert!(leaf.has(20));
        let index = leaf.lanes().find(20).unwrap();
        // SAFETY: The leaf is local to this test.
        assert_eq!(unsafe { leaf.values[index].read() }, Some(200));

        let removed = leaf.remove_value(20);
        assert!(!removed.is_null());
        // SAFETY: `remove_value` transferred ownership of the box to us.
        unsafe { drop(Box::from_raw(removed)) };
        assert!(!leaf.has(20));
        assert_eq!(leaf.lanes().count(), 2);
        let index = leaf.lanes().find(30).unwrap();
        // SAFETY: The leaf is local to this test.
        assert_eq!(unsafe { leaf.values[index].read() }, Some(300));
    }

    #[test]
    fn full_leaf_bit_before_value_order() {
        let leaf = FullLeaf::<String>::new(&[]);
        leaf.add_value(7, "seven".to_string());
        assert!(leaf.has(7));
        assert_eq!(leaf.count(), 1);
        // SAFETY: The leaf is local to this test.
        assert_eq!(unsafe { leaf.values[7].read() }, Some("seven".to_string()));
        let removed = leaf.remove_value(7);
        assert!(!leaf.has(7));
        // SAFETY: `remove_value` transferred ownership of the box to us.
        unsafe { drop(Box::from_raw(removed)) };
    }

    #[test]
    fn interior_child_round_trip() {
        let interior = ListInterior::<u32>::new(b"ab");
        let child_a = NodePtr::allocate(SkipLeaf::new(b"x", 1u32));
        let child_b = NodePtr::allocate(SkipLeaf::new(b"y", 2u32));
        interior.add_two_children(
            b'a',
            child_a.to_opaque().as_ptr(),
            b'b',
            child_b.to_opaque().as_ptr(),
        );

        assert_eq!(interior.child_count(), 2);
        assert_eq!(interior.child(b'a'), child_a.to_opaque().as_ptr());
        assert_eq!(interior.child(b'b'), child_b.to_opaque().as_ptr());
        assert!(interior.child(b'c').is_null());

        let removed = interior.remove_child(b'a');
        assert_eq!(removed, child_a.to_opaque().as_ptr());
        assert_eq!(interior.child_count(), 1);
        assert_eq!(interior.first_child().unwrap().0, b'b');

        // SAFETY: Both leaves were allocated above and have no other refs.
        unsafe {
            child_a.deallocate();
            child_b.deallocate();
        }
    }

    #[test]
    fn opaque_downcast_matches_kind() {
        let leaf = NodePtr::allocate(SkipLeaf::new(b"key", 9i64));
        let opaque = leaf.to_opaque();
        // SAFETY: Allocated with payload i64 just above.
        unsafe {
            assert_eq!(opaque.header().kind(), NodeKind::SkipLeaf);
            assert_eq!(opaque.skip(), b"key");
            match opaque.to_node_ptr() {
                ConcreteNodePtr::SkipLeaf(node) => {
                    assert_eq!(node.as_ref().value.read(), Some(9));
                }
                _ => panic!("downcast picked the wrong variant"),
            }
            leaf.deallocate();
        }
    }

    #[test]
    fn sentinel_is_poisoned_and_stable() {
        let a = retry_sentinel();
        let b = retry_sentinel();
        assert_eq!(a, b);
        assert!(is_sentinel(a));
        assert!(is_absent(a));
        assert!(is_absent(ptr::null_mut()));
        // SAFETY: The sentinel is statically allocated.
        unsafe {
            let opaque = OpaqueNodePtr::<u32>::from_ptr(a).unwrap();
            assert!(opaque.is_poisoned());
        }
    }
}
