//! The speculative insert layer: lock-free probe and out-of-lock
//! allocation.
//!
//! A probe walks from the root without any lock, classifies the pending
//! insert into one of the named structural cases, and records every
//! visited node with the version it had. For the replacement cases the
//! writer then builds the whole replacement subtree, still outside the
//! lock, with every new node poisoned, so that an aborted commit frees
//! only the new nodes and never recurses into the borrowed children. The
//! brief critical section re-validates the recorded versions, verifies the
//! parent slot, un-poisons, and swaps.

use crate::nodes::builder::NodeBuilder;
use crate::nodes::operations::insert::{create_leaf_for_key, match_len};
use crate::nodes::operations::MAX_DEPTH;
use crate::nodes::representation::{
    is_absent, ConcreteNodePtr, NodeBase, OpaqueNodePtr, SkipBytes, LIST_MAX,
};
use arrayvec::ArrayVec;
use smallvec::SmallVec;

/// One step of a recorded probe path.
#[derive(Clone, Copy)]
pub(crate) struct PathEntry<V> {
    pub(crate) node: OpaqueNodePtr<V>,
    pub(crate) version: u64,
    /// Edge byte taken from the previous path node into this one
    /// (meaningless for the root entry).
    pub(crate) edge: u8,
}

/// The structural case a probe classified the insert into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpecOp {
    /// Concurrent write observed; probe again.
    Retry,
    /// Key already present; nothing to do.
    Exists,
    /// Null root; a fresh leaf becomes the root.
    EmptyTree,
    /// Mismatch inside a skip leaf's skip, both remainders non-empty.
    SplitLeafSkip,
    /// Key is a strict prefix of a skip leaf's skip.
    PrefixLeafSkip,
    /// A skip leaf's skip is a strict prefix of the key.
    ExtendLeafSkip,
    /// Mismatch inside a LIST/FULL leaf's skip, both remainders non-empty.
    SplitLeafList,
    /// Key is a strict prefix of a LIST/FULL leaf's skip.
    PrefixLeafList,
    /// Key equals a LIST/FULL leaf's skip; needs end-of-string promotion.
    AddEosLeafList,
    /// Add a label to a LIST/FULL leaf with spare capacity.
    InPlaceLeaf,
    /// LIST leaf at capacity; rebuild as a FULL leaf.
    ListToFullLeaf,
    /// Key runs more than one byte past a LIST/FULL leaf.
    DemoteLeafList,
    /// Mismatch inside an interior's skip, both remainders non-empty.
    SplitInterior,
    /// Key is a strict prefix of an interior's skip.
    PrefixInterior,
    /// Add a child or end-of-string value to an interior in place.
    InPlaceInterior,
    /// LIST interior at capacity; convert to FULL, then add the child.
    AddChildConvert,
    /// Too deep or too complex for the speculative path; take the locked
    /// fallback immediately.
    Fallback,
}

/// Everything a probe learned about one pending insert.
pub(crate) struct SpecInfo<V> {
    pub(crate) op: SpecOp,
    pub(crate) path: ArrayVec<PathEntry<V>, MAX_DEPTH>,
    /// The node whose slot (or fields) the commit touches.
    pub(crate) target: Option<OpaqueNodePtr<V>>,
    pub(crate) target_version: u64,
    /// Offset of the first mismatching byte within the target's skip.
    pub(crate) match_pos: usize,
    /// The unconsumed key suffix at the target.
    pub(crate) remaining_key: SkipBytes,
    /// Label being added (edge byte or leaf label), where relevant.
    pub(crate) label: u8,
    /// In-place interior case is an end-of-string set, not a child add.
    pub(crate) is_eos: bool,
}

impl<V> SpecInfo<V> {
    fn new(op: SpecOp) -> Self {
        SpecInfo {
            op,
            path: ArrayVec::new(),
            target: None,
            target_version: 0,
            match_pos: 0,
            remaining_key: SkipBytes::new(),
            label: 0,
            is_eos: false,
        }
    }

    fn set_target(&mut self, node: OpaqueNodePtr<V>, version: u64) {
        self.target = Some(node);
        self.target_version = version;
    }

    fn keep_key(&mut self, key: &[u8]) {
        self.remaining_key.clear();
        self.remaining_key.extend_from_slice(key);
    }
}

/// Classify the insert of `key` without taking any lock.
///
/// # Safety
///
/// The caller must hold a reclamation guard so that every node reached
/// from `root` stays allocated for the duration of the call.
pub(crate) unsafe fn probe_insert<V>(
    root: *mut NodeBase,
    key: &[u8],
    variable_len: bool,
) -> SpecInfo<V> {
    let mut info = SpecInfo::new(SpecOp::EmptyTree);
    info.keep_key(key);
    if is_absent(root) {
        return info;
    }
    // SAFETY: All node accesses below are covered by the function
    // contract.
    unsafe {
        let mut node = OpaqueNodePtr::<V>::from_ptr(root).expect("absent check covers null");
        let mut key = key;

        let header = node.header();
        if header.is_poisoned() {
            info.op = SpecOp::Retry;
            return info;
        }
        info.path.push(PathEntry {
            node,
            version: header.version(),
            edge: 0,
        });

        loop {
            let header = node.header();
            if header.is_leaf() {
                return probe_leaf(node, key, info);
            }

            let skip = node.skip();
            let m = match_len(skip, key);

            if m < skip.len() && m < key.len() {
                info.op = SpecOp::SplitInterior;
                info.set_target(node, header.version());
                info.match_pos = m;
                info.keep_key(key);
                return info;
            }
            if m < skip.len() {
                info.op = SpecOp::PrefixInterior;
                info.set_target(node, header.version());
                info.match_pos = m;
                info.keep_key(key);
                return info;
            }
            key = &key[m..];

            if key.is_empty() {
                if !variable_len {
                    // Fixed-length keys exhaust exactly at leaves; an
                    // interior hit means the probe raced a reshape.
                    info.op = SpecOp::Retry;
                    return info;
                }
                if node.has_eos() {
                    info.op = SpecOp::Exists;
                    return info;
                }
                info.op = SpecOp::InPlaceInterior;
                info.set_target(node, header.version());
                info.is_eos = true;
                return info;
            }

            let label = key[0];
            let child = node.child(label);

            if is_absent(child) {
                info.set_target(node, header.version());
                info.label = label;
                info.keep_key(&key[1..]);
                info.op = match node.to_node_ptr() {
                    ConcreteNodePtr::ListInterior(interior)
                        if interior.as_ref().child_count() >= LIST_MAX =>
                    {
                        SpecOp::AddChildConvert
                    }
                    _ => SpecOp::InPlaceInterior,
                };
                return info;
            }

            key = &key[1..];
            node = OpaqueNodePtr::from_ptr(child).expect("absent check covers null");

            let child_header = node.header();
            if child_header.is_poisoned() {
                info.op = SpecOp::Retry;
                return info;
            }
            if info
                .path
                .try_push(PathEntry {
                    node,
                    version: child_header.version(),
                    edge: label,
                })
                .is_err()
            {
                info.op = SpecOp::Fallback;
                return info;
            }
        }
    }
}

unsafe fn probe_leaf<V>(
    node: OpaqueNodePtr<V>,
    key: &[u8],
    mut info: SpecInfo<V>,
) -> SpecInfo<V> {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let header = node.header();
        if header.is_poisoned() {
            info.op = SpecOp::Retry;
            return info;
        }

        let skip = node.skip();
        let m = match_len(skip, key);

        if header.is_skip() {
            if m == skip.len() && m == key.len() {
                info.op = SpecOp::Exists;
                return info;
            }
            info.set_target(node, header.version());
            info.match_pos = m;
            info.keep_key(key);
            info.op = if m < skip.len() && m < key.len() {
                SpecOp::SplitLeafSkip
            } else if m == key.len() {
                SpecOp::PrefixLeafSkip
            } else {
                SpecOp::ExtendLeafSkip
            };
            return info;
        }

        info.set_target(node, header.version());

        if m < skip.len() && m < key.len() {
            info.op = SpecOp::SplitLeafList;
            info.match_pos = m;
            info.keep_key(key);
            return info;
        }
        if m < skip.len() {
            info.op = SpecOp::PrefixLeafList;
            info.match_pos = m;
            info.keep_key(key);
            return info;
        }
        let key = &key[m..];
        info.keep_key(key);

        if key.is_empty() {
            info.op = SpecOp::AddEosLeafList;
            return info;
        }
        if key.len() != 1 {
            info.op = SpecOp::DemoteLeafList;
            return info;
        }

        let label = key[0];
        info.label = label;

        match node.to_node_ptr() {
            ConcreteNodePtr::ListLeaf(leaf) => {
                let leaf = leaf.as_ref();
                if leaf.has(label) {
                    info.op = SpecOp::Exists;
                } else if leaf.lanes().count() < LIST_MAX {
                    info.op = SpecOp::InPlaceLeaf;
                } else {
                    info.op = SpecOp::ListToFullLeaf;
                }
            }
            ConcreteNodePtr::FullLeaf(leaf) => {
                info.op = if leaf.as_ref().has(label) {
                    SpecOp::Exists
                } else {
                    SpecOp::InPlaceLeaf
                };
            }
            _ => unreachable!("probe_leaf on an interior"),
        }
        info
    }
}

/// The poisoned replacement subtree built outside the lock.
pub(crate) struct SpecAlloc<V> {
    /// Root of the replacement; published into the target's slot.
    pub(crate) replacement: Option<OpaqueNodePtr<V>>,
    /// Every freshly allocated node, for un-poisoning or abort cleanup.
    pub(crate) nodes: SmallVec<[OpaqueNodePtr<V>; 4]>,
}

impl<V> SpecAlloc<V> {
    pub(crate) fn empty() -> Self {
        SpecAlloc {
            replacement: None,
            nodes: SmallVec::new(),
        }
    }

    pub(crate) fn add(&mut self, node: OpaqueNodePtr<V>) {
        // SAFETY: Nodes are registered immediately after allocation.
        unsafe { node.base() }.header.poison();
        self.nodes.push(node);
    }

    /// Clear the poison on every new node just before publishing.
    ///
    /// # Safety
    ///
    /// Caller must hold the writer lock and be about to publish the
    /// replacement.
    pub(crate) unsafe fn unpoison_all(&self) {
        for node in &self.nodes {
            // SAFETY: The nodes are unpublished allocations owned by this
            // speculation.
            unsafe { node.base() }.header.unpoison();
        }
    }
}

/// Build the replacement subtree for a classified probe, all new nodes
/// poisoned. In-place and fallback-bound cases allocate nothing.
///
/// # Safety
///
/// Same contract as [`probe_insert`]; the target must have been probed
/// with payload type `V`.
pub(crate) unsafe fn allocate_speculative<V: Clone>(
    builder: &NodeBuilder<V>,
    info: &SpecInfo<V>,
    value: &V,
) -> SpecAlloc<V> {
    let mut alloc = SpecAlloc::empty();
    let key: &[u8] = &info.remaining_key;
    let m = info.match_pos;

    // SAFETY: All node accesses below are covered by the function
    // contract; concurrent mutation of the target is tolerated because
    // the commit re-validates versions before publishing.
    unsafe {
        match info.op {
            SpecOp::EmptyTree => {
                let leaf = create_leaf_for_key(builder, key, value.clone());
                alloc.add(leaf);
                alloc.replacement = Some(leaf);
            }

            SpecOp::SplitLeafSkip => {
                let target = info.target.expect("split has a target");
                let skip = target.skip();
                let old_value = read_skip_value_or_default(target);
                let interior = builder.make_interior_list(&skip[..m]);
                let old_child = builder.make_leaf_skip(&skip[m + 1..], old_value);
                let new_child = create_leaf_for_key(builder, &key[m + 1..], value.clone());
                if let ConcreteNodePtr::ListInterior(node) = interior.to_node_ptr() {
                    node.as_ref().add_two_children(
                        skip[m],
                        old_child.as_ptr(),
                        key[m],
                        new_child.as_ptr(),
                    );
                }
                alloc.add(interior);
                alloc.add(old_child);
                alloc.add(new_child);
                alloc.replacement = Some(interior);
            }

            SpecOp::PrefixLeafSkip => {
                let target = info.target.expect("prefix has a target");
                let skip = target.skip();
                let old_value = read_skip_value_or_default(target);
                let interior = builder.make_interior_list(key);
                let child = builder.make_leaf_skip(&skip[m + 1..], old_value);
                if let ConcreteNodePtr::ListInterior(node) = interior.to_node_ptr() {
                    let node = node.as_ref();
                    node.eos.install(value.clone());
                    node.add_child(skip[m], child.as_ptr());
                }
                alloc.add(interior);
                alloc.add(child);
                alloc.replacement = Some(interior);
            }

            SpecOp::ExtendLeafSkip => {
                let target = info.target.expect("extend has a target");
                let skip = target.skip();
                let old_value = read_skip_value_or_default(target);
                let interior = builder.make_interior_list(skip);
                let child = create_leaf_for_key(builder, &key[m + 1..], value.clone());
                if let ConcreteNodePtr::ListInterior(node) = interior.to_node_ptr() {
                    let node = node.as_ref();
                    node.eos.install(old_value);
                    node.add_child(key[m], child.as_ptr());
                }
                alloc.add(interior);
                alloc.add(child);
                alloc.replacement = Some(interior);
            }

            SpecOp::SplitLeafList => {
                let target = info.target.expect("split has a target");
                let skip = target.skip();
                let interior = builder.make_interior_list(&skip[..m]);
                let old_child = clone_leaf_speculative(builder, target, &skip[m + 1..]);
                let new_child = create_leaf_for_key(builder, &key[m + 1..], value.clone());
                if let ConcreteNodePtr::ListInterior(node) = interior.to_node_ptr() {
                    node.as_ref().add_two_children(
                        skip[m],
                        old_child.as_ptr(),
                        key[m],
                        new_child.as_ptr(),
                    );
                }
                alloc.add(interior);
                alloc.add(old_child);
                alloc.add(new_child);
                alloc.replacement = Some(interior);
            }

            SpecOp::PrefixLeafList => {
                let target = info.target.expect("prefix has a target");
                let skip = target.skip();
                let interior = builder.make_interior_list(key);
                let old_child = clone_leaf_speculative(builder, target, &skip[m + 1..]);
                if let ConcreteNodePtr::ListInterior(node) = interior.to_node_ptr() {
                    let node = node.as_ref();
                    node.eos.install(value.clone());
                    node.add_child(skip[m], old_child.as_ptr());
                }
                alloc.add(interior);
                alloc.add(old_child);
                alloc.replacement = Some(interior);
            }

            SpecOp::ListToFullLeaf => {
                let target = info.target.expect("promotion has a target");
                let full = builder.make_leaf_full(target.skip());
                if let (ConcreteNodePtr::ListLeaf(src), ConcreteNodePtr::FullLeaf(dst)) =
                    (target.to_node_ptr(), full.to_node_ptr())
                {
                    src.as_ref().copy_values_to_full(dst.as_ref());
                    let dst = dst.as_ref();
                    if !dst.has(info.label) {
                        dst.add_value(info.label, value.clone());
                    }
                }
                alloc.add(full);
                alloc.replacement = Some(full);
            }

            SpecOp::SplitInterior => {
                let target = info.target.expect("split has a target");
                let skip = target.skip();
                let interior = builder.make_interior_list(&skip[..m]);
                let old_child = clone_interior_speculative(builder, target, &skip[m + 1..]);
                let new_child = create_leaf_for_key(builder, &key[m + 1..], value.clone());
                if let ConcreteNodePtr::ListInterior(node) = interior.to_node_ptr() {
                    node.as_ref().add_two_children(
                        skip[m],
                        old_child.as_ptr(),
                        key[m],
                        new_child.as_ptr(),
                    );
                }
                alloc.add(interior);
                alloc.add(old_child);
                alloc.add(new_child);
                alloc.replacement = Some(interior);
            }

            SpecOp::PrefixInterior => {
                let target = info.target.expect("prefix has a target");
                let skip = target.skip();
                let interior = builder.make_interior_list(key);
                let old_child = clone_interior_speculative(builder, target, &skip[m + 1..]);
                if let ConcreteNodePtr::ListInterior(node) = interior.to_node_ptr() {
                    let node = node.as_ref();
                    node.eos.install(value.clone());
                    node.add_child(skip[m], old_child.as_ptr());
                }
                alloc.add(interior);
                alloc.add(old_child);
                alloc.replacement = Some(interior);
            }

            SpecOp::AddChildConvert => {
                let target = info.target.expect("conversion has a target");
                let full = builder.make_interior_full(target.skip());
                let child = create_leaf_for_key(builder, key, value.clone());
                if let (
                    ConcreteNodePtr::ListInterior(src),
                    ConcreteNodePtr::FullInterior(dst),
                ) = (target.to_node_ptr(), full.to_node_ptr())
                {
                    src.as_ref().copy_interior_to_full(dst.as_ref());
                    let dst = dst.as_ref();
                    if !dst.has(info.label) {
                        dst.add_child(info.label, child.as_ptr());
                    }
                }
                alloc.add(full);
                alloc.add(child);
                alloc.replacement = Some(full);
            }

            // In-place, fallback-bound, and no-op cases allocate nothing.
            SpecOp::Retry
            | SpecOp::Exists
            | SpecOp::InPlaceLeaf
            | SpecOp::InPlaceInterior
            | SpecOp::AddEosLeafList
            | SpecOp::DemoteLeafList
            | SpecOp::Fallback => {}
        }
    }
    alloc
}

/// Free every node of an aborted speculation. The nodes are poisoned, so
/// borrowed children are never touched.
///
/// # Safety
///
/// The speculation must not have been published.
pub(crate) unsafe fn dealloc_speculation<V>(builder: &NodeBuilder<V>, alloc: SpecAlloc<V>) {
    for node in alloc.nodes {
        // SAFETY: Unpublished poisoned allocations owned by the
        // speculation.
        unsafe { builder.dealloc_node(node) };
    }
}

/// Re-read every version recorded by the probe, plus the target when it is
/// not the last path entry.
///
/// # Safety
///
/// Same contract as [`probe_insert`]; caller holds the writer lock.
pub(crate) unsafe fn validate_path<V>(info: &SpecInfo<V>) -> bool {
    // Version compare is sufficient: poisoning bumps the version.
    // SAFETY: Recorded nodes stay allocated for the guard's grace period.
    unsafe {
        for entry in &info.path {
            if entry.node.version() != entry.version {
                return false;
            }
        }
        if let Some(target) = info.target {
            let last_is_target = info
                .path
                .last()
                .map(|entry| entry.node == target)
                .unwrap_or(false);
            if !last_is_target && target.version() != info.target_version {
                return false;
            }
        }
    }
    true
}

unsafe fn read_skip_value_or_default<V: Clone>(leaf: OpaqueNodePtr<V>) -> V {
    // The probe saw a skip leaf; a racing writer may already have retired
    // it, but the value box lives on until the grace period, and the
    // commit's validation throws this allocation away on any race.
    // SAFETY: Covered by the caller's contract.
    unsafe {
        match leaf.to_node_ptr() {
            ConcreteNodePtr::SkipLeaf(node) => node
                .as_ref()
                .value
                .read()
                .expect("skip leaf lost its value"),
            _ => unreachable!("read_skip_value on a non-skip node"),
        }
    }
}

unsafe fn clone_leaf_speculative<V: Clone>(
    builder: &NodeBuilder<V>,
    leaf: OpaqueNodePtr<V>,
    new_skip: &[u8],
) -> OpaqueNodePtr<V> {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        match leaf.to_node_ptr() {
            ConcreteNodePtr::ListLeaf(src) => {
                let copy = builder.make_leaf_list(new_skip);
                if let ConcreteNodePtr::ListLeaf(dst) = copy.to_node_ptr() {
                    src.as_ref().copy_values_to(dst.as_ref());
                }
                copy
            }
            ConcreteNodePtr::FullLeaf(src) => {
                let copy = builder.make_leaf_full(new_skip);
                if let ConcreteNodePtr::FullLeaf(dst) = copy.to_node_ptr() {
                    src.as_ref().copy_values_to(dst.as_ref());
                }
                copy
            }
            _ => unreachable!("clone_leaf_speculative on a non-list leaf"),
        }
    }
}

unsafe fn clone_interior_speculative<V: Clone>(
    builder: &NodeBuilder<V>,
    node: OpaqueNodePtr<V>,
    new_skip: &[u8],
) -> OpaqueNodePtr<V> {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        match node.to_node_ptr() {
            ConcreteNodePtr::ListInterior(src) => {
                let copy = builder.make_interior_list(new_skip);
                if let ConcreteNodePtr::ListInterior(dst) = copy.to_node_ptr() {
                    src.as_ref().copy_interior_to(dst.as_ref());
                }
                copy
            }
            ConcreteNodePtr::FullInterior(src) => {
                let copy = builder.make_interior_full(new_skip);
                if let ConcreteNodePtr::FullInterior(dst) = copy.to_node_ptr() {
                    src.as_ref().copy_interior_to(dst.as_ref());
                }
                copy
            }
            _ => unreachable!("clone_interior_speculative on a leaf"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::operations::insert::insert_recursive;

    fn build_root(builder: &NodeBuilder<u64>, entries: &[(&[u8], u64)]) -> *mut NodeBase {
        let mut root: *mut NodeBase = std::ptr::null_mut();
        for (key, value) in entries {
            // SAFETY: Single-threaded construction of a private tree.
            unsafe {
                let outcome =
                    insert_recursive::<u64, false>(builder, root, key, value, true);
                if let Some(new_root) = outcome.new_node {
                    root = new_root.as_ptr();
                }
                for node in outcome.retired {
                    node.base().header.poison();
                    builder.dealloc_node(node);
                }
            }
        }
        root
    }

    unsafe fn teardown(builder: &NodeBuilder<u64>, root: *mut NodeBase) {
        // SAFETY: Caller owns the tree.
        unsafe {
            if let Some(root) = OpaqueNodePtr::<u64>::from_ptr(root) {
                builder.dealloc_node(root);
            }
        }
    }

    #[test]
    fn probe_classifies_empty_and_exists() {
        let builder = NodeBuilder::<u64>::new();
        // SAFETY: Single-threaded tests own their trees outright.
        unsafe {
            let info = probe_insert::<u64>(std::ptr::null_mut(), b"abc", true);
            assert_eq!(info.op, SpecOp::EmptyTree);

            let root = build_root(&builder, &[(b"abc", 1)]);
            let info = probe_insert::<u64>(root, b"abc", true);
            assert_eq!(info.op, SpecOp::Exists);
            teardown(&builder, root);
        }
    }

    #[test]
    fn probe_classifies_skip_leaf_cases() {
        let builder = NodeBuilder::<u64>::new();
        // SAFETY: Single-threaded tests own their trees outright.
        unsafe {
            let root = build_root(&builder, &[(b"abcdef", 1)]);

            let info = probe_insert::<u64>(root, b"abczzz", true);
            assert_eq!(info.op, SpecOp::SplitLeafSkip);
            assert_eq!(info.match_pos, 3);

            let info = probe_insert::<u64>(root, b"abc", true);
            assert_eq!(info.op, SpecOp::PrefixLeafSkip);

            let info = probe_insert::<u64>(root, b"abcdefgh", true);
            assert_eq!(info.op, SpecOp::ExtendLeafSkip);

            teardown(&builder, root);
        }
    }

    #[test]
    fn probe_classifies_interior_and_leaf_list_cases() {
        let builder = NodeBuilder::<u64>::new();
        // SAFETY: Single-threaded tests own their trees outright.
        unsafe {
            // interior("p"): 'A' -> skip leaf "q", 'B' -> list leaf {q}
            let root = build_root(&builder, &[(b"pAq", 1), (b"pBq", 2)]);

            let info = probe_insert::<u64>(root, b"pBr", true);
            assert_eq!(info.op, SpecOp::InPlaceLeaf);
            assert_eq!(info.label, b'r');

            let info = probe_insert::<u64>(root, b"pB", true);
            assert_eq!(info.op, SpecOp::AddEosLeafList);

            let info = probe_insert::<u64>(root, b"pBxyz", true);
            assert_eq!(info.op, SpecOp::DemoteLeafList);

            let info = probe_insert::<u64>(root, b"pC", true);
            assert_eq!(info.op, SpecOp::InPlaceInterior);
            assert_eq!(info.label, b'C');
            assert!(!info.is_eos);

            let info = probe_insert::<u64>(root, b"p", true);
            assert_eq!(info.op, SpecOp::InPlaceInterior);
            assert!(info.is_eos);

            let info = probe_insert::<u64>(root, b"zZ", true);
            assert_eq!(info.op, SpecOp::SplitInterior);

            teardown(&builder, root);
        }
    }

    #[test]
    fn probe_detects_poison_and_validates_versions() {
        let builder = NodeBuilder::<u64>::new();
        // SAFETY: Single-threaded tests own their trees outright.
        unsafe {
            let root = build_root(&builder, &[(b"pAq", 1), (b"pBq", 2)]);
            let info = probe_insert::<u64>(root, b"pBr", true);
            assert_eq!(info.op, SpecOp::InPlaceLeaf);
            assert!(validate_path(&info));

            // Any version bump along the recorded path must fail
            // validation.
            OpaqueNodePtr::<u64>::from_ptr(root)
                .unwrap()
                .base()
                .header
                .bump_version();
            assert!(!validate_path(&info));

            let root_node = OpaqueNodePtr::<u64>::from_ptr(root).unwrap();
            root_node.base().header.poison();
            let info = probe_insert::<u64>(root, b"pBr", true);
            assert_eq!(info.op, SpecOp::Retry);
            root_node.base().header.unpoison();

            teardown(&builder, root);
        }
    }

    #[test]
    fn speculative_alloc_is_poisoned_and_abortable() {
        let builder = NodeBuilder::<u64>::new();
        // SAFETY: Single-threaded tests own their trees outright.
        unsafe {
            let root = build_root(&builder, &[(b"abcdef", 1)]);
            let info = probe_insert::<u64>(root, b"abczzz", true);
            assert_eq!(info.op, SpecOp::SplitLeafSkip);

            let alloc = allocate_speculative(&builder, &info, &9);
            let replacement = alloc.replacement.expect("split allocates a subtree");
            assert!(replacement.is_poisoned());
            assert_eq!(alloc.nodes.len(), 3);

            // Aborting must free exactly the new nodes and leave the
            // probed tree intact.
            dealloc_speculation(&builder, alloc);
            let info = probe_insert::<u64>(root, b"abcdef", true);
            assert_eq!(info.op, SpecOp::Exists);

            teardown(&builder, root);
        }
    }
}
