//! The speculative erase layer: lock-free probe and out-of-lock
//! allocation of merge replacements.
//!
//! Erase probes are parent-aware: when removing a key kills an entire
//! leaf, the classification already decides, from the recorded path,
//! whether the root goes null, the parent merely drops a label in place,
//! or the parent must merge with its lone surviving sibling to restore
//! path compression. Only the merge cases allocate, and like the insert
//! layer they pre-poison the replacement so an aborted commit never frees
//! borrowed children.

use crate::nodes::builder::NodeBuilder;
use crate::nodes::operations::insert::match_len;
use crate::nodes::operations::probe::{PathEntry, SpecAlloc};
use crate::nodes::operations::MAX_DEPTH;
use crate::nodes::representation::{
    is_absent, ConcreteNodePtr, NodeBase, OpaqueNodePtr, SkipBytes, LIST_MAX,
};
use arrayvec::ArrayVec;

/// The structural case an erase probe classified the removal into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EraseOp {
    /// No such key.
    NotFound,
    /// Concurrent write observed; probe again.
    Retry,
    /// Remove one label from a multi-entry LIST leaf in place.
    InPlaceLeafList,
    /// Remove one label from a multi-entry FULL leaf in place.
    InPlaceLeafFull,
    /// The root leaf dies; the root pointer goes null.
    DeleteRootLeaf,
    /// A leaf dies and its parent keeps enough other content: drop the
    /// label in place.
    DeleteChildNoCollapse,
    /// A leaf dies leaving the parent one child and no end-of-string
    /// value: replace the parent with a merge of it and the survivor.
    DeleteChildCollapse,
    /// Clear an interior's end-of-string value, merging with a lone child
    /// when one remains.
    DeleteEosInterior,
    /// Too deep or too entangled; take the locked fallback immediately.
    Fallback,
}

/// Everything an erase probe learned about one pending removal.
pub(crate) struct EraseSpecInfo<V> {
    pub(crate) op: EraseOp,
    pub(crate) path: ArrayVec<PathEntry<V>, MAX_DEPTH>,
    /// The node whose fields or slot the commit touches (the leaf for
    /// in-place cases, the parent for label removal, the interior for
    /// end-of-string cases).
    pub(crate) target: Option<OpaqueNodePtr<V>>,
    pub(crate) target_version: u64,
    /// The label removed from the target.
    pub(crate) label: u8,
    /// A leaf whose whole subtree disappears; retired on success.
    pub(crate) doomed: Option<OpaqueNodePtr<V>>,
    /// Surviving sibling (or lone child) merged into the replacement.
    pub(crate) survivor: Option<OpaqueNodePtr<V>>,
    pub(crate) survivor_version: u64,
    /// Edge byte from the target to the survivor.
    pub(crate) survivor_label: u8,
}

impl<V> EraseSpecInfo<V> {
    fn new(op: EraseOp) -> Self {
        EraseSpecInfo {
            op,
            path: ArrayVec::new(),
            target: None,
            target_version: 0,
            label: 0,
            doomed: None,
            survivor: None,
            survivor_version: 0,
            survivor_label: 0,
        }
    }
}

/// Classify the erase of `key` without taking any lock.
///
/// # Safety
///
/// Same contract as
/// [`probe_insert`](crate::nodes::operations::probe::probe_insert).
pub(crate) unsafe fn probe_erase<V>(
    root: *mut NodeBase,
    key: &[u8],
    variable_len: bool,
) -> EraseSpecInfo<V> {
    let mut info = EraseSpecInfo::new(EraseOp::NotFound);
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
            info.op = EraseOp::Retry;
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
                return probe_leaf_erase(node, key, info);
            }

            let skip = node.skip();
            let m = match_len(skip, key);
            if m < skip.len() {
                return info; // NotFound
            }
            key = &key[m..];

            if key.is_empty() {
                return probe_interior_eos_erase(node, header.version(), variable_len, info);
            }

            let label = key[0];
            let child = node.child(label);
            if is_absent(child) {
                return info; // NotFound
            }

            key = &key[1..];
            node = OpaqueNodePtr::from_ptr(child).expect("absent check covers null");

            let child_header = node.header();
            if child_header.is_poisoned() {
                info.op = EraseOp::Retry;
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
                info.op = EraseOp::Fallback;
                return info;
            }
        }
    }
}

unsafe fn probe_leaf_erase<V>(
    leaf: OpaqueNodePtr<V>,
    key: &[u8],
    mut info: EraseSpecInfo<V>,
) -> EraseSpecInfo<V> {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let header = leaf.header();
        let skip = leaf.skip();
        let m = match_len(skip, key);
        if m < skip.len() {
            return info; // NotFound
        }
        let key = &key[m..];

        if header.is_skip() {
            if !key.is_empty() {
                return info; // NotFound
            }
            return classify_whole_leaf_delete(leaf, info);
        }

        if key.len() != 1 {
            return info; // NotFound
        }
        let label = key[0];
        info.label = label;

        match leaf.to_node_ptr() {
            ConcreteNodePtr::ListLeaf(list) => {
                let list = list.as_ref();
                if !list.has(label) {
                    return info; // NotFound
                }
                if list.lanes().count() == 1 {
                    return classify_whole_leaf_delete(leaf, info);
                }
                info.target = Some(leaf);
                info.target_version = header.version();
                info.op = EraseOp::InPlaceLeafList;
            }
            ConcreteNodePtr::FullLeaf(full) => {
                let full = full.as_ref();
                if !full.has(label) {
                    return info; // NotFound
                }
                if full.count() == 1 {
                    return classify_whole_leaf_delete(leaf, info);
                }
                info.target = Some(leaf);
                info.target_version = header.version();
                info.op = EraseOp::InPlaceLeafFull;
            }
            _ => return info,
        }
        info
    }
}

/// A leaf's whole subtree disappears. Decide from the recorded path
/// whether that nulls the root, drops a label from the parent in place,
/// or merges the parent with its surviving sibling.
unsafe fn classify_whole_leaf_delete<V>(
    leaf: OpaqueNodePtr<V>,
    mut info: EraseSpecInfo<V>,
) -> EraseSpecInfo<V> {
    info.doomed = Some(leaf);
    // SAFETY: Covered by the caller's contract.
    unsafe {
        if info.path.len() < 2 {
            info.target = Some(leaf);
            info.target_version = leaf.version();
            info.op = EraseOp::DeleteRootLeaf;
            return info;
        }

        let parent_entry = &info.path[info.path.len() - 2];
        let parent = parent_entry.node;
        let edge = info.path[info.path.len() - 1].edge;
        info.target = Some(parent);
        info.target_version = parent_entry.version;
        info.label = edge;

        let has_eos = parent.has_eos();
        let count = parent.child_count();

        if !has_eos && count == 2 {
            // One sibling will survive; the parent must merge with it.
            match find_sibling(parent, edge) {
                Some((sibling_label, sibling)) => {
                    let sibling = match OpaqueNodePtr::from_ptr(sibling) {
                        Some(sibling) => sibling,
                        None => {
                            info.op = EraseOp::Retry;
                            return info;
                        }
                    };
                    let sibling_header = sibling.header();
                    if sibling_header.is_poisoned() {
                        info.op = EraseOp::Retry;
                        return info;
                    }
                    info.survivor = Some(sibling);
                    info.survivor_version = sibling_header.version();
                    info.survivor_label = sibling_label;
                    info.op = EraseOp::DeleteChildCollapse;
                }
                None => info.op = EraseOp::Retry,
            }
            return info;
        }

        if !has_eos && count < 2 {
            // A parent with one child and no end-of-string value is a
            // transient race artifact; let the locked path sort it out.
            info.op = EraseOp::Fallback;
            return info;
        }

        info.op = EraseOp::DeleteChildNoCollapse;
        info
    }
}

unsafe fn probe_interior_eos_erase<V>(
    node: OpaqueNodePtr<V>,
    version: u64,
    variable_len: bool,
    mut info: EraseSpecInfo<V>,
) -> EraseSpecInfo<V> {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        if !variable_len || !node.has_eos() {
            return info; // NotFound
        }
        info.target = Some(node);
        info.target_version = version;

        match node.child_count() {
            0 => {
                // An interior holding only an end-of-string value becomes
                // nothing at all; the locked path owns that teardown.
                info.op = EraseOp::Fallback;
            }
            1 => {
                if let Some((label, child)) = node.first_child() {
                    if let Some(child) = OpaqueNodePtr::from_ptr(child) {
                        let child_header = child.header();
                        if child_header.is_poisoned() {
                            info.op = EraseOp::Retry;
                            return info;
                        }
                        info.survivor = Some(child);
                        info.survivor_version = child_header.version();
                        info.survivor_label = label;
                    }
                }
                info.op = EraseOp::DeleteEosInterior;
            }
            _ => info.op = EraseOp::DeleteEosInterior,
        }
        info
    }
}

unsafe fn find_sibling<V>(parent: OpaqueNodePtr<V>, removed_edge: u8) -> Option<(u8, *mut NodeBase)> {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        match parent.to_node_ptr() {
            ConcreteNodePtr::ListInterior(interior) => {
                let interior = interior.as_ref();
                let view = interior.lanes();
                debug_assert!(view.count() <= LIST_MAX);
                for (index, label) in view.iter() {
                    if label != removed_edge {
                        let child = interior.children[index]
                            .load(std::sync::atomic::Ordering::Acquire);
                        return Some((label, child));
                    }
                }
                None
            }
            ConcreteNodePtr::FullInterior(interior) => {
                let interior = interior.as_ref();
                let bitmap = interior.bitmap();
                let mut cursor = bitmap.first();
                while let Some(label) = cursor {
                    if label != removed_edge {
                        return Some((label, interior.child(label)));
                    }
                    cursor = bitmap.next_set(Some(label));
                }
                None
            }
            _ => None,
        }
    }
}

/// Build the merge replacement for the collapse cases, pre-poisoned.
/// Every other case allocates nothing.
///
/// # Safety
///
/// Same contract as [`probe_erase`].
pub(crate) unsafe fn allocate_erase_speculative<V: Clone>(
    builder: &NodeBuilder<V>,
    info: &EraseSpecInfo<V>,
) -> SpecAlloc<V> {
    let mut alloc = SpecAlloc::empty();
    if !matches!(
        info.op,
        EraseOp::DeleteChildCollapse | EraseOp::DeleteEosInterior
    ) {
        return alloc;
    }
    let survivor = match info.survivor {
        Some(survivor) => survivor,
        None => return alloc,
    };
    let target = match info.target {
        Some(target) => target,
        None => return alloc,
    };

    // SAFETY: All node accesses below are covered by the function
    // contract; racing mutation is tolerated because the commit
    // re-validates every recorded version.
    unsafe {
        let mut merged_skip = SkipBytes::new();
        merged_skip.extend_from_slice(target.skip());
        merged_skip.push(info.survivor_label);
        merged_skip.extend_from_slice(survivor.skip());

        let merged = match survivor.to_node_ptr() {
            ConcreteNodePtr::SkipLeaf(leaf) => {
                let value = match leaf.as_ref().value.read() {
                    Some(value) => value,
                    None => return alloc,
                };
                builder.make_leaf_skip(&merged_skip, value)
            }
            ConcreteNodePtr::ListLeaf(src) => {
                let copy = builder.make_leaf_list(&merged_skip);
                if let ConcreteNodePtr::ListLeaf(dst) = copy.to_node_ptr() {
                    src.as_ref().copy_values_to(dst.as_ref());
                }
                copy
            }
            ConcreteNodePtr::FullLeaf(src) => {
                let copy = builder.make_leaf_full(&merged_skip);
                if let ConcreteNodePtr::FullLeaf(dst) = copy.to_node_ptr() {
                    src.as_ref().copy_values_to(dst.as_ref());
                }
                copy
            }
            ConcreteNodePtr::ListInterior(src) => {
                let copy = builder.make_interior_list(&merged_skip);
                if let ConcreteNodePtr::ListInterior(dst) = copy.to_node_ptr() {
                    src.as_ref().copy_interior_to(dst.as_ref());
                }
                copy
            }
            ConcreteNodePtr::FullInterior(src) => {
                let copy = builder.make_interior_full(&merged_skip);
                if let ConcreteNodePtr::FullInterior(dst) = copy.to_node_ptr() {
                    src.as_ref().copy_interior_to(dst.as_ref());
                }
                copy
            }
        };
        alloc.add(merged);
        alloc.replacement = Some(merged);
    }
    alloc
}

/// Re-read every version recorded by the probe, the out-of-path target,
/// and the survivor a merge was built from.
///
/// # Safety
///
/// Same contract as [`probe_erase`]; caller holds the writer lock.
pub(crate) unsafe fn validate_erase_path<V>(info: &EraseSpecInfo<V>) -> bool {
    // SAFETY: Recorded nodes stay allocated for the guard's grace period.
    unsafe {
        for entry in &info.path {
            if entry.node.version() != entry.version {
                return false;
            }
        }
        if let Some(target) = info.target {
            let in_path = info.path.iter().any(|entry| entry.node == target);
            if !in_path && target.version() != info.target_version {
                return false;
            }
        }
        if let Some(survivor) = info.survivor {
            if survivor.version() != info.survivor_version {
                return false;
            }
        }
    }
    true
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
    fn probe_not_found_and_root_delete() {
        let builder = NodeBuilder::<u64>::new();
        // SAFETY: Single-threaded tests own their trees outright.
        unsafe {
            let info = probe_erase::<u64>(std::ptr::null_mut(), b"abc", true);
            assert_eq!(info.op, EraseOp::NotFound);

            let root = build_root(&builder, &[(b"solo", 1)]);
            let info = probe_erase::<u64>(root, b"nope", true);
            assert_eq!(info.op, EraseOp::NotFound);
            let info = probe_erase::<u64>(root, b"solo", true);
            assert_eq!(info.op, EraseOp::DeleteRootLeaf);
            assert!(info.doomed.is_some());
            teardown(&builder, root);
        }
    }

    #[test]
    fn probe_in_place_and_collapse() {
        let builder = NodeBuilder::<u64>::new();
        // SAFETY: Single-threaded tests own their trees outright.
        unsafe {
            // interior("p"): 'A' -> skip leaf "q", 'B' -> list leaf {q,r}
            let root = build_root(&builder, &[(b"pAq", 1), (b"pBq", 2), (b"pBr", 3)]);

            let info = probe_erase::<u64>(root, b"pBq", true);
            assert_eq!(info.op, EraseOp::InPlaceLeafList);
            assert_eq!(info.label, b'q');
            assert!(validate_erase_path(&info));

            // Removing the 'A' leaf leaves one sibling: a merge.
            let info = probe_erase::<u64>(root, b"pAq", true);
            assert_eq!(info.op, EraseOp::DeleteChildCollapse);
            assert_eq!(info.survivor_label, b'B');
            let alloc = allocate_erase_speculative(&builder, &info);
            let merged = alloc.replacement.expect("collapse allocates a merge");
            assert_eq!(merged.skip(), b"pB");
            assert!(merged.is_poisoned());
            crate::nodes::operations::probe::dealloc_speculation(&builder, alloc);

            teardown(&builder, root);
        }
    }

    #[test]
    fn probe_no_collapse_with_more_siblings() {
        let builder = NodeBuilder::<u64>::new();
        // SAFETY: Single-threaded tests own their trees outright.
        unsafe {
            let root = build_root(
                &builder,
                &[(b"pAq", 1), (b"pBq", 2), (b"pCq", 3)],
            );
            let info = probe_erase::<u64>(root, b"pAq", true);
            assert_eq!(info.op, EraseOp::DeleteChildNoCollapse);
            assert_eq!(info.label, b'A');
            teardown(&builder, root);
        }
    }

    #[test]
    fn probe_eos_cases() {
        let builder = NodeBuilder::<u64>::new();
        // SAFETY: Single-threaded tests own their trees outright.
        unsafe {
            let root = build_root(&builder, &[(b"ab", 10), (b"abcde", 20)]);
            // interior("ab") {eos} with one child: clearing the
            // end-of-string value must merge.
            let info = probe_erase::<u64>(root, b"ab", true);
            assert_eq!(info.op, EraseOp::DeleteEosInterior);
            assert!(info.survivor.is_some());
            let alloc = allocate_erase_speculative(&builder, &info);
            let merged = alloc.replacement.expect("lone-child eos clear merges");
            assert_eq!(merged.skip(), b"abcde");
            crate::nodes::operations::probe::dealloc_speculation(&builder, alloc);

            // With fixed-length keys the end-of-string slot cannot exist.
            let info = probe_erase::<u64>(root, b"ab", false);
            assert_eq!(info.op, EraseOp::NotFound);

            teardown(&builder, root);
        }
    }
}
