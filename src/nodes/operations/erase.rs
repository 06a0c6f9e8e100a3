//! The locked erase path: recursive removal with path-compression
//! restoration.
//!
//! Removing the last entry of a leaf deletes the whole leaf; the parent
//! then drops the child label in place, and when exactly one child remains
//! with no end-of-string value, the parent merges with it so that no
//! interior is ever left with a single child and nothing else. Value boxes
//! removed in place are handed back as poisoned tombstone leaves so the
//! retirement machinery stays node-only.

use crate::nodes::builder::NodeBuilder;
use crate::nodes::operations::insert::{
    clone_interior_with_skip, clone_leaf_with_skip, match_len, publish_slot,
};
use crate::nodes::representation::{
    is_absent, ConcreteNodePtr, NodeBase, OpaqueNodePtr, SkipBytes,
};
use smallvec::SmallVec;

/// Result of one structural erase step.
pub(crate) struct EraseOutcome<V> {
    /// Whether a key was removed.
    pub(crate) erased: bool,
    /// The examined node's slot should be nulled (whole subtree gone).
    pub(crate) deleted_subtree: bool,
    /// Replacement for the examined slot, when the node was merged away.
    pub(crate) new_node: Option<OpaqueNodePtr<V>>,
    /// Displaced nodes (and value tombstones) to retire after publishing.
    pub(crate) retired: SmallVec<[OpaqueNodePtr<V>; 4]>,
}

impl<V> Default for EraseOutcome<V> {
    fn default() -> Self {
        EraseOutcome {
            erased: false,
            deleted_subtree: false,
            new_node: None,
            retired: SmallVec::new(),
        }
    }
}

/// Erase `key` from the subtree rooted at `node`.
///
/// Caller holds the writer lock; a `new_node` replacement or a
/// `deleted_subtree` null must be published into the slot that held
/// `node`, after which every entry in `retired` is retired.
///
/// # Safety
///
/// Same contract as
/// [`insert_recursive`](crate::nodes::operations::insert::insert_recursive).
pub(crate) unsafe fn erase_recursive<V: Clone, const CONCURRENT: bool>(
    builder: &NodeBuilder<V>,
    node: *mut NodeBase,
    key: &[u8],
    variable_len: bool,
) -> EraseOutcome<V> {
    if is_absent(node) {
        return EraseOutcome::default();
    }
    // SAFETY: All node accesses below are covered by the function
    // contract.
    unsafe {
        let node = OpaqueNodePtr::from_ptr(node).expect("absent check covers null");
        if node.header().is_leaf() {
            erase_from_leaf(builder, node, key)
        } else {
            erase_from_interior::<V, CONCURRENT>(builder, node, key, variable_len)
        }
    }
}

unsafe fn erase_from_leaf<V: Clone>(
    builder: &NodeBuilder<V>,
    leaf: OpaqueNodePtr<V>,
    key: &[u8],
) -> EraseOutcome<V> {
    let mut outcome = EraseOutcome::default();
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let skip = leaf.skip();
        let m = match_len(skip, key);
        if m < skip.len() {
            return outcome;
        }
        let key = &key[m..];

        match leaf.to_node_ptr() {
            ConcreteNodePtr::SkipLeaf(_) => {
                if !key.is_empty() {
                    return outcome;
                }
                outcome.erased = true;
                outcome.deleted_subtree = true;
                outcome.retired.push(leaf);
            }
            ConcreteNodePtr::ListLeaf(list) => {
                if key.len() != 1 {
                    return outcome;
                }
                let label = key[0];
                let list = list.as_ref();
                if !list.has(label) {
                    return outcome;
                }
                if list.lanes().count() == 1 {
                    outcome.erased = true;
                    outcome.deleted_subtree = true;
                    outcome.retired.push(leaf);
                    return outcome;
                }
                leaf.base().header.bump_version();
                let removed = list.remove_value(label);
                push_value_tombstone(builder, &mut outcome.retired, removed);
                outcome.erased = true;
            }
            ConcreteNodePtr::FullLeaf(full) => {
                if key.len() != 1 {
                    return outcome;
                }
                let label = key[0];
                let full = full.as_ref();
                if !full.has(label) {
                    return outcome;
                }
                if full.count() == 1 {
                    outcome.erased = true;
                    outcome.deleted_subtree = true;
                    outcome.retired.push(leaf);
                    return outcome;
                }
                leaf.base().header.bump_version();
                let removed = full.remove_value(label);
                push_value_tombstone(builder, &mut outcome.retired, removed);
                outcome.erased = true;
            }
            _ => unreachable!("erase_from_leaf on an interior"),
        }
    }
    outcome
}

unsafe fn erase_from_interior<V: Clone, const CONCURRENT: bool>(
    builder: &NodeBuilder<V>,
    node: OpaqueNodePtr<V>,
    key: &[u8],
    variable_len: bool,
) -> EraseOutcome<V> {
    let mut outcome = EraseOutcome::default();
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let skip = node.skip();
        let m = match_len(skip, key);
        if m < skip.len() {
            return outcome;
        }
        let key = &key[m..];

        if key.is_empty() {
            // Deleting the end-of-string value.
            if !variable_len || !node.has_eos() {
                return outcome;
            }
            node.base().header.bump_version();
            let removed = clear_eos(node);
            push_value_tombstone(builder, &mut outcome.retired, removed);
            outcome.erased = true;
            try_collapse_interior(builder, node, &mut outcome);
            return outcome;
        }

        let label = key[0];
        let child = node.child(label);
        if is_absent(child) {
            return outcome;
        }

        let child_outcome =
            erase_recursive::<V, CONCURRENT>(builder, child, &key[1..], variable_len);
        if !child_outcome.erased {
            return outcome;
        }

        if child_outcome.deleted_subtree {
            return collapse_after_child_removal(builder, node, label, child_outcome);
        }

        if let Some(new_child) = child_outcome.new_node {
            node.base().header.bump_version();
            let slot = match node.to_node_ptr() {
                ConcreteNodePtr::ListInterior(interior) => interior.as_ref().child_slot(label),
                ConcreteNodePtr::FullInterior(interior) => {
                    Some(interior.as_ref().child_slot(label))
                }
                _ => None,
            };
            let slot = slot.expect("probed child slot disappeared under the lock");
            publish_slot::<CONCURRENT>(slot, new_child.as_ptr());
        }
        outcome.erased = true;
        outcome.retired = child_outcome.retired;
    }
    outcome
}

/// After clearing an end-of-string value: delete an empty interior or
/// merge it with a lone surviving child.
unsafe fn try_collapse_interior<V: Clone>(
    builder: &NodeBuilder<V>,
    node: OpaqueNodePtr<V>,
    outcome: &mut EraseOutcome<V>,
) {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        if node.has_eos() {
            return;
        }
        let count = node.child_count();
        if count == 0 {
            outcome.deleted_subtree = true;
            outcome.retired.push(node);
            return;
        }
        if count != 1 {
            return;
        }
        let (label, child) = match node.first_child() {
            Some(pair) => pair,
            None => return,
        };
        if is_absent(child) {
            return;
        }
        let child = OpaqueNodePtr::from_ptr(child).expect("absent check covers null");
        collapse_single_child(builder, node, label, child, outcome);
    }
}

/// The examined child's whole subtree was deleted: drop its label from
/// `node`, then delete or merge `node` if that leaves too little behind.
unsafe fn collapse_after_child_removal<V: Clone>(
    builder: &NodeBuilder<V>,
    node: OpaqueNodePtr<V>,
    removed_label: u8,
    child_outcome: EraseOutcome<V>,
) -> EraseOutcome<V> {
    let mut outcome = EraseOutcome::default();
    outcome.retired = child_outcome.retired;
    outcome.erased = true;
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let eos = node.has_eos();
        let remaining = node.child_count().saturating_sub(1);

        if !eos && remaining == 0 {
            // Nothing left at all; the parent slot goes null. The child is
            // already in the retired set.
            outcome.deleted_subtree = true;
            outcome.retired.push(node);
            return outcome;
        }

        node.base().header.bump_version();
        match node.to_node_ptr() {
            ConcreteNodePtr::ListInterior(interior) => {
                interior.as_ref().remove_child(removed_label);
            }
            ConcreteNodePtr::FullInterior(interior) => {
                interior.as_ref().remove_child(removed_label);
            }
            _ => unreachable!("collapse on a leaf"),
        }

        if !eos && remaining == 1 {
            if let Some((label, child)) = node.first_child() {
                if !is_absent(child) {
                    let child =
                        OpaqueNodePtr::from_ptr(child).expect("absent check covers null");
                    collapse_single_child(builder, node, label, child, &mut outcome);
                }
            }
        }
    }
    outcome
}

/// Merge `node` (one child, no end-of-string value) with `child` into a
/// single replacement whose skip is `node.skip · label · child.skip`.
unsafe fn collapse_single_child<V: Clone>(
    builder: &NodeBuilder<V>,
    node: OpaqueNodePtr<V>,
    label: u8,
    child: OpaqueNodePtr<V>,
    outcome: &mut EraseOutcome<V>,
) {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let mut merged_skip = SkipBytes::new();
        merged_skip.extend_from_slice(node.skip());
        merged_skip.push(label);
        merged_skip.extend_from_slice(child.skip());

        let merged = match child.to_node_ptr() {
            ConcreteNodePtr::SkipLeaf(leaf) => {
                let value = leaf
                    .as_ref()
                    .value
                    .read()
                    .expect("skip leaf lost its value");
                builder.make_leaf_skip(&merged_skip, value)
            }
            ConcreteNodePtr::ListLeaf(_) | ConcreteNodePtr::FullLeaf(_) => {
                clone_leaf_with_skip(builder, child, &merged_skip)
            }
            ConcreteNodePtr::ListInterior(_) | ConcreteNodePtr::FullInterior(_) => {
                clone_interior_with_skip(builder, child, &merged_skip)
            }
        };

        outcome.new_node = Some(merged);
        outcome.retired.push(node);
        outcome.retired.push(child);
    }
}

unsafe fn clear_eos<V>(node: OpaqueNodePtr<V>) -> *mut V {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        match node.to_node_ptr() {
            ConcreteNodePtr::ListInterior(interior) => interior.as_ref().eos.clear(),
            ConcreteNodePtr::FullInterior(interior) => interior.as_ref().eos.clear(),
            _ => unreachable!("clear_eos on a leaf"),
        }
    }
}

/// Wrap a value box removed in place into a poisoned tombstone leaf so it
/// rides the node-only retired list.
pub(crate) fn push_value_tombstone<V>(
    builder: &NodeBuilder<V>,
    retired: &mut SmallVec<[OpaqueNodePtr<V>; 4]>,
    removed: *mut V,
) {
    if removed.is_null() {
        return;
    }
    retired.push(builder.make_value_tombstone(removed));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::operations::insert::insert_recursive;
    use crate::nodes::operations::lookup::{contains_plain, get_plain};

    struct Harness {
        builder: NodeBuilder<u64>,
        root: *mut NodeBase,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                builder: NodeBuilder::new(),
                root: std::ptr::null_mut(),
            }
        }

        fn insert(&mut self, key: &[u8], value: u64) -> bool {
            // SAFETY: The harness owns the whole tree and runs on one
            // thread.
            unsafe {
                let outcome =
                    insert_recursive::<u64, false>(&self.builder, self.root, key, &value, true);
                if let Some(new_root) = outcome.new_node {
                    self.root = new_root.as_ptr();
                }
                for node in outcome.retired {
                    node.base().header.poison();
                    self.builder.dealloc_node(node);
                }
                outcome.inserted
            }
        }

        fn erase(&mut self, key: &[u8]) -> bool {
            // SAFETY: Same single-threaded ownership as `insert`.
            unsafe {
                let outcome =
                    erase_recursive::<u64, false>(&self.builder, self.root, key, true);
                if outcome.deleted_subtree {
                    self.root = std::ptr::null_mut();
                } else if let Some(new_root) = outcome.new_node {
                    self.root = new_root.as_ptr();
                }
                for node in outcome.retired {
                    node.base().header.poison();
                    self.builder.dealloc_node(node);
                }
                outcome.erased
            }
        }

        fn get(&self, key: &[u8]) -> Option<u64> {
            // SAFETY: Single-threaded ownership of the tree.
            unsafe {
                let root = OpaqueNodePtr::from_ptr(self.root)?;
                get_plain(root, key, false).unwrap()
            }
        }

        fn contains(&self, key: &[u8]) -> bool {
            // SAFETY: Single-threaded ownership of the tree.
            unsafe {
                match OpaqueNodePtr::<u64>::from_ptr(self.root) {
                    Some(root) => contains_plain(root, key, false).unwrap(),
                    None => false,
                }
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            // SAFETY: The harness owns the whole tree.
            unsafe {
                if let Some(root) = OpaqueNodePtr::<u64>::from_ptr(self.root) {
                    self.builder.dealloc_node(root);
                }
            }
        }
    }

    #[test]
    fn erase_only_key_empties_tree() {
        let mut h = Harness::new();
        h.insert(b"solo", 1);
        assert!(h.erase(b"solo"));
        assert!(h.root.is_null());
        assert!(!h.contains(b"solo"));
        assert!(!h.erase(b"solo"));
    }

    #[test]
    fn erase_absent_is_a_noop() {
        let mut h = Harness::new();
        h.insert(b"car", 1);
        assert!(!h.erase(b"ca"));
        assert!(!h.erase(b"card"));
        assert!(!h.erase(b"dog"));
        assert_eq!(h.get(b"car"), Some(1));
    }

    #[test]
    fn erase_merges_lone_sibling_back() {
        let mut h = Harness::new();
        h.insert(b"abcdefghij", 1);
        h.insert(b"abcdef", 2);
        h.insert(b"abcdefghijklmnop", 3);
        assert!(h.erase(b"abcdefghij"));
        assert_eq!(h.get(b"abcdef"), Some(2));
        assert_eq!(h.get(b"abcdefghijklmnop"), Some(3));
        assert_eq!(h.get(b"abcdefghij"), None);
    }

    #[test]
    fn erase_sibling_collapses_split() {
        let mut h = Harness::new();
        h.insert(b"carpet", 1);
        h.insert(b"cartel", 2);
        assert!(h.erase(b"carpet"));
        // The split interior must have merged back into one leaf.
        assert_eq!(h.get(b"cartel"), Some(2));
        assert!(!h.contains(b"carpet"));
        // SAFETY: Single-threaded ownership.
        unsafe {
            let root = OpaqueNodePtr::<u64>::from_ptr(h.root).unwrap();
            assert!(root.header().is_leaf(), "collapse left an interior behind");
            assert_eq!(root.skip(), b"cartel");
        }
    }

    #[test]
    fn erase_from_list_leaf_in_place() {
        let mut h = Harness::new();
        h.insert(b"kAq", 1);
        h.insert(b"kBq", 2);
        h.insert(b"kBr", 3);
        assert!(h.erase(b"kBq"));
        assert_eq!(h.get(b"kBr"), Some(3));
        assert_eq!(h.get(b"kBq"), None);
        assert_eq!(h.get(b"kAq"), Some(1));
    }

    #[test]
    fn erase_eos_keeps_children() {
        let mut h = Harness::new();
        h.insert(b"ab", 10);
        h.insert(b"abc", 20);
        h.insert(b"abcd", 30);
        assert!(h.erase(b"abc"));
        assert_eq!(h.get(b"ab"), Some(10));
        assert_eq!(h.get(b"abcd"), Some(30));
        assert_eq!(h.get(b"abc"), None);
    }

    #[test]
    fn erase_last_child_of_eos_interior() {
        let mut h = Harness::new();
        h.insert(b"ab", 10);
        h.insert(b"abc", 20);
        assert!(h.erase(b"abc"));
        assert_eq!(h.get(b"ab"), Some(10));
        assert!(h.erase(b"ab"));
        assert!(h.root.is_null());
    }

    #[test]
    fn erase_eos_then_collapse() {
        let mut h = Harness::new();
        h.insert(b"ab", 10);
        h.insert(b"abcde", 20);
        // Clearing the end-of-string value leaves one child: the interior
        // must merge with it.
        assert!(h.erase(b"ab"));
        assert_eq!(h.get(b"abcde"), Some(20));
        assert_eq!(h.get(b"ab"), None);
        // SAFETY: Single-threaded ownership.
        unsafe {
            let root = OpaqueNodePtr::<u64>::from_ptr(h.root).unwrap();
            assert!(root.header().is_leaf(), "collapse left an interior behind");
        }
    }

    #[test]
    fn full_leaf_erase_back_to_seven() {
        let mut h = Harness::new();
        h.insert(b"zA1", 100);
        for digit in b'1'..=b'8' {
            h.insert(&[b'z', b'B', digit], u64::from(digit));
        }
        assert!(h.erase(b"zB8"));
        for digit in b'1'..=b'7' {
            assert_eq!(h.get(&[b'z', b'B', digit]), Some(u64::from(digit)));
        }
        assert_eq!(h.get(b"zB8"), None);
    }

    #[test]
    fn insert_erase_round_trip_leaves_nothing() {
        let mut h = Harness::new();
        let keys: Vec<Vec<u8>> = vec![
            b"car".to_vec(),
            b"card".to_vec(),
            b"care".to_vec(),
            b"careful".to_vec(),
            b"cars".to_vec(),
            b"cat".to_vec(),
            b"dog".to_vec(),
        ];
        for (i, key) in keys.iter().enumerate() {
            assert!(h.insert(key, i as u64));
        }
        for key in &keys {
            assert!(h.erase(key), "erase {:?}", key);
        }
        assert!(h.root.is_null());
        for key in &keys {
            assert!(!h.contains(key));
        }
    }
}
