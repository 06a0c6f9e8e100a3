//! The locked insert path: recursive structural transitions.
//!
//! Every insert decomposes into one of the named cases: split, prefix,
//! extend, demote, promote, or a plain in-place addition. Each case either
//! mutates the target in place (bumping its version first) or builds a
//! replacement subtree whose children are borrowed from the displaced
//! nodes, and reports the displaced nodes for retirement. This path runs
//! under the writer lock and cannot abort; the speculative layer reuses
//! the same transitions through its own allocate/commit protocol.

use crate::nodes::builder::NodeBuilder;
use crate::nodes::representation::{
    is_absent, ConcreteNodePtr, NodeBase, OpaqueNodePtr, LIST_MAX,
};
use smallvec::SmallVec;
use std::sync::atomic::Ordering;

/// Result of one structural insert step.
pub(crate) struct InsertOutcome<V> {
    /// Replacement for the examined slot, when the step was not in-place.
    pub(crate) new_node: Option<OpaqueNodePtr<V>>,
    /// Whether a new key was added.
    pub(crate) inserted: bool,
    /// Whether the change was made in place.
    pub(crate) in_place: bool,
    /// Displaced nodes to retire after publishing.
    pub(crate) retired: SmallVec<[OpaqueNodePtr<V>; 4]>,
}

impl<V> Default for InsertOutcome<V> {
    fn default() -> Self {
        InsertOutcome {
            new_node: None,
            inserted: false,
            in_place: false,
            retired: SmallVec::new(),
        }
    }
}

/// Length of the common prefix of `a` and `b`.
pub(crate) fn match_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Build the leaf for a new key remainder.
///
/// A one-byte remainder becomes a single-entry `LIST` leaf so that later
/// siblings sharing the same parent accumulate in place and eventually
/// promote to the dense leaf; anything else is a single-value `SKIP` leaf.
pub(crate) fn create_leaf_for_key<V: Clone>(
    builder: &NodeBuilder<V>,
    key: &[u8],
    value: V,
) -> OpaqueNodePtr<V> {
    if key.len() == 1 {
        let leaf = builder.make_leaf_list(&[]);
        // SAFETY: `leaf` was allocated with payload `V` on the line above.
        unsafe {
            if let ConcreteNodePtr::ListLeaf(list) = leaf.to_node_ptr() {
                list.as_ref().add_value(key[0], value);
            }
        }
        leaf
    } else {
        builder.make_leaf_skip(key, value)
    }
}

/// Publish `new_node` into `slot`, routing concurrent readers through the
/// retry sentinel first so none can observe a half-swapped subtree.
pub(crate) unsafe fn publish_slot<const CONCURRENT: bool>(
    slot: &std::sync::atomic::AtomicPtr<NodeBase>,
    new_node: *mut NodeBase,
) {
    if CONCURRENT {
        slot.store(crate::nodes::representation::retry_sentinel(), Ordering::Release);
    }
    slot.store(new_node, Ordering::Release);
}

/// Insert `key` into the subtree rooted at `node`.
///
/// Caller holds the writer lock. A replacement in `new_node` must be
/// published into the slot that held `node`, after which every entry in
/// `retired` is retired.
///
/// # Safety
///
/// `node` must be null or a live node of payload type `V`; the caller
/// must hold the writer lock and keep the subtree allocated for the call.
pub(crate) unsafe fn insert_recursive<V: Clone, const CONCURRENT: bool>(
    builder: &NodeBuilder<V>,
    node: *mut NodeBase,
    key: &[u8],
    value: &V,
    variable_len: bool,
) -> InsertOutcome<V> {
    // SAFETY: All node accesses below are covered by the function
    // contract.
    unsafe {
        if is_absent(node) {
            let mut outcome = InsertOutcome::default();
            outcome.new_node = Some(create_leaf_for_key(builder, key, value.clone()));
            outcome.inserted = true;
            return outcome;
        }
        let node = OpaqueNodePtr::from_ptr(node).expect("absent check covers null");
        if node.header().is_leaf() {
            insert_into_leaf::<V, CONCURRENT>(builder, node, key, value, variable_len)
        } else {
            insert_into_interior::<V, CONCURRENT>(builder, node, key, value, variable_len)
        }
    }
}

unsafe fn insert_into_leaf<V: Clone, const CONCURRENT: bool>(
    builder: &NodeBuilder<V>,
    leaf: OpaqueNodePtr<V>,
    key: &[u8],
    value: &V,
    variable_len: bool,
) -> InsertOutcome<V> {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let skip = leaf.skip();
        let m = match_len(skip, key);

        if leaf.header().is_skip() {
            if m == skip.len() && m == key.len() {
                return InsertOutcome::default(); // EXISTS
            }
            if m < skip.len() && m < key.len() {
                return split_leaf_skip(builder, leaf, key, value, m);
            }
            if m == key.len() {
                return prefix_leaf_skip(builder, leaf, key, value, m, variable_len);
            }
            return extend_leaf_skip(builder, leaf, key, value, m, variable_len);
        }

        if m < skip.len() && m < key.len() {
            return split_leaf_list(builder, leaf, key, value, m);
        }
        if m < skip.len() {
            return prefix_leaf_list(builder, leaf, key, value, m, variable_len);
        }
        let key = &key[m..];

        if key.is_empty() {
            return add_eos_to_leaf(builder, leaf, value, variable_len);
        }
        if key.len() == 1 {
            return add_char_to_leaf(builder, leaf, key[0], value);
        }
        demote_leaf::<V, CONCURRENT>(builder, leaf, key, value, variable_len)
    }
}

unsafe fn insert_into_interior<V: Clone, const CONCURRENT: bool>(
    builder: &NodeBuilder<V>,
    node: OpaqueNodePtr<V>,
    key: &[u8],
    value: &V,
    variable_len: bool,
) -> InsertOutcome<V> {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let skip = node.skip();
        let m = match_len(skip, key);
        if m < skip.len() && m < key.len() {
            return split_interior(builder, node, key, value, m);
        }
        if m < skip.len() {
            return prefix_interior(builder, node, key, value, m, variable_len);
        }
        let key = &key[m..];

        if key.is_empty() {
            return set_interior_eos(node, value, variable_len);
        }

        let label = key[0];
        let key = &key[1..];
        let child = node.child(label);

        if !is_absent(child) {
            let child_outcome =
                insert_recursive::<V, CONCURRENT>(builder, child, key, value, variable_len);
            let mut outcome = InsertOutcome::default();
            if let Some(new_child) = child_outcome.new_node {
                if new_child.as_ptr() != child {
                    let slot = match node.to_node_ptr() {
                        ConcreteNodePtr::ListInterior(interior) => {
                            interior.as_ref().child_slot(label)
                        }
                        ConcreteNodePtr::FullInterior(interior) => {
                            Some(interior.as_ref().child_slot(label))
                        }
                        _ => None,
                    };
                    let slot = slot.expect("probed child slot disappeared under the lock");
                    publish_slot::<CONCURRENT>(slot, new_child.as_ptr());
                }
            }
            outcome.inserted = child_outcome.inserted;
            outcome.in_place = child_outcome.in_place;
            outcome.retired = child_outcome.retired;
            return outcome;
        }

        add_child_to_interior(builder, node, label, key, value)
    }
}

unsafe fn split_leaf_skip<V: Clone>(
    builder: &NodeBuilder<V>,
    leaf: OpaqueNodePtr<V>,
    key: &[u8],
    value: &V,
    m: usize,
) -> InsertOutcome<V> {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let skip = leaf.skip();
        let old_label = skip[m];
        let new_label = key[m];

        let old_value = read_skip_value(leaf);
        let interior = builder.make_interior_list(&skip[..m]);
        let old_child = builder.make_leaf_skip(&skip[m + 1..], old_value);
        let new_child = create_leaf_for_key(builder, &key[m + 1..], value.clone());
        if let ConcreteNodePtr::ListInterior(interior) = interior.to_node_ptr() {
            interior.as_ref().add_two_children(
                old_label,
                old_child.as_ptr(),
                new_label,
                new_child.as_ptr(),
            );
        }

        replaced(interior, leaf)
    }
}

unsafe fn prefix_leaf_skip<V: Clone>(
    builder: &NodeBuilder<V>,
    leaf: OpaqueNodePtr<V>,
    key: &[u8],
    value: &V,
    m: usize,
    variable_len: bool,
) -> InsertOutcome<V> {
    // Key is a strict prefix of the leaf's skip; only possible for
    // variable-length encodings.
    debug_assert!(variable_len, "prefix insert with fixed-length keys");
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let skip = leaf.skip();
        let old_value = read_skip_value(leaf);
        let interior = builder.make_interior_list(key);
        let child = builder.make_leaf_skip(&skip[m + 1..], old_value);
        if let ConcreteNodePtr::ListInterior(interior) = interior.to_node_ptr() {
            let interior = interior.as_ref();
            interior.eos.install(value.clone());
            interior.add_child(skip[m], child.as_ptr());
        }

        replaced(interior, leaf)
    }
}

unsafe fn extend_leaf_skip<V: Clone>(
    builder: &NodeBuilder<V>,
    leaf: OpaqueNodePtr<V>,
    key: &[u8],
    value: &V,
    m: usize,
    variable_len: bool,
) -> InsertOutcome<V> {
    // The leaf's skip is a strict prefix of the key; the old value moves
    // into the end-of-string slot of the new interior.
    debug_assert!(variable_len, "extend insert with fixed-length keys");
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let skip = leaf.skip();
        let old_value = read_skip_value(leaf);
        let interior = builder.make_interior_list(skip);
        let child = create_leaf_for_key(builder, &key[m + 1..], value.clone());
        if let ConcreteNodePtr::ListInterior(interior) = interior.to_node_ptr() {
            let interior = interior.as_ref();
            interior.eos.install(old_value);
            interior.add_child(key[m], child.as_ptr());
        }

        replaced(interior, leaf)
    }
}

unsafe fn split_leaf_list<V: Clone>(
    builder: &NodeBuilder<V>,
    leaf: OpaqueNodePtr<V>,
    key: &[u8],
    value: &V,
    m: usize,
) -> InsertOutcome<V> {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let skip = leaf.skip();
        let old_label = skip[m];
        let new_label = key[m];

        let interior = builder.make_interior_list(&skip[..m]);
        let old_child = clone_leaf_with_skip(builder, leaf, &skip[m + 1..]);
        let new_child = create_leaf_for_key(builder, &key[m + 1..], value.clone());
        if let ConcreteNodePtr::ListInterior(interior) = interior.to_node_ptr() {
            interior.as_ref().add_two_children(
                old_label,
                old_child.as_ptr(),
                new_label,
                new_child.as_ptr(),
            );
        }

        replaced(interior, leaf)
    }
}

unsafe fn prefix_leaf_list<V: Clone>(
    builder: &NodeBuilder<V>,
    leaf: OpaqueNodePtr<V>,
    key: &[u8],
    value: &V,
    m: usize,
    variable_len: bool,
) -> InsertOutcome<V> {
    debug_assert!(variable_len, "prefix insert with fixed-length keys");
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let skip = leaf.skip();
        let interior = builder.make_interior_list(key);
        let old_child = clone_leaf_with_skip(builder, leaf, &skip[m + 1..]);
        if let ConcreteNodePtr::ListInterior(interior) = interior.to_node_ptr() {
            let interior = interior.as_ref();
            interior.eos.install(value.clone());
            interior.add_child(skip[m], old_child.as_ptr());
        }

        replaced(interior, leaf)
    }
}

/// Clone a LIST or FULL leaf under a shortened skip, copying the values.
///
/// # Safety
///
/// Same contract as [`insert_recursive`].
pub(crate) unsafe fn clone_leaf_with_skip<V: Clone>(
    builder: &NodeBuilder<V>,
    leaf: OpaqueNodePtr<V>,
    new_skip: &[u8],
) -> OpaqueNodePtr<V> {
    // SAFETY: Covered by the function contract.
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
            _ => unreachable!("clone_leaf_with_skip on a non-list leaf"),
        }
    }
}

/// Clone a LIST or FULL interior under a shortened skip, borrowing the
/// children and cloning the end-of-string value.
///
/// # Safety
///
/// Same contract as [`insert_recursive`]; the displaced interior must be
/// retired (poisoned) rather than recursively freed.
pub(crate) unsafe fn clone_interior_with_skip<V: Clone>(
    builder: &NodeBuilder<V>,
    node: OpaqueNodePtr<V>,
    new_skip: &[u8],
) -> OpaqueNodePtr<V> {
    // SAFETY: Covered by the function contract.
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
            _ => unreachable!("clone_interior_with_skip on a leaf"),
        }
    }
}

unsafe fn add_eos_to_leaf<V: Clone>(
    builder: &NodeBuilder<V>,
    leaf: OpaqueNodePtr<V>,
    value: &V,
    variable_len: bool,
) -> InsertOutcome<V> {
    if !variable_len {
        return InsertOutcome::default();
    }
    // Promote the leaf into an interior carrying the new value at
    // end-of-string, with one single-value child per former entry.
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let skip = leaf.skip();
        let interior = match leaf.to_node_ptr() {
            ConcreteNodePtr::ListLeaf(src) => {
                let interior = builder.make_interior_list(skip);
                if let ConcreteNodePtr::ListInterior(dst) = interior.to_node_ptr() {
                    let src = src.as_ref();
                    let dst = dst.as_ref();
                    dst.eos.install(value.clone());
                    for (index, label) in src.lanes().iter() {
                        if let Some(entry) = src.values[index].read() {
                            let child = builder.make_leaf_skip(&[], entry);
                            dst.add_child(label, child.as_ptr());
                        }
                    }
                }
                interior
            }
            ConcreteNodePtr::FullLeaf(src) => {
                let interior = builder.make_interior_full(skip);
                if let ConcreteNodePtr::FullInterior(dst) = interior.to_node_ptr() {
                    let src = src.as_ref();
                    let dst = dst.as_ref();
                    dst.eos.install(value.clone());
                    src.bitmap().for_each_set(|label| {
                        if let Some(entry) = src.values[usize::from(label)].read() {
                            let child = builder.make_leaf_skip(&[], entry);
                            dst.add_child(label, child.as_ptr());
                        }
                    });
                }
                interior
            }
            _ => unreachable!("add_eos_to_leaf on a skip leaf"),
        };

        replaced(interior, leaf)
    }
}

unsafe fn add_char_to_leaf<V: Clone>(
    builder: &NodeBuilder<V>,
    leaf: OpaqueNodePtr<V>,
    label: u8,
    value: &V,
) -> InsertOutcome<V> {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        match leaf.to_node_ptr() {
            ConcreteNodePtr::ListLeaf(list) => {
                let list_ref = list.as_ref();
                if list_ref.has(label) {
                    return InsertOutcome::default(); // EXISTS
                }
                if list_ref.lanes().count() < LIST_MAX {
                    leaf.base().header.bump_version();
                    list_ref.add_value(label, value.clone());
                    return in_place_insert();
                }
                // Capacity 7 reached: promote to the dense leaf.
                let full = builder.make_leaf_full(leaf.skip());
                if let ConcreteNodePtr::FullLeaf(dst) = full.to_node_ptr() {
                    list_ref.copy_values_to_full(dst.as_ref());
                    dst.as_ref().add_value(label, value.clone());
                }
                replaced(full, leaf)
            }
            ConcreteNodePtr::FullLeaf(full) => {
                let full = full.as_ref();
                if full.has(label) {
                    return InsertOutcome::default(); // EXISTS
                }
                leaf.base().header.bump_version();
                full.add_value(label, value.clone());
                in_place_insert()
            }
            _ => unreachable!("add_char_to_leaf on a skip leaf"),
        }
    }
}

unsafe fn demote_leaf<V: Clone, const CONCURRENT: bool>(
    builder: &NodeBuilder<V>,
    leaf: OpaqueNodePtr<V>,
    key: &[u8],
    value: &V,
    variable_len: bool,
) -> InsertOutcome<V> {
    // The key runs more than one byte past the leaf's entries; promote the
    // leaf into a one-level interior of single-value children and recurse.
    debug_assert!(key.len() > 1);
    let first = key[0];
    let mut outcome = InsertOutcome::default();
    // SAFETY: Covered by the caller's contract.
    unsafe {
        match leaf.to_node_ptr() {
            ConcreteNodePtr::ListLeaf(src) => {
                let src = src.as_ref();
                let view = src.lanes();
                let existing = view.find(first);
                let need_full = existing.is_none() && view.count() >= LIST_MAX;

                let interior = if need_full {
                    builder.make_interior_full(leaf.skip())
                } else {
                    builder.make_interior_list(leaf.skip())
                };
                for (index, label) in view.iter() {
                    if let Some(entry) = src.values[index].read() {
                        let child = builder.make_leaf_skip(&[], entry);
                        add_any_child(interior, label, child.as_ptr());
                    }
                }

                if existing.is_some() {
                    let child = interior.child(first);
                    let child_outcome = insert_recursive::<V, CONCURRENT>(
                        builder,
                        child,
                        &key[1..],
                        value,
                        variable_len,
                    );
                    if let Some(new_child) = child_outcome.new_node {
                        replace_any_child(interior, first, new_child.as_ptr());
                    }
                    outcome.retired.extend(child_outcome.retired);
                } else {
                    let child = create_leaf_for_key(builder, &key[1..], value.clone());
                    add_any_child(interior, first, child.as_ptr());
                }
                outcome.new_node = Some(interior);
            }
            ConcreteNodePtr::FullLeaf(src) => {
                let src = src.as_ref();
                let interior = builder.make_interior_full(leaf.skip());
                src.bitmap().for_each_set(|label| {
                    if let Some(entry) = src.values[usize::from(label)].read() {
                        let child = builder.make_leaf_skip(&[], entry);
                        add_any_child(interior, label, child.as_ptr());
                    }
                });

                if src.has(first) {
                    let child = interior.child(first);
                    let child_outcome = insert_recursive::<V, CONCURRENT>(
                        builder,
                        child,
                        &key[1..],
                        value,
                        variable_len,
                    );
                    if let Some(new_child) = child_outcome.new_node {
                        replace_any_child(interior, first, new_child.as_ptr());
                    }
                    outcome.retired.extend(child_outcome.retired);
                } else {
                    let child = create_leaf_for_key(builder, &key[1..], value.clone());
                    add_any_child(interior, first, child.as_ptr());
                }
                outcome.new_node = Some(interior);
            }
            _ => unreachable!("demote_leaf on a skip leaf"),
        }
    }
    outcome.retired.push(leaf);
    outcome.inserted = true;
    outcome
}

unsafe fn split_interior<V: Clone>(
    builder: &NodeBuilder<V>,
    node: OpaqueNodePtr<V>,
    key: &[u8],
    value: &V,
    m: usize,
) -> InsertOutcome<V> {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let skip = node.skip();
        let old_label = skip[m];
        let new_label = key[m];

        let new_interior = builder.make_interior_list(&skip[..m]);
        let old_child = clone_interior_with_skip(builder, node, &skip[m + 1..]);
        let new_child = builder.make_leaf_skip(&key[m + 1..], value.clone());
        if let ConcreteNodePtr::ListInterior(interior) = new_interior.to_node_ptr() {
            interior.as_ref().add_two_children(
                old_label,
                old_child.as_ptr(),
                new_label,
                new_child.as_ptr(),
            );
        }

        replaced(new_interior, node)
    }
}

unsafe fn prefix_interior<V: Clone>(
    builder: &NodeBuilder<V>,
    node: OpaqueNodePtr<V>,
    key: &[u8],
    value: &V,
    m: usize,
    variable_len: bool,
) -> InsertOutcome<V> {
    debug_assert!(variable_len, "prefix insert with fixed-length keys");
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let skip = node.skip();
        let new_interior = builder.make_interior_list(key);
        let old_child = clone_interior_with_skip(builder, node, &skip[m + 1..]);
        if let ConcreteNodePtr::ListInterior(interior) = new_interior.to_node_ptr() {
            let interior = interior.as_ref();
            interior.eos.install(value.clone());
            interior.add_child(skip[m], old_child.as_ptr());
        }

        replaced(new_interior, node)
    }
}

unsafe fn set_interior_eos<V: Clone>(
    node: OpaqueNodePtr<V>,
    value: &V,
    variable_len: bool,
) -> InsertOutcome<V> {
    if !variable_len {
        return InsertOutcome::default();
    }
    // SAFETY: Covered by the caller's contract.
    unsafe {
        if node.has_eos() {
            return InsertOutcome::default(); // EXISTS
        }
        node.base().header.bump_version();
        match node.to_node_ptr() {
            ConcreteNodePtr::ListInterior(interior) => {
                interior.as_ref().eos.install(value.clone())
            }
            ConcreteNodePtr::FullInterior(interior) => {
                interior.as_ref().eos.install(value.clone())
            }
            _ => unreachable!("set_interior_eos on a leaf"),
        }
    }
    in_place_insert()
}

unsafe fn add_child_to_interior<V: Clone>(
    builder: &NodeBuilder<V>,
    node: OpaqueNodePtr<V>,
    label: u8,
    remaining: &[u8],
    value: &V,
) -> InsertOutcome<V> {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        let child = create_leaf_for_key(builder, remaining, value.clone());
        match node.to_node_ptr() {
            ConcreteNodePtr::ListInterior(interior) => {
                let interior_ref = interior.as_ref();
                if interior_ref.child_count() < LIST_MAX {
                    node.base().header.bump_version();
                    interior_ref.add_child(label, child.as_ptr());
                    return in_place_insert();
                }
                // Capacity 7 reached: convert to the dense interior.
                let full = builder.make_interior_full(node.skip());
                if let ConcreteNodePtr::FullInterior(dst) = full.to_node_ptr() {
                    interior_ref.copy_interior_to_full(dst.as_ref());
                    dst.as_ref().add_child(label, child.as_ptr());
                }
                replaced(full, node)
            }
            ConcreteNodePtr::FullInterior(interior) => {
                node.base().header.bump_version();
                interior.as_ref().add_child(label, child.as_ptr());
                in_place_insert()
            }
            _ => unreachable!("add_child_to_interior on a leaf"),
        }
    }
}

unsafe fn read_skip_value<V: Clone>(leaf: OpaqueNodePtr<V>) -> V {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        match leaf.to_node_ptr() {
            ConcreteNodePtr::SkipLeaf(skip_leaf) => skip_leaf
                .as_ref()
                .value
                .read()
                .expect("skip leaf lost its value"),
            _ => unreachable!("read_skip_value on a non-skip node"),
        }
    }
}

unsafe fn add_any_child<V>(interior: OpaqueNodePtr<V>, label: u8, child: *mut NodeBase) {
    // SAFETY: Covered by the caller's contract.
    unsafe {
        match interior.to_node_ptr() {
            ConcreteNodePtr::ListInterior(node) => node.as_ref().add_child(label, child),
            ConcreteNodePtr::FullInterior(node) => node.as_ref().add_child(label, child),
            _ => unreachable!("add_any_child on a leaf"),
        }
    }
}

unsafe fn replace_any_child<V>(interior: OpaqueNodePtr<V>, label: u8, child: *mut NodeBase) {
    // SAFETY: Covered by the caller's contract. The interior here is a
    // freshly built, unpublished node, so a plain slot store suffices.
    unsafe {
        match interior.to_node_ptr() {
            ConcreteNodePtr::ListInterior(node) => {
                let node = node.as_ref();
                let slot = node.child_slot(label).expect("child was added above");
                slot.store(child, Ordering::Release);
            }
            ConcreteNodePtr::FullInterior(node) => {
                node.as_ref().child_slot(label).store(child, Ordering::Release);
            }
            _ => unreachable!("replace_any_child on a leaf"),
        }
    }
}

fn in_place_insert<V>() -> InsertOutcome<V> {
    InsertOutcome {
        new_node: None,
        inserted: true,
        in_place: true,
        retired: SmallVec::new(),
    }
}

fn replaced<V>(new_node: OpaqueNodePtr<V>, old: OpaqueNodePtr<V>) -> InsertOutcome<V> {
    let mut outcome = InsertOutcome::default();
    outcome.new_node = Some(new_node);
    outcome.inserted = true;
    outcome.retired.push(old);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::operations::lookup::get_plain;

    // Drives the recursive path the way the map's locked fallback does:
    // apply the outcome to a root slot and free the displaced nodes.
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
                let outcome = insert_recursive::<u64, false>(
                    &self.builder,
                    self.root,
                    key,
                    &value,
                    true,
                );
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

        fn get(&self, key: &[u8]) -> Option<u64> {
            // SAFETY: Single-threaded ownership of the tree.
            unsafe {
                let root = OpaqueNodePtr::from_ptr(self.root)?;
                get_plain(root, key, false).unwrap()
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
    fn empty_tree_then_exists() {
        let mut h = Harness::new();
        assert!(h.insert(b"hello", 1));
        assert!(!h.insert(b"hello", 2));
        assert_eq!(h.get(b"hello"), Some(1));
        assert_eq!(h.get(b"hell"), None);
    }

    #[test]
    fn split_inside_skip() {
        let mut h = Harness::new();
        assert!(h.insert(b"abcdef", 1));
        assert!(h.insert(b"abczzz", 2));
        assert_eq!(h.get(b"abcdef"), Some(1));
        assert_eq!(h.get(b"abczzz"), Some(2));
        assert_eq!(h.get(b"abc"), None);
    }

    #[test]
    fn prefix_and_extend() {
        let mut h = Harness::new();
        assert!(h.insert(b"abcdefghij", 1));
        assert!(h.insert(b"abcdef", 2));
        assert!(h.insert(b"abcdefghijklmnop", 3));
        assert_eq!(h.get(b"abcdefghij"), Some(1));
        assert_eq!(h.get(b"abcdef"), Some(2));
        assert_eq!(h.get(b"abcdefghijklmnop"), Some(3));
    }

    #[test]
    fn sibling_leaves_share_a_list() {
        let mut h = Harness::new();
        for (i, key) in [b"cab", b"cac", b"cad"].iter().enumerate() {
            assert!(h.insert(*key, i as u64));
        }
        assert_eq!(h.get(b"cab"), Some(0));
        assert_eq!(h.get(b"cac"), Some(1));
        assert_eq!(h.get(b"cad"), Some(2));
        assert_eq!(h.get(b"ca"), None);
    }

    #[test]
    fn list_leaf_promotes_to_full_on_eighth_label() {
        let mut h = Harness::new();
        // The first two keys split at index 1, leaving a single-entry
        // list leaf under 'B'; the remaining labels grow it in place
        // until the eighth forces the dense-leaf promotion.
        assert!(h.insert(b"zA1", 100));
        for digit in b'1'..=b'8' {
            let key = [b'z', b'B', digit];
            assert!(h.insert(&key, u64::from(digit)));
        }
        assert_eq!(h.get(b"zA1"), Some(100));
        for digit in b'1'..=b'8' {
            let key = [b'z', b'B', digit];
            assert_eq!(h.get(&key), Some(u64::from(digit)), "digit {digit}");
        }
        assert_eq!(h.get(b"zB"), None);
        assert_eq!(h.get(b"zB9"), None);
    }

    #[test]
    fn interior_list_converts_to_full_on_eighth_child() {
        let mut h = Harness::new();
        // Two-byte tails force real child subtrees rather than leaf lanes.
        for label in 1u8..=8 {
            let key = [b'p', label, b'x', b'y'];
            assert!(h.insert(&key, u64::from(label) * 10));
        }
        for label in 1u8..=8 {
            let key = [b'p', label, b'x', b'y'];
            assert_eq!(h.get(&key), Some(u64::from(label) * 10));
        }
    }

    #[test]
    fn eos_on_existing_interior() {
        let mut h = Harness::new();
        assert!(h.insert(b"ab", 10));
        assert!(h.insert(b"abc", 20));
        assert!(h.insert(b"abcd", 30));
        assert_eq!(h.get(b"ab"), Some(10));
        assert_eq!(h.get(b"abc"), Some(20));
        assert_eq!(h.get(b"abcd"), Some(30));
        assert_eq!(h.get(b"a"), None);
    }

    #[test]
    fn eos_on_interior_skip() {
        let mut h = Harness::new();
        assert!(h.insert(b"xa", 1));
        assert!(h.insert(b"xb", 2));
        // "x" equals the interior's skip: lands in the end-of-string slot.
        assert!(h.insert(b"x", 3));
        assert_eq!(h.get(b"xa"), Some(1));
        assert_eq!(h.get(b"xb"), Some(2));
        assert_eq!(h.get(b"x"), Some(3));
    }

    #[test]
    fn eos_added_to_leaf_list() {
        let mut h = Harness::new();
        // "pAq"/"pBq" split at index 1; the 'B' child is a list leaf, and
        // "pBr" grows it in place.
        assert!(h.insert(b"pAq", 1));
        assert!(h.insert(b"pBq", 2));
        assert!(h.insert(b"pBr", 3));
        // "pB" equals the list leaf's path: promotes it to an interior
        // carrying the value at end-of-string.
        assert!(h.insert(b"pB", 4));
        assert_eq!(h.get(b"pAq"), Some(1));
        assert_eq!(h.get(b"pBq"), Some(2));
        assert_eq!(h.get(b"pBr"), Some(3));
        assert_eq!(h.get(b"pB"), Some(4));
        assert_eq!(h.get(b"p"), None);
    }

    #[test]
    fn demote_leaf_on_long_tail() {
        let mut h = Harness::new();
        assert!(h.insert(b"kAq", 1));
        assert!(h.insert(b"kBq", 2));
        // Runs two bytes past the list leaf under 'B'.
        assert!(h.insert(b"kBqxy", 3));
        assert!(h.insert(b"kBr", 4));
        assert_eq!(h.get(b"kAq"), Some(1));
        assert_eq!(h.get(b"kBq"), Some(2));
        assert_eq!(h.get(b"kBqxy"), Some(3));
        assert_eq!(h.get(b"kBr"), Some(4));
    }

    #[test]
    fn empty_key_is_a_valid_key() {
        let mut h = Harness::new();
        assert!(h.insert(b"", 42));
        assert!(h.insert(b"a", 1));
        assert_eq!(h.get(b""), Some(42));
        assert_eq!(h.get(b"a"), Some(1));
        assert!(!h.insert(b"", 43));
        assert_eq!(h.get(b""), Some(42));
    }
}
