//! The read path: skip-matching descent with optional optimistic
//! validation.
//!
//! Both flavors run the same unified loop: consume the node's skip,
//! finish at a leaf, otherwise read the end-of-string slot or pop one byte
//! and follow the labeled child. The plain flavor reports observed poison
//! to the caller so the retry/fallback loops can decide what to do; the
//! optimistic flavor records `(node, version)` pairs on the way down and
//! lets the caller re-validate the whole path afterwards.

use crate::nodes::operations::MAX_DEPTH;
use crate::nodes::representation::{ConcreteNodePtr, OpaqueNodePtr};
use arrayvec::ArrayVec;

/// A plain descent observed a poisoned node or the retry sentinel; the
/// result is meaningless and the caller must retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interrupted;

/// The `(node, version)` pairs recorded by an optimistic descent.
pub(crate) struct ReadPath<V> {
    entries: ArrayVec<(OpaqueNodePtr<V>, u64), MAX_DEPTH>,
    dirty: bool,
}

impl<V> ReadPath<V> {
    pub(crate) fn new() -> Self {
        ReadPath {
            entries: ArrayVec::new(),
            dirty: false,
        }
    }

    /// Record `node` with one header load. Returns `false`, marking the
    /// whole descent dirty, when the node is already dead or the path is
    /// full. A dirty path never validates, so the descent's result cannot
    /// be published.
    pub(crate) fn push_checked(&mut self, node: OpaqueNodePtr<V>) -> bool {
        // SAFETY: Nodes reached during a guarded descent stay allocated
        // for the duration of the guard.
        let header = unsafe { node.header() };
        if header.is_poisoned() {
            self.dirty = true;
            return false;
        }
        if self.entries.try_push((node, header.version())).is_err() {
            self.dirty = true;
            return false;
        }
        true
    }

    /// Re-read every recorded version. Poisoning bumps the version, so
    /// this also detects retirement.
    pub(crate) fn validate(&self) -> bool {
        if self.dirty {
            return false;
        }
        self.entries.iter().all(|(node, version)| {
            // SAFETY: Retired nodes stay allocated for the guard's grace
            // period, so the header load is in bounds even when stale.
            unsafe { node.version() == *version }
        })
    }
}

fn strip_skip<'k>(key: &'k [u8], skip: &[u8]) -> Option<&'k [u8]> {
    key.strip_prefix(skip)
}

/// Membership descent without path recording.
///
/// With `check_poison` set, observing a poisoned node (including the retry
/// sentinel) aborts with [`Interrupted`]; the single-threaded flavor passes
/// `false` and never fails.
///
/// # Safety
///
/// Every node reachable from `root` must stay allocated for the duration
/// of the call (guaranteed by the caller's reclamation guard, or by
/// exclusive access for the single-threaded flavor).
pub(crate) unsafe fn contains_plain<V>(
    root: OpaqueNodePtr<V>,
    key: &[u8],
    check_poison: bool,
) -> Result<bool, Interrupted> {
    let mut node = root;
    let mut key = key;
    // SAFETY: All node accesses below are covered by the function
    // contract.
    unsafe {
        if check_poison && node.is_poisoned() {
            return Err(Interrupted);
        }
        loop {
            key = match strip_skip(key, node.skip()) {
                Some(rest) => rest,
                None => return Ok(false),
            };
            let header = node.header();
            if header.is_leaf() {
                return Ok(match node.to_node_ptr() {
                    ConcreteNodePtr::SkipLeaf(_) => key.is_empty(),
                    ConcreteNodePtr::ListLeaf(leaf) => {
                        key.len() == 1 && leaf.as_ref().has(key[0])
                    }
                    ConcreteNodePtr::FullLeaf(leaf) => {
                        key.len() == 1 && leaf.as_ref().has(key[0])
                    }
                    _ => false,
                });
            }
            if key.is_empty() {
                return Ok(node.has_eos());
            }
            let child = node.child(key[0]);
            key = &key[1..];
            node = match OpaqueNodePtr::from_ptr(child) {
                Some(child) => child,
                None => return Ok(false),
            };
            if check_poison && node.is_poisoned() {
                return Err(Interrupted);
            }
        }
    }
}

/// Value-copying descent without path recording.
///
/// # Safety
///
/// Same contract as [`contains_plain`].
pub(crate) unsafe fn get_plain<V: Clone>(
    root: OpaqueNodePtr<V>,
    key: &[u8],
    check_poison: bool,
) -> Result<Option<V>, Interrupted> {
    let mut node = root;
    let mut key = key;
    // SAFETY: All node accesses below are covered by the function
    // contract.
    unsafe {
        if check_poison && node.is_poisoned() {
            return Err(Interrupted);
        }
        loop {
            key = match strip_skip(key, node.skip()) {
                Some(rest) => rest,
                None => return Ok(None),
            };
            let header = node.header();
            if header.is_leaf() {
                return Ok(leaf_value(node, key));
            }
            if key.is_empty() {
                return Ok(node.read_eos());
            }
            let child = node.child(key[0]);
            key = &key[1..];
            node = match OpaqueNodePtr::from_ptr(child) {
                Some(child) => child,
                None => return Ok(None),
            };
            if check_poison && node.is_poisoned() {
                return Err(Interrupted);
            }
        }
    }
}

/// Value-copying descent that records `(node, version)` pairs into `path`.
///
/// The result is only meaningful if `path.validate()` passes afterwards.
///
/// # Safety
///
/// Same contract as [`contains_plain`].
pub(crate) unsafe fn get_optimistic<V: Clone>(
    root: OpaqueNodePtr<V>,
    key: &[u8],
    path: &mut ReadPath<V>,
) -> Option<V> {
    let mut node = root;
    let mut key = key;
    if !path.push_checked(node) {
        return None;
    }
    // SAFETY: All node accesses below are covered by the function
    // contract.
    unsafe {
        loop {
            key = strip_skip(key, node.skip())?;
            let header = node.header();
            if header.is_leaf() {
                return leaf_value(node, key);
            }
            if key.is_empty() {
                return node.read_eos();
            }
            let child = node.child(key[0]);
            key = &key[1..];
            node = OpaqueNodePtr::from_ptr(child)?;
            if !path.push_checked(node) {
                return None;
            }
        }
    }
}

/// Leaf endgame shared by the value-reading descents. The skip has already
/// been consumed and the node's poison state already checked.
///
/// # Safety
///
/// Same contract as [`contains_plain`].
unsafe fn leaf_value<V: Clone>(node: OpaqueNodePtr<V>, key: &[u8]) -> Option<V> {
    // SAFETY: Covered by the function contract.
    unsafe {
        match node.to_node_ptr() {
            ConcreteNodePtr::SkipLeaf(leaf) => {
                if key.is_empty() {
                    leaf.as_ref().value.read()
                } else {
                    None
                }
            }
            ConcreteNodePtr::ListLeaf(leaf) => {
                if key.len() != 1 {
                    return None;
                }
                let leaf = leaf.as_ref();
                let index = leaf.lanes().find(key[0])?;
                leaf.values[index].read()
            }
            ConcreteNodePtr::FullLeaf(leaf) => {
                if key.len() != 1 {
                    return None;
                }
                let leaf = leaf.as_ref();
                if !leaf.has(key[0]) {
                    return None;
                }
                leaf.values[usize::from(key[0])].read()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::builder::NodeBuilder;
    use crate::nodes::representation::ConcreteNodePtr;

    // A small hand-built tree:
    //   interior "ca" {eos: 100}
    //     'r' -> skip leaf "" = 1          ("car")
    //     't' -> list leaf "" {s: 2, t: 3} ("cats", "catt")
    fn build_tree(builder: &NodeBuilder<u32>) -> crate::nodes::representation::OpaqueNodePtr<u32> {
        let car = builder.make_leaf_skip(b"", 1);
        let cat_kids = builder.make_leaf_list(b"");
        let root = builder.make_interior_list(b"ca");
        // SAFETY: All nodes were allocated above with payload u32.
        unsafe {
            if let ConcreteNodePtr::ListLeaf(leaf) = cat_kids.to_node_ptr() {
                leaf.as_ref().add_value(b's', 2);
                leaf.as_ref().add_value(b't', 3);
            }
            if let ConcreteNodePtr::ListInterior(interior) = root.to_node_ptr() {
                interior.as_ref().add_child(b'r', car.as_ptr());
                interior.as_ref().add_child(b't', cat_kids.as_ptr());
                interior.as_ref().eos.install(100);
            }
        }
        root
    }

    #[test]
    fn plain_descent_finds_all_shapes() {
        let builder = NodeBuilder::<u32>::new();
        let root = build_tree(&builder);
        // SAFETY: The tree is local to this test and fully owned.
        unsafe {
            assert_eq!(get_plain(root, b"car", true), Ok(Some(1)));
            assert_eq!(get_plain(root, b"cats", true), Ok(Some(2)));
            assert_eq!(get_plain(root, b"catt", true), Ok(Some(3)));
            assert_eq!(get_plain(root, b"ca", true), Ok(Some(100)));
            assert_eq!(get_plain(root, b"c", true), Ok(None));
            assert_eq!(get_plain(root, b"cart", true), Ok(None));
            assert_eq!(get_plain(root, b"catx", true), Ok(None));
            assert_eq!(get_plain(root, b"dog", true), Ok(None));
            assert_eq!(get_plain(root, b"", true), Ok(None));

            assert_eq!(contains_plain(root, b"cats", true), Ok(true));
            assert_eq!(contains_plain(root, b"ca", true), Ok(true));
            assert_eq!(contains_plain(root, b"cat", true), Ok(false));

            builder.dealloc_node(root);
        }
    }

    #[test]
    fn optimistic_descent_validates_clean_path() {
        let builder = NodeBuilder::<u32>::new();
        let root = build_tree(&builder);
        // SAFETY: The tree is local to this test and fully owned.
        unsafe {
            let mut path = ReadPath::new();
            assert_eq!(get_optimistic(root, b"cats", &mut path), Some(2));
            assert!(path.validate());
            builder.dealloc_node(root);
        }
    }

    #[test]
    fn optimistic_descent_fails_validation_after_version_bump() {
        let builder = NodeBuilder::<u32>::new();
        let root = build_tree(&builder);
        // SAFETY: The tree is local to this test and fully owned.
        unsafe {
            let mut path = ReadPath::new();
            assert_eq!(get_optimistic(root, b"car", &mut path), Some(1));
            root.base().header.bump_version();
            assert!(!path.validate());
            builder.dealloc_node(root);
        }
    }

    #[test]
    fn poisoned_node_interrupts_plain_descent() {
        let builder = NodeBuilder::<u32>::new();
        let root = build_tree(&builder);
        // SAFETY: The tree is local to this test and fully owned.
        unsafe {
            root.base().header.poison();
            assert_eq!(contains_plain(root, b"car", true), Err(Interrupted));
            // The single-threaded flavor ignores poison entirely.
            assert_eq!(contains_plain(root, b"car", false), Ok(true));

            let mut path = ReadPath::new();
            assert_eq!(get_optimistic(root, b"car", &mut path), None);
            assert!(!path.validate());

            root.base().header.unpoison();
            builder.dealloc_node(root);
        }
    }
}
