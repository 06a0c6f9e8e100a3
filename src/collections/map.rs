//! The concurrent ordered map facade.
//!
//! [`RawTrieMap`] owns the root pointer, the size counter, the per-map
//! epoch, the writer mutex, and the reclamation state, and drives the
//! speculative probe, allocate, validate-and-commit protocol over the
//! structural transitions in [`crate::nodes::operations`]. The
//! `CONCURRENT` const parameter selects between the lock-free-reader
//! flavor and a single-threaded flavor that skips guards, validation, and
//! sentinel publishing while keeping the same structural logic.

use crate::bytes::KeyBytes;
use crate::ebr::{EbrState, READER_CLEANUP_THRESHOLD, WRITER_CLEANUP_THRESHOLD};
use crate::nodes::builder::NodeBuilder;
use crate::nodes::operations::erase::{erase_recursive, push_value_tombstone};
use crate::nodes::operations::erase_probe::{
    allocate_erase_speculative, probe_erase, validate_erase_path, EraseOp, EraseSpecInfo,
};
use crate::nodes::operations::insert::{
    create_leaf_for_key, insert_recursive, publish_slot,
};
use crate::nodes::operations::lookup::{contains_plain, get_plain, get_optimistic, ReadPath};
use crate::nodes::operations::probe::{
    allocate_speculative, dealloc_speculation, probe_insert, validate_path, PathEntry,
    SpecAlloc, SpecInfo, SpecOp,
};
use crate::nodes::representation::{
    is_sentinel, ConcreteNodePtr, NodeBase, OpaqueNodePtr, LIST_MAX,
};
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Optimistic read attempts before falling back to the wait-through read.
const READ_ATTEMPTS: usize = 10;

/// Speculative probe/commit attempts before the locked fallback.
const MAX_SPEC_RETRIES: usize = 7;

/// Snapshot of the speculative-commit counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecStats {
    /// Probes started.
    pub attempts: u64,
    /// Inserts that committed speculatively (including no-op duplicates).
    pub successes: u64,
    /// Inserts that exhausted their retries and took the locked fallback.
    pub fallbacks: u64,
}

#[derive(Default)]
struct SpecCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    fallbacks: AtomicU64,
}

impl SpecCounters {
    fn attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    fn fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SpecStats {
        SpecStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// A concurrent ordered map from byte-encoded keys to values, backed by a
/// path-compressed radix trie.
///
/// Readers never take a lock: they descend optimistically, validate the
/// versions they observed, and retry on contention. Writers serialize on
/// one mutex but probe and allocate outside it, entering the critical
/// section only to validate and swap. Displaced nodes are reclaimed
/// through a per-map epoch scheme once no reader can still hold them.
///
/// `CONCURRENT = false` selects a single-threaded flavor with the same
/// structure and none of the synchronization overhead; it is `Send` but
/// not `Sync`.
pub struct RawTrieMap<K, V, const CONCURRENT: bool> {
    root: AtomicPtr<NodeBase>,
    size: AtomicUsize,
    epoch: AtomicU64,
    writer: Mutex<()>,
    ebr: EbrState,
    builder: NodeBuilder<V>,
    stats: SpecCounters,
    _marker: PhantomData<(fn(K) -> K, *mut V, Cell<()>)>,
}

// SAFETY: The map owns its nodes and value boxes outright; sending the
// map moves that ownership, which is sound whenever the payload itself is
// `Send`. Keys are never stored.
unsafe impl<K, V: Send, const CONCURRENT: bool> Send for RawTrieMap<K, V, CONCURRENT> {}

// SAFETY: Shared access is mediated by atomics, the writer mutex, and the
// epoch scheme; values are handed out by clone only. Only the concurrent
// flavor upholds that discipline.
unsafe impl<K, V: Send + Sync> Sync for RawTrieMap<K, V, true> {}

impl<K, V, const CONCURRENT: bool> RawTrieMap<K, V, CONCURRENT> {
    /// Create an empty map.
    pub fn new() -> Self {
        RawTrieMap {
            root: AtomicPtr::new(ptr::null_mut()),
            size: AtomicUsize::new(0),
            // Zero marks an empty reader slot, so the epoch starts at one.
            epoch: AtomicU64::new(1),
            writer: Mutex::new(()),
            ebr: EbrState::new(),
            builder: NodeBuilder::new(),
            stats: SpecCounters::default(),
            _marker: PhantomData,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Whether the map holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the speculative-commit counters.
    pub fn speculative_stats(&self) -> SpecStats {
        self.stats.snapshot()
    }

    /// Remove every key and free every node, including the retired list.
    pub fn clear(&mut self) {
        let root = self.root.swap(ptr::null_mut(), Ordering::AcqRel);
        if !is_sentinel(root) {
            // SAFETY: Exclusive access; the tree is fully owned and
            // unpoisoned.
            unsafe {
                if let Some(root) = OpaqueNodePtr::<V>::from_ptr(root) {
                    self.builder.dealloc_node(root);
                }
            }
        }
        self.size.store(0, Ordering::SeqCst);
        // SAFETY: Exclusive access means no reader can hold a retired
        // node.
        unsafe { self.ebr.drain_all::<V>() };
    }

    /// Immediately free every safely retired node.
    ///
    /// Exclusive access is required, which is what makes "safely" trivial
    /// here: with no readers, everything retired is reclaimable.
    pub fn reclaim_retired(&mut self) {
        // SAFETY: Exclusive access means no reader can hold a retired
        // node.
        unsafe { self.ebr.drain_all::<V>() };
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn reader_enter(&self) {
        if CONCURRENT {
            self.ebr.reader_enter(self.current_epoch());
        }
    }

    fn reader_exit(&self) {
        if CONCURRENT {
            self.ebr.reader_exit();
        }
    }

    fn maybe_cleanup(&self, threshold: usize) {
        if CONCURRENT && self.ebr.retired_count() >= threshold {
            // SAFETY: Every node on this map's retired list was retired
            // with payload type `V`.
            unsafe { self.ebr.cleanup::<V>(self.current_epoch()) };
        }
    }

    fn load_root(&self) -> Option<OpaqueNodePtr<V>> {
        // SAFETY: The root slot only ever holds nodes of this map's
        // payload type (or the sentinel, which is poison-checked before
        // any downcast).
        unsafe { OpaqueNodePtr::from_ptr(self.root.load(Ordering::Acquire)) }
    }

    /// Poison `node` and either queue it for epoch-based reclamation or,
    /// in the single-threaded flavor, free it on the spot.
    ///
    /// # Safety
    ///
    /// `node` must be a displaced node of this map, never referenced by a
    /// writer again.
    unsafe fn retire_node(&self, node: OpaqueNodePtr<V>) {
        if is_sentinel(node.as_ptr()) {
            return;
        }
        // SAFETY: Covered by the function contract.
        unsafe {
            node.base().header.poison();
            if CONCURRENT {
                self.ebr.retire(node.as_ptr(), self.current_epoch());
            } else {
                self.builder.dealloc_node(node);
            }
        }
    }

    /// Resolve the slot that currently points at `target`: the root slot,
    /// or the child slot of the path entry above it. Returns `None` when
    /// the slot no longer points at the target.
    ///
    /// # Safety
    ///
    /// Caller holds the writer lock; `target` and the path nodes must be
    /// alive (guaranteed by the caller's guard).
    unsafe fn verified_slot(
        &self,
        path: &[PathEntry<V>],
        target: OpaqueNodePtr<V>,
    ) -> Option<&AtomicPtr<NodeBase>> {
        let position = path.iter().rposition(|entry| entry.node == target)?;
        let slot: &AtomicPtr<NodeBase> = if position == 0 {
            &self.root
        } else {
            let parent = path[position - 1].node;
            let edge = path[position].edge;
            // SAFETY: Covered by the function contract.
            unsafe {
                match parent.to_node_ptr() {
                    ConcreteNodePtr::ListInterior(interior) => {
                        interior.as_ref().child_slot(edge)?
                    }
                    ConcreteNodePtr::FullInterior(interior) => {
                        interior.as_ref().child_slot(edge)
                    }
                    _ => return None,
                }
            }
        };
        if slot.load(Ordering::Acquire) == target.as_ptr() {
            Some(slot)
        } else {
            None
        }
    }

    /// Bump the version of the node owning `target`'s slot, if any.
    ///
    /// # Safety
    ///
    /// Same contract as [`RawTrieMap::verified_slot`].
    unsafe fn bump_slot_owner(&self, path: &[PathEntry<V>], target: OpaqueNodePtr<V>) {
        if let Some(position) = path.iter().rposition(|entry| entry.node == target) {
            if position > 0 {
                // SAFETY: Covered by the function contract.
                unsafe { path[position - 1].node.base() }.header.bump_version();
            }
        }
    }
}

impl<K: KeyBytes, V, const CONCURRENT: bool> RawTrieMap<K, V, CONCURRENT> {
    fn variable_len() -> bool {
        K::FIXED_LEN == 0
    }

    /// Whether some live key equals `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        let encoded = key.to_bytes();
        if !CONCURRENT {
            return match self.load_root() {
                // SAFETY: Single-threaded flavor; the tree is stable for
                // the duration of the call.
                Some(root) => unsafe { contains_plain(root, &encoded, false) }
                    .unwrap_or(false),
                None => false,
            };
        }

        self.maybe_cleanup(READER_CLEANUP_THRESHOLD);
        self.reader_enter();
        let found = self.contains_concurrent(&encoded);
        self.reader_exit();
        found
    }

    fn contains_concurrent(&self, key: &[u8]) -> bool {
        let backoff = Backoff::new();
        for _ in 0..READ_ATTEMPTS {
            // Fast path: a traversal bracketed by two epoch reads is
            // valid when no write committed in between.
            let epoch_before = self.current_epoch();
            let root = match self.load_root() {
                Some(root) => root,
                None => return false,
            };
            // SAFETY: The reader guard keeps every reachable node
            // allocated.
            if unsafe { root.is_poisoned() } {
                backoff.spin();
                continue;
            }
            // SAFETY: As above.
            if let Ok(found) = unsafe { contains_plain(root, key, true) } {
                if self.current_epoch() == epoch_before {
                    return found;
                }
            }
            backoff.spin();
        }

        // Wait-through fallback: keep descending until a traversal
        // crosses no poisoned node. Writers are mutex-serialized, so the
        // sentinel and poison states it observes are transient.
        loop {
            let root = match self.load_root() {
                Some(root) => root,
                None => return false,
            };
            // SAFETY: As above.
            unsafe {
                if !root.is_poisoned() {
                    if let Ok(found) = contains_plain(root, key, true) {
                        return found;
                    }
                }
            }
            backoff.snooze();
        }
    }

    /// Copy out the value stored under `key`.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let encoded = key.to_bytes();
        if !CONCURRENT {
            return match self.load_root() {
                // SAFETY: Single-threaded flavor; the tree is stable for
                // the duration of the call.
                Some(root) => unsafe { get_plain(root, &encoded, false) }.unwrap_or(None),
                None => None,
            };
        }

        self.maybe_cleanup(READER_CLEANUP_THRESHOLD);
        self.reader_enter();
        let value = self.get_concurrent(&encoded);
        self.reader_exit();
        value
    }

    fn get_concurrent(&self, key: &[u8]) -> Option<V>
    where
        V: Clone,
    {
        let backoff = Backoff::new();
        for _ in 0..READ_ATTEMPTS {
            let root = match self.load_root() {
                Some(root) => root,
                None => return None,
            };
            // SAFETY: The reader guard keeps every reachable node
            // allocated.
            if unsafe { root.is_poisoned() } {
                backoff.spin();
                continue;
            }
            let mut path = ReadPath::new();
            // SAFETY: As above.
            let value = unsafe { get_optimistic(root, key, &mut path) };
            if path.validate() {
                return value;
            }
            backoff.spin();
        }

        loop {
            let root = match self.load_root() {
                Some(root) => root,
                None => return None,
            };
            // SAFETY: As above.
            unsafe {
                if !root.is_poisoned() {
                    if let Ok(value) = get_plain(root, key, true) {
                        return value;
                    }
                }
            }
            backoff.snooze();
        }
    }

    /// Insert `key` with `value`. Returns `true` when the key was new; a
    /// duplicate insert returns `false` and leaves the stored value
    /// untouched.
    pub fn insert(&self, key: &K, value: V) -> bool
    where
        V: Clone,
    {
        let encoded = key.to_bytes();
        if !CONCURRENT {
            return self.insert_locked(&encoded, &value).0;
        }

        self.maybe_cleanup(WRITER_CLEANUP_THRESHOLD);
        self.reader_enter();
        let (inserted, retired_any) = self.insert_concurrent(&encoded, &value);
        self.reader_exit();
        if retired_any {
            self.epoch.fetch_add(1, Ordering::AcqRel);
        }
        self.maybe_cleanup(WRITER_CLEANUP_THRESHOLD);
        inserted
    }

    fn insert_locked(&self, key: &[u8], value: &V) -> (bool, bool)
    where
        V: Clone,
    {
        let _writer = self.writer.lock();
        // SAFETY: The writer lock is held and the reader guard (when
        // concurrent) keeps displaced nodes alive.
        unsafe {
            let outcome = insert_recursive::<V, CONCURRENT>(
                &self.builder,
                self.root.load(Ordering::Acquire),
                key,
                value,
                Self::variable_len(),
            );
            if !outcome.inserted {
                debug_assert!(outcome.retired.is_empty());
                return (false, false);
            }
            if CONCURRENT {
                self.epoch.fetch_add(1, Ordering::Release);
            }
            if let Some(new_root) = outcome.new_node {
                publish_slot::<CONCURRENT>(&self.root, new_root.as_ptr());
            }
            let retired_any = !outcome.retired.is_empty();
            for node in outcome.retired {
                self.retire_node(node);
            }
            self.size.fetch_add(1, Ordering::SeqCst);
            (true, retired_any)
        }
    }

    fn insert_concurrent(&self, key: &[u8], value: &V) -> (bool, bool)
    where
        V: Clone,
    {
        let variable = Self::variable_len();
        let mut retired_any = false;

        for _retry in 0..=MAX_SPEC_RETRIES {
            // SAFETY: The reader guard taken by `insert` protects the
            // probe's traversal.
            let info: SpecInfo<V> =
                unsafe { probe_insert(self.root.load(Ordering::Acquire), key, variable) };
            self.stats.attempt();

            match info.op {
                SpecOp::Retry => continue,
                SpecOp::Exists => {
                    self.stats.success();
                    return (false, retired_any);
                }
                // Too complex for speculation; the locked path handles
                // these without aborting.
                SpecOp::Fallback | SpecOp::AddEosLeafList | SpecOp::DemoteLeafList => break,

                SpecOp::InPlaceLeaf => {
                    let target = info.target.expect("in-place case has a target");
                    let _writer = self.writer.lock();
                    // SAFETY: Lock held; guard keeps nodes alive.
                    unsafe {
                        if !validate_path(&info) {
                            continue;
                        }
                        match target.to_node_ptr() {
                            ConcreteNodePtr::ListLeaf(leaf) => {
                                let leaf = leaf.as_ref();
                                if leaf.has(info.label)
                                    || leaf.lanes().count() >= LIST_MAX
                                {
                                    continue;
                                }
                                self.epoch.fetch_add(1, Ordering::Release);
                                target.base().header.bump_version();
                                leaf.add_value(info.label, value.clone());
                            }
                            ConcreteNodePtr::FullLeaf(leaf) => {
                                let leaf = leaf.as_ref();
                                if leaf.has(info.label) {
                                    continue;
                                }
                                self.epoch.fetch_add(1, Ordering::Release);
                                target.base().header.bump_version();
                                leaf.add_value(info.label, value.clone());
                            }
                            _ => continue,
                        }
                    }
                    self.size.fetch_add(1, Ordering::SeqCst);
                    self.stats.success();
                    return (true, retired_any);
                }

                SpecOp::InPlaceInterior if info.is_eos => {
                    debug_assert!(variable, "end-of-string with fixed-length keys");
                    let target = info.target.expect("in-place case has a target");
                    let _writer = self.writer.lock();
                    // SAFETY: Lock held; guard keeps nodes alive.
                    unsafe {
                        if !validate_path(&info) || target.has_eos() {
                            continue;
                        }
                        self.epoch.fetch_add(1, Ordering::Release);
                        target.base().header.bump_version();
                        match target.to_node_ptr() {
                            ConcreteNodePtr::ListInterior(interior) => {
                                interior.as_ref().eos.install(value.clone())
                            }
                            ConcreteNodePtr::FullInterior(interior) => {
                                interior.as_ref().eos.install(value.clone())
                            }
                            _ => continue,
                        }
                    }
                    self.size.fetch_add(1, Ordering::SeqCst);
                    self.stats.success();
                    return (true, retired_any);
                }

                SpecOp::InPlaceInterior => {
                    let target = info.target.expect("in-place case has a target");
                    // Allocate the child outside the lock.
                    let child =
                        create_leaf_for_key(&self.builder, &info.remaining_key, value.clone());
                    let committed = {
                        let _writer = self.writer.lock();
                        // SAFETY: Lock held; guard keeps nodes alive.
                        unsafe {
                            if !validate_path(&info) {
                                false
                            } else {
                                match target.to_node_ptr() {
                                    ConcreteNodePtr::ListInterior(interior) => {
                                        let interior = interior.as_ref();
                                        if interior.has(info.label)
                                            || interior.child_count() >= LIST_MAX
                                        {
                                            false
                                        } else {
                                            self.epoch.fetch_add(1, Ordering::Release);
                                            target.base().header.bump_version();
                                            interior.add_child(info.label, child.as_ptr());
                                            true
                                        }
                                    }
                                    ConcreteNodePtr::FullInterior(interior) => {
                                        let interior = interior.as_ref();
                                        if interior.has(info.label) {
                                            false
                                        } else {
                                            self.epoch.fetch_add(1, Ordering::Release);
                                            target.base().header.bump_version();
                                            interior.add_child(info.label, child.as_ptr());
                                            true
                                        }
                                    }
                                    _ => false,
                                }
                            }
                        }
                    };
                    if !committed {
                        // SAFETY: The child was never published.
                        unsafe { self.builder.dealloc_node(child) };
                        continue;
                    }
                    self.size.fetch_add(1, Ordering::SeqCst);
                    self.stats.success();
                    return (true, retired_any);
                }

                // Replacement cases: allocate the poisoned subtree outside
                // the lock, then validate and swap.
                _ => {
                    // SAFETY: Guard keeps the probed nodes alive while the
                    // replacement copies from them.
                    let alloc = unsafe { allocate_speculative(&self.builder, &info, value) };
                    if alloc.replacement.is_none() {
                        continue;
                    }
                    let committed = {
                        let _writer = self.writer.lock();
                        // SAFETY: Lock held; guard keeps nodes alive.
                        unsafe {
                            validate_path(&info) && self.commit_insert_replacement(&info, &alloc)
                        }
                    };
                    if !committed {
                        // SAFETY: The speculation was never published.
                        unsafe { dealloc_speculation(&self.builder, alloc) };
                        continue;
                    }
                    if let Some(target) = info.target {
                        // SAFETY: The displaced target is unreachable from
                        // the new subtree root.
                        unsafe { self.retire_node(target) };
                        retired_any = true;
                    }
                    self.size.fetch_add(1, Ordering::SeqCst);
                    self.stats.success();
                    return (true, retired_any);
                }
            }
        }

        // Locked fallback: the recursive path cannot abort.
        self.stats.fallback();
        let (inserted, fallback_retired) = self.insert_locked(key, value);
        (inserted, retired_any || fallback_retired)
    }

    /// Publish a speculative insert replacement. Caller holds the writer
    /// lock and has validated the path.
    ///
    /// # Safety
    ///
    /// Lock held; `info`/`alloc` must come from this map's probe and
    /// allocation.
    unsafe fn commit_insert_replacement(&self, info: &SpecInfo<V>, alloc: &SpecAlloc<V>) -> bool {
        let replacement = match alloc.replacement {
            Some(replacement) => replacement,
            None => return false,
        };
        // SAFETY: Covered by the function contract.
        unsafe {
            match info.op {
                SpecOp::EmptyTree => {
                    if !self.root.load(Ordering::Acquire).is_null() {
                        return false;
                    }
                    alloc.unpoison_all();
                    self.root.store(replacement.as_ptr(), Ordering::Release);
                    true
                }
                _ => {
                    let target = match info.target {
                        Some(target) => target,
                        None => return false,
                    };
                    let slot = match self.verified_slot(&info.path, target) {
                        Some(slot) => slot,
                        None => return false,
                    };
                    alloc.unpoison_all();
                    self.bump_slot_owner(&info.path, target);
                    self.epoch.fetch_add(1, Ordering::Release);
                    publish_slot::<true>(slot, replacement.as_ptr());
                    true
                }
            }
        }
    }

    /// Remove `key`. Returns whether a key was removed.
    pub fn remove(&self, key: &K) -> bool
    where
        V: Clone,
    {
        let encoded = key.to_bytes();
        if !CONCURRENT {
            return self.erase_locked(&encoded).0;
        }

        self.maybe_cleanup(WRITER_CLEANUP_THRESHOLD);
        self.reader_enter();
        let (erased, retired_any) = self.erase_concurrent(&encoded);
        self.reader_exit();
        if retired_any {
            self.epoch.fetch_add(1, Ordering::AcqRel);
        }
        self.maybe_cleanup(WRITER_CLEANUP_THRESHOLD);
        erased
    }

    fn erase_locked(&self, key: &[u8]) -> (bool, bool)
    where
        V: Clone,
    {
        let _writer = self.writer.lock();
        // SAFETY: The writer lock is held and the reader guard (when
        // concurrent) keeps displaced nodes alive.
        unsafe {
            let outcome = erase_recursive::<V, CONCURRENT>(
                &self.builder,
                self.root.load(Ordering::Acquire),
                key,
                Self::variable_len(),
            );
            if !outcome.erased {
                return (false, false);
            }
            if CONCURRENT {
                self.epoch.fetch_add(1, Ordering::Release);
            }
            if outcome.deleted_subtree {
                publish_slot::<CONCURRENT>(&self.root, ptr::null_mut());
            } else if let Some(new_root) = outcome.new_node {
                publish_slot::<CONCURRENT>(&self.root, new_root.as_ptr());
            }
            let retired_any = !outcome.retired.is_empty();
            for node in outcome.retired {
                self.retire_node(node);
            }
            self.size.fetch_sub(1, Ordering::SeqCst);
            (true, retired_any)
        }
    }

    fn erase_concurrent(&self, key: &[u8]) -> (bool, bool)
    where
        V: Clone,
    {
        let variable = Self::variable_len();
        let mut retired_any = false;

        for _retry in 0..=MAX_SPEC_RETRIES {
            // SAFETY: The reader guard taken by `remove` protects the
            // probe's traversal.
            let info: EraseSpecInfo<V> =
                unsafe { probe_erase(self.root.load(Ordering::Acquire), key, variable) };

            match info.op {
                EraseOp::NotFound => return (false, retired_any),
                EraseOp::Retry => continue,
                EraseOp::Fallback => break,

                EraseOp::InPlaceLeafList | EraseOp::InPlaceLeafFull => {
                    let target = info.target.expect("in-place case has a target");
                    let mut tombstones = smallvec::SmallVec::<[OpaqueNodePtr<V>; 4]>::new();
                    let committed = {
                        let _writer = self.writer.lock();
                        // SAFETY: Lock held; guard keeps nodes alive.
                        unsafe {
                            if !validate_erase_path(&info) {
                                false
                            } else {
                                match target.to_node_ptr() {
                                    ConcreteNodePtr::ListLeaf(leaf) => {
                                        let leaf = leaf.as_ref();
                                        if !leaf.has(info.label)
                                            || leaf.lanes().count() <= 1
                                        {
                                            false
                                        } else {
                                            self.epoch.fetch_add(1, Ordering::Release);
                                            target.base().header.bump_version();
                                            let removed = leaf.remove_value(info.label);
                                            push_value_tombstone(
                                                &self.builder,
                                                &mut tombstones,
                                                removed,
                                            );
                                            true
                                        }
                                    }
                                    ConcreteNodePtr::FullLeaf(leaf) => {
                                        let leaf = leaf.as_ref();
                                        if !leaf.has(info.label) || leaf.count() <= 1 {
                                            false
                                        } else {
                                            self.epoch.fetch_add(1, Ordering::Release);
                                            target.base().header.bump_version();
                                            let removed = leaf.remove_value(info.label);
                                            push_value_tombstone(
                                                &self.builder,
                                                &mut tombstones,
                                                removed,
                                            );
                                            true
                                        }
                                    }
                                    _ => false,
                                }
                            }
                        }
                    };
                    if !committed {
                        continue;
                    }
                    for tombstone in tombstones {
                        // SAFETY: Tombstones are private allocations
                        // wrapping the removed value boxes.
                        unsafe { self.retire_node(tombstone) };
                        retired_any = true;
                    }
                    self.size.fetch_sub(1, Ordering::SeqCst);
                    return (true, retired_any);
                }

                EraseOp::DeleteRootLeaf => {
                    let target = info.target.expect("root delete has a target");
                    let committed = {
                        let _writer = self.writer.lock();
                        // SAFETY: Lock held; guard keeps nodes alive.
                        unsafe {
                            if !validate_erase_path(&info)
                                || self.root.load(Ordering::Acquire) != target.as_ptr()
                            {
                                false
                            } else {
                                self.epoch.fetch_add(1, Ordering::Release);
                                publish_slot::<true>(&self.root, ptr::null_mut());
                                true
                            }
                        }
                    };
                    if !committed {
                        continue;
                    }
                    // SAFETY: The leaf is no longer reachable.
                    unsafe { self.retire_node(target) };
                    retired_any = true;
                    self.size.fetch_sub(1, Ordering::SeqCst);
                    return (true, retired_any);
                }

                EraseOp::DeleteChildNoCollapse => {
                    let target = info.target.expect("label removal has a target");
                    let doomed = info.doomed.expect("label removal dooms a leaf");
                    let committed = {
                        let _writer = self.writer.lock();
                        // SAFETY: Lock held; guard keeps nodes alive.
                        unsafe {
                            if !validate_erase_path(&info) {
                                false
                            } else {
                                self.epoch.fetch_add(1, Ordering::Release);
                                target.base().header.bump_version();
                                match target.to_node_ptr() {
                                    ConcreteNodePtr::ListInterior(interior) => {
                                        interior.as_ref().remove_child(info.label);
                                        true
                                    }
                                    ConcreteNodePtr::FullInterior(interior) => {
                                        interior.as_ref().remove_child(info.label);
                                        true
                                    }
                                    _ => false,
                                }
                            }
                        }
                    };
                    if !committed {
                        continue;
                    }
                    // SAFETY: The doomed leaf is no longer reachable.
                    unsafe { self.retire_node(doomed) };
                    retired_any = true;
                    self.size.fetch_sub(1, Ordering::SeqCst);
                    return (true, retired_any);
                }

                EraseOp::DeleteChildCollapse | EraseOp::DeleteEosInterior => {
                    let target = info.target.expect("merge case has a target");
                    // SAFETY: Guard keeps the probed nodes alive while the
                    // merge copies from them.
                    let alloc = unsafe { allocate_erase_speculative(&self.builder, &info) };
                    let mut tombstones = smallvec::SmallVec::<[OpaqueNodePtr<V>; 4]>::new();
                    let committed = {
                        let _writer = self.writer.lock();
                        // SAFETY: Lock held; guard keeps nodes alive.
                        unsafe {
                            if !validate_erase_path(&info) {
                                false
                            } else if let Some(replacement) = alloc.replacement {
                                match self.verified_slot(&info.path, target) {
                                    Some(slot) => {
                                        alloc.unpoison_all();
                                        self.bump_slot_owner(&info.path, target);
                                        self.epoch.fetch_add(1, Ordering::Release);
                                        publish_slot::<true>(slot, replacement.as_ptr());
                                        true
                                    }
                                    None => false,
                                }
                            } else if info.op == EraseOp::DeleteEosInterior
                                && info.survivor.is_none()
                            {
                                // No lone child to merge with: clear the
                                // end-of-string value in place.
                                if !target.has_eos() {
                                    false
                                } else {
                                    self.epoch.fetch_add(1, Ordering::Release);
                                    target.base().header.bump_version();
                                    let removed = match target.to_node_ptr() {
                                        ConcreteNodePtr::ListInterior(interior) => {
                                            interior.as_ref().eos.clear()
                                        }
                                        ConcreteNodePtr::FullInterior(interior) => {
                                            interior.as_ref().eos.clear()
                                        }
                                        _ => ptr::null_mut(),
                                    };
                                    push_value_tombstone(
                                        &self.builder,
                                        &mut tombstones,
                                        removed,
                                    );
                                    true
                                }
                            } else {
                                false
                            }
                        }
                    };
                    if !committed {
                        // SAFETY: The speculation was never published.
                        unsafe { dealloc_speculation(&self.builder, alloc) };
                        continue;
                    }
                    // SAFETY: Displaced nodes are unreachable from the new
                    // subtree.
                    unsafe {
                        if alloc.replacement.is_some() {
                            self.retire_node(target);
                            if let Some(doomed) = info.doomed {
                                self.retire_node(doomed);
                            }
                            if let Some(survivor) = info.survivor {
                                self.retire_node(survivor);
                            }
                            retired_any = true;
                        }
                        for tombstone in tombstones {
                            self.retire_node(tombstone);
                            retired_any = true;
                        }
                    }
                    self.size.fetch_sub(1, Ordering::SeqCst);
                    return (true, retired_any);
                }
            }
        }

        // Locked fallback: the recursive path cannot abort.
        let (erased, fallback_retired) = self.erase_locked(key);
        (erased, retired_any || fallback_retired)
    }

    /// Visit every entry in lexicographic byte order of the encoded keys.
    ///
    /// Holds the writer lock for the whole walk, so the snapshot is
    /// consistent; concurrent readers are unaffected.
    pub fn for_each(&self, mut f: impl FnMut(K, V))
    where
        V: Clone,
    {
        let _writer = self.writer.lock();
        if let Some(root) = self.load_root() {
            let mut prefix = Vec::new();
            // SAFETY: The writer lock freezes the structure; nodes stay
            // allocated for the duration of the walk.
            unsafe { self.walk_in_order(root, &mut prefix, &mut f) };
        }
    }

    /// Collect every key in lexicographic order.
    pub fn keys(&self) -> Vec<K>
    where
        V: Clone,
    {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(|key, _| keys.push(key));
        keys
    }

    unsafe fn walk_in_order(
        &self,
        node: OpaqueNodePtr<V>,
        prefix: &mut Vec<u8>,
        f: &mut impl FnMut(K, V),
    ) where
        V: Clone,
    {
        // SAFETY: Covered by the caller (writer lock held).
        unsafe {
            let depth = prefix.len();
            prefix.extend_from_slice(node.skip());
            match node.to_node_ptr() {
                ConcreteNodePtr::SkipLeaf(leaf) => {
                    if let Some(value) = leaf.as_ref().value.read() {
                        f(K::from_bytes(prefix), value);
                    }
                }
                ConcreteNodePtr::ListLeaf(leaf) => {
                    let leaf = leaf.as_ref();
                    let mut entries: Vec<(u8, usize)> =
                        leaf.lanes().iter().map(|(index, label)| (label, index)).collect();
                    entries.sort_unstable_by_key(|entry| entry.0);
                    for (label, index) in entries {
                        if let Some(value) = leaf.values[index].read() {
                            prefix.push(label);
                            f(K::from_bytes(prefix), value);
                            prefix.pop();
                        }
                    }
                }
                ConcreteNodePtr::FullLeaf(leaf) => {
                    let leaf = leaf.as_ref();
                    let bitmap = leaf.bitmap();
                    let mut cursor = bitmap.first();
                    while let Some(label) = cursor {
                        if let Some(value) = leaf.values[usize::from(label)].read() {
                            prefix.push(label);
                            f(K::from_bytes(prefix), value);
                            prefix.pop();
                        }
                        cursor = bitmap.next_set(Some(label));
                    }
                }
                ConcreteNodePtr::ListInterior(interior) => {
                    let interior = interior.as_ref();
                    if let Some(value) = interior.eos.read() {
                        f(K::from_bytes(prefix), value);
                    }
                    let mut entries: Vec<(u8, usize)> = interior
                        .lanes()
                        .iter()
                        .map(|(index, label)| (label, index))
                        .collect();
                    entries.sort_unstable_by_key(|entry| entry.0);
                    for (label, index) in entries {
                        let child = interior.children[index].load(Ordering::Acquire);
                        if let Some(child) = OpaqueNodePtr::from_ptr(child) {
                            prefix.push(label);
                            self.walk_in_order(child, prefix, f);
                            prefix.pop();
                        }
                    }
                }
                ConcreteNodePtr::FullInterior(interior) => {
                    let interior = interior.as_ref();
                    if let Some(value) = interior.eos.read() {
                        f(K::from_bytes(prefix), value);
                    }
                    let bitmap = interior.bitmap();
                    let mut cursor = bitmap.first();
                    while let Some(label) = cursor {
                        if let Some(child) = OpaqueNodePtr::from_ptr(interior.child(label)) {
                            prefix.push(label);
                            self.walk_in_order(child, prefix, f);
                            prefix.pop();
                        }
                        cursor = bitmap.next_set(Some(label));
                    }
                }
            }
            prefix.truncate(depth);
        }
    }
}

impl<K, V, const CONCURRENT: bool> Default for RawTrieMap<K, V, CONCURRENT> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V: Clone, const CONCURRENT: bool> Clone for RawTrieMap<K, V, CONCURRENT> {
    /// Deep copy. Quiesces the source's writers for the duration; readers
    /// are unaffected.
    fn clone(&self) -> Self {
        let _writer = self.writer.lock();
        let copy = Self::new();
        let root = self.root.load(Ordering::Acquire);
        if !is_sentinel(root) {
            // SAFETY: The writer lock freezes the structure; the copy
            // owns every node it allocates.
            unsafe {
                if let Some(root) = OpaqueNodePtr::<V>::from_ptr(root) {
                    let cloned = self.builder.deep_copy(root);
                    copy.root.store(cloned.as_ptr(), Ordering::Release);
                }
            }
        }
        copy.size
            .store(self.size.load(Ordering::SeqCst), Ordering::SeqCst);
        copy
    }
}

impl<K, V, const CONCURRENT: bool> Drop for RawTrieMap<K, V, CONCURRENT> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<K, V, const CONCURRENT: bool> fmt::Debug for RawTrieMap<K, V, CONCURRENT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTrieMap")
            .field("len", &self.len())
            .field("concurrent", &CONCURRENT)
            .finish_non_exhaustive()
    }
}
