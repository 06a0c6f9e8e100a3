//! Per-map epoch-based reclamation.
//!
//! Readers publish the epoch they entered under into one of a small fixed
//! set of cache-padded slots; writers tag displaced nodes with the epoch
//! at retirement and push them onto a lock-free stack threaded through the
//! nodes' embedded retire links. Reclamation claims the whole stack,
//! frees every node retired at least two epochs before the oldest active
//! reader, and pushes the remainder back. Slot collisions are resolved
//! conservatively: the older epoch wins, which can only delay
//! reclamation, never endanger it.

use crate::nodes::builder::NodeBuilder;
use crate::nodes::representation::{NodeBase, OpaqueNodePtr};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Number of reader slots per map.
pub(crate) const READER_SLOTS: usize = 16;

/// A node retired at epoch `e` is freed once every reader slot is either
/// empty or holds an epoch past `e + RETIRE_GRACE`.
pub(crate) const RETIRE_GRACE: u64 = 2;

/// Writers run cleanup once this many nodes are awaiting reclamation.
pub(crate) const WRITER_CLEANUP_THRESHOLD: usize = 64;

/// Readers run cleanup only past this backstop threshold.
pub(crate) const READER_CLEANUP_THRESHOLD: usize = 128;

fn thread_slot() -> usize {
    thread_local! {
        static SLOT: usize = {
            let mut hasher = DefaultHasher::new();
            std::thread::current().id().hash(&mut hasher);
            (hasher.finish() as usize) % READER_SLOTS
        };
    }
    SLOT.with(|slot| *slot)
}

/// The reclamation state embedded in every map.
pub(crate) struct EbrState {
    reader_slots: [CachePadded<AtomicU64>; READER_SLOTS],
    retired_head: AtomicPtr<NodeBase>,
    retired_count: AtomicUsize,
    cleanup_lock: Mutex<()>,
}

impl EbrState {
    pub(crate) fn new() -> Self {
        EbrState {
            reader_slots: std::array::from_fn(|_| CachePadded::new(AtomicU64::new(0))),
            retired_head: AtomicPtr::new(ptr::null_mut()),
            retired_count: AtomicUsize::new(0),
            cleanup_lock: Mutex::new(()),
        }
    }

    /// Publish `epoch` into this thread's slot. Zero marks an empty slot,
    /// so callers must never pass epoch zero (the map's counter starts at
    /// one). On collision the older epoch is kept.
    pub(crate) fn reader_enter(&self, epoch: u64) {
        debug_assert!(epoch != 0, "epoch zero is the empty-slot marker");
        self.reader_slots[thread_slot()]
            .try_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == 0 || epoch < current {
                    Some(epoch)
                } else {
                    None
                }
            })
            .ok();
    }

    /// Empty this thread's slot.
    pub(crate) fn reader_exit(&self) {
        self.reader_slots[thread_slot()].store(0, Ordering::Release);
    }

    /// The oldest epoch any active reader may still be traversing under.
    pub(crate) fn min_reader_epoch(&self, current_epoch: u64) -> u64 {
        let mut min = current_epoch;
        for slot in &self.reader_slots {
            let epoch = slot.load(Ordering::Acquire);
            if epoch != 0 && epoch < min {
                min = epoch;
            }
        }
        min
    }

    /// Number of nodes awaiting reclamation.
    pub(crate) fn retired_count(&self) -> usize {
        self.retired_count.load(Ordering::Relaxed)
    }

    /// Push an already-poisoned node onto the retired stack, tagged with
    /// `epoch`.
    ///
    /// # Safety
    ///
    /// `node` must be a live, poisoned allocation that no writer will
    /// touch again; its retire links must be unused.
    pub(crate) unsafe fn retire(&self, node: *mut NodeBase, epoch: u64) {
        // SAFETY: The node stays allocated until this module frees it.
        let links = unsafe { &(*node).retire };
        links.epoch.store(epoch, Ordering::Relaxed);
        let mut head = self.retired_head.load(Ordering::Relaxed);
        loop {
            links.next.store(head, Ordering::Relaxed);
            match self.retired_head.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
        self.retired_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Claim the retired stack, free what the grace period allows, and
    /// push the rest back.
    ///
    /// # Safety
    ///
    /// Every node on the stack must have been retired with payload type
    /// `V`.
    pub(crate) unsafe fn cleanup<V>(&self, current_epoch: u64) {
        let _guard = self.cleanup_lock.lock();

        let mut list = self.retired_head.swap(ptr::null_mut(), Ordering::Acquire);
        self.retired_count.store(0, Ordering::Relaxed);
        if list.is_null() {
            return;
        }

        let min_epoch = self.min_reader_epoch(current_epoch);
        let builder = NodeBuilder::<V>::new();

        let mut keep_head: *mut NodeBase = ptr::null_mut();
        let mut keep_tail: *mut NodeBase = ptr::null_mut();
        let mut keep_count = 0usize;

        while !list.is_null() {
            let node = list;
            // SAFETY: Retired nodes stay allocated until freed below, and
            // this thread holds the cleanup lock, so the claimed list is
            // private.
            unsafe {
                list = (*node).retire.next.load(Ordering::Relaxed);
                if (*node).retire.epoch.load(Ordering::Relaxed) + RETIRE_GRACE <= min_epoch {
                    let node =
                        OpaqueNodePtr::<V>::from_ptr(node).expect("retired list holds no nulls");
                    builder.dealloc_node(node);
                } else {
                    (*node).retire.next.store(keep_head, Ordering::Relaxed);
                    if keep_head.is_null() {
                        keep_tail = node;
                    }
                    keep_head = node;
                    keep_count += 1;
                }
            }
        }

        if !keep_head.is_null() {
            // Other threads may have pushed more retirements meanwhile;
            // splice the kept list back in front of whatever is there.
            let mut head = self.retired_head.load(Ordering::Relaxed);
            loop {
                // SAFETY: `keep_tail` is part of the private kept list.
                unsafe { (*keep_tail).retire.next.store(head, Ordering::Relaxed) };
                match self.retired_head.compare_exchange_weak(
                    head,
                    keep_head,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => head = observed,
                }
            }
            self.retired_count.fetch_add(keep_count, Ordering::Relaxed);
        }
    }

    /// Free the entire retired stack unconditionally. Used by `clear` and
    /// drop, whose exclusive access guarantees no reader is left.
    ///
    /// # Safety
    ///
    /// Same contract as [`EbrState::cleanup`], plus: no concurrent
    /// readers may exist.
    pub(crate) unsafe fn drain_all<V>(&self) {
        let _guard = self.cleanup_lock.lock();
        let mut list = self.retired_head.swap(ptr::null_mut(), Ordering::Acquire);
        self.retired_count.store(0, Ordering::Relaxed);
        let builder = NodeBuilder::<V>::new();
        while !list.is_null() {
            let node = list;
            // SAFETY: Covered by the function contract.
            unsafe {
                list = (*node).retire.next.load(Ordering::Relaxed);
                let node =
                    OpaqueNodePtr::<V>::from_ptr(node).expect("retired list holds no nulls");
                builder.dealloc_node(node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retire_leaf(state: &EbrState, builder: &NodeBuilder<u32>, epoch: u64) {
        let leaf = builder.make_leaf_skip(b"x", 7);
        // SAFETY: Freshly allocated, poisoned, and handed to the state.
        unsafe {
            leaf.base().header.poison();
            state.retire(leaf.as_ptr(), epoch);
        }
    }

    #[test]
    fn reader_slots_track_oldest_epoch() {
        let state = EbrState::new();
        assert_eq!(state.min_reader_epoch(10), 10);
        state.reader_enter(5);
        assert_eq!(state.min_reader_epoch(10), 5);
        // Re-entering with a newer epoch must not displace the older one.
        state.reader_enter(8);
        assert_eq!(state.min_reader_epoch(10), 5);
        state.reader_exit();
        assert_eq!(state.min_reader_epoch(10), 10);
    }

    #[test]
    fn cleanup_respects_the_grace_period() {
        let state = EbrState::new();
        let builder = NodeBuilder::<u32>::new();
        retire_leaf(&state, &builder, 1);
        retire_leaf(&state, &builder, 5);
        assert_eq!(state.retired_count(), 2);

        // A reader stuck at epoch 2 protects both retirements.
        state.reader_enter(2);
        // SAFETY: Both nodes were retired with payload u32.
        unsafe { state.cleanup::<u32>(10) };
        assert_eq!(state.retired_count(), 2);

        // Once the reader leaves, everything is past the grace period.
        state.reader_exit();
        // SAFETY: As above.
        unsafe { state.cleanup::<u32>(10) };
        assert_eq!(state.retired_count(), 0);
    }

    #[test]
    fn drain_ignores_the_grace_period() {
        let state = EbrState::new();
        let builder = NodeBuilder::<u32>::new();
        retire_leaf(&state, &builder, 9);
        state.reader_enter(1);
        // SAFETY: The test owns the only "reader" and it touches nothing.
        unsafe { state.drain_all::<u32>() };
        assert_eq!(state.retired_count(), 0);
        state.reader_exit();
    }
}
