//! The packed per-node header word.
//!
//! Every node carries one 64-bit atomic word combining the variant tag, the
//! poison flag, and a monotonically increasing version counter:
//!
//! ```text
//! bit 0      LEAF     leaf vs. interior
//! bit 1      SKIP     single-value leaf
//! bit 2      LIST     7-slot variant (leaf or interior)
//! bit 3      POISON   logically dead; readers must disregard the node
//! bits 4..   VERSION  bumped on every mutation or retirement
//! ```
//!
//! Neither `SKIP` nor `LIST` set means the node is the dense `FULL`
//! variant. Poisoning also bumps the version, so optimistic readers can
//! validate a recorded path with a plain version compare.

use std::sync::atomic::{AtomicU64, Ordering};

const LEAF_BIT: u64 = 1 << 0;
const SKIP_BIT: u64 = 1 << 1;
const LIST_BIT: u64 = 1 << 2;
const POISON_BIT: u64 = 1 << 3;
const VERSION_SHIFT: u32 = 4;
const VERSION_UNIT: u64 = 1 << VERSION_SHIFT;

/// The five node shapes, as encoded in the header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    /// Leaf holding exactly one value under its skip string.
    SkipLeaf,
    /// Leaf with up to seven labeled value slots.
    ListLeaf,
    /// Leaf with a dense 256-slot value table.
    FullLeaf,
    /// Interior with up to seven labeled children.
    ListInterior,
    /// Interior with a dense 256-slot child table.
    FullInterior,
}

impl NodeKind {
    const fn bits(self) -> u64 {
        match self {
            NodeKind::SkipLeaf => LEAF_BIT | SKIP_BIT,
            NodeKind::ListLeaf => LEAF_BIT | LIST_BIT,
            NodeKind::FullLeaf => LEAF_BIT,
            NodeKind::ListInterior => LIST_BIT,
            NodeKind::FullInterior => 0,
        }
    }

    fn from_bits(bits: u64) -> NodeKind {
        match bits & (LEAF_BIT | SKIP_BIT | LIST_BIT) {
            b if b == LEAF_BIT | SKIP_BIT => NodeKind::SkipLeaf,
            b if b == LEAF_BIT | LIST_BIT => NodeKind::ListLeaf,
            b if b == LEAF_BIT => NodeKind::FullLeaf,
            b if b == LIST_BIT => NodeKind::ListInterior,
            _ => NodeKind::FullInterior,
        }
    }
}

/// The atomic header word shared by every node variant.
pub(crate) struct Header(AtomicU64);

impl Header {
    /// Create a header for a fresh, unpoisoned node of the given kind.
    pub(crate) fn new(kind: NodeKind) -> Self {
        Header(AtomicU64::new(kind.bits()))
    }

    /// Load the whole word once.
    pub(crate) fn snapshot(&self) -> HeaderSnapshot {
        HeaderSnapshot(self.0.load(Ordering::Acquire))
    }

    /// Current version counter.
    pub(crate) fn version(&self) -> u64 {
        self.snapshot().version()
    }

    /// Whether the node is poisoned.
    pub(crate) fn is_poisoned(&self) -> bool {
        self.snapshot().is_poisoned()
    }

    /// Bump the version counter. Writer-lock holders call this before any
    /// in-place mutation so overlapping optimistic readers fail validation.
    pub(crate) fn bump_version(&self) {
        self.0.fetch_add(VERSION_UNIT, Ordering::AcqRel);
    }

    /// Mark the node logically dead. Also bumps the version, which is what
    /// lets path validation get away with comparing versions only.
    pub(crate) fn poison(&self) {
        self.0
            .try_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some((word | POISON_BIT).wrapping_add(VERSION_UNIT))
            })
            .ok();
    }

    /// Clear the poison flag. Used when publishing a speculative
    /// replacement whose nodes were pre-poisoned for abort safety; the node
    /// is not yet visible to readers, so no version bump is needed.
    pub(crate) fn unpoison(&self) {
        self.0.fetch_and(!POISON_BIT, Ordering::Release);
    }
}

/// A single load of a [`Header`] word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeaderSnapshot(u64);

impl HeaderSnapshot {
    /// The variant encoded in the flag bits.
    pub(crate) fn kind(self) -> NodeKind {
        NodeKind::from_bits(self.0)
    }

    /// Leaf vs. interior.
    pub(crate) fn is_leaf(self) -> bool {
        self.0 & LEAF_BIT != 0
    }

    /// Single-value leaf.
    pub(crate) fn is_skip(self) -> bool {
        self.0 & SKIP_BIT != 0
    }

    /// 7-slot variant (leaf or interior).
    pub(crate) fn is_list(self) -> bool {
        self.0 & LIST_BIT != 0
    }

    /// Logically dead.
    pub(crate) fn is_poisoned(self) -> bool {
        self.0 & POISON_BIT != 0
    }

    /// The version counter portion of the word.
    pub(crate) fn version(self) -> u64 {
        self.0 >> VERSION_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_bits_round_trip() {
        for kind in [
            NodeKind::SkipLeaf,
            NodeKind::ListLeaf,
            NodeKind::FullLeaf,
            NodeKind::ListInterior,
            NodeKind::FullInterior,
        ] {
            let header = Header::new(kind);
            let snap = header.snapshot();
            assert_eq!(snap.kind(), kind);
            assert!(!snap.is_poisoned());
            assert_eq!(snap.version(), 0);
        }
    }

    #[test]
    fn leaf_flags_match_kind() {
        assert!(Header::new(NodeKind::SkipLeaf).snapshot().is_leaf());
        assert!(Header::new(NodeKind::ListLeaf).snapshot().is_leaf());
        assert!(Header::new(NodeKind::FullLeaf).snapshot().is_leaf());
        assert!(!Header::new(NodeKind::ListInterior).snapshot().is_leaf());
        assert!(!Header::new(NodeKind::FullInterior).snapshot().is_leaf());

        assert!(Header::new(NodeKind::ListInterior).snapshot().is_list());
        assert!(!Header::new(NodeKind::FullInterior).snapshot().is_list());
        assert!(Header::new(NodeKind::SkipLeaf).snapshot().is_skip());
    }

    #[test]
    fn version_is_monotonic() {
        let header = Header::new(NodeKind::ListInterior);
        let mut last = header.version();
        for _ in 0..10 {
            header.bump_version();
            let now = header.version();
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn poison_bumps_version_and_preserves_kind() {
        let header = Header::new(NodeKind::FullLeaf);
        let before = header.version();
        header.poison();
        let snap = header.snapshot();
        assert!(snap.is_poisoned());
        assert_eq!(snap.kind(), NodeKind::FullLeaf);
        assert!(snap.version() > before);

        header.unpoison();
        let snap = header.snapshot();
        assert!(!snap.is_poisoned());
        assert_eq!(snap.kind(), NodeKind::FullLeaf);
    }
}
