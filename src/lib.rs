#![deny(
    missing_docs,
    clippy::missing_safety_doc,
    unsafe_op_in_unsafe_fn,
    deprecated_in_future,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    rustdoc::invalid_codeblock_attributes
)]

//! Concurrent path-compressed radix trie map.
//!
//! `bramble` maps byte-encoded keys to values while preserving the
//! lexicographic order of the encodings. Readers are lock-free: they
//! descend the trie optimistically, validate the per-node versions they
//! observed, and retry on contention. Writers serialize on a single
//! per-map mutex but do their probing and allocation outside it, entering
//! the critical section only to validate the recorded path and swap a
//! pointer. Displaced nodes are reclaimed through a per-map epoch scheme
//! that delays freeing until no reader can still hold them.
//!
//! # References
//!
//!  - Leis, V., Kemper, A., & Neumann, T. (2013, April). The adaptive
//!    radix tree: ARTful indexing for main-memory databases. In 2013 IEEE
//!    29th International Conference on Data Engineering (ICDE)
//!    (pp. 38-49). IEEE.
//!  - Fraser, K. (2004). Practical lock-freedom. University of Cambridge
//!    technical report UCAM-CL-TR-579 (epoch-based reclamation).
//!
//! # Example
//!
//! ```
//! use bramble::TrieMap;
//!
//! let map: TrieMap<String, u32> = TrieMap::new();
//! assert!(map.insert(&"care".to_string(), 3));
//! assert!(map.insert(&"careful".to_string(), 4));
//! assert!(!map.insert(&"care".to_string(), 99)); // duplicate, unchanged
//! assert_eq!(map.get(&"care".to_string()), Some(3));
//! assert!(map.contains_key(&"careful".to_string()));
//! ```

mod bytes;
mod collections;
mod ebr;
mod nodes;
mod packed;

#[doc(hidden)]
pub mod tests_common;

pub use bytes::{KeyBuf, KeyBytes};
pub use collections::{RawTrieMap, SpecStats};

#[doc(hidden)]
pub use nodes::builder::live_node_count;

/// The concurrent map flavor: lock-free readers, mutex-serialized writers,
/// epoch-based reclamation.
pub type TrieMap<K, V> = RawTrieMap<K, V, true>;

/// The single-threaded map flavor: identical structure, no guards, no
/// retry sentinels, immediate frees. `Send` but not `Sync`.
pub type LocalTrieMap<K, V> = RawTrieMap<K, V, false>;

#[doc = include_str!("../README.md")]
#[cfg(doctest)]
pub struct ReadmeDoctests;
