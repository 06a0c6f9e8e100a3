//! Public map types built on the raw node operations.

mod map;

pub use map::{RawTrieMap, SpecStats};
