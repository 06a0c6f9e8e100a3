//! Node-accounting checks.
//!
//! Lives in its own integration-test binary so the global allocation
//! counters are not disturbed by unrelated tests running in parallel.
//! Keep this file to a single `#[test]`.

use bramble::tests_common::generate_keys_fixed_length;
use bramble::{live_node_count, LocalTrieMap, TrieMap};

#[test]
fn every_node_is_returned_to_the_allocator() {
    let baseline = live_node_count();

    // Concurrent flavor: churn, clear, and drop.
    {
        let mut map: TrieMap<Vec<u8>, String> = TrieMap::new();
        let keys = generate_keys_fixed_length(3, b"abcdef");
        for (i, key) in keys.iter().enumerate() {
            assert!(map.insert(key, format!("value-{i}")));
        }
        // In-place label removal retires value tombstones; exercise it.
        for key in keys.iter().step_by(3) {
            assert!(map.remove(key));
        }
        // Structural churn: re-insert over the gaps.
        for key in keys.iter().step_by(3) {
            assert!(map.insert(key, "replacement".to_string()));
        }
        map.reclaim_retired();

        map.clear();
        assert_eq!(map.len(), 0);
        assert!(map.is_empty());

        // Populate again so that drop itself has something to free.
        for key in keys.iter().take(50) {
            map.insert(key, "tail".to_string());
        }
    }

    // Single-threaded flavor frees displaced nodes eagerly.
    {
        let map: LocalTrieMap<u32, u32> = LocalTrieMap::new();
        for k in 0..500u32 {
            assert!(map.insert(&k, k));
        }
        for k in 0..500u32 {
            assert!(map.remove(&k));
        }
        assert!(map.is_empty());
    }

    // Clones own their nodes outright.
    {
        let source: TrieMap<Vec<u8>, u32> = TrieMap::new();
        for (i, key) in generate_keys_fixed_length(2, b"xyz").iter().enumerate() {
            source.insert(key, i as u32);
        }
        let copy = source.clone();
        drop(source);
        assert_eq!(copy.len(), 9);
        drop(copy);
    }

    assert_eq!(
        live_node_count(),
        baseline,
        "some nodes were never freed (or freed twice)"
    );
}
