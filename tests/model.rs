//! Randomized single-threaded model check against `BTreeMap`.

use bramble::{LocalTrieMap, TrieMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

const WORDS: &[&str] = &[
    "the", "be", "to", "of", "and", "a", "in", "that", "have", "it", "for", "not", "on",
    "with", "he", "as", "you", "do", "at", "this", "but", "his", "by", "from", "they",
    "say", "her", "she", "or", "an", "will", "my", "one", "all", "would", "there",
    "their", "what", "so", "up", "out", "if", "about", "who", "get", "which", "go",
    "me", "when", "make", "can", "like", "time", "no", "just", "him", "know", "take",
    "people", "into", "year", "your", "good", "some", "could", "them", "see", "other",
    "than", "then", "now", "look", "only", "come", "its", "over", "think", "also",
    "back", "after", "use", "two", "how", "our", "work", "first", "well", "way",
    "even", "new", "want", "because", "any", "these", "give", "day", "most", "us",
    "car", "card", "care", "careful", "cars", "cat", "dog", "carpet", "cartel",
    "institution", "institutional", "institutionalization", "inst",
];

fn random_key(rng: &mut StdRng) -> Vec<u8> {
    // Mix dictionary words, compound words, and raw byte strings so the
    // trie sees prefixes, shared stems, and arbitrary fan-out.
    match rng.gen_range(0..4) {
        0 => WORDS[rng.gen_range(0..WORDS.len())].as_bytes().to_vec(),
        1 => {
            let mut key = WORDS[rng.gen_range(0..WORDS.len())].as_bytes().to_vec();
            key.extend_from_slice(WORDS[rng.gen_range(0..WORDS.len())].as_bytes());
            key
        }
        2 => {
            let len = rng.gen_range(0..6);
            (0..len).map(|_| rng.gen_range(b'a'..=b'e')).collect()
        }
        _ => {
            let len = rng.gen_range(1..10);
            (0..len).map(|_| rng.gen::<u8>()).collect()
        }
    }
}

fn run_model(seed: u64, ops: usize, concurrent: bool) {
    let concurrent_map: TrieMap<Vec<u8>, u64> = TrieMap::new();
    let local_map: LocalTrieMap<Vec<u8>, u64> = LocalTrieMap::new();
    let mut reference: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(seed);

    let map_insert = |key: &Vec<u8>, value: u64| {
        if concurrent {
            concurrent_map.insert(key, value)
        } else {
            local_map.insert(key, value)
        }
    };
    let map_remove = |key: &Vec<u8>| {
        if concurrent {
            concurrent_map.remove(key)
        } else {
            local_map.remove(key)
        }
    };
    let map_get = |key: &Vec<u8>| {
        if concurrent {
            concurrent_map.get(key)
        } else {
            local_map.get(key)
        }
    };

    for op in 0..ops {
        let key = random_key(&mut rng);
        match rng.gen_range(0..3) {
            0 | 1 => {
                let value = op as u64;
                let expected = !reference.contains_key(&key);
                assert_eq!(map_insert(&key, value), expected, "insert {key:?}");
                reference.entry(key).or_insert(value);
            }
            _ => {
                let expected = reference.remove(&key).is_some();
                assert_eq!(map_remove(&key), expected, "remove {key:?}");
            }
        }

        if op % 97 == 0 {
            let probe = random_key(&mut rng);
            assert_eq!(map_get(&probe), reference.get(&probe).copied(), "get {probe:?}");
        }
    }

    let len = if concurrent {
        concurrent_map.len()
    } else {
        local_map.len()
    };
    assert_eq!(len, reference.len());

    for (key, value) in &reference {
        assert_eq!(map_get(key), Some(*value), "final get {key:?}");
    }

    // The ordered walk must match the reference exactly, keys and values.
    let mut walked = Vec::new();
    if concurrent {
        concurrent_map.for_each(|key, value| walked.push((key, value)));
    } else {
        local_map.for_each(|key, value| walked.push((key, value)));
    }
    let expected: Vec<(Vec<u8>, u64)> =
        reference.iter().map(|(k, v)| (k.clone(), *v)).collect();
    assert_eq!(walked, expected);
}

#[test]
fn concurrent_flavor_matches_reference_model() {
    for seed in 0..4 {
        run_model(seed, 4_000, true);
    }
}

#[test]
fn local_flavor_matches_reference_model() {
    for seed in 10..14 {
        run_model(seed, 4_000, false);
    }
}
