//! Helper functions for writing tests.

use std::iter;

/// Generate an iterator of bytestring keys with increasing length up to a
/// maximum value.
///
/// This iterator produces `max_len` keys. Each key has the form
/// `[0*, u8::MAX]`: zero or more zero bytes followed by a single
/// `u8::MAX`, so that no generated key is a prefix of another.
///
/// # Examples
///
/// ```
/// # use bramble::tests_common::generate_keys_skewed;
/// let keys = generate_keys_skewed(3).collect::<Vec<_>>();
/// assert_eq!(keys.len(), 3);
/// assert_eq!(keys[0].as_slice(), &[255]);
/// assert_eq!(keys[2].as_slice(), &[0, 0, 255]);
/// ```
///
/// # Panics
///
///  - Panics if `max_len` is 0.
pub fn generate_keys_skewed(max_len: usize) -> impl Iterator<Item = Vec<u8>> {
    assert!(max_len > 0, "the maximum key length must be greater than 0");

    iter::successors(Some(vec![u8::MAX]), move |prev| {
        if prev.len() < max_len {
            let mut key = vec![u8::MIN; prev.len()];
            key.push(u8::MAX);
            Some(key)
        } else {
            None
        }
    })
}

/// Generate every key of length `len` over the given alphabet, in
/// lexicographic order.
///
/// Produces `alphabet.len().pow(len)` keys, so keep both small.
///
/// # Examples
///
/// ```
/// # use bramble::tests_common::generate_keys_fixed_length;
/// let keys = generate_keys_fixed_length(2, &[b'a', b'b']);
/// assert_eq!(keys.len(), 4);
/// assert_eq!(keys[0].as_slice(), b"aa");
/// assert_eq!(keys[3].as_slice(), b"bb");
/// ```
///
/// # Panics
///
///  - Panics if `alphabet` is empty.
pub fn generate_keys_fixed_length(len: usize, alphabet: &[u8]) -> Vec<Vec<u8>> {
    assert!(!alphabet.is_empty(), "the alphabet must not be empty");

    let mut keys = vec![Vec::new()];
    for _ in 0..len {
        let mut next = Vec::with_capacity(keys.len() * alphabet.len());
        for key in &keys {
            for byte in alphabet {
                let mut extended = key.clone();
                extended.push(*byte);
                next.push(extended);
            }
        }
        keys = next;
    }
    keys
}

/// Generate keys sharing a long common prefix, differing only in their
/// final bytes. Useful for forcing deep skip strings and splits close to
/// the leaves.
///
/// # Examples
///
/// ```
/// # use bramble::tests_common::generate_keys_with_prefix;
/// let keys = generate_keys_with_prefix(b"shared/", 3);
/// assert_eq!(keys.len(), 3);
/// assert!(keys.iter().all(|key| key.starts_with(b"shared/")));
/// ```
pub fn generate_keys_with_prefix(prefix: &[u8], count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|index| {
            let mut key = prefix.to_vec();
            key.extend_from_slice(format!("{index:04}").as_bytes());
            key
        })
        .collect()
}
