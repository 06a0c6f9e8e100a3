//! Key byte-encoding traits.
//!
//! The trie is byte-exact: it stores whatever [`KeyBytes::to_bytes`]
//! produces and orders keys by the lexicographic order of those bytes. An
//! encoding must therefore be order-preserving if callers care about
//! ordered walks, and it must round-trip exactly:
//! `K::from_bytes(&k.to_bytes()) == k` for every supported key.
//!
//! Byte-string keys use the identity mapping and are variable length
//! (`FIXED_LEN == 0`). Unsigned integers encode big-endian; signed
//! integers flip the sign bit first so that two's-complement values sort
//! in numeric order. Integer encodings are fixed length, which lets the
//! trie skip the end-of-string machinery entirely for those key types.

use tinyvec::TinyVec;

/// Inline-capacity byte buffer used for encoded keys and skip strings.
///
/// Sixteen inline bytes cover every integer encoding and most short string
/// keys without touching the heap.
pub type KeyBuf = TinyVec<[u8; 16]>;

/// Conversion between a key type and its lexicographically ordered byte
/// encoding.
pub trait KeyBytes: Sized {
    /// Encoded length in bytes for fixed-length key types, or `0` when the
    /// encoding is variable length. Variable-length keys enable the
    /// end-of-string value slot on interior nodes; fixed-length keys never
    /// need it because no encoding is a strict prefix of another.
    const FIXED_LEN: usize;

    /// Encode the key.
    fn to_bytes(&self) -> KeyBuf;

    /// Decode a key from bytes previously produced by [`Self::to_bytes`].
    ///
    /// Only encodings produced by `to_bytes` are valid input; handing this
    /// function arbitrary bytes may produce an arbitrary (but memory-safe)
    /// key value.
    fn from_bytes(bytes: &[u8]) -> Self;
}

fn buf_from(bytes: &[u8]) -> KeyBuf {
    let mut buf = KeyBuf::new();
    buf.extend_from_slice(bytes);
    buf
}

impl KeyBytes for Vec<u8> {
    const FIXED_LEN: usize = 0;

    fn to_bytes(&self) -> KeyBuf {
        buf_from(self)
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        bytes.to_vec()
    }
}

impl KeyBytes for Box<[u8]> {
    const FIXED_LEN: usize = 0;

    fn to_bytes(&self) -> KeyBuf {
        buf_from(self)
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        bytes.to_vec().into_boxed_slice()
    }
}

impl KeyBytes for String {
    const FIXED_LEN: usize = 0;

    fn to_bytes(&self) -> KeyBuf {
        buf_from(self.as_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

macro_rules! unsigned_key_bytes {
    ($($ty:ty),*) => {
        $(
            impl KeyBytes for $ty {
                const FIXED_LEN: usize = std::mem::size_of::<$ty>();

                fn to_bytes(&self) -> KeyBuf {
                    buf_from(&self.to_be_bytes())
                }

                fn from_bytes(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_be_bytes(raw)
                }
            }
        )*
    };
}

unsigned_key_bytes!(u8, u16, u32, u64, u128, usize);

macro_rules! signed_key_bytes {
    ($($ty:ty => $uty:ty),*) => {
        $(
            impl KeyBytes for $ty {
                const FIXED_LEN: usize = std::mem::size_of::<$ty>();

                fn to_bytes(&self) -> KeyBuf {
                    // Flipping the sign bit biases the value so that
                    // negative keys sort below non-negative ones in plain
                    // byte order.
                    const BIAS: $uty = 1 << (<$ty>::BITS - 1);
                    buf_from(&((*self as $uty) ^ BIAS).to_be_bytes())
                }

                fn from_bytes(bytes: &[u8]) -> Self {
                    const BIAS: $uty = 1 << (<$ty>::BITS - 1);
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    (<$uty>::from_be_bytes(raw) ^ BIAS) as $ty
                }
            }
        )*
    };
}

signed_key_bytes!(i8 => u8, i16 => u16, i32 => u32, i64 => u64, i128 => u128, isize => usize);

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<K: KeyBytes + PartialEq + std::fmt::Debug>(key: K) {
        let bytes = key.to_bytes();
        if K::FIXED_LEN != 0 {
            assert_eq!(bytes.len(), K::FIXED_LEN);
        }
        assert_eq!(K::from_bytes(&bytes), key);
    }

    #[test]
    fn byte_string_round_trips() {
        round_trip(Vec::<u8>::new());
        round_trip(vec![0u8, 1, 2, 255]);
        round_trip(vec![0u8; 40]);
        round_trip(String::from(""));
        round_trip(String::from("hello"));
        round_trip(String::from("日本語のキー"));
        round_trip(vec![7u8; 3].into_boxed_slice());
    }

    #[test]
    fn unsigned_round_trips() {
        for v in [0u64, 1, 255, 256, u64::MAX / 2, u64::MAX] {
            round_trip(v);
        }
        for v in [0u32, 1, u32::MAX] {
            round_trip(v);
        }
        round_trip(0u128);
        round_trip(u128::MAX);
        round_trip(usize::MAX);
    }

    #[test]
    fn signed_round_trips() {
        for v in [i64::MIN, -1_000_000, -100, -1, 0, 1, 100, 1_000_000, i64::MAX] {
            round_trip(v);
        }
        for v in [i32::MIN, -1, 0, i32::MAX] {
            round_trip(v);
        }
        round_trip(i8::MIN);
        round_trip(i8::MAX);
    }

    #[test]
    fn unsigned_encoding_is_order_preserving() {
        let values = [0u64, 1, 2, 255, 256, 65_535, 65_536, u64::MAX - 1, u64::MAX];
        for pair in values.windows(2) {
            assert!(pair[0].to_bytes().as_slice() < pair[1].to_bytes().as_slice());
        }
    }

    #[test]
    fn signed_encoding_is_order_preserving() {
        let values = [
            i64::MIN,
            -1_000_000,
            -100,
            -1,
            0,
            1,
            100,
            1_000_000,
            i64::MAX,
        ];
        for pair in values.windows(2) {
            assert!(
                pair[0].to_bytes().as_slice() < pair[1].to_bytes().as_slice(),
                "{} should encode below {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn fixed_len_matches_width() {
        assert_eq!(<u8 as KeyBytes>::FIXED_LEN, 1);
        assert_eq!(<u64 as KeyBytes>::FIXED_LEN, 8);
        assert_eq!(<i64 as KeyBytes>::FIXED_LEN, 8);
        assert_eq!(<u128 as KeyBytes>::FIXED_LEN, 16);
        assert_eq!(<Vec<u8> as KeyBytes>::FIXED_LEN, 0);
        assert_eq!(<String as KeyBytes>::FIXED_LEN, 0);
    }
}
