//! Pluggable key comparators for [`crate::bxtree`] indices.
//!
//! Each comparator supplies a stable type name, human-readable
//! documentation, string conversion in both directions, and a total
//! order over raw key bytes. New comparators register themselves in
//! [`REGISTRY`] by name so that `index_open`/`index_new` can resolve
//! the `key_type` string stored on disk back to an implementation.

use std::{cmp::Ordering, collections::HashMap};

use lazy_static::lazy_static;

use crate::error::{Error, Result};

/// A named, total-order key comparator.
///
/// `to_str`/`from_str` round-trip a key through its human-readable
/// form (used by the CLI and by diagnostic tooling); `compare` is the
/// only function consulted by [`crate::bxtree::Tree`] itself.
pub trait Comparator: Send + Sync {
    /// Stable identifier matching the `key_type` passed to
    /// `index_new`/`index_open` and stored in the index's on-disk
    /// header.
    fn type_name(&self) -> &'static str;

    /// Human-readable description of the ordering this comparator
    /// implements.
    fn doc(&self) -> &'static str;

    /// Render `key` as a string, following whatever convention this
    /// comparator's `from_str` expects to be able to reverse.
    fn to_str(&self, key: &[u8]) -> String;

    /// Parse `s` into the on-disk key encoding for this comparator.
    fn from_str(&self, s: &str) -> Result<Vec<u8>>;

    /// Total order over two encoded keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// `STRING`: byte-wise comparison over the common prefix, falling back
/// to length difference when that prefix matches. This is a wire-format
/// contract, not merely convention:
///
/// * `"abc" < "abcd"` (longer wins once the shared prefix is equal),
/// * `"ab\0" < "abc"` (keys are not null-terminated for comparison),
/// * [`from_str`][Comparator::from_str] stores `strlen(str)+1` bytes
///   (it includes the terminator so `to_str` can hand back a
///   C-style view), and [`to_str`][Comparator::to_str] returns the raw
///   buffer, terminator included.
///
/// Do not "fix" any of the above; on-disk indices depend on it.
pub struct StringComparator;

impl Comparator for StringComparator {
    fn type_name(&self) -> &'static str {
        "STRING"
    }

    fn doc(&self) -> &'static str {
        "The key is a string. Bytes are compared over the common prefix; \
         if that prefix is equal, the shorter key sorts first."
    }

    fn to_str(&self, key: &[u8]) -> String {
        let end = key.iter().position(|&b| b == 0).unwrap_or(key.len());
        String::from_utf8_lossy(&key[..end]).into_owned()
    }

    fn from_str(&self, s: &str) -> Result<Vec<u8>> {
        let mut buf = s.as_bytes().to_vec();
        buf.push(0);
        Ok(buf)
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let cmp_len = a.len().min(b.len());
        match a[..cmp_len].cmp(&b[..cmp_len]) {
            Ordering::Equal => a.len().cmp(&b.len()),
            other => other,
        }
    }
}

/// `UINT64`: fixed 8-byte little-endian unsigned integer keys, the
/// comparator used by the reference `CompTime`/`JobComp` compound
/// indices (see [`crate::cli`]).
pub struct Uint64Comparator;

impl Comparator for Uint64Comparator {
    fn type_name(&self) -> &'static str {
        "UINT64"
    }

    fn doc(&self) -> &'static str {
        "The key is an 8-byte little-endian unsigned integer, compared numerically."
    }

    fn to_str(&self, key: &[u8]) -> String {
        let mut buf = [0u8; 8];
        buf[..key.len().min(8)].copy_from_slice(&key[..key.len().min(8)]);
        u64::from_le_bytes(buf).to_string()
    }

    fn from_str(&self, s: &str) -> Result<Vec<u8>> {
        let v: u64 = s
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("not a u64: {}", s)))?;
        Ok(v.to_le_bytes().to_vec())
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let to_u64 = |k: &[u8]| {
            let mut buf = [0u8; 8];
            buf[..k.len().min(8)].copy_from_slice(&k[..k.len().min(8)]);
            u64::from_le_bytes(buf)
        };
        to_u64(a).cmp(&to_u64(b))
    }
}

lazy_static! {
    static ref REGISTRY: HashMap<&'static str, &'static (dyn Comparator + 'static)> = {
        let mut m: HashMap<&'static str, &'static (dyn Comparator + 'static)> = HashMap::new();
        m.insert("STRING", &StringComparator);
        m.insert("UINT64", &Uint64Comparator);
        m
    };
}

/// Resolve a comparator by its `key_type` name.
pub fn lookup(key_type: &str) -> Result<&'static dyn Comparator> {
    REGISTRY
        .get(key_type)
        .copied()
        .ok_or_else(|| Error::InvalidArgument(format!("unknown key_type: {}", key_type)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ordering_matches_contract() {
        let c = StringComparator;
        let a = c.from_str("abc").unwrap();
        let ad = c.from_str("abcd").unwrap();
        assert_eq!(c.compare(&a, &ad), Ordering::Less);

        let ab0 = c.from_str("ab").unwrap(); // encodes "ab\0"
        let abc = c.from_str("abc").unwrap();
        assert_eq!(c.compare(&ab0, &abc), Ordering::Less);

        assert_eq!(c.compare(&a, &a), Ordering::Equal);
        assert_eq!(
            c.compare(&c.from_str("ab").unwrap(), &c.from_str("aa").unwrap()),
            Ordering::Greater
        );
    }

    #[test]
    fn string_antisymmetry() {
        let c = StringComparator;
        let a = c.from_str("a").unwrap();
        let b = c.from_str("ab").unwrap();
        assert_eq!(c.compare(&a, &b), c.compare(&b, &a).reverse());
    }

    #[test]
    fn string_ordered_traversal() {
        let c = StringComparator;
        let mut keys: Vec<Vec<u8>> = vec!["abc", "a", "b", "ab"]
            .into_iter()
            .map(|s| c.from_str(s).unwrap())
            .collect();
        keys.sort_by(|x, y| c.compare(x, y));
        let rendered: Vec<String> = keys.iter().map(|k| c.to_str(k)).collect();
        assert_eq!(rendered, vec!["a", "ab", "abc", "b"]);
    }

    #[test]
    fn uint64_roundtrip() {
        let c = Uint64Comparator;
        let k = c.from_str("42").unwrap();
        assert_eq!(c.to_str(&k), "42");
    }

    #[test]
    fn lookup_unknown_is_invalid_argument() {
        assert!(lookup("NOPE").is_err());
    }
}
