//! The scoped "stack key": a fixed-capacity byte buffer usable wherever
//! a key is expected, without heap allocation in the common case.
//!
//! Its existence is purely an optimization. Any allocator works as
//! long as the key's lifetime is clearly scoped to the call that
//! produced it; callers needing a longer-lived key should copy out of
//! [`StackKey::as_bytes`] instead of holding onto the `StackKey`.

use crate::error::{Error, Result};

/// Default capacity matching the reference tool's stack-allocated key
/// buffer.
pub const STACK_KEY_CAPACITY: usize = 256;

/// A fixed-capacity key buffer, created in the caller's frame.
#[derive(Clone)]
pub struct StackKey {
    len: usize,
    bytes: [u8; STACK_KEY_CAPACITY],
}

impl StackKey {
    pub fn new() -> StackKey {
        StackKey {
            len: 0,
            bytes: [0u8; STACK_KEY_CAPACITY],
        }
    }

    /// Build a stack key from `src`, failing if it does not fit.
    pub fn from_slice(src: &[u8]) -> Result<StackKey> {
        if src.len() > STACK_KEY_CAPACITY {
            return Err(Error::InvalidArgument(format!(
                "key length {} exceeds stack key capacity {}",
                src.len(),
                STACK_KEY_CAPACITY
            )));
        }
        let mut key = StackKey::new();
        key.bytes[..src.len()].copy_from_slice(src);
        key.len = src.len();
        Ok(key)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for StackKey {
    fn default() -> StackKey {
        StackKey::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_within_capacity() {
        let k = StackKey::from_slice(b"hello").unwrap();
        assert_eq!(k.as_bytes(), b"hello");
    }

    #[test]
    fn rejects_oversized_key() {
        let big = vec![0u8; STACK_KEY_CAPACITY + 1];
        assert!(StackKey::from_slice(&big).is_err());
    }
}
