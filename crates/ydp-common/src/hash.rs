//! Canonical hashing for change detection
//!
//! Merge records and schemas are compared by SHA-256 over a length-prefixed
//! encoding, so `["ab", "c"]` and `["a", "bc"]` never collide.

use sha2::{Digest, Sha256};

/// Incremental hasher over a sequence of optional string parts
#[derive(Default)]
pub struct CanonicalHasher {
    inner: Sha256,
}

impl CanonicalHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one part; `None` encodes SQL NULL distinctly from the empty string
    pub fn part(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(v) => {
                self.inner.update([1u8]);
                self.inner.update((v.len() as u64).to_be_bytes());
                self.inner.update(v.as_bytes());
            },
            None => self.inner.update([0u8]),
        }
        self
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Hash a list of non-null parts
pub fn hash_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = CanonicalHasher::new();
    for part in parts {
        hasher.part(Some(part));
    }
    hasher.finish()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries_are_significant() {
        assert_ne!(hash_parts(["ab", "c"]), hash_parts(["a", "bc"]));
    }

    #[test]
    fn test_null_differs_from_empty() {
        let mut a = CanonicalHasher::new();
        a.part(None);
        let mut b = CanonicalHasher::new();
        b.part(Some(""));
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_stable_hex_length() {
        let h = hash_parts(["customers", "id"]);
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_parts(["customers", "id"]));
    }
}
