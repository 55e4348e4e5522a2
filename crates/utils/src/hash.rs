//! Content hashing helpers.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `content`.
///
/// Used as the trace hash component of analysis cache keys, so a re-run job
/// with different output always lands on a new key.
pub fn content_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    format!("{:x}", digest)
}

/// First 12 characters of a content hash, for log lines.
pub fn short_hash(hash: &str) -> &str {
    &hash[..12.min(hash.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_known_value() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_content_hash_differs_per_content() {
        assert_ne!(content_hash(b"job output 1"), content_hash(b"job output 2"));
        assert_eq!(content_hash(b"same"), content_hash(b"same"));
    }

    #[test]
    fn test_short_hash() {
        let hash = content_hash(b"trace");
        assert_eq!(short_hash(&hash).len(), 12);
        assert_eq!(short_hash("abc"), "abc");
    }
}
