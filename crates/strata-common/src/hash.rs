//! Content hashing for derived identifiers
//!
//! IP set names and NFLOG prefixes must be short, stable across restarts and
//! identical on every node, so they are derived from a SHA-256 digest of
//! their canonical input.

use aws_lc_rs::digest;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Number of base64 characters kept from the digest
pub const SHORT_HASH_LEN: usize = 28;

/// SHA-256 digest of the given bytes
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

/// `prefix` followed by a truncated URL-safe base64 SHA-256 of `input`
pub fn short_hash(prefix: &str, input: &str) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(sha256(input.as_bytes()));
    let mut id = String::with_capacity(prefix.len() + SHORT_HASH_LEN);
    id.push_str(prefix);
    id.push_str(&encoded[..SHORT_HASH_LEN]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash_is_stable_and_prefixed() {
        let a = short_hash("s:", "role == 'db'");
        let b = short_hash("s:", "role == 'db'");
        assert_eq!(a, b);
        assert!(a.starts_with("s:"));
        assert_eq!(a.len(), 2 + SHORT_HASH_LEN);
    }

    #[test]
    fn test_short_hash_differs_by_input() {
        assert_ne!(short_hash("e:", "a"), short_hash("e:", "b"));
    }

    #[test]
    fn test_short_hash_is_url_safe() {
        let id = short_hash("", "some selector with / and + inside");
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_sha256_known_vector() {
        let d = sha256(b"abc");
        assert_eq!(d[0], 0xba);
        assert_eq!(d[31], 0xad);
    }
}
