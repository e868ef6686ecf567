//! Content hashing for the revision audit trail.

use sha2::{Digest, Sha256};

/// SHA-256 hex over a UTF-8 text.
///
/// Transcript hashes cover the joined recognized text; summary hashes cover
/// the summary sentence. Action items are deliberately excluded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // sha256("hello")
        assert_eq!(
            content_hash("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn deterministic() {
        assert_eq!(content_hash("greffe"), content_hash("greffe"));
        assert_ne!(content_hash("greffe"), content_hash("greffe "));
    }
}
