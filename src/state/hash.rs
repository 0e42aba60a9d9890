use sha2::{Digest, Sha256};

/// Computes the SHA-256 hash of compose file contents as lowercase hex.
///
/// No normalization is applied: the raw committed bytes are hashed, and the
/// same value is what ends up on container labels for drift comparison.
pub fn compose_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
