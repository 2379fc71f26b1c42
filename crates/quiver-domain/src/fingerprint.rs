use sha2::{Digest, Sha256};

/// SHA-256 over the raw archive bytes, hex-encoded.
///
/// Descriptors carry this so that a replaced archive is always observable:
/// metadata is recomputed whenever the fingerprint changes, and provisioning
/// records it to detect staleness later.
pub fn archive_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
