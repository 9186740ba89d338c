//! Content-addressing primitive.

use serde::Serialize;
use sha2::{Digest as _, Sha256};

use crate::ids::Digest;

/// SHA-256 of `bytes`, hex encoded.
pub fn hash(bytes: &[u8]) -> Digest {
    Digest::from_hex(hex::encode(Sha256::digest(bytes)))
}

/// Digest of the canonical JSON encoding of `value`.
pub fn hash_json<T: Serialize + ?Sized>(value: &T) -> Result<Digest, serde_json::Error> {
    let payload = serde_json::to_vec(value)?;
    Ok(hash(&payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_known_sha256_vector() {
        assert_eq!(
            hash(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hash_json_is_stable_for_equal_values() {
        let a = hash_json(&serde_json::json!({"x": 1, "y": [1, 2]})).unwrap();
        let b = hash_json(&serde_json::json!({"x": 1, "y": [1, 2]})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }
}
