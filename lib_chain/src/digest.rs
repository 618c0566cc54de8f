// Hashing and clock helpers used throughout the simulation.

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Compute the SHA-256 digest of `data` and return it as 64 lowercase hex
/// characters. This is the only cryptographic hash in the system; every
/// block binding (`previous_hash`, Merkle root, nonce) goes through it.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Current wall-clock time in milliseconds since the Unix epoch. All
/// timestamps in the simulation (transactions, blocks, view starts) use
/// this scale. The clock may jump; nothing here assumes monotonicity.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Standard FIPS-180-4 test vectors.
    #[test]
    fn sha256_matches_standard_vectors() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn digest_is_lowercase_hex() {
        let digest = sha256_hex(b"hello world");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
