//! Pairing token: SHA-256 of the pairing password, lowercase hex.

use sha2::{Digest, Sha256};

/// Hash a pairing password. Returns 64 lowercase hex characters.
pub fn hash_password(password: &str) -> String {
    hex::encode(sha256(password.as_bytes()))
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_vector() {
        assert_eq!(
            hash_password(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn abc_vector() {
        assert_eq!(
            hash_password("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn deterministic() {
        let a = hash_password("secret");
        let b = hash_password("secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_password("Secret"));
    }
}
