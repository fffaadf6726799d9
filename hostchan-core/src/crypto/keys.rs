//! Node key derivation.
//!
//! Core Lightning derives its node id key from the 32-byte `hsm_secret`
//! with HKDF-SHA256 (info `"nodeid"`, a little-endian u32 salt bumped
//! until the candidate is a valid secp256k1 secret). Deriving the same
//! key here lets hosted-channel state signatures verify under the node
//! id peers already know.

use hkdf::Hkdf;
use secp256k1::SecretKey;
use sha2::Sha256;

use crate::error::CryptoError;

/// Derive the node id secret key from an unencrypted `hsm_secret`.
pub fn node_key_from_hsm_secret(hsm_secret: &[u8; 32]) -> Result<SecretKey, CryptoError> {
    for salt_counter in 0u32..=255 {
        let salt = salt_counter.to_le_bytes();
        let hk = Hkdf::<Sha256>::new(Some(&salt), hsm_secret);
        let mut okm = [0u8; 32];
        hk.expand(b"nodeid", &mut okm)
            .expect("32 bytes is a valid hkdf-sha256 output length");
        if let Ok(key) = SecretKey::from_slice(&okm) {
            return Ok(key);
        }
    }
    // 256 consecutive invalid candidates cannot happen for honest input.
    Err(CryptoError::InvalidSecretKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{PublicKey, Secp256k1};

    #[test]
    fn test_derivation_is_deterministic() {
        let hsm = [0x42u8; 32];
        let a = node_key_from_hsm_secret(&hsm).unwrap();
        let b = node_key_from_hsm_secret(&hsm).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_secrets_different_keys() {
        let secp = Secp256k1::new();
        let a = node_key_from_hsm_secret(&[1u8; 32]).unwrap();
        let b = node_key_from_hsm_secret(&[2u8; 32]).unwrap();
        assert_ne!(
            PublicKey::from_secret_key(&secp, &a),
            PublicKey::from_secret_key(&secp, &b)
        );
    }
}
