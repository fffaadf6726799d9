//! ECDSA signature creation and verification over 32-byte digests.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CryptoError;

/// Compact 64-byte ECDSA signature with hex serialization.
///
/// The all-zero value stands in for "not yet signed" slots in a
/// last-cross-signed state under construction.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Signature64(pub [u8; 64]);

impl Signature64 {
    /// Placeholder for an unsigned slot.
    pub const ZERO: Signature64 = Signature64([0u8; 64]);

    /// Whether this is the unsigned placeholder.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 64]
    }
}

impl std::fmt::Debug for Signature64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature64({})", hex::encode(self.0))
    }
}

impl Serialize for Signature64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Signature64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 64] = raw
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))?;
        Ok(Signature64(bytes))
    }
}

/// Sign a 32-byte digest, returning the compact signature form.
pub fn sign_digest(digest: &[u8; 32], secret_key: &SecretKey) -> Signature64 {
    let secp = Secp256k1::signing_only();
    let msg = Message::from_digest(*digest);
    Signature64(secp.sign_ecdsa(&msg, secret_key).serialize_compact())
}

/// Verify a compact signature over a 32-byte digest.
///
/// Returns `Ok(())` when the signature is well formed and valid for
/// `public_key`, or the reason it is not.
pub fn verify_digest(
    digest: &[u8; 32],
    signature: &Signature64,
    public_key: &PublicKey,
) -> Result<(), CryptoError> {
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest(*digest);
    let sig = Signature::from_compact(&signature.0).map_err(|_| CryptoError::InvalidSignature)?;
    secp.verify_ecdsa(&msg, &sig, public_key)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn keypair(seed: u64) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let mut rng = StdRng::seed_from_u64(seed);
        let sk = SecretKey::new(&mut rng);
        (sk, PublicKey::from_secret_key(&secp, &sk))
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let (sk, pk) = keypair(7);
        let digest = sha256(b"state snapshot");

        let sig = sign_digest(&digest, &sk);
        assert!(verify_digest(&digest, &sig, &pk).is_ok());
    }

    #[test]
    fn test_verify_wrong_digest_fails() {
        let (sk, pk) = keypair(7);
        let sig = sign_digest(&sha256(b"one"), &sk);

        let result = verify_digest(&sha256(b"other"), &sig, &pk);
        assert_eq!(result, Err(CryptoError::SignatureVerificationFailed));
    }

    #[test]
    fn test_verify_wrong_key_fails() {
        let (sk, _) = keypair(7);
        let (_, other_pk) = keypair(8);
        let digest = sha256(b"state snapshot");

        let sig = sign_digest(&digest, &sk);
        assert!(verify_digest(&digest, &sig, &other_pk).is_err());
    }

    #[test]
    fn test_zero_signature_is_invalid() {
        let (_, pk) = keypair(7);
        let digest = sha256(b"anything");
        assert!(verify_digest(&digest, &Signature64::ZERO, &pk).is_err());
    }
}
