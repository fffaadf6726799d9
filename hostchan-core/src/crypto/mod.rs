//! Cryptographic primitives: SHA-256 hashing, secp256k1 ECDSA signatures
//! and node key derivation.

mod hashing;
mod keys;
mod signing;

pub use hashing::{hmac_sha256, sha256, sha256d};
pub use keys::node_key_from_hsm_secret;
pub use signing::{sign_digest, verify_digest, Signature64};
