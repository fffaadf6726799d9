//! # Hostchan Core
//!
//! Core protocol machinery for hosted channels:
//! - Amount and identifier types shared across the daemon
//! - Cryptographic primitives (secp256k1 signatures, SHA-256, node key derivation)
//! - Bit-exact wire codecs for the hosted-channel message set
//! - Sphinx onion peeling and failure-onion construction
//! - The pure last-cross-signed-state transition function
//!
//! Everything in this crate is IO-free. The daemon crate drives these pieces
//! from its event loop; the store crate persists the values defined here.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod error;
pub mod onion;
pub mod state;
pub mod types;
pub mod wire;

pub use error::{CodecError, CoreError, CryptoError};
pub use types::{BlockHeight, HtlcIdentifier, MilliSatoshi, Satoshi, ShortChannelId};
pub use wire::{
    AskBrandingInfo, ErrorMessage, HostedChannelBranding, HostedMessage, InitHostedChannel,
    InvokeHostedChannel, LastCrossSignedState, Signature64, StateOverride, StateUpdate,
    UpdateAddHtlc, UpdateFailHtlc, UpdateFailMalformedHtlc, UpdateFulfillHtlc,
};
