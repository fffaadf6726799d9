//! BOLT-4 failure messages and failure-onion packets.
//!
//! A failing hop builds a fixed-size failure packet keyed to its shared
//! secret; every hop on the way back wraps the blob once more with its
//! own `ammag` stream. When forwarding a failure received from
//! downstream, only the wrap step applies.

use byteorder::{BigEndian, WriteBytesExt};

use crate::crypto::hmac_sha256;
use crate::types::MilliSatoshi;

use super::{generate_key, generate_stream};

/// BADONION failure flag.
pub const BADONION: u16 = 0x8000;
/// PERM failure flag.
pub const PERM: u16 = 0x4000;
/// NODE failure flag.
pub const NODE: u16 = 0x2000;
/// UPDATE failure flag.
pub const UPDATE: u16 = 0x1000;

/// Combined length of message and pad inside a failure packet.
const FAILURE_SPACE: usize = 256;

/// Failure messages this hop can originate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureMessage {
    /// Transient problem with the outgoing channel; carries our encoded
    /// `channel_update` when available.
    TemporaryChannelFailure {
        /// Encoded `channel_update` for the failing channel, may be empty.
        channel_update: Vec<u8>,
    },
    /// The outgoing channel is gone for good.
    PermanentChannelFailure,
    /// Transient node-level failure.
    TemporaryNodeFailure,
    /// Payment details rejected at or near the destination.
    IncorrectOrUnknownPaymentDetails {
        /// Amount the failing HTLC carried.
        htlc_msat: MilliSatoshi,
        /// Block height at the failing hop.
        height: u32,
    },
    /// The hop payload was syntactically valid but unusable.
    InvalidOnionPayload {
        /// Offending TLV type.
        tlv_type: u64,
        /// Byte offset of the offending record.
        offset: u16,
    },
}

impl FailureMessage {
    /// The BOLT-4 failure code.
    pub fn code(&self) -> u16 {
        match self {
            FailureMessage::TemporaryChannelFailure { .. } => UPDATE | 7,
            FailureMessage::PermanentChannelFailure => PERM | 8,
            FailureMessage::TemporaryNodeFailure => NODE | 2,
            FailureMessage::IncorrectOrUnknownPaymentDetails { .. } => PERM | 15,
            FailureMessage::InvalidOnionPayload { .. } => PERM | 22,
        }
    }

    /// Encode as `code || data`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u16::<BigEndian>(self.code()).expect("vec write");
        match self {
            FailureMessage::TemporaryChannelFailure { channel_update } => {
                buf.write_u16::<BigEndian>(channel_update.len() as u16).expect("vec write");
                buf.extend_from_slice(channel_update);
            }
            FailureMessage::PermanentChannelFailure | FailureMessage::TemporaryNodeFailure => {}
            FailureMessage::IncorrectOrUnknownPaymentDetails { htlc_msat, height } => {
                buf.write_u64::<BigEndian>(htlc_msat.0).expect("vec write");
                buf.write_u32::<BigEndian>(*height).expect("vec write");
            }
            FailureMessage::InvalidOnionPayload { tlv_type, offset } => {
                super::write_bigsize(&mut buf, *tlv_type);
                buf.write_u16::<BigEndian>(*offset).expect("vec write");
            }
        }
        buf
    }
}

/// Build the failure packet for a failure originating at this hop and
/// apply the first `ammag` wrap.
pub fn create_failure_packet(shared_secret: &[u8; 32], failure: &FailureMessage) -> Vec<u8> {
    let message = failure.encode();
    assert!(message.len() <= FAILURE_SPACE, "failure message too large");
    let pad_len = FAILURE_SPACE - message.len();

    let um = generate_key(b"um", shared_secret);
    let mut payload = Vec::with_capacity(4 + FAILURE_SPACE);
    payload.write_u16::<BigEndian>(message.len() as u16).expect("vec write");
    payload.extend_from_slice(&message);
    payload.write_u16::<BigEndian>(pad_len as u16).expect("vec write");
    payload.extend(std::iter::repeat(0u8).take(pad_len));

    let mut packet = Vec::with_capacity(32 + payload.len());
    packet.extend_from_slice(&hmac_sha256(&um, &payload));
    packet.extend_from_slice(&payload);

    wrap_failure_packet(shared_secret, &packet)
}

/// Apply one `ammag` obfuscation layer to a failure packet travelling
/// back towards the payer.
pub fn wrap_failure_packet(shared_secret: &[u8; 32], packet: &[u8]) -> Vec<u8> {
    let ammag = generate_key(b"ammag", shared_secret);
    let stream = generate_stream(&ammag, packet.len());
    packet.iter().zip(&stream).map(|(b, s)| b ^ s).collect()
}
