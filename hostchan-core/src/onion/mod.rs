//! BOLT-4 sphinx onion handling.
//!
//! The channel peels one layer off each incoming HTLC's onion to learn
//! where to forward it; the failure submodule builds and re-wraps the
//! encrypted failure blobs travelling the other way. Construction of
//! full payment onions is also implemented so the codec can be exercised
//! end-to-end.

mod failure;

pub use failure::{
    create_failure_packet, wrap_failure_packet, FailureMessage, BADONION, NODE, PERM, UPDATE,
};

use std::fmt;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20Legacy;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};

use crate::crypto::{hmac_sha256, sha256};
use crate::types::{MilliSatoshi, ShortChannelId};
use crate::wire::ONION_PACKET_LEN;

/// Byte length of the routing info block inside the packet.
pub const HOP_DATA_LEN: usize = 1300;

/// Errors from onion processing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OnionError {
    /// Packet length or version byte is wrong.
    BadVersion,
    /// The ephemeral public key is not a valid curve point.
    BadPublicKey,
    /// The packet HMAC does not verify.
    BadHmac,
    /// The hop payload cannot be parsed.
    BadPayload,
}

impl OnionError {
    /// The BOLT-4 BADONION failure code to report in
    /// `update_fail_malformed_htlc`, where applicable.
    pub fn badonion_code(&self) -> u16 {
        match self {
            OnionError::BadVersion => PERM | BADONION | 4,
            OnionError::BadHmac => PERM | BADONION | 5,
            OnionError::BadPublicKey => PERM | BADONION | 6,
            OnionError::BadPayload => PERM | 22,
        }
    }
}

impl fmt::Display for OnionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnionError::BadVersion => write!(f, "unsupported onion version"),
            OnionError::BadPublicKey => write!(f, "invalid onion ephemeral key"),
            OnionError::BadHmac => write!(f, "onion hmac mismatch"),
            OnionError::BadPayload => write!(f, "unparseable hop payload"),
        }
    }
}

impl std::error::Error for OnionError {}

/// Payload addressed to a forwarding hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayPayload {
    /// Amount to forward to the next hop.
    pub amt_to_forward: MilliSatoshi,
    /// Absolute CLTV the next hop must see.
    pub outgoing_cltv: u32,
    /// Channel to forward over.
    pub short_channel_id: ShortChannelId,
}

/// Payload addressed to the final recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalPayload {
    /// Amount due at the recipient.
    pub amt_to_forward: MilliSatoshi,
    /// Absolute CLTV the recipient must see.
    pub outgoing_cltv: u32,
}

/// This hop's decrypted payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HopPayload {
    /// We are asked to forward.
    Relay(RelayPayload),
    /// We are the recipient.
    Final(FinalPayload),
}

/// Result of peeling one onion layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeeledOnion {
    /// The payload addressed to this hop.
    pub payload: HopPayload,
    /// The packet for the next hop, absent when we are final.
    pub next_packet: Option<Vec<u8>>,
    /// ECDH shared secret, kept for wrapping failures travelling back.
    pub shared_secret: [u8; 32],
}

/// HMAC-derived key in the BOLT-4 key family (`rho`, `mu`, `um`, `ammag`, `pad`).
pub(crate) fn generate_key(key_type: &[u8], secret: &[u8]) -> [u8; 32] {
    hmac_sha256(key_type, secret)
}

/// ChaCha20 keystream of `len` zero bytes under `key` (zero nonce).
pub(crate) fn generate_stream(key: &[u8; 32], len: usize) -> Vec<u8> {
    let nonce = [0u8; 8];
    let mut cipher = ChaCha20Legacy::new(key.into(), (&nonce).into());
    let mut buf = vec![0u8; len];
    cipher.apply_keystream(&mut buf);
    buf
}

fn xor_in_place(buf: &mut [u8], stream: &[u8]) {
    for (b, s) in buf.iter_mut().zip(stream) {
        *b ^= s;
    }
}

fn read_bigsize(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    match first {
        0..=0xfc => Some((first as u64, 1)),
        0xfd => {
            let v = u16::from_be_bytes(data.get(1..3)?.try_into().ok()?);
            Some((v as u64, 3))
        }
        0xfe => {
            let v = u32::from_be_bytes(data.get(1..5)?.try_into().ok()?);
            Some((v as u64, 5))
        }
        0xff => {
            let v = u64::from_be_bytes(data.get(1..9)?.try_into().ok()?);
            Some((v, 9))
        }
    }
}

fn read_truncated_u64(data: &[u8]) -> Option<u64> {
    if data.len() > 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[8 - data.len()..].copy_from_slice(data);
    Some(u64::from_be_bytes(buf))
}

/// Parse a TLV hop payload into a relay or final payload.
fn parse_tlv_payload(data: &[u8]) -> Result<HopPayload, OnionError> {
    let mut amt: Option<u64> = None;
    let mut cltv: Option<u32> = None;
    let mut scid: Option<u64> = None;

    let mut cursor = data;
    let mut last_type: Option<u64> = None;
    while !cursor.is_empty() {
        let (tlv_type, adv) = read_bigsize(cursor).ok_or(OnionError::BadPayload)?;
        cursor = &cursor[adv..];
        let (length, adv) = read_bigsize(cursor).ok_or(OnionError::BadPayload)?;
        cursor = &cursor[adv..];
        let length = length as usize;
        if length > cursor.len() {
            return Err(OnionError::BadPayload);
        }
        if last_type.is_some_and(|prev| prev >= tlv_type) {
            return Err(OnionError::BadPayload);
        }
        last_type = Some(tlv_type);
        let value = &cursor[..length];
        cursor = &cursor[length..];

        match tlv_type {
            2 => amt = Some(read_truncated_u64(value).ok_or(OnionError::BadPayload)?),
            4 => {
                let v = read_truncated_u64(value).ok_or(OnionError::BadPayload)?;
                cltv = Some(u32::try_from(v).map_err(|_| OnionError::BadPayload)?);
            }
            6 => {
                let bytes: [u8; 8] =
                    value.try_into().map_err(|_| OnionError::BadPayload)?;
                scid = Some(u64::from_be_bytes(bytes));
            }
            // payment_data, payment_metadata and any odd record are
            // tolerated and skipped
            8 | 16 => {}
            t if t % 2 == 1 => {}
            _ => return Err(OnionError::BadPayload),
        }
    }

    let amt = MilliSatoshi(amt.ok_or(OnionError::BadPayload)?);
    let cltv = cltv.ok_or(OnionError::BadPayload)?;
    match scid {
        Some(raw) => Ok(HopPayload::Relay(RelayPayload {
            amt_to_forward: amt,
            outgoing_cltv: cltv,
            short_channel_id: ShortChannelId(raw),
        })),
        None => Ok(HopPayload::Final(FinalPayload { amt_to_forward: amt, outgoing_cltv: cltv })),
    }
}

/// Parse a legacy (realm 0) hop payload.
fn parse_legacy_payload(per_hop: &[u8]) -> Result<HopPayload, OnionError> {
    let scid = u64::from_be_bytes(per_hop[0..8].try_into().expect("8 bytes"));
    let amt = u64::from_be_bytes(per_hop[8..16].try_into().expect("8 bytes"));
    let cltv = u32::from_be_bytes(per_hop[16..20].try_into().expect("4 bytes"));
    if scid == 0 {
        Ok(HopPayload::Final(FinalPayload {
            amt_to_forward: MilliSatoshi(amt),
            outgoing_cltv: cltv,
        }))
    } else {
        Ok(HopPayload::Relay(RelayPayload {
            amt_to_forward: MilliSatoshi(amt),
            outgoing_cltv: cltv,
            short_channel_id: ShortChannelId(scid),
        }))
    }
}

/// ECDH shared secret for an onion packet, without authenticating it.
///
/// Used to key failure packets for HTLCs whose onion is otherwise
/// rejected, and to re-derive the wrap key for stored onions.
pub fn shared_secret_of(node_key: &SecretKey, packet: &[u8]) -> Option<[u8; 32]> {
    let ephemeral = PublicKey::from_slice(packet.get(1..34)?).ok()?;
    Some(SharedSecret::new(&ephemeral, node_key).secret_bytes())
}

/// Peel one layer off an onion packet addressed to `node_key`.
///
/// `associated_data` is the payment hash the sender committed to.
pub fn peel_onion(
    node_key: &SecretKey,
    associated_data: &[u8],
    packet: &[u8],
) -> Result<PeeledOnion, OnionError> {
    if packet.len() != ONION_PACKET_LEN {
        return Err(OnionError::BadVersion);
    }
    if packet[0] != 0 {
        return Err(OnionError::BadVersion);
    }
    let ephemeral =
        PublicKey::from_slice(&packet[1..34]).map_err(|_| OnionError::BadPublicKey)?;
    let hop_data = &packet[34..34 + HOP_DATA_LEN];
    let packet_hmac = &packet[34 + HOP_DATA_LEN..];

    let shared_secret = SharedSecret::new(&ephemeral, node_key).secret_bytes();

    let mu = generate_key(b"mu", &shared_secret);
    let mut mac_input = Vec::with_capacity(HOP_DATA_LEN + associated_data.len());
    mac_input.extend_from_slice(hop_data);
    mac_input.extend_from_slice(associated_data);
    if hmac_sha256(&mu, &mac_input)[..] != *packet_hmac {
        return Err(OnionError::BadHmac);
    }

    // Extend with zeroes before decrypting so the next hop's routing info
    // shifts in from the keystream.
    let rho = generate_key(b"rho", &shared_secret);
    let mut extended = vec![0u8; 2 * HOP_DATA_LEN];
    extended[..HOP_DATA_LEN].copy_from_slice(hop_data);
    xor_in_place(&mut extended, &generate_stream(&rho, 2 * HOP_DATA_LEN));

    let (payload, consumed) = if extended[0] == 0 {
        // Legacy fixed-size hop data: realm, 32 bytes per-hop, 32 bytes hmac.
        (parse_legacy_payload(&extended[1..33])?, 65)
    } else {
        let (len, adv) = read_bigsize(&extended).ok_or(OnionError::BadPayload)?;
        let len = len as usize;
        let consumed = adv + len + 32;
        if consumed > HOP_DATA_LEN {
            return Err(OnionError::BadPayload);
        }
        (parse_tlv_payload(&extended[adv..adv + len])?, consumed)
    };

    let next_hmac = &extended[consumed - 32..consumed];
    let next_packet = if next_hmac.iter().all(|b| *b == 0) {
        None
    } else {
        let secp = Secp256k1::new();
        let mut blind_input = Vec::with_capacity(33 + 32);
        blind_input.extend_from_slice(&ephemeral.serialize());
        blind_input.extend_from_slice(&shared_secret);
        let blinding =
            Scalar::from_be_bytes(sha256(&blind_input)).map_err(|_| OnionError::BadPublicKey)?;
        let next_ephemeral = ephemeral
            .mul_tweak(&secp, &blinding)
            .map_err(|_| OnionError::BadPublicKey)?;

        let mut next = Vec::with_capacity(ONION_PACKET_LEN);
        next.push(0u8);
        next.extend_from_slice(&next_ephemeral.serialize());
        next.extend_from_slice(&extended[consumed..consumed + HOP_DATA_LEN]);
        next.extend_from_slice(next_hmac);
        Some(next)
    };

    Ok(PeeledOnion { payload, next_packet, shared_secret })
}

/// Write a bigsize-prefixed TLV hop payload for onion construction.
fn write_bigsize(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.push(value as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(value as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&value.to_be_bytes());
        }
    }
}

fn write_tlv_truncated(buf: &mut Vec<u8>, tlv_type: u64, value: u64) {
    let bytes = value.to_be_bytes();
    let trimmed: Vec<u8> = bytes.iter().copied().skip_while(|b| *b == 0).collect();
    write_bigsize(buf, tlv_type);
    write_bigsize(buf, trimmed.len() as u64);
    buf.extend_from_slice(&trimmed);
}

/// Encode a relay TLV payload (types 2, 4, 6).
pub fn encode_relay_payload(payload: &RelayPayload) -> Vec<u8> {
    let mut tlv = Vec::new();
    write_tlv_truncated(&mut tlv, 2, payload.amt_to_forward.0);
    write_tlv_truncated(&mut tlv, 4, payload.outgoing_cltv as u64);
    write_bigsize(&mut tlv, 6);
    write_bigsize(&mut tlv, 8);
    tlv.extend_from_slice(&payload.short_channel_id.0.to_be_bytes());
    tlv
}

/// Encode a final-hop TLV payload (types 2, 4).
pub fn encode_final_payload(payload: &FinalPayload) -> Vec<u8> {
    let mut tlv = Vec::new();
    write_tlv_truncated(&mut tlv, 2, payload.amt_to_forward.0);
    write_tlv_truncated(&mut tlv, 4, payload.outgoing_cltv as u64);
    tlv
}

/// Construct an onion packet for a route.
///
/// `hops` pairs each node's public key with its raw TLV payload (without
/// the bigsize length prefix). The daemon itself only peels; construction
/// exists for the hosted→hosted replay path's tests and tooling.
pub fn build_onion(
    session_key: &SecretKey,
    hops: &[(PublicKey, Vec<u8>)],
    associated_data: &[u8],
) -> Result<Vec<u8>, OnionError> {
    assert!(!hops.is_empty(), "route must have at least one hop");
    let secp = Secp256k1::new();

    // Per-hop ephemeral keys and shared secrets.
    let mut ephemerals = Vec::with_capacity(hops.len());
    let mut secrets: Vec<[u8; 32]> = Vec::with_capacity(hops.len());
    let mut blinded_key = *session_key;
    for (node_pk, _) in hops {
        let ephemeral = PublicKey::from_secret_key(&secp, &blinded_key);
        let secret = SharedSecret::new(node_pk, &blinded_key).secret_bytes();
        let mut blind_input = Vec::with_capacity(33 + 32);
        blind_input.extend_from_slice(&ephemeral.serialize());
        blind_input.extend_from_slice(&secret);
        let blinding =
            Scalar::from_be_bytes(sha256(&blind_input)).map_err(|_| OnionError::BadPublicKey)?;
        ephemerals.push(ephemeral);
        secrets.push(secret);
        blinded_key = blinded_key
            .mul_tweak(&blinding)
            .map_err(|_| OnionError::BadPublicKey)?;
    }

    // Length-prefixed per-hop payloads, each followed on the wire by a mac.
    let framed: Vec<Vec<u8>> = hops
        .iter()
        .map(|(_, payload)| {
            let mut buf = Vec::with_capacity(payload.len() + 9);
            write_bigsize(&mut buf, payload.len() as u64);
            buf.extend_from_slice(payload);
            buf
        })
        .collect();

    // Filler committed by upstream hops over the tail of the routing info.
    let mut filler: Vec<u8> = Vec::new();
    for (secret, frame) in secrets.iter().zip(&framed).take(hops.len() - 1) {
        let shift = frame.len() + 32;
        filler.extend(std::iter::repeat(0u8).take(shift));
        let rho = generate_key(b"rho", secret);
        let stream = generate_stream(&rho, HOP_DATA_LEN + shift);
        let offset = stream.len() - filler.len();
        xor_in_place(&mut filler, &stream[offset..]);
    }

    let mut routing_info =
        generate_stream(&generate_key(b"pad", &session_key.secret_bytes()), HOP_DATA_LEN);
    let mut hmac = [0u8; 32];
    for i in (0..hops.len()).rev() {
        let shift = framed[i].len() + 32;
        routing_info.truncate(HOP_DATA_LEN - shift);
        let mut shifted = Vec::with_capacity(HOP_DATA_LEN);
        shifted.extend_from_slice(&framed[i]);
        shifted.extend_from_slice(&hmac);
        shifted.extend_from_slice(&routing_info);
        routing_info = shifted;

        let rho = generate_key(b"rho", &secrets[i]);
        xor_in_place(&mut routing_info, &generate_stream(&rho, HOP_DATA_LEN));

        if i == hops.len() - 1 {
            routing_info.truncate(HOP_DATA_LEN - filler.len());
            routing_info.extend_from_slice(&filler);
        }

        let mu = generate_key(b"mu", &secrets[i]);
        let mut mac_input = Vec::with_capacity(HOP_DATA_LEN + associated_data.len());
        mac_input.extend_from_slice(&routing_info);
        mac_input.extend_from_slice(associated_data);
        hmac = hmac_sha256(&mu, &mac_input);
    }

    let mut packet = Vec::with_capacity(ONION_PACKET_LEN);
    packet.push(0u8);
    packet.extend_from_slice(&ephemerals[0].serialize());
    packet.extend_from_slice(&routing_info);
    packet.extend_from_slice(&hmac);
    Ok(packet)
}
