//! Hosted-channel message types.
//!
//! Shapes follow bLIP-0017 for the hosted-channel set and BOLT-2/BOLT-7
//! for the shared update and gossip messages. Byte layouts live in the
//! sibling codec module; this module holds the structs plus the
//! signature logic of the last-cross-signed state.

use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

use crate::crypto::{sha256, sha256d, sign_digest, verify_digest, Signature64};
use crate::error::CryptoError;
use crate::types::{hexser, MilliSatoshi, ShortChannelId};

use super::codec;

/// Byte length of a BOLT-4 onion routing packet.
pub const ONION_PACKET_LEN: usize = 1366;

/// Error codes carried as 4-ASCII-digit prefixes of `Error.data`.
pub mod error_codes {
    /// Handshake or override carried a blockDay too far from ours.
    pub const ERR_WRONG_BLOCKDAY: &str = "0001";
    /// A signature that should be ours does not verify.
    pub const ERR_WRONG_LOCAL_SIG: &str = "0002";
    /// The peer's signature does not verify.
    pub const ERR_WRONG_REMOTE_SIG: &str = "0003";
    /// The peer sent us an Error, closing the channel from its side.
    pub const ERR_CLOSED_BY_REMOTE_PEER: &str = "0004";
    /// An outgoing HTLC crossed its CLTV deadline.
    pub const ERR_TIMED_OUT_OUTGOING_HTLC: &str = "0005";
    /// Channel request rejected (wrong chain, bad secret).
    pub const ERR_CHANNEL_DENIED: &str = "0007";
    /// Channel suspended after a critical HTLC violation.
    pub const ERR_MANUAL_SUSPEND: &str = "0008";
}

/// Client or host asks the other side to (re)establish a hosted channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvokeHostedChannel {
    /// Genesis hash of the chain both sides must be on.
    pub chain_hash: [u8; 32],
    /// Client refund script, committed into every signed state.
    pub refund_script_pubkey: Vec<u8>,
    /// Access secret, possibly empty.
    pub secret: Vec<u8>,
}

/// Static channel parameters proposed by the host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitHostedChannel {
    /// Cap on the total of in-flight incoming HTLCs.
    pub max_htlc_value_in_flight_msat: MilliSatoshi,
    /// Minimum accepted HTLC amount.
    pub htlc_minimum_msat: MilliSatoshi,
    /// Cap on the number of concurrently accepted HTLCs.
    pub max_accepted_htlcs: u16,
    /// Total channel capacity.
    pub channel_capacity_msat: MilliSatoshi,
    /// Balance granted to the client at creation.
    pub initial_client_balance_msat: MilliSatoshi,
    /// Feature list, currently always empty.
    pub features: Vec<u16>,
}

/// The mutually signed balance snapshot, the atomic unit of agreement.
///
/// Each side signs the state *as viewed by the other side*; see
/// [`LastCrossSignedState::reverse`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastCrossSignedState {
    /// Whether the local side is the host.
    pub is_host: bool,
    /// Client refund script carried over from the handshake.
    #[serde(with = "hexser::hexvec")]
    pub refund_script_pubkey: Vec<u8>,
    /// Static channel parameters.
    pub init_hosted_channel: InitHostedChannel,
    /// Coarse timestamp (`block_height / 144`) bounding staleness.
    pub block_day: u32,
    /// Local side's spendable balance.
    pub local_balance_msat: MilliSatoshi,
    /// Remote side's spendable balance.
    pub remote_balance_msat: MilliSatoshi,
    /// Count of updates the local side has originated.
    pub local_updates: u32,
    /// Count of updates the remote side has originated.
    pub remote_updates: u32,
    /// HTLCs offered by the remote side, still unresolved.
    pub incoming_htlcs: Vec<UpdateAddHtlc>,
    /// HTLCs offered by the local side, still unresolved.
    pub outgoing_htlcs: Vec<UpdateAddHtlc>,
    /// The remote side's signature over this state as we view it.
    pub remote_sig_of_local: Signature64,
    /// Our signature over this state as the remote side views it.
    pub local_sig_of_remote: Signature64,
}

impl LastCrossSignedState {
    /// The same state as seen from the other side: balances, counters,
    /// HTLC directions and signature slots swapped, `is_host` negated.
    pub fn reverse(&self) -> LastCrossSignedState {
        LastCrossSignedState {
            is_host: !self.is_host,
            refund_script_pubkey: self.refund_script_pubkey.clone(),
            init_hosted_channel: self.init_hosted_channel.clone(),
            block_day: self.block_day,
            local_balance_msat: self.remote_balance_msat,
            remote_balance_msat: self.local_balance_msat,
            local_updates: self.remote_updates,
            remote_updates: self.local_updates,
            incoming_htlcs: self.outgoing_htlcs.clone(),
            outgoing_htlcs: self.incoming_htlcs.clone(),
            remote_sig_of_local: self.local_sig_of_remote,
            local_sig_of_remote: self.remote_sig_of_local,
        }
    }

    /// Digest each side signs: SHA-256 over the refund script, the static
    /// channel params, blockDay, balances, update counters and the framed
    /// HTLC lists. `is_host` and the signature slots are not covered.
    pub fn sig_hash(&self) -> [u8; 32] {
        sha256(&codec::lcss_sig_material(self))
    }

    /// Produce our `local_sig_of_remote`: a signature over the state as
    /// the remote side views it.
    pub fn sign_mirrored(&self, secret_key: &SecretKey) -> Signature64 {
        sign_digest(&self.reverse().sig_hash(), secret_key)
    }

    /// Check the remote side's signature over our view of the state.
    pub fn verify_remote_sig(&self, remote_key: &PublicKey) -> Result<(), CryptoError> {
        verify_digest(&self.sig_hash(), &self.remote_sig_of_local, remote_key)
    }

    /// Combined update counter, used to decide which of two states is newer.
    pub fn total_updates(&self) -> u64 {
        self.local_updates as u64 + self.remote_updates as u64
    }

    /// Capacity minus both balances and all in-flight amounts must be zero.
    pub fn is_balanced(&self) -> bool {
        let in_flight: MilliSatoshi = self
            .incoming_htlcs
            .iter()
            .chain(self.outgoing_htlcs.iter())
            .map(|h| h.amount_msat)
            .sum();
        self.local_balance_msat + self.remote_balance_msat + in_flight
            == self.init_hosted_channel.channel_capacity_msat
    }
}

/// Counters plus a signature over the sender's view of the next state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateUpdate {
    /// Sender's current block day.
    pub block_day: u32,
    /// Sender-side update counter.
    pub local_updates: u32,
    /// Receiver-side update counter as the sender sees it.
    pub remote_updates: u32,
    /// Sender's signature over the receiver's view of the state.
    pub local_sig_of_remote_lcss: Signature64,
}

/// Host proposal to reset an errored channel to fresh balances.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateOverride {
    /// Block day of the proposed state.
    pub block_day: u32,
    /// Sender-side balance in the proposed state.
    pub local_balance_msat: MilliSatoshi,
    /// Sender-side update counter after the override.
    pub local_updates: u32,
    /// Receiver-side update counter after the override.
    pub remote_updates: u32,
    /// Sender's signature over the receiver's view of the override.
    pub local_sig_of_remote_lcss: Signature64,
}

/// BOLT-2 `update_add_htlc` (hosted-channel tagged variant).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAddHtlc {
    /// Channel the HTLC rides on.
    #[serde(with = "hexser::hex32")]
    pub channel_id: [u8; 32],
    /// Sender-assigned HTLC id, strictly increasing.
    pub id: u64,
    /// HTLC amount.
    pub amount_msat: MilliSatoshi,
    /// Hash gating the payment.
    #[serde(with = "hexser::hex32")]
    pub payment_hash: [u8; 32],
    /// Absolute block height after which the HTLC is expired.
    pub cltv_expiry: u32,
    /// Onion routing packet for the next hop.
    #[serde(with = "hexser::hexvec")]
    pub onion_routing_packet: Vec<u8>,
}

/// BOLT-2 `update_fulfill_htlc`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFulfillHtlc {
    /// Channel the HTLC rides on.
    pub channel_id: [u8; 32],
    /// Id of the HTLC being fulfilled.
    pub id: u64,
    /// Preimage whose SHA-256 is the payment hash.
    pub payment_preimage: [u8; 32],
}

/// BOLT-2 `update_fail_htlc`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailHtlc {
    /// Channel the HTLC rides on.
    pub channel_id: [u8; 32],
    /// Id of the HTLC being failed.
    pub id: u64,
    /// Encrypted failure onion for the upstream path.
    pub reason: Vec<u8>,
}

/// BOLT-2 `update_fail_malformed_htlc`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailMalformedHtlc {
    /// Channel the HTLC rides on.
    pub channel_id: [u8; 32],
    /// Id of the HTLC being failed.
    pub id: u64,
    /// SHA-256 of the offending onion.
    pub sha256_of_onion: [u8; 32],
    /// BADONION failure code.
    pub failure_code: u16,
}

/// BOLT-1 `error` (hosted-channel tagged variant).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Channel the error refers to.
    #[serde(with = "hexser::hex32")]
    pub channel_id: [u8; 32],
    /// ASCII error code, optionally followed by free text.
    #[serde(with = "hexser::hexvec")]
    pub data: Vec<u8>,
}

impl ErrorMessage {
    /// Build an error whose data is `<code>` or `<code> <reason>`.
    pub fn new(channel_id: [u8; 32], code: &str, reason: &str) -> ErrorMessage {
        let data = if reason.is_empty() {
            code.as_bytes().to_vec()
        } else {
            format!("{} {}", code, reason).into_bytes()
        };
        ErrorMessage { channel_id, data }
    }

    /// The leading 4-character code, if the data carries one.
    pub fn code(&self) -> Option<&str> {
        let text = std::str::from_utf8(&self.data).ok()?;
        let code = text.get(..4)?;
        code.chars().all(|c| c.is_ascii_digit()).then_some(code)
    }

    /// Human-readable rendering of the error data.
    pub fn description(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// BOLT-7 `channel_update` (hosted-channel tagged variant), gossiped to
/// the client so it can build routes over the hosted channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelUpdate {
    /// Signature over the double-SHA-256 of the remaining fields.
    pub signature: Signature64,
    /// Chain this channel lives on.
    pub chain_hash: [u8; 32],
    /// Channel being described.
    pub short_channel_id: ShortChannelId,
    /// Unix timestamp of this update.
    pub timestamp: u32,
    /// BOLT-7 message flags; bit 0 set (htlc_maximum present).
    pub message_flags: u8,
    /// BOLT-7 channel flags; bit 0 is the direction.
    pub channel_flags: u8,
    /// Forwarding CLTV delta.
    pub cltv_expiry_delta: u16,
    /// Minimum forwardable HTLC.
    pub htlc_minimum_msat: MilliSatoshi,
    /// Base forwarding fee.
    pub fee_base_msat: u32,
    /// Proportional forwarding fee in ppm.
    pub fee_proportional_millionths: u32,
    /// Maximum forwardable HTLC.
    pub htlc_maximum_msat: MilliSatoshi,
}

impl ChannelUpdate {
    /// Digest the gossip signature commits to.
    pub fn sig_hash(&self) -> [u8; 32] {
        sha256d(&codec::channel_update_witness(self))
    }

    /// Sign the update in place.
    pub fn sign(&mut self, secret_key: &SecretKey) {
        self.signature = sign_digest(&self.sig_hash(), secret_key);
    }
}

/// Request for the host's branding info.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AskBrandingInfo {
    /// Chain the asker is on.
    pub chain_hash: [u8; 32],
}

/// Host branding: color, optional logo, contact info.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostedChannelBranding {
    /// RGB brand color.
    pub rgb_color: [u8; 3],
    /// Optional PNG logo bytes.
    pub png_icon: Option<Vec<u8>>,
    /// Contact URL or address.
    pub contact_info: String,
}
