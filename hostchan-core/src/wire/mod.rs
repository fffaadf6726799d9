//! Wire protocol for hosted channels.
//!
//! Messages travel inside the upstream node's `custommsg` transport,
//! framed as `tag (u16 BE) || length (u16 BE) || payload`. Tag numbers
//! are the bLIP-0017 assignments.

pub mod codec;
mod messages;

pub use crate::crypto::Signature64;
pub use messages::{
    error_codes, AskBrandingInfo, ChannelUpdate, ErrorMessage, HostedChannelBranding,
    InitHostedChannel, InvokeHostedChannel, LastCrossSignedState, StateOverride, StateUpdate,
    UpdateAddHtlc, UpdateFailHtlc, UpdateFailMalformedHtlc, UpdateFulfillHtlc, ONION_PACKET_LEN,
};

use byteorder::{BigEndian, ByteOrder};

use crate::error::CodecError;

/// `invoke_hosted_channel` message tag.
pub const TAG_INVOKE_HOSTED_CHANNEL: u16 = 65535;
/// `init_hosted_channel` message tag.
pub const TAG_INIT_HOSTED_CHANNEL: u16 = 65533;
/// `last_cross_signed_state` message tag.
pub const TAG_LAST_CROSS_SIGNED_STATE: u16 = 65531;
/// `state_update` message tag.
pub const TAG_STATE_UPDATE: u16 = 65529;
/// `state_override` message tag.
pub const TAG_STATE_OVERRIDE: u16 = 65527;
/// `hosted_channel_branding` message tag.
pub const TAG_HOSTED_CHANNEL_BRANDING: u16 = 65525;
/// `ask_branding_info` message tag.
pub const TAG_ASK_BRANDING_INFO: u16 = 65511;
/// `channel_update` message tag (hosted variant).
pub const TAG_CHANNEL_UPDATE: u16 = 65507;
/// `update_add_htlc` message tag (hosted variant).
pub const TAG_UPDATE_ADD_HTLC: u16 = 65505;
/// `update_fulfill_htlc` message tag (hosted variant).
pub const TAG_UPDATE_FULFILL_HTLC: u16 = 65503;
/// `update_fail_htlc` message tag (hosted variant).
pub const TAG_UPDATE_FAIL_HTLC: u16 = 65501;
/// `update_fail_malformed_htlc` message tag (hosted variant).
pub const TAG_UPDATE_FAIL_MALFORMED_HTLC: u16 = 65499;
/// `error` message tag (hosted variant).
pub const TAG_ERROR: u16 = 65497;

/// Any message of the hosted-channel set.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum HostedMessage {
    Invoke(InvokeHostedChannel),
    Init(InitHostedChannel),
    Lcss(LastCrossSignedState),
    StateUpdate(StateUpdate),
    StateOverride(StateOverride),
    Branding(HostedChannelBranding),
    AskBrandingInfo(AskBrandingInfo),
    ChannelUpdate(ChannelUpdate),
    Add(UpdateAddHtlc),
    Fulfill(UpdateFulfillHtlc),
    Fail(UpdateFailHtlc),
    FailMalformed(UpdateFailMalformedHtlc),
    Error(ErrorMessage),
}

impl HostedMessage {
    /// The message's wire tag.
    pub fn tag(&self) -> u16 {
        match self {
            HostedMessage::Invoke(_) => TAG_INVOKE_HOSTED_CHANNEL,
            HostedMessage::Init(_) => TAG_INIT_HOSTED_CHANNEL,
            HostedMessage::Lcss(_) => TAG_LAST_CROSS_SIGNED_STATE,
            HostedMessage::StateUpdate(_) => TAG_STATE_UPDATE,
            HostedMessage::StateOverride(_) => TAG_STATE_OVERRIDE,
            HostedMessage::Branding(_) => TAG_HOSTED_CHANNEL_BRANDING,
            HostedMessage::AskBrandingInfo(_) => TAG_ASK_BRANDING_INFO,
            HostedMessage::ChannelUpdate(_) => TAG_CHANNEL_UPDATE,
            HostedMessage::Add(_) => TAG_UPDATE_ADD_HTLC,
            HostedMessage::Fulfill(_) => TAG_UPDATE_FULFILL_HTLC,
            HostedMessage::Fail(_) => TAG_UPDATE_FAIL_HTLC,
            HostedMessage::FailMalformed(_) => TAG_UPDATE_FAIL_MALFORMED_HTLC,
            HostedMessage::Error(_) => TAG_ERROR,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            HostedMessage::Invoke(_) => "invoke_hosted_channel",
            HostedMessage::Init(_) => "init_hosted_channel",
            HostedMessage::Lcss(_) => "last_cross_signed_state",
            HostedMessage::StateUpdate(_) => "state_update",
            HostedMessage::StateOverride(_) => "state_override",
            HostedMessage::Branding(_) => "hosted_channel_branding",
            HostedMessage::AskBrandingInfo(_) => "ask_branding_info",
            HostedMessage::ChannelUpdate(_) => "channel_update",
            HostedMessage::Add(_) => "update_add_htlc",
            HostedMessage::Fulfill(_) => "update_fulfill_htlc",
            HostedMessage::Fail(_) => "update_fail_htlc",
            HostedMessage::FailMalformed(_) => "update_fail_malformed_htlc",
            HostedMessage::Error(_) => "error",
        }
    }
}

/// Frame a message as `tag || length || payload`.
pub fn encode_message(msg: &HostedMessage) -> Result<Vec<u8>, CodecError> {
    let payload = match msg {
        HostedMessage::Invoke(m) => codec::encode_invoke(m)?,
        HostedMessage::Init(m) => codec::encode_init(m)?,
        HostedMessage::Lcss(m) => codec::encode_lcss(m)?,
        HostedMessage::StateUpdate(m) => codec::encode_state_update(m),
        HostedMessage::StateOverride(m) => codec::encode_state_override(m),
        HostedMessage::Branding(m) => codec::encode_branding(m)?,
        HostedMessage::AskBrandingInfo(m) => codec::encode_ask_branding(m),
        HostedMessage::ChannelUpdate(m) => codec::encode_channel_update(m),
        HostedMessage::Add(m) => codec::encode_add(m),
        HostedMessage::Fulfill(m) => codec::encode_fulfill(m),
        HostedMessage::Fail(m) => codec::encode_fail(m)?,
        HostedMessage::FailMalformed(m) => codec::encode_fail_malformed(m),
        HostedMessage::Error(m) => codec::encode_error(m)?,
    };
    let len = u16::try_from(payload.len()).map_err(|_| CodecError::InvalidField("length"))?;
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&msg.tag().to_be_bytes());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&payload);
    Ok(framed)
}

/// Parse a framed message. Unknown tags surface as
/// [`CodecError::UnknownTag`] so callers can log and ignore them.
pub fn decode_message(framed: &[u8]) -> Result<HostedMessage, CodecError> {
    if framed.len() < 4 {
        return Err(CodecError::UnexpectedEnd);
    }
    let tag = BigEndian::read_u16(&framed[0..2]);
    let len = BigEndian::read_u16(&framed[2..4]) as usize;
    let payload = &framed[4..];
    if payload.len() != len {
        return Err(CodecError::InvalidField("length"));
    }
    let msg = match tag {
        TAG_INVOKE_HOSTED_CHANNEL => HostedMessage::Invoke(codec::decode_invoke(payload)?),
        TAG_INIT_HOSTED_CHANNEL => HostedMessage::Init(codec::decode_init(payload)?),
        TAG_LAST_CROSS_SIGNED_STATE => HostedMessage::Lcss(codec::decode_lcss(payload)?),
        TAG_STATE_UPDATE => HostedMessage::StateUpdate(codec::decode_state_update(payload)?),
        TAG_STATE_OVERRIDE => HostedMessage::StateOverride(codec::decode_state_override(payload)?),
        TAG_HOSTED_CHANNEL_BRANDING => HostedMessage::Branding(codec::decode_branding(payload)?),
        TAG_ASK_BRANDING_INFO => HostedMessage::AskBrandingInfo(codec::decode_ask_branding(payload)?),
        TAG_CHANNEL_UPDATE => HostedMessage::ChannelUpdate(codec::decode_channel_update(payload)?),
        TAG_UPDATE_ADD_HTLC => HostedMessage::Add(codec::decode_add(payload)?),
        TAG_UPDATE_FULFILL_HTLC => HostedMessage::Fulfill(codec::decode_fulfill(payload)?),
        TAG_UPDATE_FAIL_HTLC => HostedMessage::Fail(codec::decode_fail(payload)?),
        TAG_UPDATE_FAIL_MALFORMED_HTLC => {
            HostedMessage::FailMalformed(codec::decode_fail_malformed(payload)?)
        }
        TAG_ERROR => HostedMessage::Error(codec::decode_error(payload)?),
        other => return Err(CodecError::UnknownTag(other)),
    };
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MilliSatoshi;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use secp256k1::{PublicKey, Secp256k1, SecretKey};

    fn keypair(seed: u64) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let mut rng = StdRng::seed_from_u64(seed);
        let sk = SecretKey::new(&mut rng);
        (sk, PublicKey::from_secret_key(&secp, &sk))
    }

    fn sample_init() -> InitHostedChannel {
        InitHostedChannel {
            max_htlc_value_in_flight_msat: MilliSatoshi(100_000_000),
            htlc_minimum_msat: MilliSatoshi(1000),
            max_accepted_htlcs: 12,
            channel_capacity_msat: MilliSatoshi(100_000_000),
            initial_client_balance_msat: MilliSatoshi(0),
            features: vec![],
        }
    }

    fn sample_add(id: u64, amount: u64) -> UpdateAddHtlc {
        UpdateAddHtlc {
            channel_id: [3u8; 32],
            id,
            amount_msat: MilliSatoshi(amount),
            payment_hash: [7u8; 32],
            cltv_expiry: 800_200,
            onion_routing_packet: vec![0u8; ONION_PACKET_LEN],
        }
    }

    fn sample_lcss() -> LastCrossSignedState {
        LastCrossSignedState {
            is_host: true,
            refund_script_pubkey: vec![0x00, 0x14, 0xaa, 0xbb],
            init_hosted_channel: sample_init(),
            block_day: 5555,
            local_balance_msat: MilliSatoshi(99_000_000),
            remote_balance_msat: MilliSatoshi(990_000),
            local_updates: 4,
            remote_updates: 3,
            incoming_htlcs: vec![sample_add(3, 5_000)],
            outgoing_htlcs: vec![sample_add(4, 5_000)],
            remote_sig_of_local: Signature64([0x11; 64]),
            local_sig_of_remote: Signature64([0x22; 64]),
        }
    }

    #[test]
    fn test_roundtrip_invoke() {
        let msg = HostedMessage::Invoke(InvokeHostedChannel {
            chain_hash: [9u8; 32],
            refund_script_pubkey: vec![0x00, 0x14, 1, 2, 3],
            secret: vec![],
        });
        let framed = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&framed).unwrap(), msg);
    }

    #[test]
    fn test_roundtrip_lcss() {
        let msg = HostedMessage::Lcss(sample_lcss());
        let framed = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&framed).unwrap(), msg);
    }

    #[test]
    fn test_roundtrip_state_update() {
        let msg = HostedMessage::StateUpdate(StateUpdate {
            block_day: 5555,
            local_updates: 10,
            remote_updates: 9,
            local_sig_of_remote_lcss: Signature64([0x33; 64]),
        });
        let framed = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&framed).unwrap(), msg);
    }

    #[test]
    fn test_roundtrip_branding() {
        let msg = HostedMessage::Branding(HostedChannelBranding {
            rgb_color: [0xff, 0xff, 0xff],
            png_icon: Some(vec![0x89, 0x50, 0x4e, 0x47]),
            contact_info: "https://host.example".into(),
        });
        let framed = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&framed).unwrap(), msg);
    }

    #[test]
    fn test_unknown_tag() {
        let framed = [0x00u8, 0x11, 0x00, 0x00];
        assert_eq!(decode_message(&framed), Err(CodecError::UnknownTag(0x11)));
    }

    #[test]
    fn test_length_mismatch() {
        let msg = HostedMessage::AskBrandingInfo(AskBrandingInfo { chain_hash: [1u8; 32] });
        let mut framed = encode_message(&msg).unwrap();
        framed.pop();
        assert!(decode_message(&framed).is_err());
    }

    #[test]
    fn test_truncated_message() {
        assert_eq!(decode_message(&[0xff]), Err(CodecError::UnexpectedEnd));
    }

    #[test]
    fn test_sig_material_layout() {
        let lcss = sample_lcss();
        let material = codec::lcss_sig_material(&lcss);

        // Leads with the u16-prefixed refund script, not the wire body's
        // is_host byte.
        let spk_len = lcss.refund_script_pubkey.len();
        assert_eq!(&material[..2], &(spk_len as u16).to_be_bytes());
        assert_eq!(&material[2..2 + spk_len], lcss.refund_script_pubkey.as_slice());

        // is_host is not committed to.
        let mut flipped = lcss.clone();
        flipped.is_host = false;
        assert_eq!(codec::lcss_sig_material(&flipped), material);

        // Bare init (no length prefix), fixed fields, then each HTLC
        // u16-framed with no per-list counts.
        let init_len = codec::encode_init(&lcss.init_hosted_channel).unwrap().len();
        let htlcs_len: usize = lcss
            .incoming_htlcs
            .iter()
            .chain(lcss.outgoing_htlcs.iter())
            .map(|h| 2 + codec::encode_add(h).len())
            .sum();
        assert_eq!(material.len(), 2 + spk_len + init_len + 4 + 8 + 8 + 4 + 4 + htlcs_len);
    }

    #[test]
    fn test_sig_hash_ignores_signature_slots() {
        let mut lcss = sample_lcss();
        let hash = lcss.sig_hash();
        lcss.remote_sig_of_local = Signature64([0x44; 64]);
        lcss.local_sig_of_remote = Signature64([0x55; 64]);
        assert_eq!(lcss.sig_hash(), hash);
    }

    #[test]
    fn test_reverse_is_involution() {
        let lcss = sample_lcss();
        assert_eq!(lcss.reverse().reverse(), lcss);
        assert_eq!(lcss.reverse().is_host, false);
        assert_eq!(lcss.reverse().local_balance_msat, lcss.remote_balance_msat);
    }

    #[test]
    fn test_cross_signing() {
        // Host signs the state as the client sees it; the client verifies
        // the signature on its own view.
        let (host_sk, host_pk) = keypair(1);
        let host_view = sample_lcss();

        let mut client_view = host_view.reverse();
        client_view.remote_sig_of_local = host_view.sign_mirrored(&host_sk);
        assert!(client_view.verify_remote_sig(&host_pk).is_ok());

        // A different signer must not verify.
        let (_, other_pk) = keypair(2);
        assert!(client_view.verify_remote_sig(&other_pk).is_err());
    }

    #[test]
    fn test_signatures_computed_over_either_form_agree() {
        // Encoding then decoding must preserve the digest both sides sign.
        let lcss = sample_lcss();
        let decoded = codec::decode_lcss(&codec::encode_lcss(&lcss).unwrap()).unwrap();
        assert_eq!(decoded.sig_hash(), lcss.sig_hash());
    }

    #[test]
    fn test_error_code_extraction() {
        let err = ErrorMessage::new([0u8; 32], error_codes::ERR_MANUAL_SUSPEND, "too many HTLCs");
        assert_eq!(err.code(), Some("0008"));
        assert!(err.description().contains("too many HTLCs"));

        let opaque = ErrorMessage { channel_id: [0u8; 32], data: vec![0xff, 0xfe] };
        assert_eq!(opaque.code(), None);
    }

    #[test]
    fn test_channel_update_signing() {
        let (sk, pk) = keypair(3);
        let mut update = ChannelUpdate {
            signature: Signature64::ZERO,
            chain_hash: [6u8; 32],
            short_channel_id: crate::types::ShortChannelId(42),
            timestamp: 1_700_000_000,
            message_flags: 1,
            channel_flags: 0,
            cltv_expiry_delta: 143,
            htlc_minimum_msat: MilliSatoshi(1000),
            fee_base_msat: 1000,
            fee_proportional_millionths: 1000,
            htlc_maximum_msat: MilliSatoshi(100_000_000),
        };
        update.sign(&sk);
        assert!(crate::crypto::verify_digest(&update.sig_hash(), &update.signature, &pk).is_ok());

        let framed = encode_message(&HostedMessage::ChannelUpdate(update.clone())).unwrap();
        assert_eq!(decode_message(&framed).unwrap(), HostedMessage::ChannelUpdate(update));
    }
}
