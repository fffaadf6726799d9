//! Bit-exact encoding and decoding of the hosted-channel message set.
//!
//! All integers are big-endian. Variable-length fields carry a u16 length
//! prefix; the onion packet in `update_add_htlc` is the message remainder.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::CodecError;
use crate::types::{MilliSatoshi, ShortChannelId};

use super::messages::*;
use super::Signature64;

fn read_array<const N: usize>(cur: &mut Cursor<&[u8]>) -> Result<[u8; N], CodecError> {
    let mut buf = [0u8; N];
    cur.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_var(cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>, CodecError> {
    let len = cur.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    cur.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_rest(cur: &mut Cursor<&[u8]>) -> Vec<u8> {
    let mut buf = Vec::new();
    cur.read_to_end(&mut buf).expect("reading from a slice");
    buf
}

fn read_sig(cur: &mut Cursor<&[u8]>) -> Result<Signature64, CodecError> {
    Ok(Signature64(read_array::<64>(cur)?))
}

fn write_var(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(bytes.len()).map_err(|_| CodecError::InvalidField("length"))?;
    buf.write_u16::<BigEndian>(len).expect("vec write");
    buf.write_all(bytes).expect("vec write");
    Ok(())
}

fn done(cur: Cursor<&[u8]>) -> Result<(), CodecError> {
    if cur.position() as usize == cur.get_ref().len() {
        Ok(())
    } else {
        Err(CodecError::InvalidField("trailing bytes"))
    }
}

/// Encode `invoke_hosted_channel`.
pub fn encode_invoke(msg: &InvokeHostedChannel) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&msg.chain_hash);
    write_var(&mut buf, &msg.refund_script_pubkey)?;
    write_var(&mut buf, &msg.secret)?;
    Ok(buf)
}

/// Decode `invoke_hosted_channel`.
pub fn decode_invoke(payload: &[u8]) -> Result<InvokeHostedChannel, CodecError> {
    let mut cur = Cursor::new(payload);
    let msg = InvokeHostedChannel {
        chain_hash: read_array(&mut cur)?,
        refund_script_pubkey: read_var(&mut cur)?,
        secret: read_var(&mut cur)?,
    };
    done(cur)?;
    Ok(msg)
}

/// Encode `init_hosted_channel`.
pub fn encode_init(msg: &InitHostedChannel) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    buf.write_u64::<BigEndian>(msg.max_htlc_value_in_flight_msat.0).expect("vec write");
    buf.write_u64::<BigEndian>(msg.htlc_minimum_msat.0).expect("vec write");
    buf.write_u16::<BigEndian>(msg.max_accepted_htlcs).expect("vec write");
    buf.write_u64::<BigEndian>(msg.channel_capacity_msat.0).expect("vec write");
    buf.write_u64::<BigEndian>(msg.initial_client_balance_msat.0).expect("vec write");
    let count = u16::try_from(msg.features.len()).map_err(|_| CodecError::InvalidField("features"))?;
    buf.write_u16::<BigEndian>(count).expect("vec write");
    for feature in &msg.features {
        buf.write_u16::<BigEndian>(*feature).expect("vec write");
    }
    Ok(buf)
}

/// Decode `init_hosted_channel`.
pub fn decode_init(payload: &[u8]) -> Result<InitHostedChannel, CodecError> {
    let mut cur = Cursor::new(payload);
    let msg = decode_init_from(&mut cur)?;
    done(cur)?;
    Ok(msg)
}

fn decode_init_from(cur: &mut Cursor<&[u8]>) -> Result<InitHostedChannel, CodecError> {
    let max_htlc_value_in_flight_msat = MilliSatoshi(cur.read_u64::<BigEndian>()?);
    let htlc_minimum_msat = MilliSatoshi(cur.read_u64::<BigEndian>()?);
    let max_accepted_htlcs = cur.read_u16::<BigEndian>()?;
    let channel_capacity_msat = MilliSatoshi(cur.read_u64::<BigEndian>()?);
    let initial_client_balance_msat = MilliSatoshi(cur.read_u64::<BigEndian>()?);
    let count = cur.read_u16::<BigEndian>()?;
    let mut features = Vec::with_capacity(count as usize);
    for _ in 0..count {
        features.push(cur.read_u16::<BigEndian>()?);
    }
    Ok(InitHostedChannel {
        max_htlc_value_in_flight_msat,
        htlc_minimum_msat,
        max_accepted_htlcs,
        channel_capacity_msat,
        initial_client_balance_msat,
        features,
    })
}

/// Encode `last_cross_signed_state`.
pub fn encode_lcss(msg: &LastCrossSignedState) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    buf.push(msg.is_host as u8);
    write_var(&mut buf, &msg.refund_script_pubkey)?;
    let init = encode_init(&msg.init_hosted_channel)?;
    write_var(&mut buf, &init)?;
    buf.write_u32::<BigEndian>(msg.block_day).expect("vec write");
    buf.write_u64::<BigEndian>(msg.local_balance_msat.0).expect("vec write");
    buf.write_u64::<BigEndian>(msg.remote_balance_msat.0).expect("vec write");
    buf.write_u32::<BigEndian>(msg.local_updates).expect("vec write");
    buf.write_u32::<BigEndian>(msg.remote_updates).expect("vec write");
    for list in [&msg.incoming_htlcs, &msg.outgoing_htlcs] {
        let count = u16::try_from(list.len()).map_err(|_| CodecError::InvalidField("htlcs"))?;
        buf.write_u16::<BigEndian>(count).expect("vec write");
        for htlc in list {
            write_var(&mut buf, &encode_add(htlc))?;
        }
    }
    buf.extend_from_slice(&msg.remote_sig_of_local.0);
    buf.extend_from_slice(&msg.local_sig_of_remote.0);
    Ok(buf)
}

/// Digest input both signatures commit to:
/// `refund_spk (u16-prefixed) || init_hosted_channel || block_day ||
/// local_balance || remote_balance || local_updates || remote_updates ||
/// incoming htlcs || outgoing htlcs`, each HTLC u16-length-framed in list
/// order. `is_host`, the signature slots and the wire body's list counts
/// are not part of the material.
pub fn lcss_sig_material(msg: &LastCrossSignedState) -> Vec<u8> {
    let mut buf = Vec::new();
    write_var(&mut buf, &msg.refund_script_pubkey).expect("script below u16 length");
    let init = encode_init(&msg.init_hosted_channel).expect("static params encode");
    buf.extend_from_slice(&init);
    buf.write_u32::<BigEndian>(msg.block_day).expect("vec write");
    buf.write_u64::<BigEndian>(msg.local_balance_msat.0).expect("vec write");
    buf.write_u64::<BigEndian>(msg.remote_balance_msat.0).expect("vec write");
    buf.write_u32::<BigEndian>(msg.local_updates).expect("vec write");
    buf.write_u32::<BigEndian>(msg.remote_updates).expect("vec write");
    for htlc in msg.incoming_htlcs.iter().chain(msg.outgoing_htlcs.iter()) {
        write_var(&mut buf, &encode_add(htlc)).expect("htlc below u16 length");
    }
    buf
}

/// Decode `last_cross_signed_state`.
pub fn decode_lcss(payload: &[u8]) -> Result<LastCrossSignedState, CodecError> {
    let mut cur = Cursor::new(payload);
    let is_host = match cur.read_u8()? {
        0 => false,
        1 => true,
        _ => return Err(CodecError::InvalidField("is_host")),
    };
    let refund_script_pubkey = read_var(&mut cur)?;
    let init_raw = read_var(&mut cur)?;
    let init_hosted_channel = decode_init(&init_raw)?;
    let block_day = cur.read_u32::<BigEndian>()?;
    let local_balance_msat = MilliSatoshi(cur.read_u64::<BigEndian>()?);
    let remote_balance_msat = MilliSatoshi(cur.read_u64::<BigEndian>()?);
    let local_updates = cur.read_u32::<BigEndian>()?;
    let remote_updates = cur.read_u32::<BigEndian>()?;
    let mut lists: [Vec<UpdateAddHtlc>; 2] = [Vec::new(), Vec::new()];
    for list in lists.iter_mut() {
        let count = cur.read_u16::<BigEndian>()?;
        for _ in 0..count {
            let raw = read_var(&mut cur)?;
            list.push(decode_add(&raw)?);
        }
    }
    let [incoming_htlcs, outgoing_htlcs] = lists;
    let remote_sig_of_local = read_sig(&mut cur)?;
    let local_sig_of_remote = read_sig(&mut cur)?;
    done(cur)?;
    Ok(LastCrossSignedState {
        is_host,
        refund_script_pubkey,
        init_hosted_channel,
        block_day,
        local_balance_msat,
        remote_balance_msat,
        local_updates,
        remote_updates,
        incoming_htlcs,
        outgoing_htlcs,
        remote_sig_of_local,
        local_sig_of_remote,
    })
}

/// Encode `state_update`.
pub fn encode_state_update(msg: &StateUpdate) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u32::<BigEndian>(msg.block_day).expect("vec write");
    buf.write_u32::<BigEndian>(msg.local_updates).expect("vec write");
    buf.write_u32::<BigEndian>(msg.remote_updates).expect("vec write");
    buf.extend_from_slice(&msg.local_sig_of_remote_lcss.0);
    buf
}

/// Decode `state_update`.
pub fn decode_state_update(payload: &[u8]) -> Result<StateUpdate, CodecError> {
    let mut cur = Cursor::new(payload);
    let msg = StateUpdate {
        block_day: cur.read_u32::<BigEndian>()?,
        local_updates: cur.read_u32::<BigEndian>()?,
        remote_updates: cur.read_u32::<BigEndian>()?,
        local_sig_of_remote_lcss: read_sig(&mut cur)?,
    };
    done(cur)?;
    Ok(msg)
}

/// Encode `state_override`.
pub fn encode_state_override(msg: &StateOverride) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u32::<BigEndian>(msg.block_day).expect("vec write");
    buf.write_u64::<BigEndian>(msg.local_balance_msat.0).expect("vec write");
    buf.write_u32::<BigEndian>(msg.local_updates).expect("vec write");
    buf.write_u32::<BigEndian>(msg.remote_updates).expect("vec write");
    buf.extend_from_slice(&msg.local_sig_of_remote_lcss.0);
    buf
}

/// Decode `state_override`.
pub fn decode_state_override(payload: &[u8]) -> Result<StateOverride, CodecError> {
    let mut cur = Cursor::new(payload);
    let msg = StateOverride {
        block_day: cur.read_u32::<BigEndian>()?,
        local_balance_msat: MilliSatoshi(cur.read_u64::<BigEndian>()?),
        local_updates: cur.read_u32::<BigEndian>()?,
        remote_updates: cur.read_u32::<BigEndian>()?,
        local_sig_of_remote_lcss: read_sig(&mut cur)?,
    };
    done(cur)?;
    Ok(msg)
}

/// Encode `update_add_htlc`; the onion is the message remainder.
pub fn encode_add(msg: &UpdateAddHtlc) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&msg.channel_id);
    buf.write_u64::<BigEndian>(msg.id).expect("vec write");
    buf.write_u64::<BigEndian>(msg.amount_msat.0).expect("vec write");
    buf.extend_from_slice(&msg.payment_hash);
    buf.write_u32::<BigEndian>(msg.cltv_expiry).expect("vec write");
    buf.extend_from_slice(&msg.onion_routing_packet);
    buf
}

/// Decode `update_add_htlc`.
pub fn decode_add(payload: &[u8]) -> Result<UpdateAddHtlc, CodecError> {
    let mut cur = Cursor::new(payload);
    Ok(UpdateAddHtlc {
        channel_id: read_array(&mut cur)?,
        id: cur.read_u64::<BigEndian>()?,
        amount_msat: MilliSatoshi(cur.read_u64::<BigEndian>()?),
        payment_hash: read_array(&mut cur)?,
        cltv_expiry: cur.read_u32::<BigEndian>()?,
        onion_routing_packet: read_rest(&mut cur),
    })
}

/// Encode `update_fulfill_htlc`.
pub fn encode_fulfill(msg: &UpdateFulfillHtlc) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&msg.channel_id);
    buf.write_u64::<BigEndian>(msg.id).expect("vec write");
    buf.extend_from_slice(&msg.payment_preimage);
    buf
}

/// Decode `update_fulfill_htlc`.
pub fn decode_fulfill(payload: &[u8]) -> Result<UpdateFulfillHtlc, CodecError> {
    let mut cur = Cursor::new(payload);
    let msg = UpdateFulfillHtlc {
        channel_id: read_array(&mut cur)?,
        id: cur.read_u64::<BigEndian>()?,
        payment_preimage: read_array(&mut cur)?,
    };
    done(cur)?;
    Ok(msg)
}

/// Encode `update_fail_htlc`.
pub fn encode_fail(msg: &UpdateFailHtlc) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&msg.channel_id);
    buf.write_u64::<BigEndian>(msg.id).expect("vec write");
    write_var(&mut buf, &msg.reason)?;
    Ok(buf)
}

/// Decode `update_fail_htlc`.
pub fn decode_fail(payload: &[u8]) -> Result<UpdateFailHtlc, CodecError> {
    let mut cur = Cursor::new(payload);
    let msg = UpdateFailHtlc {
        channel_id: read_array(&mut cur)?,
        id: cur.read_u64::<BigEndian>()?,
        reason: read_var(&mut cur)?,
    };
    done(cur)?;
    Ok(msg)
}

/// Encode `update_fail_malformed_htlc`.
pub fn encode_fail_malformed(msg: &UpdateFailMalformedHtlc) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&msg.channel_id);
    buf.write_u64::<BigEndian>(msg.id).expect("vec write");
    buf.extend_from_slice(&msg.sha256_of_onion);
    buf.write_u16::<BigEndian>(msg.failure_code).expect("vec write");
    buf
}

/// Decode `update_fail_malformed_htlc`.
pub fn decode_fail_malformed(payload: &[u8]) -> Result<UpdateFailMalformedHtlc, CodecError> {
    let mut cur = Cursor::new(payload);
    let msg = UpdateFailMalformedHtlc {
        channel_id: read_array(&mut cur)?,
        id: cur.read_u64::<BigEndian>()?,
        sha256_of_onion: read_array(&mut cur)?,
        failure_code: cur.read_u16::<BigEndian>()?,
    };
    done(cur)?;
    Ok(msg)
}

/// Encode `error`.
pub fn encode_error(msg: &ErrorMessage) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&msg.channel_id);
    write_var(&mut buf, &msg.data)?;
    Ok(buf)
}

/// Decode `error`.
pub fn decode_error(payload: &[u8]) -> Result<ErrorMessage, CodecError> {
    let mut cur = Cursor::new(payload);
    let msg = ErrorMessage {
        channel_id: read_array(&mut cur)?,
        data: read_var(&mut cur)?,
    };
    done(cur)?;
    Ok(msg)
}

/// Encoding of every `channel_update` field after the signature; this is
/// what the gossip signature commits to (double-SHA-256).
pub fn channel_update_witness(msg: &ChannelUpdate) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&msg.chain_hash);
    buf.write_u64::<BigEndian>(msg.short_channel_id.0).expect("vec write");
    buf.write_u32::<BigEndian>(msg.timestamp).expect("vec write");
    buf.push(msg.message_flags);
    buf.push(msg.channel_flags);
    buf.write_u16::<BigEndian>(msg.cltv_expiry_delta).expect("vec write");
    buf.write_u64::<BigEndian>(msg.htlc_minimum_msat.0).expect("vec write");
    buf.write_u32::<BigEndian>(msg.fee_base_msat).expect("vec write");
    buf.write_u32::<BigEndian>(msg.fee_proportional_millionths).expect("vec write");
    buf.write_u64::<BigEndian>(msg.htlc_maximum_msat.0).expect("vec write");
    buf
}

/// Encode `channel_update`.
pub fn encode_channel_update(msg: &ChannelUpdate) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + 80);
    buf.extend_from_slice(&msg.signature.0);
    buf.extend_from_slice(&channel_update_witness(msg));
    buf
}

/// Decode `channel_update`.
pub fn decode_channel_update(payload: &[u8]) -> Result<ChannelUpdate, CodecError> {
    let mut cur = Cursor::new(payload);
    let msg = ChannelUpdate {
        signature: read_sig(&mut cur)?,
        chain_hash: read_array(&mut cur)?,
        short_channel_id: ShortChannelId(cur.read_u64::<BigEndian>()?),
        timestamp: cur.read_u32::<BigEndian>()?,
        message_flags: cur.read_u8()?,
        channel_flags: cur.read_u8()?,
        cltv_expiry_delta: cur.read_u16::<BigEndian>()?,
        htlc_minimum_msat: MilliSatoshi(cur.read_u64::<BigEndian>()?),
        fee_base_msat: cur.read_u32::<BigEndian>()?,
        fee_proportional_millionths: cur.read_u32::<BigEndian>()?,
        htlc_maximum_msat: MilliSatoshi(cur.read_u64::<BigEndian>()?),
    };
    done(cur)?;
    Ok(msg)
}

/// Encode `ask_branding_info`.
pub fn encode_ask_branding(msg: &AskBrandingInfo) -> Vec<u8> {
    msg.chain_hash.to_vec()
}

/// Decode `ask_branding_info`.
pub fn decode_ask_branding(payload: &[u8]) -> Result<AskBrandingInfo, CodecError> {
    let mut cur = Cursor::new(payload);
    let msg = AskBrandingInfo { chain_hash: read_array(&mut cur)? };
    done(cur)?;
    Ok(msg)
}

/// Encode `hosted_channel_branding`; an absent logo encodes as length 0.
pub fn encode_branding(msg: &HostedChannelBranding) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&msg.rgb_color);
    write_var(&mut buf, msg.png_icon.as_deref().unwrap_or(&[]))?;
    write_var(&mut buf, msg.contact_info.as_bytes())?;
    Ok(buf)
}

/// Decode `hosted_channel_branding`.
pub fn decode_branding(payload: &[u8]) -> Result<HostedChannelBranding, CodecError> {
    let mut cur = Cursor::new(payload);
    let rgb_color = read_array(&mut cur)?;
    let png = read_var(&mut cur)?;
    let contact = read_var(&mut cur)?;
    done(cur)?;
    Ok(HostedChannelBranding {
        rgb_color,
        png_icon: (!png.is_empty()).then_some(png),
        contact_info: String::from_utf8(contact)
            .map_err(|_| CodecError::InvalidField("contact_info"))?,
    })
}
