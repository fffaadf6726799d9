//! Custom RPC methods exposed to the operator.

use secp256k1::PublicKey;
use serde_json::{json, Value};

use hostchan_core::types::{hosted_short_channel_id, MilliSatoshi};
use hostchan_core::wire::codec;

use crate::channel::{self, channel_status};
use crate::master::ChannelMaster;
use crate::plugin::HookResponder;
use crate::upstream::{parse_pubkey, UpstreamNode};

/// Route one custom method call.
pub async fn dispatch<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    method: &str,
    params: Value,
    responder: HookResponder,
) {
    let result = match method {
        "hc-list" => Ok(hc_list(master)),
        "hc-channel" => hc_channel(master, &params),
        "hc-override" => hc_override(master, &params).await,
        "hc-request-channel" => hc_request_channel(master, &params).await,
        "add-hc-secret" => add_secret(master, &params),
        "remove-hc-secret" => remove_secret(master, &params),
        "parse-lcss" => parse_lcss(&params),
        other => Err(format!("unknown method {}", other)),
    };
    match result {
        Ok(value) => responder.respond(value),
        Err(message) => responder.respond_error(-32602, &message),
    }
}

/// Positional-or-named parameter access.
fn param<'a>(params: &'a Value, index: usize, name: &str) -> Option<&'a Value> {
    match params {
        Value::Array(list) => list.get(index),
        Value::Object(map) => map.get(name),
        _ => None,
    }
}

fn peer_param(params: &Value) -> Result<PublicKey, String> {
    param(params, 0, "peerid")
        .and_then(Value::as_str)
        .and_then(parse_pubkey)
        .ok_or_else(|| "peerid must be a 66-hex-char node id".to_string())
}

fn channel_summary<U: UpstreamNode>(master: &ChannelMaster<U>, peer: &PublicKey) -> Value {
    let record = master.record(peer);
    let status = channel_status(record, master.channels.get(peer));
    let mut summary = json!({
        "peer_id": hex::encode(peer.serialize()),
        "short_channel_id": hosted_short_channel_id(&master.node_id, peer).to_string(),
        "status": status.to_string(),
    });
    if let Some(lcss) = record.and_then(|r| r.lcss.as_ref()) {
        summary["local_balance_msat"] = json!(lcss.local_balance_msat);
        summary["remote_balance_msat"] = json!(lcss.remote_balance_msat);
        summary["local_updates"] = json!(lcss.local_updates);
        summary["remote_updates"] = json!(lcss.remote_updates);
        summary["incoming_htlcs"] = json!(lcss.incoming_htlcs.len());
        summary["outgoing_htlcs"] = json!(lcss.outgoing_htlcs.len());
    }
    summary
}

fn hc_list<U: UpstreamNode>(master: &ChannelMaster<U>) -> Value {
    let mut peers: Vec<PublicKey> = master.store.data().channels.keys().copied().collect();
    peers.sort_by_key(|p| p.serialize());
    let channels: Vec<Value> = peers.iter().map(|p| channel_summary(master, p)).collect();
    json!({ "channels": channels })
}

fn hc_channel<U: UpstreamNode>(
    master: &ChannelMaster<U>,
    params: &Value,
) -> Result<Value, String> {
    let peer = peer_param(params)?;
    let record = master.record(&peer).ok_or("no such hosted channel")?;
    let mut detail = channel_summary(master, &peer);
    detail["record"] = serde_json::to_value(record).map_err(|e| e.to_string())?;
    if let Some(chan) = master.channels.get(&peer) {
        detail["uncommitted_updates"] = json!(chan.uncommitted.len());
        detail["pending_results"] = json!(chan.results.len());
    }
    Ok(detail)
}

async fn hc_override<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    params: &Value,
) -> Result<Value, String> {
    let peer = peer_param(params)?;
    let msat: MilliSatoshi = param(params, 1, "msat")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .ok_or("msat must be a millisatoshi amount")?;
    channel::propose_override(master, peer, msat).await?;
    Ok(json!({ "proposed": true, "new_local_balance_msat": msat }))
}

async fn hc_request_channel<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    params: &Value,
) -> Result<Value, String> {
    let peer = peer_param(params)?;
    channel::request_hosted_channel(master, peer).await?;
    Ok(json!({ "invoked": true }))
}

fn add_secret<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    params: &Value,
) -> Result<Value, String> {
    let secret = secret_param(params)?;
    if !master.temporary_secrets.contains(&secret) {
        master.temporary_secrets.push(secret);
    }
    Ok(json!({ "secrets": master.temporary_secrets.len() }))
}

fn remove_secret<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    params: &Value,
) -> Result<Value, String> {
    let secret = secret_param(params)?;
    master.temporary_secrets.retain(|s| *s != secret);
    Ok(json!({ "secrets": master.temporary_secrets.len() }))
}

fn secret_param(params: &Value) -> Result<String, String> {
    let secret = param(params, 0, "secret")
        .and_then(Value::as_str)
        .ok_or("secret must be a hex string")?;
    if secret.is_empty() || hex::decode(secret).is_err() {
        return Err("secret must be a hex string".into());
    }
    Ok(secret.to_owned())
}

fn parse_lcss(params: &Value) -> Result<Value, String> {
    let raw = param(params, 0, "hex")
        .and_then(Value::as_str)
        .and_then(|s| hex::decode(s).ok())
        .ok_or("expected a hex-encoded last_cross_signed_state")?;
    let lcss = codec::decode_lcss(&raw).map_err(|e| format!("undecodable: {}", e))?;
    let mut value = serde_json::to_value(&lcss).map_err(|e| e.to_string())?;
    value["balanced"] = json!(lcss.is_balanced());
    value["total_updates"] = json!(lcss.total_updates());
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_positional_and_named() {
        let positional = json!(["abc", 5]);
        assert_eq!(param(&positional, 0, "peerid"), Some(&json!("abc")));
        assert_eq!(param(&positional, 1, "msat"), Some(&json!(5)));

        let named = json!({ "peerid": "abc", "msat": 5 });
        assert_eq!(param(&named, 0, "peerid"), Some(&json!("abc")));
        assert_eq!(param(&named, 1, "msat"), Some(&json!(5)));
    }

    #[test]
    fn test_secret_param_validation() {
        assert!(secret_param(&json!(["00ff"])).is_ok());
        assert!(secret_param(&json!(["zz"])).is_err());
        assert!(secret_param(&json!([])).is_err());
    }
}
